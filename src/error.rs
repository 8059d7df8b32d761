//! Error types for the stress harness.
//!
//! Device and setup failures are `StressError`s. Memory faults found by the
//! tester are plain data (`MemoryFault`) because a fault is a test result,
//! not a reason to stop.

use crate::memtests::{MemTest, Mismatch};
use std::path::PathBuf;
use thiserror::Error;

/// A mismatch found by a memtester worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFault {
    /// The test that detected the fault.
    pub test: MemTest,
    /// Worker thread whose region holds the fault.
    pub thread_id: usize,
    /// Loop number, starting at 1.
    pub loop_no: u64,
    /// Offset and values of the bad word.
    pub mismatch: Mismatch,
}

impl MemoryFault {
    pub fn new(test: MemTest, thread_id: usize, loop_no: u64, mismatch: Mismatch) -> Self {
        Self {
            test,
            thread_id,
            loop_no,
            mismatch,
        }
    }
}

impl std::fmt::Display for MemoryFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FAILURE: 0x{:016x} != 0x{:016x} at offset 0x{:08x} ({}, thread {}, loop {})",
            self.mismatch.expected,
            self.mismatch.actual,
            self.mismatch.offset,
            self.test.name(),
            self.thread_id,
            self.loop_no
        )
    }
}

/// Unified error type for lima-memtester operations.
#[derive(Error, Debug)]
pub enum StressError {
    /// Bad command line or configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Test memory could not be allocated at any size.
    #[error("Could not allocate test memory (requested {requested} bytes)")]
    Allocation { requested: usize },

    /// Framebuffer device could not be opened or controlled.
    #[error("Framebuffer {}: {source}", .path.display())]
    Framebuffer {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A background load returned although nothing asked it to stop.
    #[error("{0} load returned unexpectedly")]
    LoadReturned(&'static str),

    /// GPU-specific errors.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
}

/// Kernel module loading errors.
#[derive(Error, Debug)]
pub enum KmodError {
    /// `modprobe` could not be started.
    #[error("failed to run modprobe for {module}: {source}")]
    Spawn {
        module: String,
        source: std::io::Error,
    },

    /// `modprobe` ran but reported failure.
    #[error("modprobe {module} exited with {status}")]
    Failed {
        module: String,
        status: std::process::ExitStatus,
    },

    /// Module name that cannot be a kernel module.
    #[error("invalid kernel module name {0:?}")]
    InvalidName(String),
}

/// GPU-specific errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// No GPU adapter found.
    #[error("No GPU adapter found")]
    NoAdapter,

    /// Specified GPU adapter not found.
    #[error("GPU adapter {index} not found (available: {available:?})")]
    AdapterNotFound {
        index: usize,
        available: Vec<String>,
    },

    /// Failed to request GPU device.
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),

    /// Render target size the device cannot handle.
    #[error("Invalid render target {width}x{height}")]
    InvalidTarget { width: u32, height: u32 },

    /// Buffer mapping failed.
    #[error("Buffer mapping failed: {0}")]
    BufferMapping(String),

    /// GPU operation timed out.
    #[error("GPU operation timed out after {0} seconds")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fault() -> MemoryFault {
        MemoryFault::new(
            MemTest::CompareXor,
            2,
            3,
            Mismatch {
                offset: 0x40,
                expected: 0xFF,
                actual: 0x7F,
            },
        )
    }

    #[test]
    fn test_memory_fault_new() {
        let fault = sample_fault();
        assert_eq!(fault.test, MemTest::CompareXor);
        assert_eq!(fault.thread_id, 2);
        assert_eq!(fault.loop_no, 3);
        assert_eq!(fault.mismatch.offset, 0x40);
    }

    #[test]
    fn test_memory_fault_display() {
        let msg = sample_fault().to_string();
        assert!(msg.starts_with("FAILURE: "));
        assert!(msg.contains("0x00000000000000ff != 0x000000000000007f"));
        assert!(msg.contains("offset 0x00000040"));
        assert!(msg.contains("Compare XOR"));
    }

    #[test]
    fn test_gpu_error_display() {
        let err = GpuError::NoAdapter;
        assert!(err.to_string().contains("No GPU adapter"));

        let err = GpuError::Timeout(30);
        assert!(err.to_string().contains("30 seconds"));
    }

    #[test]
    fn test_adapter_not_found_display() {
        let err = GpuError::AdapterNotFound {
            index: 5,
            available: vec!["GPU 0".into(), "GPU 1".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("5"));
        assert!(msg.contains("GPU 0"));
    }

    #[test]
    fn test_framebuffer_error_display() {
        let err = StressError::Framebuffer {
            path: PathBuf::from("/dev/fb0"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/dev/fb0"));
    }

    #[test]
    fn test_kmod_error_display() {
        let err = KmodError::InvalidName("a/b".into());
        assert!(err.to_string().contains("\"a/b\""));
    }

    #[test]
    fn test_gpu_error_into_stress_error() {
        let err: StressError = GpuError::NoAdapter.into();
        assert!(matches!(err, StressError::Gpu(_)));
    }
}
