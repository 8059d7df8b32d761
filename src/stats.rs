//! Statistics shared between the memory tester and the background loads.
//!
//! Every counter is an independent atomic; readers may see a mix of old and
//! new values, which is fine for progress display.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated from all threads.
pub struct StressStats {
    bytes_tested: AtomicU64,
    faults_found: AtomicU64,
    tests_completed: AtomicU64,
    frames_rendered: AtomicU64,
    unblanks_issued: AtomicU64,
}

impl StressStats {
    /// Creates a new StressStats instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            bytes_tested: AtomicU64::new(0),
            faults_found: AtomicU64::new(0),
            tests_completed: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            unblanks_issued: AtomicU64::new(0),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_tested.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds `count` faulty words to the fault counter.
    pub fn add_faults(&self, count: u64) {
        self.faults_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_test(&self) {
        self.tests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frame(&self) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unblank(&self) {
        self.unblanks_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_bytes(&self) -> u64 {
        self.bytes_tested.load(Ordering::Relaxed)
    }

    pub fn get_faults(&self) -> u64 {
        self.faults_found.load(Ordering::Relaxed)
    }

    pub fn get_tests(&self) -> u64 {
        self.tests_completed.load(Ordering::Relaxed)
    }

    pub fn get_frames(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn get_unblanks(&self) -> u64 {
        self.unblanks_issued.load(Ordering::Relaxed)
    }
}

impl Default for StressStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stats_new() {
        let stats = StressStats::new();
        assert_eq!(stats.get_bytes(), 0);
        assert_eq!(stats.get_faults(), 0);
        assert_eq!(stats.get_tests(), 0);
        assert_eq!(stats.get_frames(), 0);
        assert_eq!(stats.get_unblanks(), 0);
    }

    #[test]
    fn test_stats_tracking() {
        let stats = StressStats::default();

        stats.add_bytes(1024);
        stats.add_bytes(2048);
        assert_eq!(stats.get_bytes(), 3072);

        stats.add_faults(3);
        stats.add_faults(0);
        assert_eq!(stats.get_faults(), 3);

        stats.add_test();
        stats.add_frame();
        stats.add_frame();
        stats.add_unblank();
        assert_eq!(stats.get_tests(), 1);
        assert_eq!(stats.get_frames(), 2);
        assert_eq!(stats.get_unblanks(), 1);
    }

    #[test]
    fn test_stats_shared_between_loads() {
        let stats = Arc::new(StressStats::new());
        let mut handles = vec![];

        for i in 0..8 {
            let stats_clone = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        stats_clone.add_frame();
                    } else {
                        stats_clone.add_bytes(8);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.get_frames(), 400);
        assert_eq!(stats.get_bytes(), 3200);
    }
}
