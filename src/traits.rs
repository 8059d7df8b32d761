//! Core traits for background loads.
//!
//! A load is anything that keeps hardware busy next to the memory tester:
//! the GPU renderer and the framebuffer unblanker. Loads are started on
//! their own threads and never joined. They are expected to run until the
//! shared stop flag is raised; a load that ends early takes the process
//! down with it, because a silently idle GPU would make the memory test
//! results meaningless.

use crate::error::StressError;
use crate::stats::StressStats;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A background hardware load.
pub trait StressLoad: Send {
    /// Returns the name of this load (e.g., "GPU", "unblank").
    fn name(&self) -> &'static str;

    /// Runs the load until `should_stop` is raised.
    ///
    /// Setup happens inside `run` so it executes on the load's own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be set up or stops responding.
    fn run(&mut self, stats: &StressStats, should_stop: &AtomicBool) -> Result<(), StressError>;
}

/// How a load ended.
#[derive(Debug)]
pub enum LoadExit {
    /// The stop flag was raised; this is the only healthy exit.
    Stopped,
    /// `run` returned `Ok` without being asked to stop.
    Returned,
    /// `run` failed while the harness was still running.
    Failed(StressError),
    /// `run` panicked.
    Panicked(String),
}

/// Runs `load` to completion and classifies how it ended.
///
/// Panics inside `run` are caught and reported as [`LoadExit::Panicked`];
/// wgpu signals validation errors and device loss by panicking. Anything
/// that goes wrong after the stop flag is raised counts as a stop.
pub fn supervise(
    load: &mut dyn StressLoad,
    stats: &StressStats,
    should_stop: &AtomicBool,
) -> LoadExit {
    let result = panic::catch_unwind(AssertUnwindSafe(|| load.run(stats, should_stop)));
    let stopping = should_stop.load(Ordering::Relaxed);
    let result = match result {
        Ok(result) => result,
        Err(payload) if stopping => {
            log::debug!(
                "{} load panicked during shutdown: {}",
                load.name(),
                panic_message(payload.as_ref())
            );
            return LoadExit::Stopped;
        }
        Err(payload) => return LoadExit::Panicked(panic_message(payload.as_ref())),
    };
    match result {
        Ok(()) if stopping => LoadExit::Stopped,
        Ok(()) => LoadExit::Returned,
        Err(e) if stopping => {
            log::debug!("{} load failed during shutdown: {}", load.name(), e);
            LoadExit::Stopped
        }
        Err(e) => LoadExit::Failed(e),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawns `load` on a named thread.
///
/// The handle may be dropped; the thread aborts the process if the load
/// ever ends without a stop request.
pub fn spawn_load<L: StressLoad + 'static>(
    mut load: L,
    stats: Arc<StressStats>,
    should_stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let name = load.name();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match supervise(&mut load, &stats, &should_stop) {
            LoadExit::Stopped => log::debug!("{} load stopped", name),
            LoadExit::Returned => {
                log::error!("{}", StressError::LoadReturned(name));
                std::process::abort();
            }
            LoadExit::Failed(e) => {
                log::error!("{} load failed: {}", name, e);
                std::process::abort();
            }
            LoadExit::Panicked(msg) => {
                log::error!("{} load panicked: {}", name, msg);
                std::process::abort();
            }
        })
}
