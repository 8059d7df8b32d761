//! Framebuffer unblanking.
//!
//! Console framebuffers blank after a few minutes of inactivity and some
//! display controllers stop scanning out memory while blank. Issuing
//! `FBIOBLANK` with `FB_BLANK_UNBLANK` once a second keeps the display
//! engine reading RAM for the whole run.

use crate::error::StressError;
use crate::stats::StressStats;
use crate::traits::StressLoad;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default framebuffer device.
pub const DEFAULT_DEVICE: &str = "/dev/fb0";

/// Interval between unblank requests.
pub const UNBLANK_INTERVAL: Duration = Duration::from_secs(1);

/// `FBIOBLANK` from `<linux/fb.h>`.
const FBIOBLANK: libc::c_ulong = 0x4611;
/// `FB_BLANK_UNBLANK` from `<linux/fb.h>`.
const FB_BLANK_UNBLANK: libc::c_ulong = 0;

/// Something that can be told to unblank.
pub trait BlankControl: Send {
    fn unblank(&mut self) -> Result<(), StressError>;
}

/// An open framebuffer device.
pub struct Framebuffer {
    file: File,
    path: PathBuf,
}

impl Framebuffer {
    /// Opens the framebuffer device read/write.
    pub fn open(path: &Path) -> Result<Self, StressError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| StressError::Framebuffer {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl BlankControl for Framebuffer {
    fn unblank(&mut self) -> Result<(), StressError> {
        // SAFETY: FBIOBLANK takes its argument by value; the fd is owned by `self.file`.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), FBIOBLANK as _, FB_BLANK_UNBLANK) };
        if ret == 0 {
            Ok(())
        } else {
            Err(StressError::Framebuffer {
                path: self.path.clone(),
                source: std::io::Error::last_os_error(),
            })
        }
    }
}

/// Keeps a display unblanked until stopped.
pub struct Unblanker<C> {
    open: Box<dyn FnMut() -> Result<C, StressError> + Send>,
    interval: Duration,
}

impl Unblanker<Framebuffer> {
    /// Creates an unblanker for the framebuffer at `path`.
    pub fn for_device(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(move || Framebuffer::open(&path), UNBLANK_INTERVAL)
    }
}

impl<C: BlankControl> Unblanker<C> {
    /// Creates an unblanker that obtains its control by calling `open`.
    pub fn new(
        open: impl FnMut() -> Result<C, StressError> + Send + 'static,
        interval: Duration,
    ) -> Self {
        Self {
            open: Box::new(open),
            interval,
        }
    }
}

impl<C: BlankControl> StressLoad for Unblanker<C> {
    fn name(&self) -> &'static str {
        "unblank"
    }

    fn run(&mut self, stats: &StressStats, should_stop: &AtomicBool) -> Result<(), StressError> {
        let mut control = (self.open)()?;
        while !should_stop.load(Ordering::Relaxed) {
            control.unblank()?;
            stats.add_unblank();
            sleep_unless_stopped(self.interval, should_stop);
        }
        Ok(())
    }
}

/// Sleeps for `total`, waking early if `should_stop` is raised.
fn sleep_unless_stopped(total: Duration, should_stop: &AtomicBool) {
    let step = Duration::from_millis(50).min(total);
    let mut slept = Duration::ZERO;
    while slept < total && !should_stop.load(Ordering::Relaxed) {
        std::thread::sleep(step);
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Counts unblank calls and raises the stop flag after `limit`.
    struct CountingControl {
        calls: u32,
        limit: u32,
        stop: Arc<AtomicBool>,
    }

    impl BlankControl for CountingControl {
        fn unblank(&mut self) -> Result<(), StressError> {
            self.calls += 1;
            if self.calls >= self.limit {
                self.stop.store(true, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    struct BrokenControl;

    impl BlankControl for BrokenControl {
        fn unblank(&mut self) -> Result<(), StressError> {
            Err(StressError::Framebuffer {
                path: PathBuf::from("/dev/fb9"),
                source: std::io::Error::from_raw_os_error(libc::ENOTTY),
            })
        }
    }

    #[test]
    fn test_unblanks_until_stopped() {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_control = Arc::clone(&stop);
        let mut unblanker = Unblanker::new(
            move || {
                Ok(CountingControl {
                    calls: 0,
                    limit: 3,
                    stop: Arc::clone(&stop_for_control),
                })
            },
            Duration::from_millis(1),
        );
        let stats = StressStats::new();

        unblanker.run(&stats, &stop).unwrap();
        assert_eq!(stats.get_unblanks(), 3);
    }

    #[test]
    fn test_no_unblank_once_stopped() {
        let stop = AtomicBool::new(true);
        let mut unblanker = Unblanker::new(|| Ok(BrokenControl), Duration::from_millis(1));
        let stats = StressStats::new();

        unblanker.run(&stats, &stop).unwrap();
        assert_eq!(stats.get_unblanks(), 0);
    }

    #[test]
    fn test_ioctl_failure_propagates() {
        let stop = AtomicBool::new(false);
        let mut unblanker = Unblanker::new(|| Ok(BrokenControl), Duration::from_millis(1));

        let err = unblanker.run(&StressStats::new(), &stop).unwrap_err();
        assert!(err.to_string().contains("/dev/fb9"));
    }

    #[test]
    fn test_missing_device_fails_to_open() {
        let mut unblanker = Unblanker::for_device("/nonexistent/fb0");
        let err = unblanker
            .run(&StressStats::new(), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, StressError::Framebuffer { .. }));
    }

    #[test]
    fn test_regular_file_rejects_ioctl() {
        let path = std::env::temp_dir().join(format!("lima-fb-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let mut fb = Framebuffer::open(&path).unwrap();
        assert!(fb.unblank().is_err());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_sleep_wakes_on_stop() {
        let stop = AtomicBool::new(true);
        let start = std::time::Instant::now();
        sleep_unless_stopped(Duration::from_secs(10), &stop);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_unblank_interval() {
        assert_eq!(UNBLANK_INTERVAL, Duration::from_secs(1));
    }
}
