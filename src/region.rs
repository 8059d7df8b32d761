//! Test memory allocation.
//!
//! Regions are allocated fallibly and pinned with `mlock` so the kernel
//! cannot page them out mid-test. When the request or the lock cannot be
//! satisfied the region shrinks one page at a time until it fits.

use crate::error::StressError;
use std::io;

/// Smallest region worth testing: one word in each half.
pub const MIN_REGION_BYTES: usize = 2 * std::mem::size_of::<u64>();

/// A heap region of 64-bit words, optionally locked into RAM.
pub struct LockedRegion {
    words: Vec<u64>,
    locked: bool,
}

/// Returns the system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl LockedRegion {
    /// Allocates up to `bytes` bytes, locking them when `lock` is set.
    ///
    /// # Errors
    ///
    /// Returns `StressError::Allocation` if no size down to
    /// [`MIN_REGION_BYTES`] could be allocated.
    pub fn allocate(bytes: usize, lock: bool) -> Result<Self, StressError> {
        let page = page_size();
        let requested = bytes;
        let mut want = bytes;
        let mut lock = lock;

        loop {
            let mut words = loop {
                if want < MIN_REGION_BYTES {
                    return Err(StressError::Allocation { requested });
                }
                match try_alloc_words(want) {
                    Some(words) => break words,
                    None => want = want.saturating_sub(page),
                }
            };

            if want != requested {
                log::warn!("got {} bytes of {} requested", want, requested);
            }

            if !lock {
                return Ok(Self {
                    words,
                    locked: false,
                });
            }

            match mlock(&mut words) {
                Ok(()) => {
                    log::debug!("locked {} bytes", want);
                    return Ok(Self {
                        words,
                        locked: true,
                    });
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::EAGAIN) => {
                        log::warn!("mlock over system/per-process limit, reducing");
                        want = want.saturating_sub(page);
                    }
                    Some(libc::ENOMEM) => {
                        log::warn!("mlock: too many pages, reducing");
                        want = want.saturating_sub(page);
                    }
                    Some(libc::EPERM) => {
                        log::warn!("mlock: insufficient permission, trying again unlocked");
                        lock = false;
                        want = requested;
                    }
                    _ => {
                        log::warn!("mlock failed ({}), continuing unlocked", e);
                        return Ok(Self {
                            words,
                            locked: false,
                        });
                    }
                },
            }
        }
    }

    /// Returns the words of this region.
    pub fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }

    /// Returns the size of this region in bytes.
    pub fn len_bytes(&self) -> usize {
        std::mem::size_of_val(self.words.as_slice())
    }

    /// Returns true if the region is locked into RAM.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for LockedRegion {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: the pointer and length describe the live allocation we locked.
            unsafe {
                libc::munlock(
                    self.words.as_ptr() as *const libc::c_void,
                    self.len_bytes(),
                );
            }
        }
    }
}

fn try_alloc_words(bytes: usize) -> Option<Vec<u64>> {
    let count = bytes / std::mem::size_of::<u64>();
    let mut words = Vec::new();
    words.try_reserve_exact(count).ok()?;
    words.resize(count, 0);
    Some(words)
}

fn mlock(words: &mut [u64]) -> io::Result<()> {
    // SAFETY: the slice is a valid allocation for its whole length.
    let ret = unsafe {
        libc::mlock(
            words.as_ptr() as *const libc::c_void,
            std::mem::size_of_val(words),
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
