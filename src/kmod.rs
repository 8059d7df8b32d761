//! Kernel module loading.
//!
//! The GPU driver on these boards usually ships as an out-of-tree module
//! that is not loaded at boot. Before starting the GPU load we make sure it
//! is present, asking `modprobe` to load it if not.

use crate::error::KmodError;
use std::path::PathBuf;
use std::process::Command;

/// Default GPU driver module.
pub const DEFAULT_MODULE: &str = "mali";

/// Locates loaded modules and loads missing ones.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    sys_module: PathBuf,
    proc_modules: PathBuf,
    modprobe: PathBuf,
}

/// What `ensure_loaded` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    AlreadyLoaded,
    Loaded,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self {
            sys_module: PathBuf::from("/sys/module"),
            proc_modules: PathBuf::from("/proc/modules"),
            modprobe: PathBuf::from("modprobe"),
        }
    }
}

impl ModuleLoader {
    /// Creates a loader that looks in non-standard places.
    #[cfg(test)]
    pub fn with_paths(
        sys_module: impl Into<PathBuf>,
        proc_modules: impl Into<PathBuf>,
        modprobe: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_module: sys_module.into(),
            proc_modules: proc_modules.into(),
            modprobe: modprobe.into(),
        }
    }

    /// Returns true if `name` is present in the running kernel.
    pub fn is_loaded(&self, name: &str) -> bool {
        let canonical = canonical_name(name);
        if self.sys_module.join(&canonical).is_dir() {
            return true;
        }
        match std::fs::read_to_string(&self.proc_modules) {
            Ok(listing) => module_listed(&listing, name),
            Err(e) => {
                log::debug!("cannot read {}: {}", self.proc_modules.display(), e);
                false
            }
        }
    }

    /// Loads `name` unless it is already present.
    ///
    /// # Errors
    ///
    /// Returns `KmodError::InvalidName` for names containing path separators
    /// or whitespace, `KmodError::Spawn` if `modprobe` cannot be run and
    /// `KmodError::Failed` if it exits unsuccessfully.
    pub fn ensure_loaded(&self, name: &str) -> Result<LoadStatus, KmodError> {
        validate_name(name)?;

        if self.is_loaded(name) {
            log::debug!("kernel module {} already loaded", name);
            return Ok(LoadStatus::AlreadyLoaded);
        }

        log::info!("loading kernel module {}", name);
        let status = Command::new(&self.modprobe)
            .arg(name)
            .status()
            .map_err(|source| KmodError::Spawn {
                module: name.to_string(),
                source,
            })?;

        if !status.success() {
            return Err(KmodError::Failed {
                module: name.to_string(),
                status,
            });
        }

        Ok(LoadStatus::Loaded)
    }
}

/// The kernel reports module names with underscores only.
fn canonical_name(name: &str) -> String {
    name.replace('-', "_")
}

fn validate_name(name: &str) -> Result<(), KmodError> {
    if name.is_empty() || name.contains(|c: char| c == '/' || c.is_whitespace()) {
        return Err(KmodError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Returns true if a `/proc/modules` listing contains `name`.
fn module_listed(listing: &str, name: &str) -> bool {
    let wanted = canonical_name(name);
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|module| canonical_name(module) == wanted)
}
