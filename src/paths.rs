//! Directory layout for pg-vm.
//!
//! Provides a single `AppPaths` struct that resolves the standard
//! directories and can create them on first launch. Follows XDG conventions,
//! with the usual macOS locations for data and logs:
//!
//! - Config:     `~/.config/pg-vm/`  (holds `config.toml`)
//! - Data:       `~/.local/share/pg-vm/` or `~/Library/Application Support/pg-vm/`
//! - Runtime:    `<data>/run/`         (launch options for the emulator)
//! - Guest root: `<data>/guest-root/`  (host side of the guest filesystem)
//! - Logs:       `~/.local/share/pg-vm/logs/` or `~/Library/Logs/pg-vm/`

use std::path::{Path, PathBuf};

use tracing::debug;

const APP_NAME: &str = "pg-vm";

pub const CONFIG_FILE: &str = "config.toml";

/// All resolved application directory paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub runtime: PathBuf,
    pub guest_root: PathBuf,
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under_home(&home))
    }

    fn under_home(home: &Path) -> Self {
        let data = resolve_data_dir(home);
        Self {
            config: resolve_config_dir(home),
            runtime: data.join("run"),
            guest_root: data.join("guest-root"),
            logs: resolve_log_dir(home),
            data,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.runtime, &self.guest_root, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}
