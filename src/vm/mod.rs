//! VM runtime seam for pg-vm.
//!
//! The orchestrator never talks to an emulator directly. It launches an
//! instance through a [`VmLauncher`], drives it through the returned
//! [`GuestVm`] and listens to the [`VmEvent`] stream that comes with it.
//!
//! Two runtimes ship with the crate:
//! - [`process`]: an external emulator process driven over stdio, with guest
//!   files living in a host directory shared over 9p.
//! - [`fake`]: an in-memory guest for tests and `--dry-run`.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::launch::LaunchOptions;

pub mod fake;
pub mod process;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Signals emitted by a running instance, in the order the runtime saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    /// The instance is running and accepts console input.
    Ready,
    /// One line of guest console output, without the trailing newline.
    ConsoleLine(String),
    /// The instance is gone.
    Exited(String),
}

/// Failure reading a file from the guest filesystem.
#[derive(Error, Debug)]
pub enum GuestFileError {
    /// The guest has not written the file (yet).
    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("guest file {path}: {reason}")]
    Io { path: String, reason: String },
}

impl GuestFileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GuestFileError::NotFound { .. })
    }
}

/// A running instance, exclusively owned by one bring-up.
#[async_trait]
pub trait GuestVm: Send + Sync {
    /// Forward `text` verbatim to the guest console.
    async fn send_console(&self, text: &str) -> anyhow::Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, GuestFileError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()>;
}

/// A freshly launched instance together with its event stream.
pub struct LaunchedVm {
    pub vm: Box<dyn GuestVm>,
    pub events: mpsc::UnboundedReceiver<VmEvent>,
}

/// Starts instances from [`LaunchOptions`].
#[async_trait]
pub trait VmLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<LaunchedVm>;
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use fake::{FakeGuest, FakeLauncher};
pub use process::{ProcessLauncher, ProcessLauncherConfig, ProcessVm};
