//! Error types for the bring-up orchestrator.
//!
//! Every fatal condition ends up as a [`BringUpError`] that rejects the
//! pending bring-up, so a caller awaiting [`crate::Orchestrator::bring_up`]
//! always observes the failure instead of waiting forever.

use thiserror::Error;

/// Result type for bring-up operations
pub type Result<T> = std::result::Result<T, BringUpError>;

/// Errors that can end a bring-up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BringUpError {
    // ========================================================================
    // Invocation Errors
    // ========================================================================
    /// Another bring-up on the same orchestrator has not settled yet
    #[error("a bring-up is already in progress on this orchestrator")]
    AlreadyInProgress,

    /// The VM runtime refused to start the instance
    #[error("failed to launch VM: {reason}")]
    Launch { reason: String },

    // ========================================================================
    // Guest Errors
    // ========================================================================
    /// A console write or inbox injection failed
    #[error("guest command failed: {reason}")]
    Guest { reason: String },

    /// Reading the address file failed with something other than not-found
    #[error("Error initializing network: {reason}")]
    NetworkInit { reason: String },

    /// The guest never produced an address within the retry budget
    #[error("Connecting network failed after {attempts} attempts")]
    NetworkBringUpFailed { attempts: u32 },

    /// The address file held something other than a dotted quad
    #[error("malformed guest address {raw:?}: {reason}")]
    MalformedAddress { raw: String, reason: String },

    /// A connection string was requested without an established credential
    #[error("No database password")]
    MissingCredential,

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The VM process ended before the instance resolved
    #[error("VM exited before the instance resolved: {status}")]
    VmExited { status: String },

    /// The actor task panicked or was cancelled
    #[error("bring-up task ended unexpectedly: {reason}")]
    TaskFailed { reason: String },
}

impl BringUpError {
    /// Wrap a guest-side failure from the runtime seam.
    pub fn guest(err: impl std::fmt::Display) -> Self {
        Self::Guest {
            reason: err.to_string(),
        }
    }
}
