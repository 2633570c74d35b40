//! State machines driven by the orchestrator.

pub mod bringup_sm;

pub use bringup_sm::{BootMode, BringUpEvent, BringUpMachine, GuestAction, Scheduled};
