//! pg-vm: bring up a PostgreSQL guest VM and hand back a connection string.
//!
//! A bring-up launches one emulator instance, either resuming a memory
//! snapshot or cold-booting a kernel, drives the guest through its console
//! and an inbox of shell scripts, waits for the guest to publish its network
//! address, and turns that address into a connection string routed through
//! a relay.
//!
//! ```no_run
//! # async fn demo() -> pg_vm::Result<()> {
//! use pg_vm::{FakeGuest, Orchestrator};
//!
//! let guest = FakeGuest::resumed().answer_probe("10.0.2.15", 1);
//! let orchestrator = Orchestrator::new(guest.launcher());
//! let running = orchestrator.bring_up(None).await?;
//! println!("{}", running.connection_string());
//! running.shutdown().await
//! # }
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod guest;
pub mod launch;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod state_machine;
pub mod vm;

pub use address::{ProbedAddress, ResolvedInstance};
pub use config::{Config, ConfigFile, ConfigOverrides, MemorySize, Timings};
pub use error::{BringUpError, Result};
pub use launch::LaunchOptions;
pub use orchestrator::{Orchestrator, RunningInstance};
pub use vm::{FakeGuest, GuestVm, ProcessLauncher, ProcessLauncherConfig, VmEvent, VmLauncher};
