//! Bring-up lifecycle state machine.
//!
//! Two tracks, chosen by boot mode, converging on network bring-up:
//! ```text
//! resume:    Launched ─ready─► Ready ──────────────► PasswordSet ─► NetworkUp
//! cold boot: Launched ───────► WaitingServer ──────► PasswordSet ─► ShellReady ─► NetworkUp
//!                                                                   (postgres=# ⇒ OpenClient, BringNetworkUp)
//! ```
//!
//! Every state after `Launched` sits under the `Booted` superstate. On the
//! cold-boot track it requests the password on the first `server started`
//! line, whichever state the machine is in when it arrives.
//!
//! The machine does no I/O. Entry actions and handlers only request guest
//! actions through the schedule channel; the orchestrator runs them when
//! their delay elapses and reports back with [`BringUpEvent::Performed`].

use std::sync::mpsc;
use std::time::Duration;

use statig::prelude::*;
use tracing::{debug, info};

use crate::config::Timings;
use crate::guest::{SERVER_READY_MARKER, SHELL_PROMPT_MARKER};

// ---------------------------------------------------------------------------
// Events and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Restore a snapshot; the guest is already initialised and logged in.
    Resume,
    /// Boot firmware and kernel; wait for the server and shell on the console.
    ColdBoot,
}

impl BootMode {
    pub fn from_boot_flag(boot: bool) -> Self {
        if boot { BootMode::ColdBoot } else { BootMode::Resume }
    }
}

/// Something the orchestrator should do to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestAction {
    /// Send a bare newline so an idle prompt redraws.
    NudgeConsole,
    SetPassword,
    /// Start an interactive psql on the console.
    OpenClient,
    BringNetworkUp,
}

/// A request to perform `action` once `delay` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub delay: Duration,
    pub action: GuestAction,
}

/// Events dispatched to the bring-up state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BringUpEvent {
    /// Posted once by the orchestrator right after launch.
    Launched,
    /// The runtime reports the instance ready.
    InstanceReady,
    /// One line of console output.
    ConsoleLine(String),
    /// The orchestrator carried out a scheduled action.
    Performed(GuestAction),
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the bring-up state machine.
pub struct BringUpMachine {
    pub mode: BootMode,
    timings: Timings,
    password_requested: bool,
    schedule_tx: mpsc::Sender<Scheduled>,
}

impl BringUpMachine {
    /// Returns the machine and the receiving end of its schedule channel.
    pub fn new(mode: BootMode, timings: Timings) -> (Self, mpsc::Receiver<Scheduled>) {
        let (schedule_tx, schedule_rx) = mpsc::channel();
        (
            Self {
                mode,
                timings,
                password_requested: false,
                schedule_tx,
            },
            schedule_rx,
        )
    }

    fn schedule(&self, delay_ms: u64, action: GuestAction) {
        debug!(target: "bringup", ?action, delay_ms, "scheduling guest action");
        let _ = self.schedule_tx.send(Scheduled {
            delay: Duration::from_millis(delay_ms),
            action,
        });
    }

    fn request_password(&mut self, delay_ms: u64) {
        if !std::mem::replace(&mut self.password_requested, true) {
            self.schedule(delay_ms, GuestAction::SetPassword);
        }
    }
}

fn is_server_ready(line: &str) -> bool {
    line.starts_with(SERVER_READY_MARKER)
}

fn is_shell_prompt(line: &str) -> bool {
    line.starts_with(SHELL_PROMPT_MARKER)
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::launched()",
    state(derive(Debug, Clone, PartialEq))
)]
impl BringUpMachine {
    /// Instance started; nothing observed yet.
    #[state]
    fn launched(&mut self, event: &BringUpEvent) -> Outcome<State> {
        match (self.mode, event) {
            (BootMode::ColdBoot, BringUpEvent::Launched) => Transition(State::waiting_server()),
            (BootMode::Resume, BringUpEvent::InstanceReady) => Transition(State::ready()),
            _ => Handled,
        }
    }

    /// Superstate: the instance is up.
    #[superstate]
    fn booted(&mut self, event: &BringUpEvent) -> Outcome<State> {
        match event {
            BringUpEvent::ConsoleLine(line)
                if self.mode == BootMode::ColdBoot && is_server_ready(line) =>
            {
                self.request_password(self.timings.cold_boot_password_ms);
                Handled
            }
            _ => Handled,
        }
    }

    /// Resume track: snapshot restored. Entry fires three independent timers.
    #[state(superstate = "booted", entry_action = "enter_ready")]
    fn ready(&mut self, event: &BringUpEvent) -> Outcome<State> {
        match event {
            BringUpEvent::Performed(GuestAction::SetPassword) => Transition(State::password_set()),
            BringUpEvent::Performed(GuestAction::BringNetworkUp) => Transition(State::network_up()),
            _ => Super,
        }
    }

    /// Cold-boot track: waiting for PostgreSQL to come up.
    #[state(superstate = "booted")]
    fn waiting_server(&mut self, event: &BringUpEvent) -> Outcome<State> {
        match event {
            BringUpEvent::ConsoleLine(line) if is_shell_prompt(line) => Transition(State::shell_ready()),
            BringUpEvent::Performed(GuestAction::SetPassword) => Transition(State::password_set()),
            _ => Super,
        }
    }

    /// Password command sent.
    #[state(superstate = "booted")]
    fn password_set(&mut self, event: &BringUpEvent) -> Outcome<State> {
        match event {
            BringUpEvent::ConsoleLine(line)
                if self.mode == BootMode::ColdBoot && is_shell_prompt(line) =>
            {
                Transition(State::shell_ready())
            }
            BringUpEvent::Performed(GuestAction::BringNetworkUp) => Transition(State::network_up()),
            _ => Super,
        }
    }

    /// Cold-boot track: prompt seen. Entry opens the client and starts the network.
    #[state(superstate = "booted", entry_action = "enter_shell_ready")]
    fn shell_ready(&mut self, event: &BringUpEvent) -> Outcome<State> {
        match event {
            BringUpEvent::Performed(GuestAction::BringNetworkUp) => Transition(State::network_up()),
            _ => Super,
        }
    }

    /// Network bring-up issued; the address poller takes over. A repeated
    /// bring-up stays here without re-entering.
    #[state(superstate = "booted", entry_action = "enter_network_up")]
    fn network_up(&mut self, event: &BringUpEvent) -> Outcome<State> {
        match event {
            BringUpEvent::Performed(GuestAction::BringNetworkUp) => Handled,
            _ => Super,
        }
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_ready(&mut self) {
        info!(target: "bringup", "Emulator ready");
        self.schedule(self.timings.console_nudge_ms, GuestAction::NudgeConsole);
        self.schedule(self.timings.resume_password_ms, GuestAction::SetPassword);
        self.schedule(self.timings.resume_network_ms, GuestAction::BringNetworkUp);
    }

    #[action]
    fn enter_shell_ready(&mut self) {
        info!(target: "bringup", "Shell prompt ready");
        self.schedule(self.timings.cold_boot_client_ms, GuestAction::OpenClient);
        self.schedule(self.timings.cold_boot_network_ms, GuestAction::BringNetworkUp);
    }

    #[action]
    fn enter_network_up(&mut self) {
        info!(target: "bringup", "Network bring-up issued");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
