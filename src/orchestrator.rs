//! Bring-up orchestrator.
//!
//! Each call to [`Orchestrator::bring_up`] launches one VM and spawns one
//! actor task that owns everything about that boot: the guest channel, the
//! lifecycle state machine, the timer queue, the address poller and the
//! completion gate. Nothing is shared with other tasks, so no locking is
//! needed.
//!
//! ## Architecture
//!
//! ```text
//! bring_up(overrides)
//!     ├─► Config::resolve + LaunchOptions::from_config
//!     ├─► VmLauncher::launch  →  GuestVm + VmEvent stream
//!     └─► tokio::spawn(BringUpTask::run)
//!             loop select! {
//!                 VmEvent       → BringUpMachine::handle   → Scheduled actions → TimerQueue
//!                 TimerQueue    → GuestChannel / AddressPoller
//!                 shutdown      → drop the VM
//!             }
//!             AddressPoller ─Found─► CompletionGate::resolve ─► bring_up returns
//! ```
//!
//! The task keeps running after the instance resolves so the VM stays up. It
//! stops when the [`RunningInstance`] is shut down or dropped, or when the
//! VM exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use statig::blocking::StateMachine;
use statig::prelude::*;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::address::{AddressPoller, PollStep, ResolvedInstance};
use crate::config::{Config, ConfigOverrides};
use crate::error::{BringUpError, Result};
use crate::guest::{
    ADDRESS_FILE, CLIENT_COMMAND, GuestChannel, NETWORK_SCRIPT, NETWORK_SCRIPT_NAME, PROBE_SCRIPT,
    PROBE_SCRIPT_NAME, set_password_command,
};
use crate::launch::LaunchOptions;
use crate::state_machine::{BootMode, BringUpEvent, BringUpMachine, GuestAction, Scheduled};
use crate::vm::{GuestVm, LaunchedVm, VmEvent, VmLauncher};

// ---------------------------------------------------------------------------
// Completion gate
// ---------------------------------------------------------------------------

/// Single-settlement result slot for one bring-up.
///
/// The first `resolve` or `reject` wins; later calls return `false` and do
/// nothing.
#[derive(Debug)]
pub struct CompletionGate {
    tx: Option<oneshot::Sender<Result<ResolvedInstance>>>,
}

impl CompletionGate {
    pub fn new() -> (Self, oneshot::Receiver<Result<ResolvedInstance>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn resolve(&mut self, instance: ResolvedInstance) -> bool {
        self.settle(Ok(instance))
    }

    pub fn reject(&mut self, err: BringUpError) -> bool {
        self.settle(Err(err))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.is_none()
    }

    fn settle(&mut self, outcome: Result<ResolvedInstance>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The caller may have stopped waiting; the gate is settled regardless.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Timer queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerAction {
    Guest(GuestAction),
    PollAddress,
    InjectProbe,
}

/// Deadline-ordered one-shot timers. Equal deadlines fire in the order they
/// were scheduled.
#[derive(Debug, Default)]
struct TimerQueue {
    entries: Vec<(Instant, u64, TimerAction)>,
    next_seq: u64,
}

impl TimerQueue {
    fn schedule(&mut self, delay: Duration, action: TimerAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push((Instant::now() + delay, seq, action));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Wait for the earliest timer and remove it. Cancel-safe: an entry is
    /// only removed once its deadline has passed.
    async fn next_due(&mut self) -> TimerAction {
        let earliest = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, (deadline, seq, _))| (*deadline, *seq))
            .map(|(index, (deadline, _, _))| (index, *deadline));

        let Some((index, deadline)) = earliest else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(deadline).await;
        self.entries.remove(index).2
    }
}

// ---------------------------------------------------------------------------
// Bring-up task
// ---------------------------------------------------------------------------

enum Step {
    Shutdown,
    Vm(Option<VmEvent>),
    Timer(TimerAction),
}

struct BringUpTask {
    config: Config,
    channel: GuestChannel,
    events: mpsc::UnboundedReceiver<VmEvent>,
    machine: StateMachine<BringUpMachine>,
    schedule_rx: std::sync::mpsc::Receiver<Scheduled>,
    timers: TimerQueue,
    poller: AddressPoller,
    gate: CompletionGate,
    shutdown: oneshot::Receiver<()>,
}

impl BringUpTask {
    fn new(
        config: Config,
        vm: Box<dyn GuestVm>,
        events: mpsc::UnboundedReceiver<VmEvent>,
        gate: CompletionGate,
        shutdown: oneshot::Receiver<()>,
    ) -> Self {
        let mode = BootMode::from_boot_flag(config.boot);
        let (storage, schedule_rx) = BringUpMachine::new(mode, config.timings.clone());
        let poller = AddressPoller::new(config.timings.max_poll_attempts);

        Self {
            config,
            channel: GuestChannel::new(vm),
            events,
            machine: storage.state_machine(),
            schedule_rx,
            timers: TimerQueue::default(),
            poller,
            gate,
            shutdown,
        }
    }

    async fn run(mut self) -> Result<()> {
        let outcome = self.drive().await;
        if let Err(err) = &outcome {
            error!(target: "bringup", error = %err, "bring-up failed");
            self.gate.reject(err.clone());
        }
        outcome
    }

    async fn drive(&mut self) -> Result<()> {
        self.dispatch(BringUpEvent::Launched);

        loop {
            let step = tokio::select! {
                _ = &mut self.shutdown => Step::Shutdown,
                event = self.events.recv() => Step::Vm(event),
                action = self.timers.next_due() => Step::Timer(action),
            };

            match step {
                Step::Shutdown => {
                    info!(target: "bringup", "shutting down VM");
                    return Ok(());
                }
                Step::Vm(Some(VmEvent::Ready)) => self.dispatch(BringUpEvent::InstanceReady),
                Step::Vm(Some(VmEvent::ConsoleLine(line))) => {
                    debug!(target: "bringup::console", "{line}");
                    self.dispatch(BringUpEvent::ConsoleLine(line));
                }
                Step::Vm(Some(VmEvent::Exited(status))) => return self.vm_gone(status),
                Step::Vm(None) => return self.vm_gone("event stream closed".to_string()),
                Step::Timer(action) => self.perform(action).await?,
            }
        }
    }

    /// Feed one event to the state machine and queue whatever it scheduled.
    fn dispatch(&mut self, event: BringUpEvent) {
        let before = self.machine.state().clone();
        self.machine.handle(&event);
        let after = self.machine.state();
        if *after != before {
            info!(target: "bringup", from = ?before, to = ?after, "state transition");
        }

        while let Ok(Scheduled { delay, action }) = self.schedule_rx.try_recv() {
            self.timers.schedule(delay, TimerAction::Guest(action));
        }
    }

    fn vm_gone(&self, status: String) -> Result<()> {
        if self.gate.is_settled() {
            info!(target: "bringup", exit_status = %status, "VM exited");
            Ok(())
        } else {
            Err(BringUpError::VmExited { status })
        }
    }

    async fn perform(&mut self, action: TimerAction) -> Result<()> {
        match action {
            TimerAction::Guest(action) => {
                self.perform_guest(action).await?;
                self.dispatch(BringUpEvent::Performed(action));
            }
            TimerAction::PollAddress => self.poll_address().await?,
            TimerAction::InjectProbe => {
                if !self.gate.is_settled() {
                    self.channel.inject_script(PROBE_SCRIPT_NAME, PROBE_SCRIPT).await?;
                }
            }
        }
        Ok(())
    }

    async fn perform_guest(&mut self, action: GuestAction) -> Result<()> {
        match action {
            GuestAction::NudgeConsole => self.channel.send_console_line("\n").await,
            GuestAction::SetPassword => {
                let credential = self
                    .config
                    .credential
                    .as_deref()
                    .ok_or(BringUpError::MissingCredential)?;
                let command = set_password_command(credential);
                self.channel.send_console_line(&command).await?;
                info!(target: "bringup", "Database password set");
                Ok(())
            }
            GuestAction::OpenClient => self.channel.send_console_line(CLIENT_COMMAND).await,
            GuestAction::BringNetworkUp => self.bring_network_up().await,
        }
    }

    /// Rebind the NIC every time; start polling only once.
    async fn bring_network_up(&mut self) -> Result<()> {
        self.channel.inject_script(NETWORK_SCRIPT_NAME, NETWORK_SCRIPT).await?;

        if !self.gate.is_settled() && self.poller.start() {
            let delay_ms = self.config.timings.first_poll_ms;
            info!(target: "bringup", delay_ms, "Waiting for guest network");
            self.timers
                .schedule(Duration::from_millis(delay_ms), TimerAction::PollAddress);
        }
        Ok(())
    }

    async fn poll_address(&mut self) -> Result<()> {
        if self.gate.is_settled() {
            return Ok(());
        }

        let read = self.channel.read_file(ADDRESS_FILE).await;
        match self.poller.observe(read)? {
            PollStep::Found(address) => {
                let instance = ResolvedInstance::from_probe(&self.config, &address)?;
                info!(
                    target: "bringup",
                    host = %instance.relay_host,
                    port = %instance.port,
                    password = %instance.credential,
                    guest_address = %address,
                    "Instance resolved"
                );
                info!(target: "bringup", "{}", instance.connection_string);
                self.gate.resolve(instance);
            }
            PollStep::Pending { attempt } => {
                let timings = &self.config.timings;
                info!(
                    target: "bringup",
                    attempt,
                    max_attempts = timings.max_poll_attempts,
                    "Connecting network..."
                );
                let reinject = Duration::from_millis(timings.probe_reinject_ms);
                let interval = Duration::from_millis(timings.poll_interval_ms);
                self.timers.schedule(reinject, TimerAction::InjectProbe);
                self.timers.schedule(interval, TimerAction::PollAddress);
                debug!(target: "bringup", pending_timers = self.timers.len(), "poll rescheduled");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A resolved, running instance.
///
/// Dropping this value stops the VM; call [`RunningInstance::wait`] to keep
/// it up until it exits on its own.
pub struct RunningInstance {
    instance: ResolvedInstance,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl RunningInstance {
    pub fn instance(&self) -> &ResolvedInstance {
        &self.instance
    }

    pub fn connection_string(&self) -> &str {
        &self.instance.connection_string
    }

    pub fn credential(&self) -> &str {
        &self.instance.credential
    }

    /// Wait until the VM exits.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        join_outcome(joined)
    }

    /// Stop the VM and wait for the task to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.wait().await
    }
}

fn join_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => Err(BringUpError::TaskFailed { reason: e.to_string() }),
    }
}

/// Releases the in-flight flag when a bring-up settles or is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn claim(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(BringUpError::AlreadyInProgress);
        }
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Entry point: boots instances through a [`VmLauncher`].
pub struct Orchestrator<L> {
    launcher: L,
    in_flight: AtomicBool,
}

impl<L: VmLauncher> Orchestrator<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            launcher,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Launch one VM and wait until its connection string is known.
    ///
    /// Returns [`BringUpError::AlreadyInProgress`] if another call on this
    /// orchestrator has not settled yet. Dropping the returned future before
    /// it completes stops the VM.
    pub async fn bring_up(&self, overrides: Option<ConfigOverrides>) -> Result<RunningInstance> {
        let _claim = InFlight::claim(&self.in_flight)?;

        let config = Config::resolve(overrides, &mut rand::thread_rng());
        let options = LaunchOptions::from_config(&config);
        info!(
            target: "bringup",
            memory_mb = config.memory_size.megabytes(),
            cold_boot = config.boot,
            relay = %config.proxy_url,
            "Launching VM"
        );

        let LaunchedVm { vm, events } =
            self.launcher
                .launch(&options)
                .await
                .map_err(|e| BringUpError::Launch {
                    reason: format!("{e:#}"),
                })?;

        let (gate, result_rx) = CompletionGate::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = BringUpTask::new(config, vm, events, gate, shutdown_rx);
        let handle = tokio::spawn(task.run());

        match result_rx.await {
            Ok(Ok(instance)) => Ok(RunningInstance {
                instance,
                shutdown: Some(shutdown_tx),
                task: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.await;
                Err(err)
            }
            Err(_) => match join_outcome(handle.await) {
                Err(err) => Err(err),
                Ok(()) => Err(BringUpError::TaskFailed {
                    reason: "bring-up ended without a result".to_string(),
                }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ProbedAddress;

    fn instance(credential: &str) -> ResolvedInstance {
        let mut config = Config::default();
        config.credential = Some(credential.to_string());
        ResolvedInstance::from_probe(&config, &ProbedAddress::parse("10.0.2.15").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn gate_settles_exactly_once() {
        let (mut gate, rx) = CompletionGate::new();
        assert!(!gate.is_settled());
        assert!(gate.resolve(instance("first")));
        assert!(gate.is_settled());
        assert!(!gate.resolve(instance("second")));
        assert!(!gate.reject(BringUpError::MissingCredential));

        let settled = rx.await.unwrap().unwrap();
        assert_eq!(settled.credential, "first");
    }

    #[tokio::test]
    async fn gate_rejection_reaches_waiter() {
        let (mut gate, rx) = CompletionGate::new();
        assert!(gate.reject(BringUpError::NetworkBringUpFailed { attempts: 22 }));
        assert_eq!(
            rx.await.unwrap(),
            Err(BringUpError::NetworkBringUpFailed { attempts: 22 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_by_deadline_then_schedule_order() {
        let mut timers = TimerQueue::default();
        timers.schedule(Duration::from_millis(100), TimerAction::Guest(GuestAction::BringNetworkUp));
        timers.schedule(Duration::from_millis(10), TimerAction::Guest(GuestAction::SetPassword));
        timers.schedule(Duration::from_millis(10), TimerAction::PollAddress);
        timers.schedule(Duration::from_millis(1), TimerAction::Guest(GuestAction::NudgeConsole));

        let start = Instant::now();
        assert_eq!(timers.next_due().await, TimerAction::Guest(GuestAction::NudgeConsole));
        assert_eq!(timers.next_due().await, TimerAction::Guest(GuestAction::SetPassword));
        assert_eq!(timers.next_due().await, TimerAction::PollAddress);
        assert_eq!(timers.next_due().await, TimerAction::Guest(GuestAction::BringNetworkUp));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn in_flight_claim_is_exclusive() {
        let flag = AtomicBool::new(false);
        let claim = InFlight::claim(&flag).unwrap();
        assert!(matches!(InFlight::claim(&flag), Err(BringUpError::AlreadyInProgress)));
        drop(claim);
        assert!(InFlight::claim(&flag).is_ok());
    }
}
