//! In-memory scripted guest.
//!
//! `FakeGuest` stands in for an emulator: it records everything the
//! orchestrator sends, keeps guest files in a map, and plays a small script
//! back (events on launch, an answer to the N-th address probe). The test
//! suite drives the orchestrator with it, and `pg-vm run --dry-run` uses it
//! to walk through a bring-up without an emulator installed.
//!
//! Clones share state, so a test keeps one handle for inspection and hands
//! [`FakeGuest::launcher`] to the orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::guest::{ADDRESS_FILE, PROBE_SCRIPT_NAME, SERVER_READY_MARKER, SHELL_PROMPT_MARKER, script_path};
use crate::launch::LaunchOptions;
use crate::vm::{GuestFileError, GuestVm, LaunchedVm, VmEvent, VmLauncher};

#[derive(Debug)]
struct ProbeAnswer {
    address: String,
    after_probes: usize,
    probes_seen: usize,
}

#[derive(Debug, Default)]
struct FakeState {
    launch_events: Vec<VmEvent>,
    probe_answer: Option<ProbeAnswer>,
    read_failures: HashMap<String, String>,
    console: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    writes: Vec<String>,
    reads: HashMap<String, usize>,
    launches: Vec<LaunchOptions>,
    events: Option<mpsc::UnboundedSender<VmEvent>>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeGuest {
    state: Arc<Mutex<FakeState>>,
}

impl FakeGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// A guest resumed from a snapshot: reports ready right after launch.
    pub fn resumed() -> Self {
        Self::new().with_launch_events(vec![VmEvent::Ready])
    }

    /// A cold-booted guest: prints the server-ready line, then a prompt.
    pub fn cold_booted() -> Self {
        Self::new().with_launch_events(vec![
            VmEvent::ConsoleLine("Welcome to Buildroot".to_string()),
            VmEvent::ConsoleLine(format!("{SERVER_READY_MARKER} on port 5432")),
            VmEvent::ConsoleLine(format!("{SHELL_PROMPT_MARKER} ")),
        ])
    }

    /// Events delivered, in order, as soon as the instance launches.
    pub fn with_launch_events(self, events: Vec<VmEvent>) -> Self {
        self.lock().launch_events = events;
        self
    }

    /// Write `address` to the address file when the probe script is injected
    /// for the `after_probes`-th time (1-based; 0 answers immediately).
    pub fn answer_probe(self, address: impl Into<String>, after_probes: usize) -> Self {
        {
            let mut state = self.lock();
            if after_probes == 0 {
                let mut contents = address.into().into_bytes();
                contents.push(b'\n');
                state.files.insert(ADDRESS_FILE.to_string(), contents);
            } else {
                state.probe_answer = Some(ProbeAnswer {
                    address: address.into(),
                    after_probes,
                    probes_seen: 0,
                });
            }
        }
        self
    }

    /// Fail every read of `path` with a non-not-found error.
    pub fn fail_reads(self, path: impl Into<String>, reason: impl Into<String>) -> Self {
        self.lock().read_failures.insert(path.into(), reason.into());
        self
    }

    pub fn launcher(&self) -> FakeLauncher {
        FakeLauncher { guest: self.clone() }
    }

    /// Push an event to the running instance. Returns `false` when nothing
    /// is listening.
    pub fn emit(&self, event: VmEvent) -> bool {
        match &self.lock().events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Console input in the order it was sent.
    pub fn console_input(&self) -> Vec<String> {
        self.lock().console.clone()
    }

    /// Paths written, in order, including repeats.
    pub fn written_paths(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn reads_of(&self, path: &str) -> usize {
        self.lock().reads.get(path).copied().unwrap_or(0)
    }

    pub fn launches(&self) -> Vec<LaunchOptions> {
        self.lock().launches.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct FakeLauncher {
    guest: FakeGuest,
}

#[async_trait]
impl VmLauncher for FakeLauncher {
    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<LaunchedVm> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.guest.lock();
            state.launches.push(options.clone());
            for event in &state.launch_events {
                let _ = tx.send(event.clone());
            }
            state.events = Some(tx);
        }
        Ok(LaunchedVm {
            vm: Box::new(FakeVm {
                guest: self.guest.clone(),
            }),
            events: rx,
        })
    }
}

struct FakeVm {
    guest: FakeGuest,
}

#[async_trait]
impl GuestVm for FakeVm {
    async fn send_console(&self, text: &str) -> anyhow::Result<()> {
        self.guest.lock().console.push(text.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, GuestFileError> {
        let mut state = self.guest.lock();
        *state.reads.entry(path.to_string()).or_default() += 1;
        if let Some(reason) = state.read_failures.get(path) {
            return Err(GuestFileError::Io {
                path: path.to_string(),
                reason: reason.clone(),
            });
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| GuestFileError::NotFound { path: path.to_string() })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        let mut state = self.guest.lock();
        state.writes.push(path.to_string());
        state.files.insert(path.to_string(), contents.to_vec());

        if path == script_path(PROBE_SCRIPT_NAME) {
            let mut answered = None;
            if let Some(answer) = state.probe_answer.as_mut() {
                answer.probes_seen += 1;
                if answer.probes_seen >= answer.after_probes {
                    answered = Some(format!("{}\n", answer.address));
                }
            }
            if let Some(contents) = answered {
                state.files.insert(ADDRESS_FILE.to_string(), contents.into_bytes());
            }
        }
        Ok(())
    }
}
