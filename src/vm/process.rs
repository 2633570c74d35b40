//! Emulator-process runtime.
//!
//! The emulator is an external program that loads `launch-options.json`,
//! speaks the guest serial console over its stdin/stdout, and serves the
//! guest root filesystem over 9p from a host directory. Guest file reads and
//! writes therefore become plain host file I/O under `shared_root`.
//!
//! ## Architecture
//!
//! ```text
//! ProcessLauncher::launch(LaunchOptions)
//!     ├─► runtime_dir/launch-options.json
//!     └─► tokio::process::Command  →  emulator child process
//!             └─► ProcessVm { stdin, shared_root }
//!                     ├─► console reader task (stdout lines → VmEvent::ConsoleLine)
//!                     └─► exit watch task     (child.wait() → VmEvent::Exited)
//! ```
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launch::LaunchOptions;
use crate::vm::{GuestFileError, GuestVm, LaunchedVm, VmEvent, VmLauncher};

/// File name of the options document handed to the emulator.
pub const OPTIONS_FILE: &str = "launch-options.json";

/// How to start the emulator process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessLauncherConfig {
    /// Emulator binary. A bare name is looked up on `PATH`.
    pub program: PathBuf,

    /// Arguments placed before the options file path.
    #[serde(default)]
    pub args: Vec<String>,

    /// Host side of the guest's 9p root filesystem.
    pub shared_root: PathBuf,

    /// Where `launch-options.json` is written.
    pub runtime_dir: PathBuf,
}

pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self { config }
    }
}

/// Resolve the emulator binary, returning an error if it cannot be found.
fn find_program(program: &Path) -> anyhow::Result<PathBuf> {
    if program.components().count() > 1 {
        if program.exists() {
            return Ok(program.to_path_buf());
        }
        bail!("emulator binary does not exist: {}", program.display());
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    bail!(
        "emulator binary {} not found on PATH.\n\
         Set [runtime].program in the config file or pass --program.",
        program.display()
    )
}

fn build_command(program: &Path, config: &ProcessLauncherConfig, options_path: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(&config.args);
    cmd.arg(options_path);

    // Console over stdio; emulator diagnostics are not part of the console.
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::null());
    cmd.kill_on_drop(true);

    cmd
}

/// Forward each stdout line as a console event until EOF.
fn spawn_console_reader(stdout: ChildStdout, events: mpsc::UnboundedSender<VmEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r').to_string();
                    if events.send(VmEvent::ConsoleLine(line)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!("emulator console closed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "emulator console read failed");
                    return;
                }
            }
        }
    })
}

/// Wait for the child to exit, let the console drain, then report the exit.
fn spawn_exit_watch(
    mut child: Child,
    console: JoinHandle<()>,
    events: mpsc::UnboundedSender<VmEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };
        let _ = console.await;
        info!(exit_status = %status, "emulator process exited");
        let _ = events.send(VmEvent::Exited(status));
    })
}

#[async_trait]
impl VmLauncher for ProcessLauncher {
    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<LaunchedVm> {
        let program = find_program(&self.config.program)?;
        info!(path = %program.display(), "Found emulator binary");

        tokio::fs::create_dir_all(&self.config.runtime_dir)
            .await
            .with_context(|| format!("failed to create runtime dir {}", self.config.runtime_dir.display()))?;
        tokio::fs::create_dir_all(&self.config.shared_root)
            .await
            .with_context(|| format!("failed to create shared root {}", self.config.shared_root.display()))?;

        let options_path = self.config.runtime_dir.join(OPTIONS_FILE);
        let document = options.to_json().context("failed to serialise launch options")?;
        tokio::fs::write(&options_path, document)
            .await
            .with_context(|| format!("failed to write {}", options_path.display()))?;

        let mut child = build_command(&program, &self.config, &options_path)
            .spawn()
            .with_context(|| format!("Failed to spawn emulator {}", program.display()))?;

        let stdin = child.stdin.take().context("emulator stdin was not piped")?;
        let stdout = child.stdout.take().context("emulator stdout was not piped")?;

        info!(
            pid = child.id(),
            memory_bytes = options.memory_size,
            cold_boot = options.is_cold_boot(),
            snapshot = options.resume_snapshot().unwrap_or("-"),
            "VM spawned"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        // The process owns the console from here on.
        let _ = tx.send(VmEvent::Ready);
        let console = spawn_console_reader(stdout, tx.clone());
        let exit_watch = spawn_exit_watch(child, console, tx);

        Ok(LaunchedVm {
            vm: Box::new(ProcessVm {
                stdin: Mutex::new(stdin),
                shared_root: self.config.shared_root.clone(),
                exit_watch,
            }),
            events: rx,
        })
    }
}

/// A live emulator process.
///
/// Dropping this value kills the process.
pub struct ProcessVm {
    stdin: Mutex<ChildStdin>,
    shared_root: PathBuf,
    exit_watch: JoinHandle<()>,
}

impl ProcessVm {
    /// Map an absolute guest path onto the shared root.
    fn host_path(&self, guest_path: &str) -> Result<PathBuf, GuestFileError> {
        host_path(&self.shared_root, guest_path)
    }
}

fn host_path(shared_root: &Path, guest_path: &str) -> Result<PathBuf, GuestFileError> {
    let relative = Path::new(guest_path.trim_start_matches('/'));
    let plain = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !plain || relative.as_os_str().is_empty() {
        return Err(GuestFileError::Io {
            path: guest_path.to_string(),
            reason: "path escapes the shared guest root".to_string(),
        });
    }
    Ok(shared_root.join(relative))
}

#[async_trait]
impl GuestVm for ProcessVm {
    async fn send_console(&self, text: &str) -> anyhow::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(text.as_bytes())
            .await
            .context("failed to write to emulator console")?;
        stdin.flush().await.context("failed to flush emulator console")?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, GuestFileError> {
        let host = self.host_path(path)?;
        tokio::fs::read(&host).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GuestFileError::NotFound { path: path.to_string() }
            } else {
                GuestFileError::Io {
                    path: path.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&host, contents)
            .await
            .with_context(|| format!("failed to write guest file {path}"))?;
        Ok(())
    }
}

impl Drop for ProcessVm {
    fn drop(&mut self) {
        // The exit watch owns the child; aborting it drops the child, and
        // kill_on_drop takes the process down with it.
        self.exit_watch.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_paths_map_under_shared_root() {
        let root = Path::new("/srv/guest");
        assert_eq!(host_path(root, "/addr.txt").unwrap(), PathBuf::from("/srv/guest/addr.txt"));
        assert_eq!(
            host_path(root, "/inbox/get_new_ip.sh").unwrap(),
            PathBuf::from("/srv/guest/inbox/get_new_ip.sh")
        );
    }

    #[test]
    fn guest_paths_cannot_escape_shared_root() {
        let root = Path::new("/srv/guest");
        assert!(host_path(root, "/../etc/passwd").is_err());
        assert!(host_path(root, "/inbox/../../x").is_err());
        assert!(host_path(root, "/").is_err());
    }

    #[test]
    fn missing_program_is_reported() {
        let err = find_program(Path::new("definitely-not-an-emulator-binary")).unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));

        let err = find_program(Path::new("/nonexistent/dir/emulator")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn command_passes_options_path_last() {
        let config = ProcessLauncherConfig {
            program: PathBuf::from("emu"),
            args: vec!["--headless".into()],
            shared_root: PathBuf::from("/srv/guest"),
            runtime_dir: PathBuf::from("/srv/run"),
        };
        let cmd = build_command(Path::new("/usr/bin/emu"), &config, Path::new("/srv/run/launch-options.json"));
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--headless", "/srv/run/launch-options.json"]);
    }
}
