//! pg-vm: boot a PostgreSQL guest VM and print its connection string.
//!
//! `pg-vm run` launches the configured emulator, waits for the guest to come
//! up on the relay and keeps it running until Ctrl-C. `--dry-run` walks the
//! same bring-up against an in-memory guest. `pg-vm launch-options` prints
//! the document the emulator would be started with.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use pg_vm::config::{Config, ConfigFile, ConfigOverrides, MemorySize};
use pg_vm::launch::LaunchOptions;
use pg_vm::logging;
use pg_vm::orchestrator::Orchestrator;
use pg_vm::paths::AppPaths;
use pg_vm::vm::{FakeGuest, ProcessLauncher, ProcessLauncherConfig, VmLauncher};

/// Boot a PostgreSQL guest VM and print its connection string
#[derive(Parser, Debug)]
#[command(name = "pg-vm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring up an instance and keep it running until interrupted
    Run(RunArgs),
    /// Print the launch options for the resolved configuration
    LaunchOptions(InstanceArgs),
}

#[derive(Args, Debug, Clone)]
struct InstanceArgs {
    /// Config file (defaults to ~/.config/pg-vm/config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Guest memory in megabytes (128, 196, 256, 384, 512 or 1024)
    #[arg(short, long)]
    memory: Option<MemorySize>,

    /// Relay URL the connection string is routed through
    #[arg(long)]
    proxy_url: Option<String>,

    /// Cold boot the kernel instead of resuming a snapshot
    #[arg(long)]
    boot: bool,

    /// Database password (generated when omitted)
    #[arg(long)]
    password: Option<String>,

    /// Log bring-up progress
    #[arg(short, long)]
    verbose: bool,
}

impl InstanceArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            memory_size: self.memory,
            proxy_url: self.proxy_url.clone(),
            boot: self.boot.then_some(true),
            print: self.verbose.then_some(true),
            credential: self.password.clone(),
            timings: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    instance: InstanceArgs,

    /// Emulator binary (overrides [runtime].program)
    #[arg(long)]
    program: Option<PathBuf>,

    /// Host directory backing the guest filesystem
    #[arg(long)]
    shared_root: Option<PathBuf>,

    /// Print the resolved instance as JSON instead of a bare connection string
    #[arg(long)]
    json: bool,

    /// Use an in-memory guest instead of launching an emulator
    #[arg(long)]
    dry_run: bool,

    /// Address the in-memory guest reports
    #[arg(long, default_value = "10.0.2.15")]
    dry_run_address: String,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl RunArgs {
    /// `run` logs progress unless the config file or `--quiet` turns it off.
    fn overrides(&self, from_file: ConfigOverrides) -> ConfigOverrides {
        let mut cli = self.instance.overrides();
        if self.quiet {
            cli.print = Some(false);
        }
        ConfigOverrides {
            print: Some(true),
            ..Default::default()
        }
        .merge(from_file)
        .merge(cli)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let paths = AppPaths::resolve();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    match command {
        Command::Run(args) => {
            let file = load_config_file(args.instance.config.as_deref(), paths.as_ref())?;
            let overrides = args.overrides(file.instance.clone());
            let _log_guard = logging::init(
                overrides.print.unwrap_or(false),
                paths.as_ref().map(|p| p.logs.as_path()),
            );
            runtime.block_on(run(args, file, overrides, paths))
        }
        Command::LaunchOptions(args) => {
            let file = load_config_file(args.config.as_deref(), paths.as_ref())?;
            let overrides = file.instance.merge(args.overrides());
            let _log_guard = logging::init(overrides.print.unwrap_or(false), None);
            let config = Config::resolve(Some(overrides), &mut rand::thread_rng());
            println!("{}", LaunchOptions::from_config(&config).to_json()?);
            Ok(())
        }
    }
}

/// Explicit `--config` must exist; the default location is optional.
fn load_config_file(explicit: Option<&Path>, paths: Option<&AppPaths>) -> Result<ConfigFile> {
    if let Some(path) = explicit {
        return ConfigFile::load(path);
    }
    match paths.map(AppPaths::config_file) {
        Some(path) if path.is_file() => ConfigFile::load(&path),
        _ => Ok(ConfigFile::default()),
    }
}

async fn run(
    args: RunArgs,
    file: ConfigFile,
    overrides: ConfigOverrides,
    paths: Option<AppPaths>,
) -> Result<()> {
    if args.dry_run {
        let guest = if overrides.boot.unwrap_or(false) {
            FakeGuest::cold_booted()
        } else {
            FakeGuest::resumed()
        };
        let guest = guest.answer_probe(args.dry_run_address.clone(), 1);
        info!("dry run: using an in-memory guest");
        return serve(Orchestrator::new(guest.launcher()), overrides, args.json, false).await;
    }

    if let Some(paths) = &paths {
        paths
            .ensure()
            .context("failed to create pg-vm directories")?;
    }
    let runtime_config = runtime_config(&args, file.runtime, paths.as_ref())?;
    serve(Orchestrator::new(ProcessLauncher::new(runtime_config)), overrides, args.json, true).await
}

/// CLI flags override `[runtime]`; directories fall back to the app paths.
fn runtime_config(
    args: &RunArgs,
    from_file: Option<ProcessLauncherConfig>,
    paths: Option<&AppPaths>,
) -> Result<ProcessLauncherConfig> {
    let program = args
        .program
        .clone()
        .or_else(|| from_file.as_ref().map(|c| c.program.clone()));
    let Some(program) = program else {
        bail!("no emulator configured: pass --program or set [runtime].program in the config file");
    };

    let shared_root = args
        .shared_root
        .clone()
        .or_else(|| from_file.as_ref().map(|c| c.shared_root.clone()))
        .or_else(|| paths.map(|p| p.guest_root.clone()))
        .context("no shared root: pass --shared-root or set HOME")?;
    let runtime_dir = from_file
        .as_ref()
        .map(|c| c.runtime_dir.clone())
        .or_else(|| paths.map(|p| p.runtime.clone()))
        .context("no runtime directory: set [runtime].runtime_dir or HOME")?;
    let extra_args = from_file.map(|c| c.args).unwrap_or_default();

    Ok(ProcessLauncherConfig {
        program,
        args: extra_args,
        shared_root,
        runtime_dir,
    })
}

async fn serve<L: VmLauncher>(
    orchestrator: Orchestrator<L>,
    overrides: ConfigOverrides,
    json: bool,
    hold: bool,
) -> Result<()> {
    let mut running = orchestrator.bring_up(Some(overrides)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(running.instance())?);
    } else {
        println!("{}", running.connection_string());
    }

    if !hold {
        running.shutdown().await?;
        return Ok(());
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            running.shutdown().await?;
        }
        outcome = running.wait() => {
            if let Err(e) = &outcome {
                warn!(error = %e, "instance stopped");
            }
            outcome?;
        }
    }
    Ok(())
}
