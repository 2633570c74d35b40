//! Instance configuration: defaults, caller overrides and the credential.
//!
//! A bring-up works from one immutable [`Config`] value. Callers supply a
//! [`ConfigOverrides`] (all fields optional), which is layered onto the
//! defaults field by field. Overrides can come from code, from a TOML file
//! (see [`ConfigFile`]) or from CLI flags, and [`ConfigOverrides::merge`]
//! combines those layers with the later layer winning.
//!
//! The database credential is either supplied by the caller or generated
//! once per bring-up from a randomness source passed in explicitly.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::vm::process::ProcessLauncherConfig;

/// Relay used when the caller does not name one.
pub const DEFAULT_PROXY_URL: &str = "wss://proxy.wasm.supabase.com/";

/// Number of random bytes behind a generated credential (hex encoded).
pub const CREDENTIAL_BYTES: usize = 20;

// ---------------------------------------------------------------------------
// MemorySize
// ---------------------------------------------------------------------------

/// Guest memory, restricted to the sizes snapshots are published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum MemorySize {
    #[default]
    Mb128,
    Mb196,
    Mb256,
    Mb384,
    Mb512,
    Mb1024,
}

impl MemorySize {
    pub const ALL: [MemorySize; 6] = [
        MemorySize::Mb128,
        MemorySize::Mb196,
        MemorySize::Mb256,
        MemorySize::Mb384,
        MemorySize::Mb512,
        MemorySize::Mb1024,
    ];

    pub fn megabytes(self) -> u32 {
        match self {
            MemorySize::Mb128 => 128,
            MemorySize::Mb196 => 196,
            MemorySize::Mb256 => 256,
            MemorySize::Mb384 => 384,
            MemorySize::Mb512 => 512,
            MemorySize::Mb1024 => 1024,
        }
    }

    pub fn bytes(self) -> u64 {
        u64::from(self.megabytes()) * 1024 * 1024
    }
}

impl TryFrom<u32> for MemorySize {
    type Error = String;

    fn try_from(megabytes: u32) -> Result<Self, Self::Error> {
        MemorySize::ALL
            .into_iter()
            .find(|size| size.megabytes() == megabytes)
            .ok_or_else(|| {
                format!("unsupported memory size {megabytes} (expected one of 128, 196, 256, 384, 512, 1024)")
            })
    }
}

impl From<MemorySize> for u32 {
    fn from(size: MemorySize) -> Self {
        size.megabytes()
    }
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let megabytes: u32 = s
            .trim()
            .parse()
            .map_err(|e| format!("invalid memory size {s:?}: {e}"))?;
        MemorySize::try_from(megabytes)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.megabytes())
    }
}

// ---------------------------------------------------------------------------
// Timings
// ---------------------------------------------------------------------------

/// Delays used to sequence the guest.
///
/// None of these are acknowledged by the guest; they were tuned against the
/// published images and only need to keep actions in a safe order. All values
/// are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Newline sent after resume so an idle prompt redraws.
    pub console_nudge_ms: u64,
    /// Resume track: instance ready until the password command.
    pub resume_password_ms: u64,
    /// Resume track: instance ready until network bring-up.
    pub resume_network_ms: u64,
    /// Cold-boot track: server-ready line until the password command.
    pub cold_boot_password_ms: u64,
    /// Cold-boot track: shell prompt until the client command.
    pub cold_boot_client_ms: u64,
    /// Cold-boot track: shell prompt until network bring-up.
    pub cold_boot_network_ms: u64,
    /// Network bring-up script until the first address read.
    pub first_poll_ms: u64,
    /// Spacing between address reads.
    pub poll_interval_ms: u64,
    /// Failed read until the probe script is injected again.
    pub probe_reinject_ms: u64,
    /// Address reads before giving up.
    pub max_poll_attempts: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            console_nudge_ms: 1,
            resume_password_ms: 10,
            resume_network_ms: 100,
            cold_boot_password_ms: 0,
            cold_boot_client_ms: 0,
            cold_boot_network_ms: 100,
            first_poll_ms: 2000,
            poll_interval_ms: 1000,
            probe_reinject_ms: 2000,
            max_poll_attempts: 22,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Complete configuration for one bring-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub memory_size: MemorySize,
    pub proxy_url: String,
    /// Cold boot from kernel images instead of resuming a snapshot.
    pub boot: bool,
    /// Verbose logging requested by the caller.
    pub print: bool,
    pub credential: Option<String>,
    pub timings: Timings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_size: MemorySize::default(),
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            boot: false,
            print: false,
            credential: None,
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Apply `overrides` onto the defaults without touching the credential
    /// policy: an absent credential stays absent.
    pub fn with_overrides(overrides: ConfigOverrides) -> Self {
        let defaults = Config::default();
        Self {
            memory_size: overrides.memory_size.unwrap_or(defaults.memory_size),
            proxy_url: overrides.proxy_url.unwrap_or(defaults.proxy_url),
            boot: overrides.boot.unwrap_or(defaults.boot),
            print: overrides.print.unwrap_or(defaults.print),
            credential: overrides.credential.filter(|c| !c.is_empty()),
            timings: overrides.timings.unwrap_or(defaults.timings),
        }
    }

    /// Build the configuration for one bring-up. The credential is taken
    /// from the overrides when non-empty, otherwise generated from `rng`.
    pub fn resolve<R: RngCore + ?Sized>(overrides: Option<ConfigOverrides>, rng: &mut R) -> Self {
        let mut config = Config::with_overrides(overrides.unwrap_or_default());
        let credential = resolve_credential(config.credential.take(), rng);
        config.credential = Some(credential);
        config
    }
}

/// Return `supplied` if it is non-empty, otherwise a fresh random credential.
pub fn resolve_credential<R: RngCore + ?Sized>(supplied: Option<String>, rng: &mut R) -> String {
    match supplied {
        Some(credential) if !credential.is_empty() => credential,
        _ => generate_credential(rng),
    }
}

/// Hex-encode [`CREDENTIAL_BYTES`] random bytes.
pub fn generate_credential<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; CREDENTIAL_BYTES];
    rng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// Partial configuration supplied by a caller. `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub memory_size: Option<MemorySize>,
    pub proxy_url: Option<String>,
    pub boot: Option<bool>,
    pub print: Option<bool>,
    #[serde(alias = "db_password")]
    pub credential: Option<String>,
    pub timings: Option<Timings>,
}

impl ConfigOverrides {
    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merge(self, other: ConfigOverrides) -> Self {
        Self {
            memory_size: other.memory_size.or(self.memory_size),
            proxy_url: other.proxy_url.or(self.proxy_url),
            boot: other.boot.or(self.boot),
            print: other.print.or(self.print),
            credential: other.credential.or(self.credential),
            timings: other.timings.or(self.timings),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// On-disk configuration read by the CLI.
///
/// ```toml
/// [instance]
/// memory_size = 256
/// boot = true
///
/// [instance.timings]
/// poll_interval_ms = 500
///
/// [runtime]
/// program = "v86-runner"
/// shared_root = "/var/lib/pg-vm/guest-root"
/// runtime_dir = "/var/lib/pg-vm/run"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub instance: ConfigOverrides,
    pub runtime: Option<ProcessLauncherConfig>,
}

impl ConfigFile {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn defaults_match_published_image() {
        let config = Config::default();
        assert_eq!(config.memory_size, MemorySize::Mb128);
        assert_eq!(config.proxy_url, "wss://proxy.wasm.supabase.com/");
        assert!(!config.boot);
        assert!(!config.print);
        assert!(config.credential.is_none());
        assert_eq!(config.timings.max_poll_attempts, 22);
    }

    #[test]
    fn memory_size_accepts_only_known_values() {
        for size in MemorySize::ALL {
            assert_eq!(MemorySize::try_from(size.megabytes()), Ok(size));
        }
        assert!(MemorySize::try_from(64).is_err());
        assert!(MemorySize::try_from(200).is_err());
        assert_eq!("384".parse::<MemorySize>(), Ok(MemorySize::Mb384));
        assert!("lots".parse::<MemorySize>().is_err());
        assert_eq!(MemorySize::Mb1024.bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let config = Config::with_overrides(ConfigOverrides {
            memory_size: Some(MemorySize::Mb512),
            boot: Some(true),
            ..Default::default()
        });
        assert_eq!(config.memory_size, MemorySize::Mb512);
        assert!(config.boot);
        assert_eq!(config.proxy_url, DEFAULT_PROXY_URL);
        assert!(!config.print);
    }

    #[test]
    fn supplied_credential_is_used_verbatim() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = Config::resolve(
            Some(ConfigOverrides {
                credential: Some("hunter2".into()),
                ..Default::default()
            }),
            &mut rng,
        );
        assert_eq!(config.credential.as_deref(), Some("hunter2"));
    }

    #[test]
    fn empty_credential_counts_as_absent() {
        let mut rng = StdRng::seed_from_u64(7);
        let credential = resolve_credential(Some(String::new()), &mut rng);
        assert_eq!(credential.len(), CREDENTIAL_BYTES * 2);
    }

    #[test]
    fn generated_credential_is_hex_and_seed_dependent() {
        let a = generate_credential(&mut StdRng::seed_from_u64(1));
        let b = generate_credential(&mut StdRng::seed_from_u64(1));
        let c = generate_credential(&mut StdRng::seed_from_u64(2));
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn merge_is_last_wins() {
        let file = ConfigOverrides {
            memory_size: Some(MemorySize::Mb256),
            proxy_url: Some("wss://file.example/".into()),
            ..Default::default()
        };
        let flags = ConfigOverrides {
            proxy_url: Some("wss://flag.example/".into()),
            boot: Some(true),
            ..Default::default()
        };
        let merged = file.merge(flags);
        assert_eq!(merged.memory_size, Some(MemorySize::Mb256));
        assert_eq!(merged.proxy_url.as_deref(), Some("wss://flag.example/"));
        assert_eq!(merged.boot, Some(true));
        assert_eq!(merged.credential, None);
    }

    #[test]
    fn config_file_parses_instance_and_runtime() {
        let file = ConfigFile::from_toml(
            r#"
[instance]
memory_size = 256
db_password = "from-file"

[instance.timings]
poll_interval_ms = 500

[runtime]
program = "v86-runner"
shared_root = "/srv/guest"
runtime_dir = "/srv/run"
"#,
        )
        .expect("config file should parse");

        assert_eq!(file.instance.memory_size, Some(MemorySize::Mb256));
        assert_eq!(file.instance.credential.as_deref(), Some("from-file"));
        let timings = file.instance.timings.expect("timings table");
        assert_eq!(timings.poll_interval_ms, 500);
        assert_eq!(timings.max_poll_attempts, 22);
        let runtime = file.runtime.expect("runtime table");
        assert_eq!(runtime.program.to_string_lossy(), "v86-runner");
    }

    #[test]
    fn config_file_rejects_bad_memory_and_unknown_keys() {
        assert!(ConfigFile::from_toml("[instance]\nmemory_size = 100\n").is_err());
        assert!(ConfigFile::from_toml("[instance]\nmemroy_size = 128\n").is_err());
    }
}
