//! Launch options handed to the emulator.
//!
//! [`LaunchOptions::from_config`] is a pure function of [`Config`]. The boot
//! source is an enum, so an options value carries either the cold-boot image
//! set or the resume snapshot, never both.
//!
//! Serialized to JSON the boot-source fields sit alongside the base fields:
//!
//! ```text
//! { "wasm_path": "./v86/v86.wasm", "memory_size": 134217728, ...,
//!   "initial_state": { "url": "./state/state-128.bin.zst" } }
//! ```

use serde::Serialize;

use crate::config::{Config, MemorySize};

pub const WASM_PATH: &str = "./v86/v86.wasm";
pub const BASE_FS: &str = "filesystem/filesystem.json";
pub const BASE_URL: &str = "filesystem/";

pub const KERNEL_IMAGE: &str = "./filesystem/0f8b7fb4.bin";
pub const BIOS_IMAGE: &str = "./system/seabios.bin";
pub const VGA_BIOS_IMAGE: &str = "./system/vgabios.bin";

/// Kernel command line for cold boot: root on the 9p host filesystem, serial
/// console, reliable TSC, no watchdog.
pub const KERNEL_CMDLINE: &[&str] = &[
    "rw",
    "root=host9p rootfstype=9p",
    "rootflags=version=9p2000.L,trans=virtio,cache=loose",
    "quiet acpi=off console=ttyS0",
    "tsc=reliable mitigations=off random.trust_cpu=on",
    "nowatchdog page_poison=on",
];

/// Path of the serialized VM state published for `memory_size`.
pub fn snapshot_path(memory_size: MemorySize) -> String {
    format!("./state/state-{}.bin.zst", memory_size.megabytes())
}

/// Reference to an image the emulator loads itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub url: String,
}

impl ImageRef {
    fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemOptions {
    pub basefs: String,
    pub baseurl: String,
}

/// How the guest starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BootSource {
    /// Firmware and kernel from scratch.
    ColdBoot {
        bzimage: ImageRef,
        cmdline: String,
        bios: ImageRef,
        vga_bios: ImageRef,
    },
    /// Restore a previously serialized memory and device state.
    Resume { initial_state: ImageRef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchOptions {
    pub wasm_path: String,
    /// Guest memory in bytes.
    pub memory_size: u64,
    pub filesystem: FilesystemOptions,
    pub network_relay_url: String,
    pub preserve_mac_from_state_image: bool,
    pub mac_address_translation: bool,
    pub autostart: bool,
    pub disable_keyboard: bool,
    pub disable_mouse: bool,
    pub disable_speaker: bool,
    pub acpi: bool,
    #[serde(flatten)]
    pub boot: BootSource,
}

impl LaunchOptions {
    pub fn from_config(config: &Config) -> Self {
        let boot = if config.boot {
            BootSource::ColdBoot {
                bzimage: ImageRef::new(KERNEL_IMAGE),
                cmdline: KERNEL_CMDLINE.join(" "),
                bios: ImageRef::new(BIOS_IMAGE),
                vga_bios: ImageRef::new(VGA_BIOS_IMAGE),
            }
        } else {
            BootSource::Resume {
                initial_state: ImageRef::new(snapshot_path(config.memory_size)),
            }
        };

        Self {
            wasm_path: WASM_PATH.to_string(),
            memory_size: config.memory_size.bytes(),
            filesystem: FilesystemOptions {
                basefs: BASE_FS.to_string(),
                baseurl: BASE_URL.to_string(),
            },
            network_relay_url: config.proxy_url.clone(),
            preserve_mac_from_state_image: false,
            mac_address_translation: false,
            autostart: true,
            disable_keyboard: true,
            disable_mouse: true,
            disable_speaker: true,
            acpi: true,
            boot,
        }
    }

    pub fn is_cold_boot(&self) -> bool {
        matches!(self.boot, BootSource::ColdBoot { .. })
    }

    /// The snapshot this launch resumes from, if any.
    pub fn resume_snapshot(&self) -> Option<&str> {
        match &self.boot {
            BootSource::Resume { initial_state } => Some(&initial_state.url),
            BootSource::ColdBoot { .. } => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
