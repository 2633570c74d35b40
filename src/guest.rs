//! Guest command channel.
//!
//! Two fire-and-forget ways to make the guest do something: type a line on
//! its console, or drop a shell script into `/inbox`, which a watcher inside
//! the image executes. Neither is acknowledged; the orchestrator infers
//! progress from console output and from files the scripts leave behind.

use tracing::debug;

use crate::error::{BringUpError, Result};
use crate::vm::{GuestFileError, GuestVm};

/// Directory the guest watches for scripts to run.
pub const INBOX_DIR: &str = "/inbox";

/// File the probe script writes the guest's routable address to.
pub const ADDRESS_FILE: &str = "/addr.txt";

/// Console prefix printed once PostgreSQL accepts connections (cold boot).
pub const SERVER_READY_MARKER: &str = "server started";

/// Console prefix of the interactive psql prompt (cold boot).
pub const SHELL_PROMPT_MARKER: &str = "postgres=#";

/// Opens an interactive client on the console.
pub const CLIENT_COMMAND: &str = "psql -U postgres\n";

pub const NETWORK_SCRIPT_NAME: &str = "get_new_ip";

/// Rebind the NIC driver and restart networking so DHCP hands out a fresh
/// lease.
pub const NETWORK_SCRIPT: &str = "
echo 0000:00:05.0 > /sys/bus/pci/drivers/ne2k-pci/unbind &&
echo 0000:00:05.0 > /sys/bus/pci/drivers/ne2k-pci/bind &&
sleep 1 &&
/etc/init.d/S40network restart
";

pub const PROBE_SCRIPT_NAME: &str = "probe_address";

/// Write the default route's source address to [`ADDRESS_FILE`].
pub const PROBE_SCRIPT: &str = "ip route get 1 | awk '{print $7}' &> /addr.txt
sync
";

/// Inbox path for a script called `name`.
pub fn script_path(name: &str) -> String {
    format!("{INBOX_DIR}/{name}.sh")
}

/// SQL that sets the superuser password, typed at the psql prompt.
pub fn set_password_command(credential: &str) -> String {
    format!("ALTER ROLE postgres WITH PASSWORD '{credential}';\n")
}

/// The orchestrator's only way to talk to the guest.
pub struct GuestChannel {
    vm: Box<dyn GuestVm>,
}

impl GuestChannel {
    pub fn new(vm: Box<dyn GuestVm>) -> Self {
        Self { vm }
    }

    /// Send `text` to the console as-is.
    pub async fn send_console_line(&self, text: &str) -> Result<()> {
        debug!(target: "bringup", bytes = text.len(), "console input");
        self.vm.send_console(text).await.map_err(BringUpError::guest)
    }

    /// Write `body` to `/inbox/<name>.sh` for the guest to execute.
    pub async fn inject_script(&self, name: &str, body: &str) -> Result<()> {
        let path = script_path(name);
        debug!(target: "bringup", path = %path, "injecting script");
        self.vm
            .write_file(&path, body.as_bytes())
            .await
            .map_err(BringUpError::guest)
    }

    pub async fn read_file(&self, path: &str) -> std::result::Result<Vec<u8>, GuestFileError> {
        self.vm.read_file(path).await
    }
}
