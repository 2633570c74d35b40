//! Address resolution: from the guest's volatile IP to a stable relay
//! connection string.
//!
//! The relay multiplexes many guests behind one host name. A guest is
//! addressed by a port built from the last two octets of its internal
//! address: the third octet's text followed by the fourth octet zero-padded
//! to three digits. `10.0.1.50` becomes port `1050`, `192.168.168.5` becomes
//! `168005`. This is string concatenation, not arithmetic, and is only
//! meaningful to the relay.
//!
//! [`AddressPoller`] owns the retry counter for reading the address file.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::error::{BringUpError, Result};
use crate::vm::GuestFileError;

/// Relay host used when the proxy URL has no `scheme://` part.
pub const NO_PROXY: &str = "NO_PROXY";

// ---------------------------------------------------------------------------
// ProbedAddress
// ---------------------------------------------------------------------------

/// A dotted quad exactly as the guest wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedAddress {
    octets: [String; 4],
}

impl ProbedAddress {
    /// Parse `a.b.c.d`, each field 1-3 ASCII digits no greater than 255.
    /// Surrounding whitespace is ignored; the octet text is otherwise kept
    /// verbatim.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = |reason: &str| BringUpError::MalformedAddress {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = raw.trim().split('.').collect();
        if fields.len() != 4 {
            return Err(malformed("expected four dot-separated octets"));
        }
        for field in &fields {
            if field.is_empty() || field.len() > 3 || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed("octets must be 1-3 decimal digits"));
            }
            let value: u16 = field.parse().map_err(|_| malformed("octet is not a number"))?;
            if value > 255 {
                return Err(malformed("octet out of range"));
            }
        }

        Ok(Self {
            octets: [
                fields[0].to_string(),
                fields[1].to_string(),
                fields[2].to_string(),
                fields[3].to_string(),
            ],
        })
    }

    /// Relay port text: third octet, then the fourth padded to three digits.
    pub fn relay_port(&self) -> String {
        format!("{}{:0>3}", self.octets[2], self.octets[3])
    }
}

impl std::fmt::Display for ProbedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.octets.join("."))
    }
}

// ---------------------------------------------------------------------------
// Relay host and connection string
// ---------------------------------------------------------------------------

/// Host part of the relay URL: scheme and one trailing slash removed.
pub fn relay_host(proxy_url: &str) -> String {
    let host = proxy_url
        .split("//")
        .nth(1)
        .filter(|rest| !rest.is_empty())
        .unwrap_or(NO_PROXY);
    host.strip_suffix('/').unwrap_or(host).to_string()
}

pub fn connection_string(credential: Option<&str>, relay_host: &str, port: &str) -> Result<String> {
    let credential = credential.ok_or(BringUpError::MissingCredential)?;
    Ok(format!("postgres://postgres:{credential}@{relay_host}:{port}"))
}

/// The externally visible result of a bring-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedInstance {
    pub connection_string: String,
    pub credential: String,
    pub relay_host: String,
    pub port: String,
    pub guest_address: String,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedInstance {
    pub fn from_probe(config: &Config, address: &ProbedAddress) -> Result<Self> {
        let credential = config
            .credential
            .clone()
            .ok_or(BringUpError::MissingCredential)?;
        let relay_host = relay_host(&config.proxy_url);
        let port = address.relay_port();
        let connection_string = connection_string(Some(&credential), &relay_host, &port)?;

        Ok(Self {
            connection_string,
            credential,
            relay_host,
            port,
            guest_address: address.to_string(),
            resolved_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// AddressPoller
// ---------------------------------------------------------------------------

/// What to do after one read of the address file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    /// The guest published an address.
    Found(ProbedAddress),
    /// Nothing yet; `attempt` reads have come back empty so far.
    Pending { attempt: u32 },
}

/// Bounded retry counter for address reads.
#[derive(Debug, Clone)]
pub struct AddressPoller {
    attempts: u32,
    max_attempts: u32,
    active: bool,
}

impl AddressPoller {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
            active: false,
        }
    }

    /// Mark a poll loop as running. Returns `false` if one already is.
    pub fn start(&mut self) -> bool {
        !std::mem::replace(&mut self.active, true)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Classify one read. Not-found and blank content consume one attempt;
    /// any other read error fails at once without touching the budget.
    pub fn observe(&mut self, read: std::result::Result<Vec<u8>, GuestFileError>) -> Result<PollStep> {
        let content = match read {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(GuestFileError::NotFound { .. }) => String::new(),
            Err(err) => {
                self.reset();
                return Err(BringUpError::NetworkInit {
                    reason: err.to_string(),
                });
            }
        };

        if !content.is_empty() {
            self.reset();
            return ProbedAddress::parse(&content).map(PollStep::Found);
        }

        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            let attempts = self.attempts;
            self.reset();
            return Err(BringUpError::NetworkBringUpFailed { attempts });
        }
        Ok(PollStep::Pending {
            attempt: self.attempts,
        })
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.active = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
