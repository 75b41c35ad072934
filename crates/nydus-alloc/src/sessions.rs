//! Remote interactive session probe
//!
//! Maintenance needs to know whether the user a record is allocated to is
//! still logged in from that client. The probe shells out to `who` and keeps
//! only the rows whose origin is an IPv4 address; console and local TTY
//! rows carry a display name or nothing in that column and are discarded.
//!
//! Sample `who` output:
//! ```text
//! crutech  tty7         2025-01-01 13:27 (:0)
//! crutech  pts/1        2025-01-01 13:40 (192.168.1.5)
//! ```

use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{Error, Result};

const LOGINS_COMMAND: &str = "who";

/// `who` rows are username, tty, date, time, origin.
const WHO_FIELDS: usize = 5;
const USERNAME_FIELD: usize = 0;
const ORIGIN_FIELD: usize = 4;

/// One remote interactive login on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user: String,
    addr: Ipv4Addr,
}

impl Session {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }
}

/// Snapshot of the host's remote interactive sessions.
pub struct SessionTable {
    sessions: Vec<Session>,
}

impl SessionTable {
    /// Run the session-listing command and parse its output.
    pub async fn probe() -> Result<Self> {
        let output = tokio::process::Command::new(LOGINS_COMMAND)
            .output()
            .await
            .map_err(|e| Error::Probe(format!("running {LOGINS_COMMAND}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Probe(format!(
                "{LOGINS_COMMAND} exited with {}: {stderr}",
                output.status
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(Self::from_listing(&listing))
    }

    /// Parse a session listing. Rows that are not remote IPv4 logins are
    /// dropped, as are rows with an unexpected field count.
    pub fn from_listing(listing: &str) -> Self {
        let mut sessions = Vec::new();
        for line in listing.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != WHO_FIELDS {
                if !parts.is_empty() {
                    debug!(line, "skipping session row with unexpected field count");
                }
                continue;
            }

            let origin = parts[ORIGIN_FIELD]
                .trim_start_matches('(')
                .trim_end_matches(')');
            let Ok(addr) = origin.parse::<Ipv4Addr>() else {
                // Local session (tty, display) rather than a remote login.
                continue;
            };

            sessions.push(Session {
                user: parts[USERNAME_FIELD].to_string(),
                addr,
            });
        }
        Self { sessions }
    }

    pub fn all(&self) -> &[Session] {
        &self.sessions
    }

    /// Sessions for this user from this address. Usually 0 or 1 entries, but
    /// nothing stops a user logging in twice from the same machine.
    pub fn sessions_for(&self, user: &str, addr: Ipv4Addr) -> Vec<&Session> {
        self.sessions
            .iter()
            .filter(|s| s.user == user && s.addr == addr)
            .collect()
    }
}
