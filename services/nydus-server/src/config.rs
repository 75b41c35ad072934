//! Configuration loading
//!
//! The config file is line-oriented `Key = Value` text. Blank lines and `#`
//! comments are skipped; an unknown key or a line without an equals sign
//! fails the load, as does any value that fails its form check. Every
//! recognised key has a default, so a minimal deployment only overrides what
//! differs from the LAN's conventions.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use common::{
    is_valid_field, is_valid_ipaddr, is_valid_mc_version, is_valid_ms_username, is_valid_port,
};

use crate::error::{Error, Result};

/// Where the daemon looks when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nydus-launcher/nydus-server.conf";

const IPADDR: &str = "IpAddr";
const PORT: &str = "Port";
const CERTFILE: &str = "CertFile";
const CERTPRIVKEY: &str = "CertPrivKey";
const MCVERSION: &str = "McVersion";
const MSALCID: &str = "MSALClientID";
const ALLOCFILE: &str = "AllocFile";
const ACCOUNTSFILE: &str = "AccountsFile";
const METRICSADDR: &str = "MetricsAddr";

/// Server configuration, validated at load.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the client-facing listener.
    pub ip_addr: Ipv4Addr,
    /// Bind port for the client-facing listener.
    pub port: u16,
    /// PEM certificate chain presented to clients.
    pub cert_file: PathBuf,
    /// PEM private key for the certificate.
    pub cert_privkey: PathBuf,
    /// Opaque game version string echoed in allocation responses.
    pub mc_version: String,
    /// Identity-provider public-client id.
    pub msal_client_id: String,
    /// Pool file path. May not exist yet on first start.
    pub alloc_file: PathBuf,
    /// Newline-delimited upstream-username list.
    pub accounts_file: PathBuf,
    /// Prometheus exporter bind address; `None` disables the exporter.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip_addr: Ipv4Addr::new(192, 168, 1, 1),
            port: 2011,
            cert_file: PathBuf::from("nydus-server.crt"),
            cert_privkey: PathBuf::from("nydus-server.key"),
            mc_version: "1.20.6".to_string(),
            msal_client_id: "1ab23456-7890-1c2d-e3fg-45h6789ijk01".to_string(),
            alloc_file: PathBuf::from("nydus-alloc.csv"),
            accounts_file: PathBuf::from("nydus-accounts.txt"),
            metrics_addr: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the config path from an optional CLI override.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        cli_path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate configuration from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    /// Parse configuration text. Separate from `load` so tests can feed
    /// strings directly.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config = Self::default();

        for (idx, raw) in contents.lines().enumerate() {
            let nline = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Config(format!(
                    "line {nline}: no equals sign in {line:?}"
                )));
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                IPADDR => {
                    if !is_valid_ipaddr(value) {
                        return Err(bad_value(nline, IPADDR, value));
                    }
                    config.ip_addr = value.parse().map_err(|_| bad_value(nline, IPADDR, value))?;
                }
                PORT => {
                    if !is_valid_port(value) {
                        return Err(bad_value(nline, PORT, value));
                    }
                    config.port = value.parse().map_err(|_| bad_value(nline, PORT, value))?;
                }
                CERTFILE => config.cert_file = path_value(nline, CERTFILE, value)?,
                CERTPRIVKEY => config.cert_privkey = path_value(nline, CERTPRIVKEY, value)?,
                MCVERSION => {
                    if !is_valid_mc_version(value) {
                        return Err(bad_value(nline, MCVERSION, value));
                    }
                    config.mc_version = value.to_string();
                }
                MSALCID => {
                    if !is_valid_field(value) {
                        return Err(bad_value(nline, MSALCID, value));
                    }
                    config.msal_client_id = value.to_string();
                }
                ALLOCFILE => config.alloc_file = path_value(nline, ALLOCFILE, value)?,
                ACCOUNTSFILE => config.accounts_file = path_value(nline, ACCOUNTSFILE, value)?,
                METRICSADDR => {
                    config.metrics_addr = if value.is_empty() {
                        None
                    } else {
                        Some(value.parse().map_err(|_| bad_value(nline, METRICSADDR, value))?)
                    };
                }
                unknown => {
                    return Err(Error::Config(format!(
                        "line {nline}: unknown parameter {unknown:?}"
                    )));
                }
            }
        }

        Ok(config)
    }
}

fn bad_value(nline: usize, key: &str, value: &str) -> Error {
    Error::Config(format!("line {nline}: bad value for {key}: {value:?}"))
}

fn path_value(nline: usize, key: &str, value: &str) -> Result<PathBuf> {
    if value.is_empty() {
        return Err(bad_value(nline, key, value));
    }
    Ok(PathBuf::from(value))
}

/// Read the upstream-username list: one email-shaped username per line.
/// Blank lines are skipped; anything else malformed fails startup.
pub fn read_accounts_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Accounts(format!("reading {}: {e}", path.display())))?;

    let mut usernames = Vec::new();
    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.split_whitespace().count() != 1 || !is_valid_ms_username(line) {
            return Err(Error::Accounts(format!(
                "line {}: not a single upstream username: {raw:?}",
                idx + 1
            )));
        }
        usernames.push(line.to_string());
    }
    Ok(usernames)
}
