//! One row of the pool file
//!
//! A record is an auth bundle plus an optional tenancy: which client address
//! and local user currently hold the account, and since when. The tenancy
//! triple is either fully present (record is allocated) or fully absent
//! (record is free); a partial triple in the file means a past allocation
//! broke halfway, so it is normalised to free at load.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::warn;

use common::{format_timestamp, is_valid_system_username, parse_timestamp};
use nydus_auth::{AccessToken, AuthBundle, McProfile};

use crate::error::{Error, Result};

/// Field delimiter of the pool file. Validators keep every field comma-free,
/// so no escaping exists.
pub const ALLOC_DELIM: char = ',';

/// Pool-file columns, in order. The header line names them; every record
/// line must have exactly this many fields.
pub const FIELDS: [&str; 16] = [
    "client_addr",
    "client_user",
    "alloc_time",
    "ms_username",
    "msal_token",
    "msal_expiry",
    "xbl_token",
    "xbl_expiry",
    "xbl_hash",
    "xsts_token",
    "xsts_expiry",
    "xsts_hash",
    "mc_token",
    "mc_expiry",
    "mc_username",
    "mc_uuid",
];

/// Who holds the account right now, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenancy {
    client_addr: Ipv4Addr,
    client_user: String,
    allocated_at: DateTime<Utc>,
}

impl Tenancy {
    pub fn client_addr(&self) -> Ipv4Addr {
        self.client_addr
    }

    pub fn client_user(&self) -> &str {
        &self.client_user
    }

    pub fn allocated_at(&self) -> DateTime<Utc> {
        self.allocated_at
    }
}

/// An auth bundle with its current tenancy, as stored in the pool file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRecord {
    tenancy: Option<Tenancy>,
    bundle: AuthBundle,
}

impl AllocRecord {
    /// A free record around a freshly authenticated bundle.
    pub fn new_free(bundle: AuthBundle) -> Self {
        Self {
            tenancy: None,
            bundle,
        }
    }

    /// Header line for the top of the pool file (no trailing newline).
    pub fn header() -> String {
        FIELDS.join(&ALLOC_DELIM.to_string())
    }

    /// Parse one pool-file line. The field count is strict; a tenancy with
    /// only some of its three fields present is normalised to free.
    pub fn from_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(ALLOC_DELIM).collect();
        if parts.len() != FIELDS.len() {
            return Err(Error::Parse(format!(
                "expected {} comma-separated fields, found {}",
                FIELDS.len(),
                parts.len()
            )));
        }

        let token = |tok: &str, expiry: &str, hash: &str, stage: &str| -> Result<AccessToken> {
            let expires_at = parse_timestamp(expiry)
                .map_err(|_| Error::Parse(format!("bad {stage} expiry timestamp: {expiry:?}")))?;
            AccessToken::with_hash(tok, expires_at, hash)
                .map_err(|e| Error::Parse(format!("bad {stage} token: {e}")))
        };

        let msal = token(parts[4], parts[5], "", "identity-provider")?;
        let xbl = token(parts[6], parts[7], parts[8], "Xbox Live")?;
        let xsts = token(parts[9], parts[10], parts[11], "XSTS")?;
        let minecraft = token(parts[12], parts[13], "", "game")?;

        let profile = McProfile::new(parts[14], parts[15], parts[12])
            .map_err(|e| Error::Parse(format!("bad game profile: {e}")))?;
        let bundle = AuthBundle::new(parts[3], msal, xbl, xsts, minecraft, profile)
            .map_err(|e| Error::Parse(format!("bad auth bundle: {e}")))?;

        let tenancy = parse_tenancy(parts[0], parts[1], parts[2])?;
        Ok(Self { tenancy, bundle })
    }

    /// Render the record as one pool-file line (no trailing newline).
    pub fn to_line(&self) -> String {
        let (addr, user, at) = match &self.tenancy {
            Some(t) => (
                t.client_addr.to_string(),
                t.client_user.clone(),
                format_timestamp(t.allocated_at),
            ),
            None => (String::new(), String::new(), String::new()),
        };

        let fields: [&str; 16] = [
            addr.as_str(),
            user.as_str(),
            at.as_str(),
            self.bundle.ms_username(),
            self.bundle.msal().token(),
            &format_timestamp(self.bundle.msal().expires_at()),
            self.bundle.xbl().token(),
            &format_timestamp(self.bundle.xbl().expires_at()),
            self.bundle.xbl().hash(),
            self.bundle.xsts().token(),
            &format_timestamp(self.bundle.xsts().expires_at()),
            self.bundle.xsts().hash(),
            self.bundle.minecraft().token(),
            &format_timestamp(self.bundle.minecraft().expires_at()),
            self.bundle.profile().name(),
            self.bundle.profile().uuid(),
        ];
        debug_assert_eq!(fields.len(), FIELDS.len());
        fields.join(&ALLOC_DELIM.to_string())
    }

    pub fn is_allocated(&self) -> bool {
        self.tenancy.is_some()
    }

    pub fn tenancy(&self) -> Option<&Tenancy> {
        self.tenancy.as_ref()
    }

    /// Give the account to a client. Overwrites any existing tenancy, which
    /// is how explicit reassignment works.
    pub fn allocate(&mut self, client_addr: Ipv4Addr, client_user: &str) -> Result<()> {
        if !is_valid_system_username(client_user) {
            return Err(Error::Policy(format!(
                "not a usable client username: {client_user:?}"
            )));
        }
        self.tenancy = Some(Tenancy {
            client_addr,
            client_user: client_user.to_string(),
            allocated_at: Utc::now(),
        });
        Ok(())
    }

    /// Clear the tenancy. The bundle is retained; releasing a free record is
    /// a no-op.
    pub fn release(&mut self) {
        self.tenancy = None;
    }

    /// Whether the tenancy is older than `limit`. Free records never expire.
    pub fn tenancy_expired(&self, limit: Duration) -> bool {
        match &self.tenancy {
            Some(t) => {
                let age = Utc::now() - t.allocated_at;
                age > TimeDelta::from_std(limit).unwrap_or(TimeDelta::MAX)
            }
            None => false,
        }
    }

    pub fn bundle(&self) -> &AuthBundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut AuthBundle {
        &mut self.bundle
    }

    /// Game UUID identifying this record within the pool.
    pub fn uuid(&self) -> &str {
        self.bundle.profile().uuid()
    }

    // Renewal queries, forwarded per token so maintenance can ask the
    // record directly.

    pub fn msal_needs_renewal(&self, period: Duration, lookahead: u32) -> bool {
        self.bundle.msal().needs_renewal(period, lookahead)
    }

    pub fn xbl_needs_renewal(&self, period: Duration, lookahead: u32) -> bool {
        self.bundle.xbl().needs_renewal(period, lookahead)
    }

    pub fn xsts_needs_renewal(&self, period: Duration, lookahead: u32) -> bool {
        self.bundle.xsts().needs_renewal(period, lookahead)
    }

    pub fn minecraft_needs_renewal(&self, period: Duration, lookahead: u32) -> bool {
        self.bundle.minecraft().needs_renewal(period, lookahead)
    }
}

fn parse_tenancy(addr: &str, user: &str, at: &str) -> Result<Option<Tenancy>> {
    let present = [addr, user, at].iter().filter(|f| !f.is_empty()).count();
    match present {
        0 => Ok(None),
        3 => {
            let client_addr: Ipv4Addr = addr
                .parse()
                .map_err(|_| Error::Parse(format!("bad client address: {addr:?}")))?;
            if !is_valid_system_username(user) {
                return Err(Error::Parse(format!("bad client username: {user:?}")));
            }
            let allocated_at = parse_timestamp(at)
                .map_err(|_| Error::Parse(format!("bad allocation timestamp: {at:?}")))?;
            Ok(Some(Tenancy {
                client_addr,
                client_user: user.to_string(),
                allocated_at,
            }))
        }
        _ => {
            // A half-written tenancy means an allocation broke partway;
            // count the record as free.
            warn!(addr, user, at, "partial tenancy in pool file, treating record as free");
            Ok(None)
        }
    }
}
