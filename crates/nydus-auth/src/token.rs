//! Access-token record
//!
//! One bearer token with its absolute expiry and, for the Xbox stages, the
//! secondary user hash claim. Values are immutable once constructed; renewal
//! replaces the whole record.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use crate::error::{Error, Result};

/// How many maintenance periods of headroom `needs_renewal` looks ahead by
/// default. Looking further than one period gives later passes a chance to
/// retry a failed renewal before the token actually lapses.
pub const DEFAULT_RENEWAL_LOOKAHEAD: u32 = 2;

/// A bearer token with an absolute expiry and an optional hash side-value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
    hash: String,
}

impl AccessToken {
    /// Token without a hash claim (identity-provider and game stages).
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Result<Self> {
        Self::with_hash(token, expires_at, String::new())
    }

    /// Token carrying a hash claim (Xbox Live and XSTS stages).
    pub fn with_hash(
        token: impl Into<String>,
        expires_at: DateTime<Utc>,
        hash: impl Into<String>,
    ) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::InvalidValue("access token must be non-empty".into()));
        }
        Ok(Self {
            token,
            expires_at,
            hash: hash.into(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Empty for stages that carry no secondary claim.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Strict check: the expiry instant has been reached.
    pub fn expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Forward-looking check: expired now, or will be within
    /// `lookahead * period`.
    pub fn needs_renewal(&self, period: Duration, lookahead: u32) -> bool {
        if self.expired() {
            return true;
        }
        let window = TimeDelta::from_std(period.saturating_mul(lookahead.max(1)))
            .unwrap_or(TimeDelta::MAX);
        Utc::now().checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
            >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(n: i64) -> DateTime<Utc> {
        Utc::now() + TimeDelta::minutes(n)
    }

    #[test]
    fn rejects_empty_token() {
        assert!(AccessToken::new("", minutes(10)).is_err());
        assert!(AccessToken::with_hash("", minutes(10), "h").is_err());
    }

    #[test]
    fn hash_defaults_to_empty() {
        let tok = AccessToken::new("tok", minutes(10)).unwrap();
        assert_eq!(tok.hash(), "");
        let tok = AccessToken::with_hash("tok", minutes(10), "uhs1").unwrap();
        assert_eq!(tok.hash(), "uhs1");
    }

    #[test]
    fn expired_is_strict() {
        let live = AccessToken::new("tok", minutes(10)).unwrap();
        assert!(!live.expired());
        let dead = AccessToken::new("tok", minutes(-1)).unwrap();
        assert!(dead.expired());
    }

    #[test]
    fn needs_renewal_window() {
        // Expires in 50 minutes; a 30-minute period with lookahead 2 means
        // the 60-minute window catches it.
        let tok = AccessToken::new("tok", minutes(50)).unwrap();
        assert!(tok.needs_renewal(Duration::from_secs(30 * 60), 2));
        // A 10-minute period only looks 20 minutes ahead.
        assert!(!tok.needs_renewal(Duration::from_secs(10 * 60), 2));
    }

    #[test]
    fn expired_implies_needs_renewal() {
        let dead = AccessToken::new("tok", minutes(-5)).unwrap();
        assert!(dead.needs_renewal(Duration::from_secs(1), 1));
        assert!(dead.needs_renewal(Duration::from_secs(0), 7));
    }

    #[test]
    fn huge_lookahead_does_not_overflow() {
        let tok = AccessToken::new("tok", minutes(10)).unwrap();
        assert!(tok.needs_renewal(Duration::from_secs(u64::MAX / 2), u32::MAX));
    }
}
