//! Identity-provider token acquisition
//!
//! The first stage of the chain talks to the Microsoft consumers tenant as a
//! public client. Two paths exist:
//!
//! 1. silent: a refresh-token grant using provider state cached from an
//!    earlier sign-in; this is the only path maintenance may take;
//! 2. interactive: the device-authorization grant (RFC 8628), where the operator
//!    is shown a verification URI and user code, and the token endpoint is
//!    polled until sign-in completes. Used at startup while a human is
//!    present.
//!
//! The client caches the rotated refresh token per username, so one
//! interactive sign-in at startup carries all later silent renewals.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::{is_valid_field, is_valid_ms_username};

use crate::constants::{MSAL_DEVICE_CODE_ENDPOINT, MSAL_SCOPES, MSAL_TOKEN_ENDPOINT};
use crate::error::{Error, Result};
use crate::token::AccessToken;

/// Successful answer from the token endpoint, for both grant types.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    /// Seconds until expiry, relative to the response.
    expires_in: u64,
    /// Present when `offline_access` was granted; rotates on every use.
    refresh_token: Option<String>,
}

/// Error answer from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenDenial {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Answer from the device-authorization endpoint.
#[derive(Debug, Deserialize)]
struct DeviceCodeGrant {
    device_code: String,
    user_code: String,
    verification_uri: String,
    /// Seconds until the user code lapses.
    expires_in: u64,
    /// Suggested seconds between token-endpoint polls.
    interval: u64,
}

/// Token-endpoint error codes that mean the cached state is unusable and a
/// human has to sign in again.
const INTERACTION_ERRORS: &[&str] = &["invalid_grant", "interaction_required", "expired_token"];

/// Public-client handle for the identity provider.
///
/// Create one per process and share it; the refresh-token cache inside is
/// what lets background renewal run without prompting anyone.
pub struct MsalClient {
    client_id: String,
    http: reqwest::Client,
    refresh_tokens: Mutex<HashMap<String, String>>,
}

impl MsalClient {
    pub fn new(client_id: impl Into<String>, http: reqwest::Client) -> Result<Self> {
        let client_id = client_id.into();
        if !is_valid_field(&client_id) {
            return Err(Error::InvalidValue(format!(
                "not a usable identity-provider client id: {client_id:?}"
            )));
        }
        Ok(Self {
            client_id,
            http,
            refresh_tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire an identity-provider token for `username`.
    ///
    /// Tries the silent path whenever cached state exists. When that fails or
    /// no state is cached, falls back to the device-code flow if
    /// `interactive_allowed`, and otherwise fails with interaction-required.
    pub async fn acquire_token(
        &self,
        username: &str,
        interactive_allowed: bool,
    ) -> Result<AccessToken> {
        if !is_valid_ms_username(username) {
            return Err(Error::InvalidValue(format!(
                "not an email-shaped upstream username: {username:?}"
            )));
        }

        let cached = self.refresh_tokens.lock().await.get(username).cloned();
        if let Some(refresh_token) = cached {
            match self.acquire_silent(username, &refresh_token).await {
                Ok(token) => return Ok(token),
                Err(err) if interactive_allowed => {
                    warn!(username, error = %err, "silent acquisition failed, falling back to device-code sign-in");
                }
                Err(err) => return Err(err),
            }
        }

        if interactive_allowed {
            self.acquire_interactive(username).await
        } else {
            Err(Error::InteractionRequired(format!(
                "no cached sign-in for {username}"
            )))
        }
    }

    /// Refresh-token grant. Rotates the cached refresh token on success and
    /// drops it when the provider says the grant is dead.
    async fn acquire_silent(&self, username: &str, refresh_token: &str) -> Result<AccessToken> {
        let response = self
            .http
            .post(MSAL_TOKEN_ENDPOINT)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("scope", MSAL_SCOPES),
            ])
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading token refresh response: {e}")))?;

        if !status.is_success() {
            if let Ok(denial) = serde_json::from_str::<TokenDenial>(&body) {
                if INTERACTION_ERRORS.contains(&denial.error.as_str()) {
                    self.refresh_tokens.lock().await.remove(username);
                    return Err(Error::InteractionRequired(format!(
                        "cached sign-in for {username} was rejected: {}",
                        denial.error_description
                    )));
                }
            }
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let grant: TokenGrant = serde_json::from_str(&body)
            .map_err(|e| Error::MalformedResponse(format!("token refresh response: {e}")))?;
        self.store_grant(username, &grant).await;
        debug!(username, "silent token acquisition succeeded");
        grant_to_token(grant)
    }

    /// Device-authorization grant: announce the code, then poll until the
    /// operator completes sign-in or the code lapses.
    async fn acquire_interactive(&self, username: &str) -> Result<AccessToken> {
        let response = self
            .http
            .post(MSAL_DEVICE_CODE_ENDPOINT)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", MSAL_SCOPES),
            ])
            .send()
            .await
            .map_err(|e| Error::Http(format!("device-code request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let device: DeviceCodeGrant = response
            .json()
            .await
            .map_err(|e| Error::MalformedResponse(format!("device-code response: {e}")))?;

        info!(
            username,
            verification_uri = %device.verification_uri,
            user_code = %device.user_code,
            "waiting for operator sign-in"
        );

        let mut poll_interval = Duration::from_secs(device.interval.max(1));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);

        loop {
            tokio::time::sleep(poll_interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::InteractionRequired(format!(
                    "device code lapsed before sign-in completed for {username}"
                )));
            }

            let response = self
                .http
                .post(MSAL_TOKEN_ENDPOINT)
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", device.device_code.as_str()),
                ])
                .send()
                .await
                .map_err(|e| Error::Http(format!("device-code poll failed: {e}")))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| Error::Http(format!("reading device-code poll response: {e}")))?;

            if status.is_success() {
                let grant: TokenGrant = serde_json::from_str(&body).map_err(|e| {
                    Error::MalformedResponse(format!("device-code token response: {e}"))
                })?;
                self.store_grant(username, &grant).await;
                info!(username, "operator sign-in completed");
                return grant_to_token(grant);
            }

            match serde_json::from_str::<TokenDenial>(&body) {
                Ok(denial) if denial.error == "authorization_pending" => continue,
                Ok(denial) if denial.error == "slow_down" => {
                    poll_interval += Duration::from_secs(5);
                }
                Ok(denial) => {
                    return Err(Error::UpstreamStatus {
                        status: status.as_u16(),
                        body: format!("{}: {}", denial.error, denial.error_description),
                    });
                }
                Err(_) => {
                    return Err(Error::UpstreamStatus {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
    }

    async fn store_grant(&self, username: &str, grant: &TokenGrant) {
        match &grant.refresh_token {
            Some(refresh_token) => {
                self.refresh_tokens
                    .lock()
                    .await
                    .insert(username.to_string(), refresh_token.clone());
            }
            None => {
                warn!(username, "token grant carried no refresh token; silent renewal will not work");
            }
        }
    }

    /// Whether a silent acquisition could currently be attempted.
    pub async fn has_cached_signin(&self, username: &str) -> bool {
        self.refresh_tokens.lock().await.contains_key(username)
    }
}

fn grant_to_token(grant: TokenGrant) -> Result<AccessToken> {
    let expires_at = Utc::now() + TimeDelta::seconds(grant.expires_in as i64);
    AccessToken::new(grant.access_token, expires_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MsalClient {
        MsalClient::new("1ab23456-7890-1c2d-e3fg-45h6789ijk01", reqwest::Client::new()).unwrap()
    }

    #[test]
    fn rejects_blank_client_id() {
        assert!(MsalClient::new("", reqwest::Client::new()).is_err());
        assert!(MsalClient::new("id with spaces", reqwest::Client::new()).is_err());
    }

    #[tokio::test]
    async fn silent_only_with_no_cache_is_interaction_required() {
        let c = client();
        let err = c
            .acquire_token("player@example.com", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InteractionRequired(_)), "{err}");
    }

    #[tokio::test]
    async fn rejects_malformed_username_before_any_network() {
        let c = client();
        let err = c.acquire_token("not-an-email", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)), "{err}");
    }

    #[tokio::test]
    async fn cache_starts_empty() {
        let c = client();
        assert!(!c.has_cached_signin("player@example.com").await);
    }

    #[test]
    fn token_grant_deserializes() {
        let json = r#"{"access_token":"at","expires_in":3600,"refresh_token":"rt"}"#;
        let grant: TokenGrant = serde_json::from_str(json).unwrap();
        assert_eq!(grant.access_token, "at");
        assert_eq!(grant.expires_in, 3600);
        assert_eq!(grant.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn token_grant_without_refresh_deserializes() {
        let json = r#"{"access_token":"at","expires_in":3600}"#;
        let grant: TokenGrant = serde_json::from_str(json).unwrap();
        assert!(grant.refresh_token.is_none());
    }

    #[test]
    fn token_denial_deserializes_without_description() {
        let json = r#"{"error":"authorization_pending"}"#;
        let denial: TokenDenial = serde_json::from_str(json).unwrap();
        assert_eq!(denial.error, "authorization_pending");
        assert_eq!(denial.error_description, "");
    }

    #[test]
    fn interaction_error_codes_cover_dead_grants() {
        assert!(INTERACTION_ERRORS.contains(&"invalid_grant"));
        assert!(INTERACTION_ERRORS.contains(&"interaction_required"));
        assert!(!INTERACTION_ERRORS.contains(&"slow_down"));
    }

    #[test]
    fn device_code_grant_deserializes() {
        let json = r#"{"device_code":"dc","user_code":"ABCD-1234",
            "verification_uri":"https://microsoft.com/devicelogin",
            "expires_in":900,"interval":5,"message":"ignored"}"#;
        let grant: DeviceCodeGrant = serde_json::from_str(json).unwrap();
        assert_eq!(grant.user_code, "ABCD-1234");
        assert_eq!(grant.interval, 5);
    }

    #[test]
    fn grant_expiry_is_relative_to_now() {
        let grant = TokenGrant {
            access_token: "at".into(),
            expires_in: 3600,
            refresh_token: None,
        };
        let token = grant_to_token(grant).unwrap();
        let delta = token.expires_at() - Utc::now();
        assert!(delta > TimeDelta::minutes(59) && delta <= TimeDelta::minutes(60));
    }
}
