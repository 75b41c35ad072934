//! The chained authentication stages
//!
//! Identity-provider token in, game profile out, via Xbox Live and XSTS.
//! Every stage is a standalone async function of the previous stage's token
//! over a shared `reqwest::Client`, so maintenance can refresh exactly the
//! stage that is expiring. Stages never retry; the caller decides when to
//! try again.
//!
//! Each stage is a thin HTTP exchange around a pure parse function; the
//! parse functions are what the tests exercise.

use std::collections::HashMap;

use reqwest::header::ACCEPT;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::bundle::{AuthBundle, McProfile};
use crate::claims::extract_user_hash;
use crate::constants::{MC_AUTH_ENDPOINT, MC_PROFILE_ENDPOINT, XBL_AUTH_ENDPOINT, XSTS_AUTH_ENDPOINT};
use crate::error::{Error, Result};
use crate::msal::MsalClient;
use crate::timestamp::parse_xbox_timestamp;
use crate::token::AccessToken;

const XB_TOKEN_KEY: &str = "Token";
const XB_EXPIRY_KEY: &str = "NotAfter";
const MC_TOKEN_KEY: &str = "access_token";
const MC_EXPIRES_KEY: &str = "expires_in";
const MC_NAME_KEY: &str = "name";
const MC_UUID_KEY: &str = "id";

/// Exchange an identity-provider token for an Xbox Live token.
pub async fn xboxlive_token(http: &reqwest::Client, msal: &AccessToken) -> Result<AccessToken> {
    let body = post_json(http, XBL_AUTH_ENDPOINT, &xbl_request_body(msal.token())).await?;
    parse_xbox_stage(&body)
}

/// Exchange an Xbox Live token for an XSTS token.
pub async fn xsts_token(http: &reqwest::Client, xbl: &AccessToken) -> Result<AccessToken> {
    let body = post_json(http, XSTS_AUTH_ENDPOINT, &xsts_request_body(xbl.token())).await?;
    parse_xbox_stage(&body)
}

/// Exchange an XSTS token (and its user hash) for a game token.
pub async fn minecraft_token(http: &reqwest::Client, xsts: &AccessToken) -> Result<AccessToken> {
    let body = post_json(http, MC_AUTH_ENDPOINT, &mc_request_body(xsts)).await?;
    parse_mc_stage(&body)
}

/// Fetch the game profile issued for a game token.
pub async fn minecraft_profile(
    http: &reqwest::Client,
    minecraft: &AccessToken,
) -> Result<McProfile> {
    let response = http
        .get(MC_PROFILE_ENDPOINT)
        .header(ACCEPT, "application/json")
        .bearer_auth(minecraft.token())
        .send()
        .await
        .map_err(|e| Error::Http(format!("profile request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| Error::MalformedResponse(format!("profile response was not JSON: {e}")))?;
    parse_mc_profile(&body, minecraft.token())
}

/// Run the whole chain for one upstream account.
///
/// Fails with the first failing stage's error; nothing partial is returned.
pub async fn auth_stream(
    http: &reqwest::Client,
    msal_client: &MsalClient,
    username: &str,
    interactive_allowed: bool,
) -> Result<AuthBundle> {
    let msal = msal_client.acquire_token(username, interactive_allowed).await?;
    let xbl = xboxlive_token(http, &msal).await?;
    let xsts = xsts_token(http, &xbl).await?;
    if xbl.hash() != xsts.hash() {
        // Downstream uses the XSTS hash either way.
        warn!(username, "Xbox Live and XSTS responses carried different user hashes");
    }
    let minecraft = minecraft_token(http, &xsts).await?;
    let profile = minecraft_profile(http, &minecraft).await?;
    AuthBundle::new(username, msal, xbl, xsts, minecraft, profile)
}

/// Run the whole chain for every username, independently.
///
/// Never fails as a whole: a failed username maps to `None` and its error is
/// logged, while the rest proceed.
pub async fn auth_all(
    http: &reqwest::Client,
    msal_client: &MsalClient,
    usernames: &[String],
    interactive_allowed: bool,
) -> HashMap<String, Option<AuthBundle>> {
    let mut results = HashMap::with_capacity(usernames.len());
    for username in usernames {
        let outcome = auth_stream(http, msal_client, username, interactive_allowed).await;
        match outcome {
            Ok(bundle) => {
                info!(username, profile = bundle.profile().name(), "account authenticated");
                results.insert(username.clone(), Some(bundle));
            }
            Err(err) => {
                warn!(username, error = %err, "account authentication failed");
                results.insert(username.clone(), None);
            }
        }
    }
    results
}

/// Fixed Xbox Live request envelope around an identity-provider token.
fn xbl_request_body(msal_token: &str) -> Value {
    json!({
        "Properties": {
            "AuthMethod": "RPS",
            "SiteName": "user.auth.xboxlive.com",
            "RpsTicket": format!("d={msal_token}"),
        },
        "RelyingParty": "http://auth.xboxlive.com",
        "TokenType": "JWT",
    })
}

/// Fixed XSTS request envelope around an Xbox Live token.
fn xsts_request_body(xbl_token: &str) -> Value {
    json!({
        "Properties": {
            "SandboxId": "RETAIL",
            "UserTokens": [xbl_token],
        },
        "RelyingParty": "rp://api.minecraftservices.com/",
        "TokenType": "JWT",
    })
}

/// Game-auth request: the XSTS hash and token combined into one identity
/// ticket.
fn mc_request_body(xsts: &AccessToken) -> Value {
    json!({
        "identityToken": format!("XBL3.0 x={};{}", xsts.hash(), xsts.token()),
    })
}

/// Parse the shared Xbox Live / XSTS response shape: bearer token, absolute
/// high-precision expiry, and the user hash.
fn parse_xbox_stage(body: &Value) -> Result<AccessToken> {
    let token = body
        .get(XB_TOKEN_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::MalformedResponse(format!("response carried no {XB_TOKEN_KEY} string"))
        })?;

    let not_after = body
        .get(XB_EXPIRY_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::MalformedResponse(format!("response carried no {XB_EXPIRY_KEY} string"))
        })?;

    let expires_at = parse_xbox_timestamp(not_after)?;
    let hash = extract_user_hash(body)?;
    AccessToken::with_hash(token, expires_at, hash)
}

/// Parse the game-auth response: bearer token plus a relative expiry.
fn parse_mc_stage(body: &Value) -> Result<AccessToken> {
    let token = body
        .get(MC_TOKEN_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::MalformedResponse(format!("response carried no {MC_TOKEN_KEY} string"))
        })?;

    let expires_in = body
        .get(MC_EXPIRES_KEY)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            Error::MalformedResponse(format!("response carried no integer {MC_EXPIRES_KEY}"))
        })?;

    let expires_at = chrono::Utc::now() + chrono::TimeDelta::seconds(expires_in);
    AccessToken::new(token, expires_at)
}

/// Parse the profile response into the issued game identity, echoing the
/// game token the profile was fetched with.
fn parse_mc_profile(body: &Value, game_token: &str) -> Result<McProfile> {
    let name = body
        .get(MC_NAME_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::MalformedResponse(format!("profile carried no {MC_NAME_KEY} string"))
        })?;

    let uuid = body
        .get(MC_UUID_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::MalformedResponse(format!("profile carried no {MC_UUID_KEY} string"))
        })?;

    McProfile::new(name, uuid, game_token)
}

async fn post_json(http: &reqwest::Client, url: &str, body: &Value) -> Result<Value> {
    let response = http
        .post(url)
        .header(ACCEPT, "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| Error::Http(format!("request to {url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| Error::MalformedResponse(format!("response from {url} was not JSON: {e}")))
}
