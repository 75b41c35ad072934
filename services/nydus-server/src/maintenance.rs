//! Periodic pool maintenance
//!
//! One dedicated task wakes every maintenance period and, under a single
//! engine-lock acquisition: renews every token that approaches expiry,
//! releases tenancies older than the allocation timeout, and releases
//! tenancies whose user has no live remote session. Renewal runs with
//! interaction disabled; a token whose renewal fails is left for the next
//! pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use nydus_alloc::{ALLOC_TIMEOUT, AllocEngine, SessionTable};
use nydus_auth::{DEFAULT_RENEWAL_LOOKAHEAD, MsalClient, pipeline};

/// How long the maintenance task sleeps between passes.
pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Spawn the maintenance task.
///
/// Storage failures go to the fatal channel and stop the task; everything
/// else is logged and retried next pass.
pub fn spawn_maintenance(
    engine: Arc<Mutex<AllocEngine>>,
    msal: Arc<MsalClient>,
    http: reqwest::Client,
    fatal: mpsc::Sender<nydus_alloc::Error>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_PERIOD);
        // Skip the immediate first tick; the pool was just (re)authenticated.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = maintenance_pass(&engine, &msal, &http, MAINTENANCE_PERIOD).await {
                warn!(error = %e, "maintenance pass failed, requesting shutdown");
                let _ = fatal.send(e).await;
                return;
            }
        }
    })
}

/// Run one maintenance pass under the engine lock.
pub async fn maintenance_pass(
    engine: &Mutex<AllocEngine>,
    msal: &MsalClient,
    http: &reqwest::Client,
    period: Duration,
) -> nydus_alloc::Result<()> {
    let mut engine = engine.lock().await;

    let renewed = renew_tokens(&mut engine, msal, http, period).await;
    if renewed > 0 {
        engine.save().await?;
    }

    engine.release_expired(ALLOC_TIMEOUT).await?;

    match SessionTable::probe().await {
        Ok(sessions) => {
            engine.release_absent(&sessions).await?;
        }
        Err(e) => {
            // Without a session listing we keep tenancies; the allocation
            // timeout still bounds them.
            warn!(error = %e, "session probe failed, skipping absence check");
        }
    }

    debug!(renewed, "maintenance pass complete");
    Ok(())
}

/// Renew every token in the pool that will expire within the renewal
/// window. Each stage uses the record's current upstream token, so one
/// expiring stage does not force the whole chain. Returns how many tokens
/// were replaced.
async fn renew_tokens(
    engine: &mut AllocEngine,
    msal: &MsalClient,
    http: &reqwest::Client,
    period: Duration,
) -> usize {
    let mut renewed = 0;

    for record in engine.records_mut() {
        let username = record.bundle().ms_username().to_string();

        if record.msal_needs_renewal(period, DEFAULT_RENEWAL_LOOKAHEAD) {
            match msal.acquire_token(&username, false).await {
                Ok(token) => {
                    info!(username, "renewed identity-provider token");
                    record.bundle_mut().set_msal_token(token);
                    renewed += 1;
                }
                Err(e) => {
                    warn!(username, error = %e, "identity-provider renewal failed, leaving for next pass");
                }
            }
        }

        if record.xbl_needs_renewal(period, DEFAULT_RENEWAL_LOOKAHEAD) {
            match pipeline::xboxlive_token(http, record.bundle().msal()).await {
                Ok(token) => {
                    info!(username, "renewed Xbox Live token");
                    record.bundle_mut().set_xbl_token(token);
                    renewed += 1;
                }
                Err(e) => {
                    warn!(username, error = %e, "Xbox Live renewal failed, leaving for next pass");
                }
            }
        }

        if record.xsts_needs_renewal(period, DEFAULT_RENEWAL_LOOKAHEAD) {
            match pipeline::xsts_token(http, record.bundle().xbl()).await {
                Ok(token) => {
                    info!(username, "renewed XSTS token");
                    record.bundle_mut().set_xsts_token(token);
                    renewed += 1;
                }
                Err(e) => {
                    warn!(username, error = %e, "XSTS renewal failed, leaving for next pass");
                }
            }
        }

        if record.minecraft_needs_renewal(period, DEFAULT_RENEWAL_LOOKAHEAD) {
            match pipeline::minecraft_token(http, record.bundle().xsts()).await {
                Ok(token) => {
                    info!(username, "renewed game token");
                    // Also rewrites the profile's token echo.
                    record.bundle_mut().set_minecraft_token(token);
                    renewed += 1;
                }
                Err(e) => {
                    warn!(username, error = %e, "game token renewal failed, leaving for next pass");
                }
            }
        }
    }

    if renewed > 0 {
        metrics::counter!("nydus_token_renewals_total").increment(renewed as u64);
    }
    renewed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use nydus_auth::{AccessToken, AuthBundle, McProfile};

    fn bundle_expiring(msal_minutes: i64) -> AuthBundle {
        let soon = Utc::now() + TimeDelta::minutes(msal_minutes);
        let far = Utc::now() + TimeDelta::hours(12);
        AuthBundle::new(
            "player@example.com",
            AccessToken::new("msal", soon).unwrap(),
            AccessToken::with_hash("xbl", far, "uhs").unwrap(),
            AccessToken::with_hash("xsts", far, "uhs").unwrap(),
            AccessToken::new("mc", far).unwrap(),
            McProfile::new("Player", "uuid-0", "mc").unwrap(),
        )
        .unwrap()
    }

    async fn engine_with(dir: &tempfile::TempDir, bundle: AuthBundle) -> Mutex<AllocEngine> {
        let mut engine = AllocEngine::load(dir.path().join("nydus-alloc.csv"))
            .await
            .unwrap();
        engine.create(vec![bundle]).await.unwrap();
        Mutex::new(engine)
    }

    fn msal() -> MsalClient {
        MsalClient::new("client-id", reqwest::Client::new()).unwrap()
    }

    #[tokio::test]
    async fn fresh_tokens_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        // Everything expires half a day out; a 30-minute period looks only
        // an hour ahead.
        let engine = engine_with(&dir, bundle_expiring(12 * 60)).await;

        maintenance_pass(&engine, &msal(), &reqwest::Client::new(), MAINTENANCE_PERIOD)
            .await
            .unwrap();

        let engine = engine.lock().await;
        let record = &engine.view_all()[0];
        assert_eq!(record.bundle().msal().token(), "msal");
        assert_eq!(record.bundle().minecraft().token(), "mc");
    }

    #[tokio::test]
    async fn failed_renewal_leaves_token_for_next_pass() {
        let dir = tempfile::tempdir().unwrap();
        // The identity-provider token is inside the renewal window, but the
        // client has no cached sign-in and interaction is disabled, so the
        // renewal fails without touching the network and the token stays.
        let engine = engine_with(&dir, bundle_expiring(10)).await;

        maintenance_pass(&engine, &msal(), &reqwest::Client::new(), MAINTENANCE_PERIOD)
            .await
            .unwrap();

        let engine = engine.lock().await;
        let record = &engine.view_all()[0];
        assert_eq!(record.bundle().msal().token(), "msal");
        assert_eq!(record.bundle().xbl().token(), "xbl");
    }

    #[tokio::test]
    async fn stale_tenancy_is_released_by_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nydus-alloc.csv");

        // A tenancy stamped years ago, with tokens that are nowhere near
        // expiry so renewal stays out of the picture.
        let line = "192.168.1.5,alice,01-01-2020 00:00:00,player@example.com,\
                    msal,01-01-2030 00:00:00,\
                    xbl,01-01-2030 00:00:00,uhs,\
                    xsts,01-01-2030 00:00:00,uhs,\
                    mc,01-01-2030 00:00:00,Player,uuid-0";
        let contents = format!("{}\n{line}\n", nydus_alloc::AllocRecord::header());
        tokio::fs::write(&path, contents).await.unwrap();

        let engine = Mutex::new(AllocEngine::load(&path).await.unwrap());
        assert!(engine.lock().await.view_all()[0].is_allocated());

        maintenance_pass(&engine, &msal(), &reqwest::Client::new(), MAINTENANCE_PERIOD)
            .await
            .unwrap();

        let engine = engine.lock().await;
        assert!(!engine.view_all()[0].is_allocated());
        assert_eq!(engine.view_all()[0].bundle().msal().token(), "msal");
    }
}
