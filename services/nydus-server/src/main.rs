//! Nydus fleet-auth daemon
//!
//! Holds a pool of pre-authenticated game accounts and hands them out to
//! trusted-LAN workstations over a one-line TLS exchange. On startup the
//! operator signs the configured upstream accounts in; after that a
//! maintenance task keeps tokens fresh and reclaims abandoned allocations.

mod config;
mod error;
mod handler;
mod maintenance;
mod metrics;
mod tls;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing::{Instrument, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nydus_alloc::AllocEngine;
use nydus_auth::{AuthBundle, MsalClient, auth_all};

use crate::config::{ServerConfig, read_accounts_file};
use crate::handler::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting nydus-server");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = ServerConfig::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if let Some(addr) = config.metrics_addr {
        metrics::install(addr).context("failed to install metrics exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let http = reqwest::Client::new();
    let msal = Arc::new(
        MsalClient::new(config.msal_client_id.as_str(), http.clone())
            .context("failed to create identity-provider client")?,
    );

    let engine = initialise_accounts(&config, &msal, &http)
        .await
        .context("failed to initialise the account pool")?;
    let engine = Arc::new(Mutex::new(engine));

    // Storage failures anywhere mean memory and disk have diverged; the
    // sender side lives in every handler and in maintenance.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<nydus_alloc::Error>(1);

    maintenance::spawn_maintenance(
        engine.clone(),
        msal.clone(),
        http.clone(),
        fatal_tx.clone(),
    );

    let acceptor = tls::build_acceptor(&config.cert_file, &config.cert_privkey)
        .context("failed to build TLS acceptor")?;
    let listener = TcpListener::bind((config.ip_addr, config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.ip_addr, config.port))?;
    info!(addr = %config.ip_addr, port = config.port, "listening");

    let state = AppState {
        engine,
        mc_version: Arc::from(config.mc_version.as_str()),
        fatal: fatal_tx,
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let state = state.clone();
                let conn = format!("conn_{}", uuid::Uuid::new_v4().as_simple());
                let span = tracing::info_span!("client", conn = %conn, %peer);
                tokio::spawn(
                    async move {
                        match acceptor.accept(socket).await {
                            Ok(stream) => handler::handle_connection(state, stream, peer).await,
                            Err(e) => info!(error = %e, "TLS handshake failed"),
                        }
                    }
                    .instrument(span),
                );
            }
            Some(err) = fatal_rx.recv() => {
                error!(error = %err, "fatal pool error, shutting down");
                bail!("pool storage diverged from disk: {err}");
            }
            _ = &mut shutdown => {
                info!("shutdown complete");
                return Ok(());
            }
        }
    }
}

/// Authenticate the configured accounts and reconcile the pool file.
///
/// The operator is present at startup, so the full chain runs with
/// interaction allowed and each account may prompt a device-code sign-in.
/// A pool file with records keeps its tenancies and only has its bundles
/// refreshed; an empty or missing file is created from scratch.
async fn initialise_accounts(
    config: &ServerConfig,
    msal: &MsalClient,
    http: &reqwest::Client,
) -> Result<AllocEngine> {
    let usernames = read_accounts_file(&config.accounts_file)?;
    if usernames.is_empty() {
        bail!(
            "accounts file {} names no upstream accounts",
            config.accounts_file.display()
        );
    }

    info!(accounts = usernames.len(), "authenticating upstream accounts");
    let results = auth_all(http, msal, &usernames, true).await;

    let authenticated: Vec<&String> = usernames
        .iter()
        .filter(|u| matches!(results.get(*u), Some(Some(_))))
        .collect();
    let failed: Vec<&String> = usernames
        .iter()
        .filter(|u| !matches!(results.get(*u), Some(Some(_))))
        .collect();
    info!(
        authenticated = authenticated.len(),
        failed = failed.len(),
        "account authentication finished"
    );
    for username in &failed {
        warn!(username = username.as_str(), "account excluded from pool");
    }

    let bundles: HashMap<String, AuthBundle> = results
        .into_iter()
        .filter_map(|(username, bundle)| bundle.map(|b| (username, b)))
        .collect();

    let mut engine = AllocEngine::load(&config.alloc_file).await?;
    if engine.count_total() == 0 {
        // Preserve the accounts-file ordering in the new pool.
        let ordered: Vec<AuthBundle> = usernames
            .iter()
            .filter_map(|u| bundles.get(u).cloned())
            .collect();
        if ordered.is_empty() {
            bail!("no account authenticated; refusing to create an empty pool");
        }
        engine.create(ordered).await?;
    } else {
        engine.refresh_from_bundles(&bundles).await?;
    }
    Ok(engine)
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
