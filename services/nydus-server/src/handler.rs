//! Per-connection request handling
//!
//! One connection carries one newline-terminated request and at most one
//! response. The read side is bounded three ways: a newline ends the
//! request, 1024 bytes is the hard cap, and 5 seconds is the deadline. The
//! client is identified by the address it connected from, never by anything
//! it sends.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use common::{is_valid_system_username, system_user_exists};
use nydus_alloc::{AllocEngine, AllocRecord};

/// Hard cap on a request line; a client past this is misbehaving.
pub const MAX_REQUEST_BYTES: usize = 1024;

/// How long the handler waits for the full request line.
pub const RECV_DEADLINE: Duration = Duration::from_secs(5);

const REQUEST_COMMAND: &str = "REQUEST";
const RELEASE_COMMAND: &str = "RELEASE";

/// State shared by every connection handler.
#[derive(Clone)]
pub struct AppState {
    /// The writer lock: every engine operation holds it in full.
    pub engine: Arc<Mutex<AllocEngine>>,
    /// Version string echoed in allocation responses.
    pub mc_version: Arc<str>,
    /// Storage failures land here; the main loop exits on receipt.
    pub fatal: mpsc::Sender<nydus_alloc::Error>,
}

/// A parsed request line.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Allocate { client_user: String },
    Release,
}

/// Parse a request line. `None` means the connection is dropped without a
/// response.
pub fn parse_request(line: &str) -> Option<Request> {
    let mut tokens = line.split_whitespace();
    match tokens.next()? {
        REQUEST_COMMAND => {
            let user = tokens.next()?;
            if tokens.next().is_some() || !is_valid_system_username(user) {
                return None;
            }
            Some(Request::Allocate {
                client_user: user.to_string(),
            })
        }
        RELEASE_COMMAND => {
            if tokens.next().is_some() {
                return None;
            }
            Some(Request::Release)
        }
        _ => None,
    }
}

/// Render a successful allocation: `<version>:<name>:<uuid>:<token>\n`.
pub fn render_allocation(version: &str, record: &AllocRecord) -> String {
    let profile = record.bundle().profile();
    format!(
        "{}:{}:{}:{}\n",
        version,
        profile.name(),
        profile.uuid(),
        profile.token()
    )
}

/// Serve one client exchange over an established (TLS) stream.
pub async fn handle_connection<S>(state: AppState, mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    metrics::counter!("nydus_connections_total").increment(1);

    let line = match tokio::time::timeout(RECV_DEADLINE, read_request_line(&mut stream)).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            debug!(%peer, "connection closed without a usable request");
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "reading request failed");
            return;
        }
        Err(_) => {
            info!(%peer, "client took too long to send a request");
            metrics::counter!("nydus_client_timeouts_total").increment(1);
            return;
        }
    };

    let Some(request) = parse_request(&line) else {
        info!(%peer, "invalid request line");
        return;
    };

    let IpAddr::V4(client_addr) = peer.ip() else {
        info!(%peer, "peer is not an IPv4 client");
        return;
    };

    match request {
        Request::Allocate { client_user } => {
            handle_allocate(&state, &mut stream, client_addr, &client_user).await;
        }
        Request::Release => {
            let result = state.engine.lock().await.release_by_addr(client_addr).await;
            if let Err(e) = result {
                report_engine_error(&state, e).await;
            }
        }
    }
}

async fn handle_allocate<S>(
    state: &AppState,
    stream: &mut S,
    client_addr: Ipv4Addr,
    client_user: &str,
) where
    S: AsyncWrite + Unpin,
{
    if !system_user_exists(client_user) {
        info!(client = %client_addr, user = client_user, "request names an unknown local user");
        return;
    }

    let allocated = state
        .engine
        .lock()
        .await
        .allocate(client_addr, client_user)
        .await;

    match allocated {
        Ok(Some(record)) => {
            let response = render_allocation(&state.mc_version, &record);
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                // The tenancy stands; cleanup will reclaim it if the client
                // never got the account.
                warn!(client = %client_addr, error = %e, "failed to send allocation response");
                return;
            }
            let _ = stream.shutdown().await;
        }
        Ok(None) => {
            // No free record: the connection closes without a response.
        }
        Err(e) => report_engine_error(state, e).await,
    }
}

async fn report_engine_error(state: &AppState, err: nydus_alloc::Error) {
    match err {
        e @ nydus_alloc::Error::Storage(_) => {
            error!(error = %e, "pool storage failure, requesting shutdown");
            let _ = state.fatal.send(e).await;
        }
        e => warn!(error = %e, "engine rejected the request"),
    }
}

/// Accumulate bytes until a newline, the size cap, or end of stream, then
/// take the first line. `None` means the bytes were unusable (empty or not
/// UTF-8).
async fn read_request_line<S>(stream: &mut S) -> std::io::Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(MAX_REQUEST_BYTES);
    let mut chunk = [0u8; 256];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.contains(&b'\n') || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    if buf.is_empty() {
        return Ok(None);
    }
    buf.truncate(MAX_REQUEST_BYTES);

    let Ok(text) = String::from_utf8(buf) else {
        return Ok(None);
    };
    let line = text
        .split('\n')
        .next()
        .unwrap_or_default()
        .trim_end_matches('\r')
        .to_string();
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use nydus_auth::{AccessToken, AuthBundle, McProfile};

    fn bundle(n: usize) -> AuthBundle {
        let expiry = Utc::now() + TimeDelta::hours(12);
        let tok = |s: String| AccessToken::new(s, expiry).unwrap();
        AuthBundle::new(
            format!("player{n}@example.com"),
            tok(format!("msal{n}")),
            AccessToken::with_hash(format!("xbl{n}"), expiry, "uhs").unwrap(),
            AccessToken::with_hash(format!("xsts{n}"), expiry, "uhs").unwrap(),
            tok(format!("mc{n}")),
            McProfile::new(format!("Player{n}"), format!("uuid-{n}"), format!("mc{n}"))
                .unwrap(),
        )
        .unwrap()
    }

    async fn state_with(dir: &tempfile::TempDir, accounts: usize) -> AppState {
        let mut engine = AllocEngine::load(dir.path().join("nydus-alloc.csv"))
            .await
            .unwrap();
        engine
            .create((0..accounts).map(bundle).collect())
            .await
            .unwrap();
        let (fatal, _rx) = mpsc::channel(1);
        AppState {
            engine: Arc::new(Mutex::new(engine)),
            mc_version: Arc::from("1.20.6"),
            fatal,
        }
    }

    fn peer(last: u8) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, last], 40000))
    }

    async fn exchange(state: &AppState, peer: SocketAddr, request: &[u8]) -> String {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        handle_connection(state.clone(), server, peer).await;

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn parse_request_shapes() {
        assert_eq!(
            parse_request("REQUEST alice"),
            Some(Request::Allocate {
                client_user: "alice".into()
            })
        );
        assert_eq!(parse_request("RELEASE"), Some(Request::Release));
        assert_eq!(parse_request("REQUEST"), None);
        assert_eq!(parse_request("REQUEST alice bob"), None);
        assert_eq!(parse_request("RELEASE now"), None);
        assert_eq!(parse_request("LAUNCH alice"), None);
        assert_eq!(parse_request(""), None);
    }

    #[tokio::test]
    async fn request_allocates_and_responds() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 3).await;

        // "root" exists on any host this daemon runs on.
        let response = exchange(&state, peer(5), b"REQUEST root\n").await;
        assert_eq!(response, "1.20.6:Player0:uuid-0:mc0\n");
        assert_eq!(response.matches(':').count(), 3);

        let engine = state.engine.lock().await;
        let held = engine.view_by_addr([192, 168, 1, 5].into());
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].tenancy().unwrap().client_user(), "root");
    }

    #[tokio::test]
    async fn second_request_from_same_client_swaps_records() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 3).await;

        let first = exchange(&state, peer(5), b"REQUEST root\n").await;
        assert!(first.contains(":uuid-0:"));
        let second = exchange(&state, peer(5), b"REQUEST root\n").await;
        assert!(second.contains(":uuid-1:"));

        let engine = state.engine.lock().await;
        let all = engine.view_all();
        assert!(!all[0].is_allocated());
        assert!(all[1].is_allocated());
    }

    #[tokio::test]
    async fn exhausted_pool_closes_without_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;

        let first = exchange(&state, peer(5), b"REQUEST root\n").await;
        assert!(!first.is_empty());

        let before = state.engine.lock().await.view_all();
        let second = exchange(&state, peer(9), b"REQUEST root\n").await;
        assert!(second.is_empty());
        assert_eq!(state.engine.lock().await.view_all(), before);
    }

    #[tokio::test]
    async fn release_frees_everything_the_client_holds() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 3).await;

        {
            let mut engine = state.engine.lock().await;
            engine
                .allocate_by_uuid("uuid-0", [192, 168, 1, 5].into(), "root")
                .await
                .unwrap();
            engine
                .allocate_by_uuid("uuid-2", [192, 168, 1, 5].into(), "root")
                .await
                .unwrap();
        }

        let response = exchange(&state, peer(5), b"RELEASE\n").await;
        assert!(response.is_empty());

        let engine = state.engine.lock().await;
        assert!(engine.view_all().iter().all(|r| !r.is_allocated()));
    }

    #[tokio::test]
    async fn unknown_local_user_gets_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;

        let response = exchange(&state, peer(5), b"REQUEST no-such-user-zx81\n").await;
        assert!(response.is_empty());
        assert!(state.engine.lock().await.view_all()[0].tenancy().is_none());
    }

    #[tokio::test]
    async fn crlf_terminated_request_works() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;

        let response = exchange(&state, peer(5), b"REQUEST root\r\n").await;
        assert_eq!(response, "1.20.6:Player0:uuid-0:mc0\n");
    }

    #[tokio::test]
    async fn garbage_command_gets_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;

        let response = exchange(&state, peer(5), b"LAUNCH root\n").await;
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn oversize_request_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;

        let request = vec![b'A'; 2 * MAX_REQUEST_BYTES];
        let response = exchange(&state, peer(5), &request).await;
        assert!(response.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;

        let (client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn(handle_connection(state.clone(), server, peer(5)));
        // The client sends nothing; the paused clock advances straight to
        // the receive deadline.
        handler.await.unwrap();
        drop(client);

        assert!(state.engine.lock().await.view_all()[0].tenancy().is_none());
    }
}
