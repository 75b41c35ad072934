//! Prometheus metrics exposition
//!
//! Counters are recorded where things happen (engine, handler, maintenance);
//! this module only installs the recorder and its scrape listener when the
//! config enables it.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
pub fn install(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    metrics::describe_counter!(
        "nydus_connections_total",
        "Client connections accepted by the listener"
    );
    metrics::describe_counter!(
        "nydus_client_timeouts_total",
        "Connections dropped because the request never arrived"
    );
    metrics::describe_counter!("nydus_allocations_total", "Accounts handed to clients");
    metrics::describe_counter!(
        "nydus_allocation_misses_total",
        "Requests that found no free account"
    );
    metrics::describe_counter!("nydus_releases_total", "Tenancies released");
    metrics::describe_counter!(
        "nydus_token_renewals_total",
        "Tokens replaced by maintenance renewal"
    );
    Ok(())
}
