use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("syncsellr-api/", env!("CARGO_PKG_VERSION"));

/// One pooled client shared by the marketplace adapters and the selector prober.
pub fn build_client(timeout: Duration, connect_timeout: Duration) -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .gzip(true)
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(target = "syncsellr.http", error = %err, "client builder failed; using defaults");
            Client::new()
        })
}
