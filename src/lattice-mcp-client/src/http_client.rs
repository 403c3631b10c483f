//! HTTP client factory shared by the HTTP transports.
//!
//! - `create_default_client()` - standard 30s timeout for request/response
//! - `create_streaming_client()` - connect timeout only, for SSE streams

use std::time::Duration;

use reqwest::Client;

use crate::error::Result;

/// User-Agent string for all HTTP requests.
pub const USER_AGENT: &str = concat!("lattice/", env!("CARGO_PKG_VERSION"));

/// Default timeout for standard requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout applied to every client.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle pooled connections are dropped after this long so DNS is re-resolved.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates an HTTP client with the default 30s timeout.
pub fn create_default_client() -> Result<Client> {
    create_client_with_timeout(DEFAULT_TIMEOUT)
}

/// Creates an HTTP client for long-lived event streams.
///
/// There is no total request timeout: an SSE stream stays open for as long
/// as the server keeps it open.
pub fn create_streaming_client() -> Result<Client> {
    Ok(base_builder().build()?)
}

/// Creates an HTTP client with a custom total timeout.
pub fn create_client_with_timeout(timeout: Duration) -> Result<Client> {
    Ok(base_builder().timeout(timeout).build()?)
}

fn base_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_build() {
        assert!(create_default_client().is_ok());
        assert!(create_streaming_client().is_ok());
    }

    #[test]
    fn test_user_agent_format() {
        assert!(USER_AGENT.starts_with("lattice/"));
    }
}
