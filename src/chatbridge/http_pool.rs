//! HTTP client pool for maintaining persistent connections.
//!
//! This module provides a singleton-based HTTP client pool that maintains
//! persistent connections per base URL, avoiding DNS/TLS churn on repeated
//! tool calls against the same API. Each base URL gets its own configured
//! `reqwest::Client` with connection pooling enabled. The pool is shared
//! across all sessions; per-session OAuth2 state lives beside it in the
//! credential store, never inside it.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::time::Duration;

/// Global cache of HTTP clients indexed by base URL.
/// DashMap gives thread-safe concurrent access without a global lock.
static CLIENT_POOL: Lazy<DashMap<String, reqwest::Client>> = Lazy::new(DashMap::new);

/// Create or retrieve the shared HTTP client for the given base URL.
///
/// The client is configured with:
/// - connection pooling with up to 100 idle connections per host
/// - 90-second idle timeout for persistent connections
/// - TCP keepalive to maintain long-lived connections
/// - 30-second connection timeout
/// - redirect following disabled: tool calls must hit the declared endpoint
pub fn get_or_create_client(base_url: &str) -> reqwest::Client {
    CLIENT_POOL
        .entry(base_url.to_string())
        .or_insert_with(create_pooled_client)
        .clone()
}

fn create_pooled_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_entries_per_base_url() {
        let url = "https://api.example.com";
        let _c1 = get_or_create_client(url);
        let _c2 = get_or_create_client(url);
        assert!(CLIENT_POOL.contains_key(url));

        let other = "https://auth.example.com";
        let _c3 = get_or_create_client(other);
        assert!(CLIENT_POOL.contains_key(other));
        assert!(CLIENT_POOL.len() >= 2);
    }
}
