//! Shared `reqwest` client construction for the backend, search and fetch
//! collaborators.

use anyhow::{Context, Result};
use std::time::Duration;

const PROXY_ENV: &str = "COMPANION_ENABLE_SYSTEM_PROXY";
const USER_AGENT: &str = concat!("companion/", env!("CARGO_PKG_VERSION"));

pub fn build_http_client() -> Result<reqwest::Client> {
    build_http_client_with_timeout(None)
}

/// Proxy discovery can panic on some platforms, so it is opt-in and the
/// client falls back to `no_proxy`.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let use_system_proxy = system_proxy_enabled(std::env::var(PROXY_ENV).ok().as_deref());

    if use_system_proxy {
        match std::panic::catch_unwind(|| client_builder(timeout).build()) {
            Ok(Ok(client)) => return Ok(client),
            Ok(Err(e)) => tracing::warn!("HTTP client with system proxy failed: {}; using no_proxy", e),
            Err(_) => tracing::warn!("HTTP client proxy discovery panicked; using no_proxy"),
        }
    }

    match std::panic::catch_unwind(|| client_builder(timeout).no_proxy().build()) {
        Ok(result) => result.context("Failed to initialize HTTP client"),
        Err(_) => anyhow::bail!("Failed to initialize HTTP client (no_proxy build panicked)"),
    }
}

fn client_builder(timeout: Option<Duration>) -> reqwest::ClientBuilder {
    let builder = reqwest::Client::builder().user_agent(USER_AGENT);
    match timeout {
        Some(timeout) => builder.timeout(timeout),
        None => builder,
    }
}

fn system_proxy_enabled(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
}
