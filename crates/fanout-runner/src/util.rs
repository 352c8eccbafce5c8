//! Shared utility functions for the runner.

use std::time::Duration;

/// Parse a host:port from a URL and attempt a TCP connection with timeout.
///
/// Used by the preflight check on the entry-point base address.
pub async fn check_tcp_reachable(url: &str, timeout: Duration) -> bool {
    let host = extract_host(url);
    if host.is_empty() {
        return false;
    }
    tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&host))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Extract host:port from an `http://` or `https://` URL, filling in the
/// scheme's default port when none is given.
fn extract_host(url: &str) -> String {
    let (stripped, default_port) = if let Some(rest) = url.strip_prefix("https://") {
        (rest, 443)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (rest, 80)
    } else {
        (url, 80)
    };
    let authority = stripped
        .split(['/', '?'])
        .next()
        .unwrap_or("")
        .to_string();
    if authority.is_empty() || authority.contains(':') {
        authority
    } else {
        format!("{authority}:{default_port}")
    }
}

/// URL for one session's page on the entry point.
pub fn page_url(
    base: &str,
    mode: impl std::fmt::Display,
    role: impl std::fmt::Display,
    room: &str,
    index: Option<u32>,
) -> String {
    let mut url = format!(
        "{}/?mode={mode}&role={role}&room={room}",
        base.trim_end_matches('/')
    );
    if let Some(i) = index {
        url.push_str(&format!("&index={i}"));
    }
    url
}
