//! Target validation for user supplied check configurations.

use anyhow::{Result, anyhow};
use std::net::IpAddr;
use url::Url;

use super::types::CheckConfig;

/// Validates a check configuration based on its type
pub fn validate_check_config(config: &CheckConfig) -> Result<()> {
    match config {
        CheckConfig::Http { url } => validate_http_target(url),
        CheckConfig::Tls { host, port } => validate_tls_target(host, *port),
    }
}

/// Validate HTTP/HTTPS target
pub fn validate_http_target(target: &str) -> Result<()> {
    let url = Url::parse(target).map_err(|e| anyhow!("Invalid URL: {}", e))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("Invalid scheme for HTTP check: {}", other)),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(anyhow!("HTTP check URL must contain a host")),
    }

    if let Some(port) = url.port() {
        validate_port(port)?;
    }

    Ok(())
}

/// Validate TLS target (host name or IP address plus port)
pub fn validate_tls_target(host: &str, port: u16) -> Result<()> {
    let host = host.trim();
    if host.is_empty() {
        return Err(anyhow!("TLS check host must not be empty"));
    }

    if host.parse::<IpAddr>().is_err() && !is_valid_hostname(host) {
        return Err(anyhow!("Invalid host name for TLS check: {}", host));
    }

    validate_port(port)
}

fn is_valid_hostname(host: &str) -> bool {
    host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Validate port is in valid range
fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(anyhow!("Port 0 is not valid"));
    }
    Ok(())
}
