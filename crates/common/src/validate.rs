// Input validation for tunnel names, route domains, and ports.
// Everything here runs before any state is touched.

use crate::error::{Error, Result};

const MAX_TUNNEL_NAME_LEN: usize = 63;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Validate a tunnel name: 1-63 characters, alphanumeric plus dashes,
/// no leading or trailing dash.
pub fn validate_tunnel_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("tunnel name must not be empty".into()));
    }
    if name.len() > MAX_TUNNEL_NAME_LEN {
        return Err(Error::Validation(format!(
            "tunnel name '{}' exceeds {} characters",
            name, MAX_TUNNEL_NAME_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::Validation(format!(
            "tunnel name '{}' may only contain letters, digits, and dashes",
            name
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Validation(format!(
            "tunnel name '{}' must not begin or end with a dash",
            name
        )));
    }
    Ok(())
}

/// Validate a public hostname: at least two dot-separated DNS labels.
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(Error::Validation("domain must not be empty".into()));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(Error::Validation(format!(
            "domain '{}' exceeds {} characters",
            domain, MAX_DOMAIN_LEN
        )));
    }
    if domain.contains("://") || domain.contains('/') {
        return Err(Error::Validation(format!(
            "domain '{}' must be a bare hostname, not a URL",
            domain
        )));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(Error::Validation(format!(
            "domain '{}' must be fully qualified (e.g. app.example.com)",
            domain
        )));
    }
    for label in labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::Validation(format!(
                "domain '{}' contains an empty or oversized label",
                domain
            )));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::Validation(format!(
                "domain '{}' contains invalid characters",
                domain
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::Validation(format!(
                "domain '{}' has a label edged by a dash",
                domain
            )));
        }
    }
    Ok(())
}

/// Validate a target host for a route. Hostnames and IP literals are both
/// fine; URLs and whitespace are not.
pub fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::Validation("host must not be empty".into()));
    }
    if host.contains("://") || host.contains('/') || host.chars().any(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "host '{}' must be a bare hostname or IP address",
            host
        )));
    }
    Ok(())
}

/// Validate a port carried as u32 on the wire and narrow it to u16.
pub fn validate_port(port: u32) -> Result<u16> {
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::Validation(format!(
            "port {} is out of range (1-65535)",
            port
        )));
    }
    Ok(port as u16)
}
