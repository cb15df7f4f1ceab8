// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Network utility functions

use std::net::IpAddr;

/// Join a host and port, bracketing IPv6 literals as needed.
pub fn format_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Check if a host address is a loopback address.
/// Supports IPv4 (127.x.x.x), IPv6 (::1), and the "localhost" hostname.
/// Anything unparseable is treated as non-loopback.
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_ipv4_and_hostnames() {
        assert_eq!(format_host_port("127.0.0.1", 8787), "127.0.0.1:8787");
        assert_eq!(format_host_port("localhost", 3000), "localhost:3000");
    }

    #[test]
    fn brackets_ipv6() {
        assert_eq!(format_host_port("::1", 8787), "[::1]:8787");
        assert_eq!(format_host_port("2001:db8::1", 80), "[2001:db8::1]:80");
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.0.0.2"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("localhost"));
        assert!(is_loopback_address("LOCALHOST"));

        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("192.168.1.1"));
        assert!(!is_loopback_address("example.com"));
        assert!(!is_loopback_address("::"));
    }
}
