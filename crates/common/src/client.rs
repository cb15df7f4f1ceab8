// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Daemon Client Module
// Typed HTTP client for the daemon REST API, shared by the CLI

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{
    AddRouteRequest, AuthStatus, CreateTunnelRequest, ErrorResponse, LoginRequest, LoginResponse,
    MeResponse, MessageResponse, RegisterRequest, RegisterResponse, SetupStatus, Tunnel,
    TunnelListResponse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    /// Daemon host (the daemon only binds loopback addresses)
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Bearer token obtained from `login` (empty until first login)
    #[serde(default)]
    pub auth_token: String,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    8787
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            auth_token: String::new(),
        }
    }
}

impl DaemonClientConfig {
    pub fn base_url(&self) -> String {
        format!(
            "http://{}",
            crate::format_host_port(&self.daemon_host, self.daemon_port)
        )
    }
}

/// Typed wrapper over the daemon REST API
#[derive(Debug, Clone)]
pub struct DaemonClient {
    http: Client,
    config: DaemonClientConfig,
}

impl DaemonClient {
    pub fn new(config: DaemonClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url(), path);
        let mut builder = self.http.request(method, url);
        if !self.config.auth_token.is_empty() {
            builder = builder.bearer_auth(&self.config.auth_token);
        }
        builder
    }

    /// Send a request and decode the JSON body, surfacing the daemon's
    /// error message on non-success statuses.
    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder
            .send()
            .await
            .context("Failed to reach the daemon - is it running?")?;

        let status = response.status();
        if status.is_success() {
            response.json::<T>().await.context("Invalid daemon response")
        } else {
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => format!("daemon returned {}", status),
            };
            tracing::debug!("Daemon request failed ({}): {}", status, message);
            if status == StatusCode::UNAUTHORIZED {
                anyhow::bail!("{} (run `cfd-tunnel login` first)", message);
            }
            anyhow::bail!(message);
        }
    }

    // --- setup & accounts ---

    pub async fn setup_status(&self) -> Result<SetupStatus> {
        self.send(self.request(Method::GET, "/api/setup")).await
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<RegisterResponse> {
        let body = RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.send(self.request(Method::POST, "/api/auth/register").json(&body))
            .await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.send(self.request(Method::POST, "/api/auth/login").json(&body))
            .await
    }

    pub async fn logout(&self) -> Result<MessageResponse> {
        self.send(self.request(Method::POST, "/api/auth/logout"))
            .await
    }

    pub async fn me(&self) -> Result<MeResponse> {
        self.send(self.request(Method::GET, "/api/auth/me")).await
    }

    // --- tunnels ---

    pub async fn list_tunnels(&self) -> Result<TunnelListResponse> {
        self.send(self.request(Method::GET, "/api/tunnels")).await
    }

    pub async fn get_tunnel(&self, name: &str) -> Result<Tunnel> {
        self.send(self.request(Method::GET, &format!("/api/tunnels/{}", name)))
            .await
    }

    pub async fn create_tunnel(&self, name: &str, auto_start: bool) -> Result<MessageResponse> {
        let body = CreateTunnelRequest {
            name: name.to_string(),
            auto_start,
        };
        self.send(self.request(Method::POST, "/api/tunnels").json(&body))
            .await
    }

    pub async fn delete_tunnel(&self, name: &str, force: bool) -> Result<MessageResponse> {
        let path = if force {
            format!("/api/tunnels/{}?force=true", name)
        } else {
            format!("/api/tunnels/{}", name)
        };
        self.send(self.request(Method::DELETE, &path)).await
    }

    pub async fn start_tunnel(&self, name: &str) -> Result<MessageResponse> {
        self.send(self.request(Method::POST, &format!("/api/tunnels/{}/start", name)))
            .await
    }

    pub async fn stop_tunnel(&self, name: &str) -> Result<MessageResponse> {
        self.send(self.request(Method::POST, &format!("/api/tunnels/{}/stop", name)))
            .await
    }

    // --- routes ---

    pub async fn add_route(
        &self,
        tunnel: &str,
        domain: &str,
        host: &str,
        port: u32,
    ) -> Result<MessageResponse> {
        let body = AddRouteRequest {
            domain: domain.to_string(),
            host: host.to_string(),
            port,
        };
        self.send(
            self.request(Method::POST, &format!("/api/tunnels/{}/routes", tunnel))
                .json(&body),
        )
        .await
    }

    pub async fn remove_route(&self, tunnel: &str, domain: &str) -> Result<MessageResponse> {
        self.send(self.request(
            Method::DELETE,
            &format!("/api/tunnels/{}/routes/{}", tunnel, domain),
        ))
        .await
    }

    // --- Cloudflare login flow ---

    pub async fn begin_login_flow(&self) -> Result<AuthStatus> {
        self.send(self.request(Method::POST, "/api/login-flow"))
            .await
    }

    pub async fn login_flow_status(&self) -> Result<AuthStatus> {
        self.send(self.request(Method::GET, "/api/login-flow")).await
    }

    pub async fn cancel_login_flow(&self) -> Result<MessageResponse> {
        self.send(self.request(Method::DELETE, "/api/login-flow"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_uses_host_and_port() {
        let config = DaemonClientConfig {
            daemon_host: "127.0.0.1".to_string(),
            daemon_port: 9001,
            auth_token: String::new(),
        };
        assert_eq!(config.base_url(), "http://127.0.0.1:9001");
    }

    #[test]
    fn default_config_points_at_loopback() {
        let config = DaemonClientConfig::default();
        assert_eq!(config.daemon_host, "127.0.0.1");
        assert_eq!(config.daemon_port, 8787);
        assert!(config.auth_token.is_empty());
    }
}
