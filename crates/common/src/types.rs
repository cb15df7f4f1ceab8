// Common types for the Cloudflared Tunnel Manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a managed tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Stopped,  // no backing process
    Starting, // process spawned, waiting for readiness
    Running,  // cloudflared connected and serving routes
    Crashed,  // process exited without being asked to
    Stopping, // stop requested, waiting for exit
}

impl TunnelStatus {
    /// True when a backing process exists (or is being torn down)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Starting | TunnelStatus::Running | TunnelStatus::Stopping
        )
    }

    /// True for the transitional states between operator requests
    pub fn is_in_progress(&self) -> bool {
        matches!(self, TunnelStatus::Starting | TunnelStatus::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Running => "running",
            TunnelStatus::Crashed => "crashed",
            TunnelStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for TunnelStatus {
    fn default() -> Self {
        TunnelStatus::Stopped
    }
}

/// A public hostname mapped to a local service, owned by one tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    /// Fully-qualified public hostname, unique across all tunnels
    pub domain: String,
    /// Target host the tunnel forwards to (usually localhost)
    pub host: String,
    /// Local TCP port on the target host
    pub port: u16,
    /// False when the external DNS-binding step has not succeeded yet;
    /// the route still exists locally but is reported as degraded
    #[serde(default = "default_dns_bound")]
    pub dns_bound: bool,
    pub created_at: DateTime<Utc>,
}

fn default_dns_bound() -> bool {
    true
}

impl Route {
    /// Service URL in the form cloudflared expects (http://host:port)
    pub fn service(&self) -> String {
        format!("http://{}", crate::format_host_port(&self.host, self.port))
    }
}

/// A named tunnel and its routes, as persisted and as served by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    /// Unique name, immutable after creation
    pub name: String,
    /// Start this tunnel automatically when the daemon boots
    #[serde(default)]
    pub auto_start: bool,
    /// Reconciled against actual process liveness; persisted for display only
    #[serde(default)]
    pub status: TunnelStatus,
    #[serde(default)]
    pub routes: Vec<Route>,
    pub created_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn route(&self, domain: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.domain == domain)
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.route(domain).is_some()
    }
}

/// State machine of the one-shot browser login handshake
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlowState {
    Idle,
    Initializing,
    WaitingForUrl,
    UrlFound,
    Completed,
    Failed,
}

impl AuthFlowState {
    /// True while an external login process is (potentially) alive
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            AuthFlowState::Initializing | AuthFlowState::WaitingForUrl | AuthFlowState::UrlFound
        )
    }
}

impl Default for AuthFlowState {
    fn default() -> Self {
        AuthFlowState::Idle
    }
}

/// Poll-able snapshot of the login handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    pub state: AuthFlowState,
    /// Browser login URL, present from `url_found` onwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Failure reason when `state` is `failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthStatus {
    pub fn idle() -> Self {
        Self {
            state: AuthFlowState::Idle,
            url: None,
            started_at: None,
            message: None,
        }
    }
}

// --- API request/response bodies ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub name: String,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRouteRequest {
    pub domain: String,
    #[serde(default = "default_route_host")]
    pub host: String,
    /// Deliberately wider than u16 so out-of-range ports are rejected by
    /// validation instead of failing to deserialize
    pub port: u32,
}

fn default_route_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub message: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeResponse {
    pub username: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupStatus {
    pub needs_setup: bool,
    pub has_users: bool,
    pub has_tunnels: bool,
    pub user_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelListResponse {
    pub tunnels: Vec<Tunnel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_status_round_trip() {
        let json = serde_json::to_string(&TunnelStatus::Crashed).unwrap();
        assert_eq!(json, "\"crashed\"");
        let back: TunnelStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TunnelStatus::Crashed);
    }

    #[test]
    fn route_service_url() {
        let route = Route {
            domain: "app.example.com".to_string(),
            host: "localhost".to_string(),
            port: 3000,
            dns_bound: true,
            created_at: Utc::now(),
        };
        assert_eq!(route.service(), "http://localhost:3000");
    }

    #[test]
    fn auth_status_omits_empty_fields() {
        let json = serde_json::to_string(&AuthStatus::idle()).unwrap();
        assert_eq!(json, "{\"state\":\"idle\"}");
    }

    #[test]
    fn tunnel_deserializes_with_defaults() {
        let json = r#"{"name":"t1","created_at":"2025-01-01T00:00:00Z"}"#;
        let tunnel: Tunnel = serde_json::from_str(json).unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Stopped);
        assert!(!tunnel.auto_start);
        assert!(tunnel.routes.is_empty());
    }
}
