// Error types for the Cloudflared Tunnel Manager

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad input, rejected before any mutation
    #[error("validation error: {0}")]
    Validation(String),

    #[error("tunnel '{0}' already exists")]
    TunnelExists(String),

    #[error("tunnel '{0}' not found")]
    TunnelNotFound(String),

    #[error("no route for domain '{0}'")]
    RouteNotFound(String),

    #[error("domain '{domain}' is already routed by tunnel '{tunnel}'")]
    DuplicateDomain { domain: String, tunnel: String },

    #[error("tunnel '{0}' is already running")]
    AlreadyRunning(String),

    #[error("tunnel '{0}' is not running")]
    NotRunning(String),

    #[error("tunnel '{0}' is still running; stop it first or use force")]
    StillRunning(String),

    #[error("a Cloudflare login flow is already in progress")]
    LoginInProgress,

    #[error("username '{0}' is already registered")]
    UserExists(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    /// The external cloudflared process misbehaved (spawn failure,
    /// unexpected exit, non-zero status)
    #[error("external process error: {0}")]
    Process(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
