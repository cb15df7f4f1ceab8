// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Common Library
// Shared types, errors, validation, and the daemon API client

pub mod client;
pub mod error;
pub mod network;
pub mod types;
pub mod validate;

pub use client::{DaemonClient, DaemonClientConfig};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address};
pub use types::{
    AddRouteRequest, AuthFlowState, AuthStatus, CreateTunnelRequest, ErrorResponse, LoginRequest,
    LoginResponse, MeResponse, MessageResponse, RegisterRequest, RegisterResponse, Route,
    SetupStatus, Tunnel, TunnelListResponse, TunnelStatus,
};
pub use validate::{validate_domain, validate_host, validate_port, validate_tunnel_name};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
