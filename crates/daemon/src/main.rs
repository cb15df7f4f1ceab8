// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Daemon
// Owns the durable model of tunnels and routes, supervises one cloudflared
// process per running tunnel, and coordinates the browser login handshake.

mod api;
mod auth;
mod authflow;
mod cloudflared;
mod config;
mod ingress;
mod permissions;
mod pidfile;
mod routes;
mod store;
mod supervisor;
mod users;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cfd_tunnel_common::format_host_port;

use api::AppState;
use auth::SessionStore;
use authflow::{AuthFlowCoordinator, AuthFlowSettings};
use cloudflared::CloudflaredCli;
use config::DaemonConfig;
use routes::RouteManager;
use store::TunnelStore;
use supervisor::{ProcessSupervisor, SupervisorSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cfd_tunnel_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Cloudflared Tunnel Manager Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Create PID file to prevent multiple instances
    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    // Load daemon configuration
    let daemon_config = DaemonConfig::load()?;
    daemon_config.validate()?;
    info!(
        "API bind: {}",
        format_host_port(&daemon_config.bind_host, daemon_config.bind_port)
    );
    info!("Authentication required: {}", daemon_config.require_auth);

    permissions::ensure_private_dir(&daemon_config.data_dir)?;
    permissions::ensure_private_dir(&daemon_config.cloudflared_dir)?;

    // Load persisted state; statuses reconcile to stopped since no
    // subprocess survives a daemon restart
    let store = TunnelStore::load(daemon_config.state_path())?;
    let users = users::UserStore::load(daemon_config.users_path())?;
    if !users.has_users().await {
        info!("No users registered yet - the API is in setup mode");
    }

    let supervisor = ProcessSupervisor::new(
        store.clone(),
        SupervisorSettings::from_config(&daemon_config),
    );

    // Subscribe to supervision events for logging
    let mut event_rx = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Tunnel event: {:?}", event);
        }
    });

    let cloudflared = CloudflaredCli::new(
        daemon_config.cloudflared_path.clone(),
        daemon_config.dns_timeout(),
    );
    let route_manager = RouteManager::new(
        store.clone(),
        supervisor.clone(),
        cloudflared.clone(),
        daemon_config.cloudflared_dir.clone(),
    );
    let auth_flow = AuthFlowCoordinator::new(AuthFlowSettings::from_config(&daemon_config));

    let state = Arc::new(AppState {
        store: store.clone(),
        supervisor: supervisor.clone(),
        auth_flow,
        route_manager,
        users,
        sessions: SessionStore::new(),
        cloudflared,
        cloudflared_dir: daemon_config.cloudflared_dir.clone(),
    });

    let app = api::create_router(state, daemon_config.require_auth);

    // Kick off auto-start tunnels without blocking the listener
    let autostart_supervisor = supervisor.clone();
    let autostart_store = store.clone();
    tokio::spawn(async move {
        for name in autostart_store.auto_start_names().await {
            info!("Auto-starting tunnel '{}'", name);
            if let Err(e) = autostart_supervisor.start(&name).await {
                error!("Auto-start of tunnel '{}' failed: {}", name, e);
            }
        }
    });

    let bind_address = format_host_port(&daemon_config.bind_host, daemon_config.bind_port);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    info!("Daemon listening on {}", bind_address);
    info!("Daemon started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await
        .context("API server error")?;

    info!("Daemon shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop all supervised tunnels
async fn shutdown_signal(supervisor: ProcessSupervisor) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    supervisor.stop_all().await;
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    supervisor.stop_all().await;
    info!("All tunnels stopped");
}
