// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - CLI Client
// Command-line interface for the tunnel manager daemon

mod config;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Confirm, Password};

use cfd_tunnel_common::{AuthFlowState, DaemonClient, Tunnel, TunnelStatus};
use config::CliConfig;

const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "cfd-tunnel")]
#[command(about = "Cloudflared Tunnel Manager CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon setup status
    Setup,

    /// Register a user account with the daemon
    Register {
        username: String,
    },

    /// Log in and store the session token in the CLI config
    Login {
        username: String,
    },

    /// Log out and clear the stored session token
    Logout,

    /// List all tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Create a new tunnel
    Create {
        /// Tunnel name
        name: String,

        /// Start this tunnel automatically when the daemon boots
        #[arg(short, long)]
        auto_start: bool,
    },

    /// Delete a tunnel
    Delete {
        name: String,

        /// Stop the tunnel first if it is running
        #[arg(short, long)]
        force: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Start a tunnel
    Start {
        name: String,
    },

    /// Stop a running tunnel
    Stop {
        name: String,
    },

    /// Show one tunnel with its routes
    Status {
        name: String,
    },

    /// Add a route (public hostname -> local service) to a tunnel
    AddRoute {
        /// Tunnel name
        tunnel: String,

        /// Public hostname, e.g. app.example.com
        domain: String,

        /// Local TCP port to expose
        port: u32,

        /// Target host for the local service
        #[arg(long, default_value = "localhost")]
        host: String,
    },

    /// Remove a route from a tunnel
    RemoveRoute {
        tunnel: String,
        domain: String,
    },

    /// List the routes of a tunnel
    Routes {
        tunnel: String,
    },

    /// Run the Cloudflare browser login flow
    CloudLogin {
        /// Only print the current login-flow status
        #[arg(long)]
        status: bool,

        /// Cancel an in-flight login flow
        #[arg(long)]
        cancel: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load()?;
    let client = DaemonClient::new(config.daemon.clone())?;

    match cli.command {
        Commands::Setup => show_setup(&client).await,
        Commands::Register { username } => register(&client, &username).await,
        Commands::Login { username } => login(&client, &mut config, &username).await,
        Commands::Logout => logout(&client, &mut config).await,
        Commands::List { json } => list_tunnels(&client, json).await,
        Commands::Create { name, auto_start } => create_tunnel(&client, &name, auto_start).await,
        Commands::Delete { name, force, yes } => delete_tunnel(&client, &name, force, yes).await,
        Commands::Start { name } => start_tunnel(&client, &name).await,
        Commands::Stop { name } => stop_tunnel(&client, &name).await,
        Commands::Status { name } => show_status(&client, &name).await,
        Commands::AddRoute {
            tunnel,
            domain,
            port,
            host,
        } => add_route(&client, &tunnel, &domain, &host, port).await,
        Commands::RemoveRoute { tunnel, domain } => remove_route(&client, &tunnel, &domain).await,
        Commands::Routes { tunnel } => list_routes(&client, &tunnel).await,
        Commands::CloudLogin { status, cancel } => cloud_login(&client, status, cancel).await,
    }
}

async fn show_setup(client: &DaemonClient) -> Result<()> {
    let setup = client.setup_status().await?;

    if setup.needs_setup {
        println!("{} No users registered yet", "!".yellow().bold());
        println!("  Run {} to create the first (admin) account", "cfd-tunnel register <username>".cyan());
    } else {
        println!("{} {} user(s) registered", "✓".green().bold(), setup.user_count);
    }
    if setup.has_tunnels {
        println!("{} Tunnels configured", "✓".green().bold());
    } else {
        println!("{} No tunnels yet - create one with {}", "!".yellow().bold(), "cfd-tunnel create <name>".cyan());
    }
    Ok(())
}

async fn register(client: &DaemonClient, username: &str) -> Result<()> {
    let password = Password::new()
        .with_prompt(format!("Password for '{}'", username))
        .with_confirmation("Confirm password", "Passwords do not match")
        .interact()?;

    let response = client.register(username, &password).await?;
    println!("{} {}", "✓".green().bold(), response.message);
    if response.is_admin {
        println!("  First user registered - '{}' is the administrator", username);
    }
    Ok(())
}

async fn login(client: &DaemonClient, config: &mut CliConfig, username: &str) -> Result<()> {
    let password = Password::new()
        .with_prompt(format!("Password for '{}'", username))
        .interact()?;

    let response = client.login(username, &password).await?;
    config.daemon.auth_token = response.token;
    config.save()?;

    println!("{} Logged in as '{}'", "✓".green().bold(), username);
    println!("  Session token saved to {}", CliConfig::config_path()?.display());
    Ok(())
}

async fn logout(client: &DaemonClient, config: &mut CliConfig) -> Result<()> {
    if config.daemon.auth_token.is_empty() {
        println!("{} Not logged in", "!".yellow().bold());
        return Ok(());
    }

    // Best-effort server-side revocation; the local token is cleared anyway
    if let Err(e) = client.logout().await {
        eprintln!("{} Could not revoke session on the daemon: {}", "!".yellow().bold(), e);
    }

    config.daemon.auth_token.clear();
    config.save()?;
    println!("{} Logged out", "✓".green().bold());
    Ok(())
}

async fn list_tunnels(client: &DaemonClient, json: bool) -> Result<()> {
    let response = client.list_tunnels().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response.tunnels)?);
        return Ok(());
    }

    if response.tunnels.is_empty() {
        println!("No tunnels configured.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
            Cell::new("Auto-start").add_attribute(Attribute::Bold),
            Cell::new("Routes").add_attribute(Attribute::Bold),
        ]);

    for tunnel in &response.tunnels {
        table.add_row(vec![
            Cell::new(&tunnel.name),
            status_cell(tunnel.status),
            Cell::new(if tunnel.auto_start { "yes" } else { "no" }),
            Cell::new(tunnel.routes.len()),
        ]);
    }

    println!("{table}");
    Ok(())
}

fn status_cell(status: TunnelStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        TunnelStatus::Running => cell.fg(Color::Green),
        TunnelStatus::Crashed => cell.fg(Color::Red),
        TunnelStatus::Starting | TunnelStatus::Stopping => cell.fg(Color::Yellow),
        TunnelStatus::Stopped => cell,
    }
}

async fn create_tunnel(client: &DaemonClient, name: &str, auto_start: bool) -> Result<()> {
    let response = client.create_tunnel(name, auto_start).await?;
    println!("{} {}", "✓".green().bold(), response.message);
    println!("  Add a route with {}", format!("cfd-tunnel add-route {} <domain> <port>", name).cyan());
    Ok(())
}

async fn delete_tunnel(client: &DaemonClient, name: &str, force: bool, yes: bool) -> Result<()> {
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete tunnel '{}'?", name))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let response = client.delete_tunnel(name, force).await?;
    println!("{} {}", "✓".green().bold(), response.message);
    println!("  DNS records for its routes must be removed in the Cloudflare dashboard");
    Ok(())
}

async fn start_tunnel(client: &DaemonClient, name: &str) -> Result<()> {
    let response = client.start_tunnel(name).await?;
    println!("{} {}", "✓".green().bold(), response.message);
    Ok(())
}

async fn stop_tunnel(client: &DaemonClient, name: &str) -> Result<()> {
    let response = client.stop_tunnel(name).await?;
    println!("{} {}", "✓".green().bold(), response.message);
    Ok(())
}

async fn show_status(client: &DaemonClient, name: &str) -> Result<()> {
    let tunnel = client.get_tunnel(name).await?;
    print_tunnel(&tunnel);
    Ok(())
}

fn print_tunnel(tunnel: &Tunnel) {
    let status = match tunnel.status {
        TunnelStatus::Running => tunnel.status.to_string().green().bold(),
        TunnelStatus::Crashed => tunnel.status.to_string().red().bold(),
        _ => tunnel.status.to_string().normal(),
    };
    println!("{} ({})", tunnel.name.bold(), status);
    println!("  Auto-start: {}", if tunnel.auto_start { "yes" } else { "no" });

    if tunnel.routes.is_empty() {
        println!("  No routes configured");
        return;
    }
    println!("  Routes:");
    for route in &tunnel.routes {
        let dns = if route.dns_bound {
            String::new()
        } else {
            format!(" {}", "(DNS binding pending)".yellow())
        };
        println!(
            "    {} -> {}:{}{}",
            route.domain.cyan(),
            route.host,
            route.port,
            dns
        );
    }
}

async fn add_route(
    client: &DaemonClient,
    tunnel: &str,
    domain: &str,
    host: &str,
    port: u32,
) -> Result<()> {
    let response = client.add_route(tunnel, domain, host, port).await?;
    println!("{} {}", "✓".green().bold(), response.message);
    Ok(())
}

async fn remove_route(client: &DaemonClient, tunnel: &str, domain: &str) -> Result<()> {
    let response = client.remove_route(tunnel, domain).await?;
    println!("{} {}", "✓".green().bold(), response.message);
    println!("  Remove the CNAME record for '{}' in the Cloudflare dashboard", domain);
    Ok(())
}

async fn list_routes(client: &DaemonClient, tunnel_name: &str) -> Result<()> {
    let tunnel = client.get_tunnel(tunnel_name).await?;

    if tunnel.routes.is_empty() {
        println!("No routes configured for tunnel '{}'.", tunnel_name);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Domain").add_attribute(Attribute::Bold),
            Cell::new("Target").add_attribute(Attribute::Bold),
            Cell::new("DNS").add_attribute(Attribute::Bold),
        ]);
    for route in &tunnel.routes {
        table.add_row(vec![
            Cell::new(&route.domain),
            Cell::new(format!("{}:{}", route.host, route.port)),
            if route.dns_bound {
                Cell::new("bound").fg(Color::Green)
            } else {
                Cell::new("pending").fg(Color::Yellow)
            },
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Drive the Cloudflare browser login: begin the flow, then poll the daemon
/// until the handshake completes or fails
async fn cloud_login(client: &DaemonClient, status_only: bool, cancel: bool) -> Result<()> {
    if cancel {
        let response = client.cancel_login_flow().await?;
        println!("{} {}", "✓".green().bold(), response.message);
        return Ok(());
    }

    if status_only {
        let status = client.login_flow_status().await?;
        print_login_status(&status.state, status.url.as_deref(), status.message.as_deref());
        return Ok(());
    }

    client.begin_login_flow().await?;
    println!("Login flow started; waiting for the login URL...");

    let mut printed_url = false;
    loop {
        let status = client.login_flow_status().await?;

        match status.state {
            AuthFlowState::UrlFound => {
                if !printed_url {
                    if let Some(url) = &status.url {
                        println!();
                        println!("Open this URL in a browser to authorize the tunnel manager:");
                        println!();
                        println!("  {}", url.cyan().bold());
                        println!();
                        println!("Waiting for you to finish in the browser...");
                    }
                    printed_url = true;
                }
            }
            AuthFlowState::Completed => {
                println!("{} Cloudflare login completed", "✓".green().bold());
                return Ok(());
            }
            AuthFlowState::Failed => {
                let reason = status.message.unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("Cloudflare login failed: {}", reason);
            }
            AuthFlowState::Idle => {
                anyhow::bail!("login flow was cancelled");
            }
            AuthFlowState::Initializing | AuthFlowState::WaitingForUrl => {}
        }

        tokio::time::sleep(LOGIN_POLL_INTERVAL).await;
    }
}

fn print_login_status(state: &AuthFlowState, url: Option<&str>, message: Option<&str>) {
    match state {
        AuthFlowState::Idle => println!("No login flow in progress."),
        AuthFlowState::Initializing | AuthFlowState::WaitingForUrl => {
            println!("Login flow in progress; waiting for the login URL.")
        }
        AuthFlowState::UrlFound => {
            println!("Waiting for browser authorization.");
            if let Some(url) = url {
                println!("  {}", url.cyan().bold());
            }
        }
        AuthFlowState::Completed => println!("{} Logged in to Cloudflare", "✓".green().bold()),
        AuthFlowState::Failed => {
            println!(
                "{} Login failed: {}",
                "✗".red().bold(),
                message.unwrap_or("unknown error")
            );
        }
    }
}
