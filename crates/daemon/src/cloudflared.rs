// Cloudflared Tunnel Manager - cloudflared CLI wrapper
// One-shot invocations of the external cloudflared binary (tunnel
// provisioning and DNS binding). Every call carries a bounded timeout so
// request handlers never hang on the external tool.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use cfd_tunnel_common::{Error, Result};

#[derive(Debug, Clone)]
pub struct CloudflaredCli {
    path: PathBuf,
    timeout: Duration,
}

impl CloudflaredCli {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Register the tunnel with Cloudflare. Writes the tunnel credentials
    /// file into the cloudflared directory as a side effect.
    pub async fn create_tunnel(&self, name: &str) -> Result<()> {
        info!("Registering tunnel '{}' with cloudflared", name);
        self.run(&["tunnel", "create", name]).await
    }

    /// Delete the tunnel registration (best-effort cleanup path)
    pub async fn delete_tunnel(&self, name: &str) -> Result<()> {
        info!("Deleting cloudflared registration for tunnel '{}'", name);
        self.run(&["tunnel", "delete", name]).await
    }

    /// Bind a route's hostname to the tunnel at the DNS level. Idempotent
    /// and retryable on the cloudflared side.
    pub async fn route_dns(&self, tunnel: &str, domain: &str) -> Result<()> {
        info!("Creating DNS record for {} via tunnel '{}'", domain, tunnel);
        self.run(&["tunnel", "route", "dns", tunnel, domain]).await
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!("Running: {} {}", self.path.display(), args.join(" "));

        let result = tokio::time::timeout(
            self.timeout,
            Command::new(&self.path)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Process(format!(
                    "failed to run cloudflared {}: {}",
                    args.join(" "),
                    e
                )))
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "cloudflared {} did not finish within {:?}",
                    args.join(" "),
                    self.timeout
                )))
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Process(format!(
                "cloudflared {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )))
        }
    }
}
