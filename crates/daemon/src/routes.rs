// Cloudflared Tunnel Manager - Route Manager
// Validates and mutates route definitions, regenerates the per-tunnel
// ingress artifact, and drives the external DNS-binding step. Local config
// correctness and network-level registration are deliberately decoupled:
// a failed DNS bind leaves the route persisted but degraded.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, warn};

use cfd_tunnel_common::{
    validate_domain, validate_host, validate_port, AddRouteRequest, Result, Route,
};

use crate::cloudflared::CloudflaredCli;
use crate::ingress;
use crate::store::TunnelStore;
use crate::supervisor::ProcessSupervisor;

/// Outcome of a route addition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub domain: String,
    /// True when the DNS-binding step failed and the route is serving
    /// locally but not yet reachable by hostname
    pub degraded: bool,
}

#[derive(Clone)]
pub struct RouteManager {
    store: TunnelStore,
    supervisor: ProcessSupervisor,
    cloudflared: CloudflaredCli,
    cloudflared_dir: PathBuf,
}

impl RouteManager {
    pub fn new(
        store: TunnelStore,
        supervisor: ProcessSupervisor,
        cloudflared: CloudflaredCli,
        cloudflared_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            supervisor,
            cloudflared,
            cloudflared_dir,
        }
    }

    /// Add a route: validate, persist (atomic, globally unique domain),
    /// regenerate the ingress artifact, bind DNS, and restart the tunnel
    /// if it is currently serving so it picks up the new rule set.
    pub async fn add(&self, tunnel_name: &str, request: AddRouteRequest) -> Result<RouteOutcome> {
        validate_domain(&request.domain)?;
        validate_host(&request.host)?;
        let port = validate_port(request.port)?;

        let _guard = self.supervisor.lock_ops(tunnel_name).await;

        let route = Route {
            domain: request.domain.clone(),
            host: request.host,
            port,
            dns_bound: true,
            created_at: Utc::now(),
        };
        self.store.add_route(tunnel_name, route).await?;

        let tunnel = self.store.get(tunnel_name).await?;
        ingress::write_config(&self.cloudflared_dir, &tunnel)?;

        // DNS registration is idempotent and retryable on the provider
        // side; a failure here degrades the route instead of rolling back
        let degraded = match self
            .cloudflared
            .route_dns(tunnel_name, &request.domain)
            .await
        {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    "DNS binding for {} failed, route remains degraded: {}",
                    request.domain, e
                );
                self.store
                    .set_route_dns_bound(tunnel_name, &request.domain, false)
                    .await?;
                true
            }
        };

        if self.supervisor.is_supervised(tunnel_name).await {
            info!(
                "Restarting tunnel '{}' to pick up route {}",
                tunnel_name, request.domain
            );
            self.supervisor.restart_locked(tunnel_name).await?;
        }

        info!(
            "Route added to '{}': {} (degraded: {})",
            tunnel_name, request.domain, degraded
        );
        Ok(RouteOutcome {
            domain: request.domain,
            degraded,
        })
    }

    /// Remove a route: persist the removal, regenerate the artifact, make
    /// a best-effort attempt at revoking the DNS binding, and restart a
    /// serving tunnel. Orphaned DNS records are a cleanup concern, not a
    /// correctness one.
    pub async fn remove(&self, tunnel_name: &str, domain: &str) -> Result<()> {
        let _guard = self.supervisor.lock_ops(tunnel_name).await;

        self.store.remove_route(tunnel_name, domain).await?;

        let tunnel = self.store.get(tunnel_name).await?;
        ingress::write_config(&self.cloudflared_dir, &tunnel)?;

        // cloudflared has no command to delete a DNS record; surface the
        // manual cleanup step instead of pretending
        warn!(
            "DNS record for {} must be removed manually in the Cloudflare dashboard (DNS -> Records)",
            domain
        );

        if self.supervisor.is_supervised(tunnel_name).await {
            info!(
                "Restarting tunnel '{}' after removing route {}",
                tunnel_name, domain
            );
            self.supervisor.restart_locked(tunnel_name).await?;
        }

        info!("Route removed from '{}': {}", tunnel_name, domain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorSettings;
    use cfd_tunnel_common::{Error, TunnelStatus};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        _dir: TempDir,
        cloudflared_dir: PathBuf,
        store: TunnelStore,
        supervisor: ProcessSupervisor,
        manager: RouteManager,
    }

    /// Build a manager whose `cloudflared` CLI is a fake script
    async fn fixture(cli_body: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cli_script = write_script(dir.path(), "fake-cli", cli_body);
        let daemon_script = write_script(
            dir.path(),
            "fake-daemon",
            "trap 'exit 0' TERM\nwhile true; do sleep 0.05; done",
        );
        let cloudflared_dir = dir.path().join("cloudflared");

        let store = TunnelStore::load(dir.path().join("state.json")).unwrap();
        store.create("t1", false).await.unwrap();

        let supervisor = ProcessSupervisor::new(
            store.clone(),
            SupervisorSettings {
                cloudflared_path: daemon_script,
                cloudflared_dir: cloudflared_dir.clone(),
                startup_grace: Duration::from_millis(150),
                stop_timeout: Duration::from_secs(2),
                restart_max_attempts: 0,
                restart_base_delay: Duration::from_millis(50),
            },
        );
        let cloudflared = CloudflaredCli::new(cli_script, Duration::from_secs(5));
        let manager = RouteManager::new(
            store.clone(),
            supervisor.clone(),
            cloudflared,
            cloudflared_dir.clone(),
        );

        Fixture {
            _dir: dir,
            cloudflared_dir,
            store,
            supervisor,
            manager,
        }
    }

    fn add_request(domain: &str, port: u32) -> AddRouteRequest {
        AddRouteRequest {
            domain: domain.to_string(),
            host: "localhost".to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn add_route_persists_and_regenerates_ingress() {
        let f = fixture("exit 0").await;

        let outcome = f
            .manager
            .add("t1", add_request("app.example.com", 3000))
            .await
            .unwrap();
        assert!(!outcome.degraded);

        let tunnel = f.store.get("t1").await.unwrap();
        assert_eq!(tunnel.routes.len(), 1);
        assert!(tunnel.routes[0].dns_bound);

        let config = fs::read_to_string(ingress::config_path(&f.cloudflared_dir, "t1")).unwrap();
        assert!(config.contains("app.example.com"));
        assert!(config.contains("http://localhost:3000"));
    }

    #[tokio::test]
    async fn out_of_range_port_is_rejected_before_any_persistence() {
        let f = fixture("exit 0").await;

        let err = f
            .manager
            .add("t1", add_request("app.example.com", 70000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(f.store.get("t1").await.unwrap().routes.is_empty());
        assert!(!ingress::config_path(&f.cloudflared_dir, "t1").exists());
    }

    #[tokio::test]
    async fn dns_failure_leaves_route_degraded() {
        let f = fixture("exit 1").await;

        let outcome = f
            .manager
            .add("t1", add_request("app.example.com", 3000))
            .await
            .unwrap();
        assert!(outcome.degraded);

        let tunnel = f.store.get("t1").await.unwrap();
        assert_eq!(tunnel.routes.len(), 1);
        assert!(!tunnel.routes[0].dns_bound);
        // The ingress artifact still carries the rule
        let config = fs::read_to_string(ingress::config_path(&f.cloudflared_dir, "t1")).unwrap();
        assert!(config.contains("app.example.com"));
    }

    #[tokio::test]
    async fn duplicate_domain_across_tunnels_is_rejected() {
        let f = fixture("exit 0").await;
        f.store.create("t2", false).await.unwrap();

        f.manager
            .add("t1", add_request("app.example.com", 3000))
            .await
            .unwrap();
        let err = f
            .manager
            .add("t2", add_request("app.example.com", 4000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDomain { .. }));

        // Prior route unchanged
        let t1 = f.store.get("t1").await.unwrap();
        assert_eq!(t1.routes[0].port, 3000);
        assert!(f.store.get("t2").await.unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn remove_route_rewrites_the_artifact() {
        let f = fixture("exit 0").await;

        f.manager
            .add("t1", add_request("a.example.com", 3000))
            .await
            .unwrap();
        f.manager
            .add("t1", add_request("b.example.com", 3001))
            .await
            .unwrap();

        f.manager.remove("t1", "a.example.com").await.unwrap();

        let config = fs::read_to_string(ingress::config_path(&f.cloudflared_dir, "t1")).unwrap();
        assert!(!config.contains("a.example.com"));
        assert!(config.contains("b.example.com"));

        assert!(matches!(
            f.manager.remove("t1", "a.example.com").await.unwrap_err(),
            Error::RouteNotFound(_)
        ));
    }

    #[tokio::test]
    async fn route_change_restarts_a_running_tunnel() {
        let f = fixture("exit 0").await;

        f.supervisor.start("t1").await.unwrap();
        // Let it reach running via the grace period
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if f.store.get("t1").await.unwrap().status == TunnelStatus::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never reached running");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        f.manager
            .add("t1", add_request("app.example.com", 3000))
            .await
            .unwrap();

        // Still exactly one supervised process, serving the new config
        assert!(f.supervisor.is_supervised("t1").await);
        let status = f.store.get("t1").await.unwrap().status;
        assert!(matches!(status, TunnelStatus::Running | TunnelStatus::Starting));

        f.supervisor.stop("t1").await.unwrap();
    }
}
