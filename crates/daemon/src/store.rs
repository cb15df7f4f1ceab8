// Cloudflared Tunnel Manager - Tunnel Store
// Durable record of all tunnels and their routes. Single source of truth;
// every mutation persists to disk before it is acknowledged.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cfd_tunnel_common::{validate_tunnel_name, Error, Result, Route, Tunnel, TunnelStatus};

/// On-disk shape of the store
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    tunnels: BTreeMap<String, Tunnel>,
    #[serde(default)]
    last_updated: Option<chrono::DateTime<Utc>>,
}

struct StoreInner {
    path: PathBuf,
    tunnels: BTreeMap<String, Tunnel>,
}

impl StoreInner {
    /// Write the full state to a temporary file and atomically replace the
    /// durable record. A reader never observes a half-written state file.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let state = PersistedState {
            tunnels: self.tunnels.clone(),
            last_updated: Some(Utc::now()),
        };
        let contents = serde_json::to_vec_pretty(&state)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!("Persisted {} tunnel(s) to {}", state.tunnels.len(), self.path.display());
        Ok(())
    }
}

/// Mutex-guarded store of all tunnels. All mutators hold the lock across
/// the read-modify-write-persist cycle; none of them perform process I/O.
#[derive(Clone)]
pub struct TunnelStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl TunnelStore {
    /// Load persisted state. Every tunnel status is reconciled to `stopped`
    /// since no subprocess survives a daemon restart.
    pub fn load(path: PathBuf) -> Result<Self> {
        let mut tunnels = BTreeMap::new();

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let state: PersistedState = serde_json::from_str(&contents)?;
            tunnels = state.tunnels;

            for tunnel in tunnels.values_mut() {
                if tunnel.status != TunnelStatus::Stopped {
                    warn!(
                        "Tunnel '{}' was persisted as {}, reconciling to stopped",
                        tunnel.name, tunnel.status
                    );
                    tunnel.status = TunnelStatus::Stopped;
                }
            }
            info!("Loaded {} tunnel(s) from {}", tunnels.len(), path.display());
        } else {
            info!("No tunnel state found at {}, starting empty", path.display());
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner { path, tunnels })),
        })
    }

    pub async fn list(&self) -> Vec<Tunnel> {
        let inner = self.inner.lock().await;
        inner.tunnels.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Result<Tunnel> {
        let inner = self.inner.lock().await;
        inner
            .tunnels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))
    }

    pub async fn has_tunnels(&self) -> bool {
        let inner = self.inner.lock().await;
        !inner.tunnels.is_empty()
    }

    /// Names of tunnels flagged for automatic start at daemon boot
    pub async fn auto_start_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .tunnels
            .values()
            .filter(|t| t.auto_start)
            .map(|t| t.name.clone())
            .collect()
    }

    pub async fn create(&self, name: &str, auto_start: bool) -> Result<Tunnel> {
        validate_tunnel_name(name)?;

        let mut inner = self.inner.lock().await;
        if inner.tunnels.contains_key(name) {
            return Err(Error::TunnelExists(name.to_string()));
        }

        let tunnel = Tunnel {
            name: name.to_string(),
            auto_start,
            status: TunnelStatus::Stopped,
            routes: Vec::new(),
            created_at: Utc::now(),
        };
        inner.tunnels.insert(name.to_string(), tunnel.clone());
        inner.persist()?;

        info!("Created tunnel '{}' (auto_start: {})", name, auto_start);
        Ok(tunnel)
    }

    /// Delete a tunnel record. Fails with `StillRunning` while a backing
    /// process exists; callers stop the tunnel first (or pass force at the
    /// API boundary, which does the stop on their behalf).
    pub async fn delete(&self, name: &str) -> Result<Tunnel> {
        let mut inner = self.inner.lock().await;
        let status = inner
            .tunnels
            .get(name)
            .map(|t| t.status)
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;

        if status.is_active() {
            return Err(Error::StillRunning(name.to_string()));
        }

        let removed = inner
            .tunnels
            .remove(name)
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;
        inner.persist()?;

        info!("Deleted tunnel '{}'", name);
        Ok(removed)
    }

    /// Add a route to a tunnel. Domain uniqueness is enforced across ALL
    /// tunnels atomically; a collision fails without any mutation.
    pub async fn add_route(&self, name: &str, route: Route) -> Result<()> {
        let mut inner = self.inner.lock().await;

        for tunnel in inner.tunnels.values() {
            if tunnel.has_domain(&route.domain) {
                return Err(Error::DuplicateDomain {
                    domain: route.domain,
                    tunnel: tunnel.name.clone(),
                });
            }
        }

        let tunnel = inner
            .tunnels
            .get_mut(name)
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;

        info!(
            "Adding route {} -> {}:{} to tunnel '{}'",
            route.domain, route.host, route.port, name
        );
        tunnel.routes.push(route);
        inner.persist()?;
        Ok(())
    }

    pub async fn remove_route(&self, name: &str, domain: &str) -> Result<Route> {
        let mut inner = self.inner.lock().await;
        let tunnel = inner
            .tunnels
            .get_mut(name)
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;

        let position = tunnel
            .routes
            .iter()
            .position(|r| r.domain == domain)
            .ok_or_else(|| Error::RouteNotFound(domain.to_string()))?;

        let removed = tunnel.routes.remove(position);
        inner.persist()?;

        info!("Removed route {} from tunnel '{}'", domain, name);
        Ok(removed)
    }

    /// Record the outcome of the external DNS-binding step for a route
    pub async fn set_route_dns_bound(&self, name: &str, domain: &str, bound: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let tunnel = inner
            .tunnels
            .get_mut(name)
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;

        let route = tunnel
            .routes
            .iter_mut()
            .find(|r| r.domain == domain)
            .ok_or_else(|| Error::RouteNotFound(domain.to_string()))?;

        route.dns_bound = bound;
        inner.persist()?;
        Ok(())
    }

    /// Internal, called only by the process supervisor
    pub async fn set_status(&self, name: &str, status: TunnelStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let tunnel = inner
            .tunnels
            .get_mut(name)
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;

        if tunnel.status != status {
            debug!("Tunnel '{}': {} -> {}", name, tunnel.status, status);
            tunnel.status = status;
            inner.persist()?;
        }
        Ok(())
    }
}
