// Cloudflared Tunnel Manager - Ingress Config Module
// Renders the per-tunnel YAML descriptor cloudflared consumes. The file is
// regenerated in full on every route change and swapped in atomically so a
// starting process never reads a half-written rule set.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use cfd_tunnel_common::{Error, Result, Tunnel};

/// Service cloudflared falls back to for unmatched hostnames
const CATCH_ALL_SERVICE: &str = "http_status:404";

#[derive(Debug, Serialize)]
struct IngressDocument {
    tunnel: String,
    #[serde(rename = "credentials-file", skip_serializing_if = "Option::is_none")]
    credentials_file: Option<PathBuf>,
    ingress: Vec<IngressRule>,
}

#[derive(Debug, Serialize)]
struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    service: String,
}

/// Path of the generated config for a tunnel
pub fn config_path(cloudflared_dir: &Path, tunnel_name: &str) -> PathBuf {
    cloudflared_dir.join(format!("config-{}.yml", tunnel_name))
}

/// Render the ingress document for a tunnel: one hostname rule per route in
/// insertion order, catch-all always last.
pub fn render(tunnel: &Tunnel, credentials_file: Option<PathBuf>) -> Result<String> {
    let mut rules: Vec<IngressRule> = tunnel
        .routes
        .iter()
        .map(|route| IngressRule {
            hostname: Some(route.domain.clone()),
            service: route.service(),
        })
        .collect();
    rules.push(IngressRule {
        hostname: None,
        service: CATCH_ALL_SERVICE.to_string(),
    });

    let document = IngressDocument {
        tunnel: tunnel.name.clone(),
        credentials_file,
        ingress: rules,
    };

    serde_yaml::to_string(&document)
        .map_err(|e| Error::Internal(format!("failed to render ingress config: {}", e)))
}

/// Write the tunnel's ingress config, replacing any previous version
/// atomically. Returns the config path.
pub fn write_config(cloudflared_dir: &Path, tunnel: &Tunnel) -> Result<PathBuf> {
    fs::create_dir_all(cloudflared_dir)?;

    let credentials = find_credentials_file(cloudflared_dir, &tunnel.name);
    let contents = render(tunnel, credentials)?;

    let path = config_path(cloudflared_dir, &tunnel.name);
    let tmp_path = path.with_extension("yml.tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, &path)?;

    debug!(
        "Wrote ingress config for '{}' ({} route(s)) to {}",
        tunnel.name,
        tunnel.routes.len(),
        path.display()
    );
    Ok(path)
}

/// Remove the generated config for a deleted tunnel (best-effort)
pub fn remove_config(cloudflared_dir: &Path, tunnel_name: &str) {
    let path = config_path(cloudflared_dir, tunnel_name);
    if path.exists() {
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("Failed to remove ingress config {}: {}", path.display(), e);
        }
    }
}

/// Locate the credentials file `cloudflared tunnel create` wrote for this
/// tunnel. cloudflared names it after the tunnel UUID, which we do not
/// track, so prefer an exact `<name>.json` and otherwise fall back to the
/// newest JSON file in the directory.
fn find_credentials_file(cloudflared_dir: &Path, tunnel_name: &str) -> Option<PathBuf> {
    let named = cloudflared_dir.join(format!("{}.json", tunnel_name));
    if named.exists() {
        return Some(named);
    }

    let entries = fs::read_dir(cloudflared_dir).ok()?;
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, path))
        })
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().map(|(_, path)| path).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfd_tunnel_common::{Route, TunnelStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn tunnel_with_routes(domains: &[&str]) -> Tunnel {
        Tunnel {
            name: "t1".to_string(),
            auto_start: false,
            status: TunnelStatus::Stopped,
            routes: domains
                .iter()
                .map(|d| Route {
                    domain: d.to_string(),
                    host: "localhost".to_string(),
                    port: 3000,
                    dns_bound: true,
                    created_at: Utc::now(),
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn catch_all_is_always_last() {
        let rendered = render(&tunnel_with_routes(&["a.example.com", "b.example.com"]), None).unwrap();

        let a = rendered.find("a.example.com").unwrap();
        let b = rendered.find("b.example.com").unwrap();
        let catch_all = rendered.find(CATCH_ALL_SERVICE).unwrap();
        assert!(a < b, "routes keep insertion order");
        assert!(b < catch_all, "catch-all comes after every route");
    }

    #[test]
    fn empty_tunnel_renders_only_catch_all() {
        let rendered = render(&tunnel_with_routes(&[]), None).unwrap();
        assert!(rendered.contains(CATCH_ALL_SERVICE));
        assert!(!rendered.contains("hostname"));
    }

    #[test]
    fn credentials_file_is_included_when_present() {
        let rendered = render(
            &tunnel_with_routes(&[]),
            Some(PathBuf::from("/home/u/.cloudflared/abc.json")),
        )
        .unwrap();
        assert!(rendered.contains("credentials-file"));
        assert!(rendered.contains("abc.json"));
    }

    #[test]
    fn regeneration_drops_removed_hostname() {
        let dir = TempDir::new().unwrap();
        let mut tunnel = tunnel_with_routes(&["a.example.com", "b.example.com"]);

        write_config(dir.path(), &tunnel).unwrap();
        tunnel.routes.retain(|r| r.domain != "a.example.com");
        let path = write_config(dir.path(), &tunnel).unwrap();

        let contents = fs::read_to_string(path).unwrap();
        assert!(!contents.contains("a.example.com"));
        assert!(contents.contains("b.example.com"));
        assert!(!dir.path().join("config-t1.yml.tmp").exists());
    }

    #[test]
    fn prefers_name_matched_credentials() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("t1.json"), "{}").unwrap();
        fs::write(dir.path().join("other.json"), "{}").unwrap();

        let found = find_credentials_file(dir.path(), "t1").unwrap();
        assert_eq!(found, dir.path().join("t1.json"));
    }

    #[test]
    fn service_urls_use_route_targets() {
        let mut tunnel = tunnel_with_routes(&["app.example.com"]);
        tunnel.routes[0].port = 8080;
        tunnel.routes[0].host = "127.0.0.1".to_string();

        let rendered = render(&tunnel, None).unwrap();
        assert!(rendered.contains("http://127.0.0.1:8080"));
    }
}
