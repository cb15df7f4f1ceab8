// Cloudflared Tunnel Manager - Daemon Config Module
// Handles daemon configuration (bind address, cloudflared paths, timeouts)

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use cfd_tunnel_common::is_loopback_address;

/// Daemon configuration, loaded from daemon.toml
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Bind host for the REST API. Must be a loopback address; the public
    /// side of this system is cloudflared itself, never this API.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bind port for the REST API
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Require a logged-in user for tunnel and route operations
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// Path to the cloudflared binary (resolved via PATH by default)
    #[serde(default = "default_cloudflared_path")]
    pub cloudflared_path: PathBuf,

    /// cloudflared's working directory: ingress configs, tunnel
    /// credentials, and the origin certificate live here
    #[serde(default = "default_cloudflared_dir")]
    pub cloudflared_dir: PathBuf,

    /// Directory for daemon state (state.json, users.json)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds a starting tunnel may stay silent before being considered
    /// running anyway
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,

    /// Seconds to wait after SIGTERM before escalating to SIGKILL
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Automatic restart attempts after an unexpected exit
    #[serde(default = "default_restart_max_attempts")]
    pub restart_max_attempts: u32,

    /// Base delay for restart backoff (doubled per attempt)
    #[serde(default = "default_restart_base_delay_secs")]
    pub restart_base_delay_secs: u64,

    /// Upper bound on a browser login session
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,

    /// Upper bound on a single cloudflared CLI invocation (DNS binding,
    /// tunnel create/delete)
    #[serde(default = "default_dns_timeout_secs")]
    pub dns_timeout_secs: u64,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    8787
}

fn default_require_auth() -> bool {
    true
}

fn default_cloudflared_path() -> PathBuf {
    PathBuf::from("cloudflared")
}

fn default_cloudflared_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudflared")
}

fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cfd-tunnel-manager")
}

fn default_startup_grace_secs() -> u64 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_restart_max_attempts() -> u32 {
    3
}

fn default_restart_base_delay_secs() -> u64 {
    1
}

fn default_login_timeout_secs() -> u64 {
    300
}

fn default_dns_timeout_secs() -> u64 {
    30
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            require_auth: default_require_auth(),
            cloudflared_path: default_cloudflared_path(),
            cloudflared_dir: default_cloudflared_dir(),
            data_dir: default_data_dir(),
            startup_grace_secs: default_startup_grace_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            restart_max_attempts: default_restart_max_attempts(),
            restart_base_delay_secs: default_restart_base_delay_secs(),
            login_timeout_secs: default_login_timeout_secs(),
            dns_timeout_secs: default_dns_timeout_secs(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if !is_loopback_address(&self.bind_host) {
            anyhow::bail!(
                "Refusing to bind the API to non-loopback address {}.\n\
                 The API serves plain HTTP and must stay on localhost.\n\
                 Expose services to the network through cloudflared routes instead.",
                self.bind_host
            );
        }
        if self.startup_grace_secs == 0 {
            anyhow::bail!("startup_grace_secs must be at least 1");
        }
        Ok(())
    }

    /// Load daemon configuration from file, writing defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(&config_path, contents).context("Failed to write daemon configuration")?;

        crate::permissions::set_file_permissions_private(&config_path)?;

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("cfd-tunnel-manager").join("daemon.toml"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    /// The origin certificate cloudflared writes after a successful login
    pub fn cert_path(&self) -> PathBuf {
        self.cloudflared_dir.join("cert.pem")
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_secs(self.restart_base_delay_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn loopback_binds_are_accepted() {
        for host in ["127.0.0.1", "127.0.0.2", "::1", "localhost"] {
            let config = DaemonConfig {
                bind_host: host.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "expected {} to validate", host);
        }
    }

    #[test]
    fn non_loopback_binds_are_rejected() {
        for host in ["0.0.0.0", "192.168.1.10", "example.com"] {
            let config = DaemonConfig {
                bind_host: host.to_string(),
                ..Default::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("non-loopback"));
        }
    }

    #[test]
    fn zero_grace_period_is_rejected() {
        let config = DaemonConfig {
            startup_grace_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn paths_derive_from_directories() {
        let config = DaemonConfig {
            data_dir: PathBuf::from("/tmp/data"),
            cloudflared_dir: PathBuf::from("/tmp/cfd"),
            ..Default::default()
        };
        assert_eq!(config.state_path(), PathBuf::from("/tmp/data/state.json"));
        assert_eq!(config.users_path(), PathBuf::from("/tmp/data/users.json"));
        assert_eq!(config.cert_path(), PathBuf::from("/tmp/cfd/cert.pem"));
    }
}
