// Cloudflared Tunnel Manager - CLI Config Module
// Connection settings for the daemon, including the session token written
// by `cfd-tunnel login`

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use cfd_tunnel_common::DaemonClientConfig;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon: DaemonClientConfig,
}

impl CliConfig {
    /// Load CLI configuration, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read CLI configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse CLI configuration")?;

        Ok(config)
    }

    /// Save CLI configuration (used after login/logout to persist the token)
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize CLI configuration")?;
        fs::write(&config_path, contents).context("Failed to write CLI configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&config_path, perms)
                .context("Failed to set CLI config permissions")?;
        }

        Ok(())
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("cfd-tunnel-manager").join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_local_daemon() {
        let config = CliConfig::default();
        assert_eq!(config.daemon.daemon_host, "127.0.0.1");
        assert_eq!(config.daemon.daemon_port, 8787);
        assert!(config.daemon.auth_token.is_empty());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = CliConfig::default();
        config.daemon.auth_token = "token-123".to_string();

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: CliConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.daemon.auth_token, "token-123");
        assert_eq!(parsed.daemon.daemon_port, 8787);
    }
}
