// Cloudflared Tunnel Manager - PID File Management
// Ensures only one daemon instance runs at a time

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// PID file guard - automatically removes the PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create the PID file, failing if another daemon already holds one.
    /// Stale files left by a crashed daemon are detected and replaced.
    pub fn create() -> Result<Self> {
        let path = Self::pid_file_path()?;

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(pid_str) => {
                    if let Ok(pid) = pid_str.trim().parse::<u32>() {
                        if Self::is_process_running(pid) {
                            anyhow::bail!(
                                "Daemon is already running with PID {}. \
                                 Stop it first or remove {} if it's stale.",
                                pid,
                                path.display()
                            );
                        }
                        warn!(
                            "Found stale PID file for process {} (not running), removing it",
                            pid
                        );
                        fs::remove_file(&path).context("Failed to remove stale PID file")?;
                    }
                }
                Err(e) => {
                    warn!("Failed to read PID file {}: {}", path.display(), e);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;

        info!("Created PID file at {} with PID {}", path.display(), pid);
        Ok(Self { path })
    }

    fn pid_file_path() -> Result<PathBuf> {
        let runtime_dir = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))?;

        Ok(runtime_dir.join("cfd-tunnel-manager").join("daemon.pid"))
    }

    /// Check whether a process with the given PID is alive
    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        // kill(pid, 0) probes for existence without sending a signal
        unsafe {
            if libc::kill(pid as i32, 0) == 0 {
                return true;
            }
            let errno = *libc::__errno_location();
            match errno {
                libc::ESRCH => false,
                libc::EPERM => true, // exists, owned by someone else
                _ => false,
            }
        }
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        warn!("Process existence check not implemented for this platform");
        true
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_prevents_multiple_instances() {
        let guard = PidFileGuard::create().expect("first instance should succeed");

        let second = PidFileGuard::create();
        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains("already running"));

        drop(guard);
        let _third = PidFileGuard::create().expect("should succeed after first is dropped");
    }

    #[test]
    fn current_process_is_running() {
        assert!(PidFileGuard::is_process_running(std::process::id()));
    }

    #[test]
    fn nonexistent_process_is_not_running() {
        assert!(!PidFileGuard::is_process_running(999_999));
    }
}
