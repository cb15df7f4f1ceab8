// Permission hardening for daemon files and directories. State files carry
// tunnel credentials paths and password hashes; nothing here should be
// world-readable.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Set a restrictive umask so every file the daemon creates defaults to
/// owner-only access. Called once, before any files are created.
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

/// Set file permissions to 0600 (owner read/write only)
pub fn set_file_permissions_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .context(format!("Failed to set permissions on {}", path.display()))?;
        debug!("Set file permissions to 0600: {}", path.display());
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Ensure a directory exists with owner-only (0700) permissions
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .context(format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(path, perms)
            .context(format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}
