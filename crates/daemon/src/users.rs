// Cloudflared Tunnel Manager - User Store
// Local user accounts backing the API: Argon2id password hashes in
// users.json. The system stays in "needs setup" mode until the first user
// registers; that user becomes the administrator.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use cfd_tunnel_common::{Error, Result};

const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Argon2id hash in PHC string format
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

struct UsersInner {
    path: PathBuf,
    users: BTreeMap<String, UserRecord>,
}

impl UsersInner {
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(&self.users)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;
        debug!("Persisted {} user(s) to {}", self.users.len(), self.path.display());
        Ok(())
    }
}

#[derive(Clone)]
pub struct UserStore {
    inner: Arc<Mutex<UsersInner>>,
}

impl UserStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let users = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let users: BTreeMap<String, UserRecord> = serde_json::from_str(&contents)?;
            info!("Loaded {} user(s) from {}", users.len(), path.display());
            users
        } else {
            info!("No user database at {}, setup required", path.display());
            BTreeMap::new()
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(UsersInner { path, users })),
        })
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.users.len()
    }

    pub async fn has_users(&self) -> bool {
        self.count().await > 0
    }

    /// Register a new user. The first registered user becomes the
    /// administrator.
    pub async fn register(&self, username: &str, password: &str) -> Result<UserRecord> {
        validate_username(username)?;
        if password.len() < 8 {
            return Err(Error::Validation(
                "password must be at least 8 characters".to_string(),
            ));
        }

        let password_hash = hash_password(password)?;

        let mut inner = self.inner.lock().await;
        if inner.users.contains_key(username) {
            return Err(Error::UserExists(username.to_string()));
        }

        let record = UserRecord {
            username: username.to_string(),
            password_hash,
            is_admin: inner.users.is_empty(),
            created_at: Utc::now(),
        };
        inner.users.insert(username.to_string(), record.clone());
        inner.persist()?;

        info!(
            "Registered user '{}'{}",
            username,
            if record.is_admin { " (administrator)" } else { "" }
        );
        Ok(record)
    }

    /// Verify credentials, returning the user record on success. Unknown
    /// users and wrong passwords are indistinguishable to the caller.
    pub async fn verify(&self, username: &str, password: &str) -> Result<UserRecord> {
        let record = {
            let inner = self.inner.lock().await;
            inner.users.get(username).cloned()
        };

        let record = record.ok_or(Error::InvalidCredentials)?;
        if verify_password(password, &record.password_hash)? {
            Ok(record)
        } else {
            Err(Error::InvalidCredentials)
        }
    }

    pub async fn get(&self, username: &str) -> Option<UserRecord> {
        self.inner.lock().await.users.get(username).cloned()
    }
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(Error::Validation(format!(
            "username must be 1-{} characters",
            MAX_USERNAME_LEN
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::Validation(
            "username may only contain letters, digits, dots, underscores, and dashes".to_string(),
        ));
    }
    Ok(())
}

/// Hash a password with Argon2id and a fresh salt
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("password hashing failed: {}", e)))
}

/// Verify a password against a stored PHC hash string
fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| Error::Internal(format!("corrupt password hash: {}", e)))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(Error::Internal(format!("password verification failed: {}", e))),
    }
}
