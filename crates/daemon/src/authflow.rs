// Cloudflared Tunnel Manager - Auth Flow Coordinator
// Drives the one-shot `cloudflared tunnel login` handshake: spawns the
// process, scrapes its output for the browser login URL, and watches for
// completion. Exactly one session may be open system-wide; callers poll.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use cfd_tunnel_common::{AuthFlowState, AuthStatus, Error, Result};

use crate::config::DaemonConfig;

#[derive(Debug, Clone)]
pub struct AuthFlowSettings {
    pub cloudflared_path: PathBuf,
    /// Origin certificate cloudflared writes on successful login; its
    /// appearance doubles as a completion signal
    pub cert_path: PathBuf,
    pub login_timeout: Duration,
}

impl AuthFlowSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            cloudflared_path: config.cloudflared_path.clone(),
            cert_path: config.cert_path(),
            login_timeout: config.login_timeout(),
        }
    }
}

/// The singleton login session slot
struct AuthSlot {
    state: AuthFlowState,
    url: Option<String>,
    started_at: Option<DateTime<Utc>>,
    message: Option<String>,
    /// Signals the watcher task to kill the process and reset to idle
    cancel_tx: Option<mpsc::Sender<()>>,
}

impl AuthSlot {
    fn idle() -> Self {
        Self {
            state: AuthFlowState::Idle,
            url: None,
            started_at: None,
            message: None,
            cancel_tx: None,
        }
    }

    fn snapshot(&self) -> AuthStatus {
        AuthStatus {
            state: self.state,
            url: self.url.clone(),
            started_at: self.started_at,
            message: self.message.clone(),
        }
    }
}

/// Coordinates the interactive Cloudflare login handshake
#[derive(Clone)]
pub struct AuthFlowCoordinator {
    slot: Arc<Mutex<AuthSlot>>,
    settings: Arc<AuthFlowSettings>,
}

impl AuthFlowCoordinator {
    pub fn new(settings: AuthFlowSettings) -> Self {
        Self {
            slot: Arc::new(Mutex::new(AuthSlot::idle())),
            settings: Arc::new(settings),
        }
    }

    /// Start a login session. Fails if one is already in progress; a fresh
    /// attempt after completed/failed reclaims the slot.
    pub async fn begin(&self) -> Result<AuthStatus> {
        let mut slot = self.slot.lock().await;

        if slot.state.is_in_progress() {
            return Err(Error::LoginInProgress);
        }

        *slot = AuthSlot::idle();
        slot.state = AuthFlowState::Initializing;
        slot.started_at = Some(Utc::now());

        info!("Beginning Cloudflare login flow");
        let spawn_result = Command::new(&self.settings.cloudflared_path)
            .arg("tunnel")
            .arg("login")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to spawn cloudflared login: {}", e);
                slot.state = AuthFlowState::Failed;
                slot.message = Some(reason.clone());
                return Err(Error::Process(reason));
            }
        };

        // cloudflared prints the login URL on stderr; scan both streams
        let (line_tx, line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        slot.cancel_tx = Some(cancel_tx);
        slot.state = AuthFlowState::WaitingForUrl;

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.watch(child, line_rx, cancel_rx).await;
        });

        Ok(slot.snapshot())
    }

    /// Pure read of the current session state; never blocks on the
    /// external process and never mutates anything
    pub async fn status(&self) -> AuthStatus {
        self.slot.lock().await.snapshot()
    }

    /// Cancel an in-flight session (terminates the external process) or
    /// clear a finished one. The slot always ends up idle.
    pub async fn cancel(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;

        if let Some(tx) = slot.cancel_tx.take() {
            info!("Cancelling Cloudflare login flow");
            let _ = tx.send(()).await;
            // The watcher resets the slot once the process is gone
        } else {
            *slot = AuthSlot::idle();
        }
        Ok(())
    }

    /// Background watcher: scans output for the login URL and interprets
    /// process exit, the watchdog timer, and cancellation.
    async fn watch(
        &self,
        mut child: Child,
        mut line_rx: mpsc::Receiver<String>,
        mut cancel_rx: mpsc::Receiver<()>,
    ) {
        let watchdog = tokio::time::sleep(self.settings.login_timeout);
        tokio::pin!(watchdog);
        let mut lines_open = true;

        loop {
            tokio::select! {
                maybe = line_rx.recv(), if lines_open => {
                    match maybe {
                        Some(line) => {
                            debug!(target: "cloudflared", "[login] {}", line);
                            if let Some(url) = extract_login_url(&line) {
                                self.record_url(url).await;
                            }
                        }
                        None => lines_open = false,
                    }
                }
                status = child.wait() => {
                    // The URL may still be in flight from the scanners;
                    // drain before interpreting the exit
                    self.drain_remaining(&mut line_rx).await;
                    self.finish(status).await;
                    return;
                }
                () = &mut watchdog => {
                    warn!(
                        "Login flow exceeded {:?}, terminating",
                        self.settings.login_timeout
                    );
                    kill_quietly(&mut child).await;
                    let mut slot = self.slot.lock().await;
                    slot.state = AuthFlowState::Failed;
                    slot.message = Some(format!(
                        "login timed out after {:?}",
                        self.settings.login_timeout
                    ));
                    slot.cancel_tx = None;
                    return;
                }
                _ = cancel_rx.recv() => {
                    kill_quietly(&mut child).await;
                    let mut slot = self.slot.lock().await;
                    *slot = AuthSlot::idle();
                    info!("Login flow cancelled");
                    return;
                }
            }
        }
    }

    /// Consume whatever the output scanners have left after process exit.
    /// The pipes hit EOF once the process is gone, so this returns quickly.
    async fn drain_remaining(&self, line_rx: &mut mpsc::Receiver<String>) {
        loop {
            match tokio::time::timeout(Duration::from_millis(100), line_rx.recv()).await {
                Ok(Some(line)) => {
                    if let Some(url) = extract_login_url(&line) {
                        self.record_url(url).await;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn record_url(&self, url: String) {
        let mut slot = self.slot.lock().await;
        if slot.state == AuthFlowState::WaitingForUrl {
            info!("Login URL found");
            slot.state = AuthFlowState::UrlFound;
            slot.url = Some(url);
        }
    }

    /// Interpret the login process exit. A clean exit after the URL was
    /// presented (or once the origin certificate exists on disk) completes
    /// the handshake; anything else fails it.
    async fn finish(&self, status: std::io::Result<std::process::ExitStatus>) {
        let mut slot = self.slot.lock().await;
        slot.cancel_tx = None;

        let url_seen = slot.url.is_some();
        let cert_present = self.settings.cert_path.exists();

        match status {
            Ok(status) if status.success() && (url_seen || cert_present) => {
                info!("Cloudflare login completed");
                slot.state = AuthFlowState::Completed;
            }
            Ok(status) if status.success() => {
                slot.state = AuthFlowState::Failed;
                slot.message =
                    Some("login process exited before presenting a URL".to_string());
            }
            Ok(status) => {
                warn!("Login process exited with {}", status);
                slot.state = AuthFlowState::Failed;
                slot.message = Some(format!("login process exited with {}", status));
            }
            Err(e) => {
                slot.state = AuthFlowState::Failed;
                slot.message = Some(format!("failed to await login process: {}", e));
            }
        }
    }
}

async fn kill_quietly(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Failed to kill login process: {}", e);
    }
}

/// Extract the browser login URL from one line of cloudflared output.
/// Deliberately the only place that knows what the URL looks like, so a
/// format change in the external tool stays contained here.
pub fn extract_login_url(line: &str) -> Option<String> {
    let start = line.find("https://")?;
    let token = line[start..].split_whitespace().next()?;
    let token = token.trim_end_matches(['"', '\'', ')', ']', ',', '.']);

    if !token.to_ascii_lowercase().contains("cloudflare") {
        return None;
    }
    Some(token.to_string())
}

async fn forward_lines<R>(stream: R, line_tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line_tx.send(line).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    const LOGIN_URL: &str =
        "https://dash.cloudflare.com/argotunnel?aud=&callback=https%3A%2F%2Flogin";

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-cloudflared");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn coordinator_with(dir: &TempDir, body: &str, timeout: Duration) -> AuthFlowCoordinator {
        let script = write_script(dir.path(), body);
        AuthFlowCoordinator::new(AuthFlowSettings {
            cloudflared_path: script,
            cert_path: dir.path().join("cert.pem"),
            login_timeout: timeout,
        })
    }

    async fn wait_for_state(coordinator: &AuthFlowCoordinator, wanted: AuthFlowState) -> AuthStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = coordinator.status().await;
            if status.state == wanted {
                return status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("never reached {:?}, stuck at {:?}", wanted, status.state);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[test]
    fn url_extraction_matches_cloudflared_output() {
        let line = format!("Please open the following URL and log in: {}", LOGIN_URL);
        assert_eq!(extract_login_url(&line).unwrap(), LOGIN_URL);

        // Plain chatter and non-cloudflare URLs are ignored
        assert!(extract_login_url("Waiting for browser authentication...").is_none());
        assert!(extract_login_url("see https://example.com/docs for help").is_none());

        // Trailing punctuation is stripped
        let wrapped = format!("visit {}.", LOGIN_URL);
        assert_eq!(extract_login_url(&wrapped).unwrap(), LOGIN_URL);
    }

    #[tokio::test]
    async fn successful_login_walks_the_state_machine() {
        let dir = TempDir::new().unwrap();
        // Print the URL, linger briefly as if waiting for the browser, exit 0
        let body = format!("echo '{}'\nsleep 0.3\nexit 0", LOGIN_URL);
        let coordinator = coordinator_with(&dir, &body, Duration::from_secs(10));

        let begun = coordinator.begin().await.unwrap();
        assert!(matches!(
            begun.state,
            AuthFlowState::WaitingForUrl | AuthFlowState::UrlFound
        ));

        let found = wait_for_state(&coordinator, AuthFlowState::UrlFound).await;
        assert_eq!(found.url.as_deref(), Some(LOGIN_URL));

        let done = wait_for_state(&coordinator, AuthFlowState::Completed).await;
        assert_eq!(done.url.as_deref(), Some(LOGIN_URL));
    }

    #[tokio::test]
    async fn begin_while_in_progress_is_rejected() {
        let dir = TempDir::new().unwrap();
        let body = format!("echo '{}'\nsleep 5", LOGIN_URL);
        let coordinator = coordinator_with(&dir, &body, Duration::from_secs(30));

        coordinator.begin().await.unwrap();
        wait_for_state(&coordinator, AuthFlowState::UrlFound).await;

        let err = coordinator.begin().await.unwrap_err();
        assert!(matches!(err, Error::LoginInProgress));

        coordinator.cancel().await.unwrap();
        wait_for_state(&coordinator, AuthFlowState::Idle).await;
    }

    #[tokio::test]
    async fn exit_before_url_fails_the_session() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            coordinator_with(&dir, "echo 'no url here'\nexit 0", Duration::from_secs(10));

        coordinator.begin().await.unwrap();
        let status = wait_for_state(&coordinator, AuthFlowState::Failed).await;
        assert!(status.message.unwrap().contains("before presenting"));
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_session() {
        let dir = TempDir::new().unwrap();
        let body = format!("echo '{}'\nexit 3", LOGIN_URL);
        let coordinator = coordinator_with(&dir, &body, Duration::from_secs(10));

        coordinator.begin().await.unwrap();
        let status = wait_for_state(&coordinator, AuthFlowState::Failed).await;
        assert!(status.message.unwrap().contains("exited with"));
    }

    #[tokio::test]
    async fn watchdog_fails_a_stalled_session() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator_with(&dir, "sleep 30", Duration::from_millis(300));

        coordinator.begin().await.unwrap();
        let status = wait_for_state(&coordinator, AuthFlowState::Failed).await;
        assert!(status.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cert_file_counts_as_completion() {
        let dir = TempDir::new().unwrap();
        // Simulates cloudflared writing cert.pem but the URL line being
        // missed (e.g. unexpected output format)
        let body = "echo 'logged in'\nexit 0";
        fs::write(dir.path().join("cert.pem"), "CERT").unwrap();
        let coordinator = coordinator_with(&dir, body, Duration::from_secs(10));

        coordinator.begin().await.unwrap();
        wait_for_state(&coordinator, AuthFlowState::Completed).await;
    }

    #[tokio::test]
    async fn fresh_begin_after_failure_reclaims_the_slot() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator_with(&dir, "exit 1", Duration::from_secs(10));

        coordinator.begin().await.unwrap();
        wait_for_state(&coordinator, AuthFlowState::Failed).await;

        // The slot is reclaimable without an explicit cancel
        coordinator.begin().await.unwrap();
        wait_for_state(&coordinator, AuthFlowState::Failed).await;
    }
}
