// Cloudflared Tunnel Manager - Process Supervisor
// Maps each running tunnel to exactly one live cloudflared process: spawn,
// readiness detection, graceful stop with escalation, and bounded automatic
// restart after unexpected exits.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cfd_tunnel_common::{Error, Result, TunnelStatus};

use crate::config::DaemonConfig;
use crate::ingress;
use crate::store::TunnelStore;

/// Events emitted as supervised processes change state
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Starting { name: String },
    Running { name: String },
    Stopped { name: String, reason: String },
    Crashed { name: String, reason: String },
    RestartScheduled { name: String, attempt: u32, delay: Duration },
}

/// Tunables for process supervision, derived from the daemon config
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub cloudflared_path: PathBuf,
    pub cloudflared_dir: PathBuf,
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
    pub restart_max_attempts: u32,
    pub restart_base_delay: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            cloudflared_path: config.cloudflared_path.clone(),
            cloudflared_dir: config.cloudflared_dir.clone(),
            startup_grace: config.startup_grace(),
            stop_timeout: config.stop_timeout(),
            restart_max_attempts: config.restart_max_attempts,
            restart_base_delay: config.restart_base_delay(),
        }
    }
}

/// Runtime state for one supervised process
struct ActiveProcess {
    pid: Option<u32>,
    /// Set before the shutdown signal so the exit watcher can tell a
    /// requested stop from a crash
    stop_requested: Arc<AtomicBool>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

/// Supervises all tunnel processes. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ProcessSupervisor {
    store: TunnelStore,
    settings: Arc<SupervisorSettings>,
    /// Live processes indexed by tunnel name
    processes: Arc<RwLock<HashMap<String, ActiveProcess>>>,
    /// Sleeping restart tasks, cancelled by operator start/stop/delete
    pending_restarts: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    /// Per-tunnel operation locks: start/stop/route changes for one tunnel
    /// never interleave, while different tunnels proceed independently
    op_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl ProcessSupervisor {
    pub fn new(store: TunnelStore, settings: SupervisorSettings) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            store,
            settings: Arc::new(settings),
            processes: Arc::new(RwLock::new(HashMap::new())),
            pending_restarts: Arc::new(Mutex::new(HashMap::new())),
            op_locks: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
        }
    }

    /// Subscribe to supervision events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    /// Acquire the operation lock for a tunnel name. Held across the whole
    /// of start/stop/route mutations; never held by the supervision tasks
    /// themselves, so waiting on a task while holding it cannot deadlock.
    pub async fn lock_ops(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.op_locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Whether a live process is currently registered for this tunnel
    pub async fn is_supervised(&self, name: &str) -> bool {
        self.processes.read().await.contains_key(name)
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let _guard = self.lock_ops(name).await;
        self.start_locked(name, 0).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let _guard = self.lock_ops(name).await;
        self.stop_locked(name).await
    }

    /// Stop all supervised tunnels and cancel pending restarts (daemon
    /// shutdown path, best-effort)
    pub async fn stop_all(&self) {
        {
            let mut pending = self.pending_restarts.lock().await;
            for (name, handle) in pending.drain() {
                handle.abort();
                debug!("Cancelled pending restart for tunnel '{}'", name);
            }
        }

        let names: Vec<String> = self.processes.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!("Failed to stop tunnel '{}' during shutdown: {}", name, e);
            }
        }
    }

    /// Start with the op lock already held (attempt > 0 marks an automatic
    /// restart)
    pub(crate) async fn start_locked(&self, name: &str, attempt: u32) -> Result<()> {
        self.cancel_pending_restart(name).await;

        {
            let processes = self.processes.read().await;
            if processes.contains_key(name) {
                return Err(Error::AlreadyRunning(name.to_string()));
            }
        }

        let tunnel = self.store.get(name).await?;

        // The ingress artifact is regenerated on every route change; only
        // write it here if it has never been generated
        let config_path = ingress::config_path(&self.settings.cloudflared_dir, name);
        if !config_path.exists() {
            ingress::write_config(&self.settings.cloudflared_dir, &tunnel)?;
        }

        self.store.set_status(name, TunnelStatus::Starting).await?;
        self.broadcast(TunnelEvent::Starting {
            name: name.to_string(),
        });
        info!("Starting tunnel '{}'", name);

        let spawn_result = Command::new(&self.settings.cloudflared_path)
            .arg("tunnel")
            .arg("--config")
            .arg(&config_path)
            .arg("run")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                // Spawn failures are surfaced, not retried
                let reason = format!("failed to spawn cloudflared: {}", e);
                error!("Tunnel '{}': {}", name, reason);
                self.store.set_status(name, TunnelStatus::Crashed).await?;
                self.broadcast(TunnelEvent::Crashed {
                    name: name.to_string(),
                    reason: reason.clone(),
                });
                return Err(Error::Process(reason));
            }
        };

        // Readiness signal from the output scanners; try_send keeps the
        // readers from ever blocking on a full channel
        let (ready_tx, ready_rx) = mpsc::channel::<()>(1);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(scan_output(stdout, name.to_string(), ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(scan_output(stderr, name.to_string(), ready_tx.clone()));
        }
        drop(ready_tx);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let stop_requested = Arc::new(AtomicBool::new(false));

        {
            let mut processes = self.processes.write().await;
            processes.insert(
                name.to_string(),
                ActiveProcess {
                    pid: child.id(),
                    stop_requested: stop_requested.clone(),
                    shutdown_tx: Some(shutdown_tx),
                    join_handle: None,
                },
            );
        }

        let supervisor = self.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            supervisor
                .supervise(task_name, child, ready_rx, shutdown_rx, stop_requested, attempt)
                .await;
        });

        let mut processes = self.processes.write().await;
        if let Some(process) = processes.get_mut(name) {
            process.join_handle = Some(handle);
        }

        Ok(())
    }

    /// Stop with the op lock already held
    pub(crate) async fn stop_locked(&self, name: &str) -> Result<()> {
        self.store.get(name).await?;

        let taken = {
            let mut processes = self.processes.write().await;
            processes.get_mut(name).map(|process| {
                process.stop_requested.store(true, Ordering::SeqCst);
                (process.shutdown_tx.take(), process.join_handle.take())
            })
        };

        let (shutdown_tx, join_handle) = match taken {
            Some(parts) => parts,
            None => {
                // No live process. A crashed tunnel may still have a restart
                // pending; stopping it cancels the restart and settles the
                // record at stopped.
                self.cancel_pending_restart(name).await;
                let tunnel = self.store.get(name).await?;
                if tunnel.status == TunnelStatus::Crashed {
                    self.store.set_status(name, TunnelStatus::Stopped).await?;
                    info!("Tunnel '{}' settled from crashed to stopped", name);
                    self.broadcast(TunnelEvent::Stopped {
                        name: name.to_string(),
                        reason: "stop after crash; restarts cancelled".to_string(),
                    });
                    return Ok(());
                }
                return Err(Error::NotRunning(name.to_string()));
            }
        };

        self.store.set_status(name, TunnelStatus::Stopping).await?;
        info!("Stopping tunnel '{}'", name);

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = join_handle {
            // SIGTERM wait plus margin for the SIGKILL escalation
            let deadline = self.settings.stop_timeout + Duration::from_secs(5);
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Supervision task for '{}' ended abnormally: {}", name, e),
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "tunnel '{}' did not stop within {:?}",
                        name, deadline
                    )))
                }
            }
        }

        Ok(())
    }

    /// Stop-if-running then start, with the op lock already held. Used when
    /// a route change regenerates the ingress artifact.
    pub(crate) async fn restart_locked(&self, name: &str) -> Result<()> {
        if self.is_supervised(name).await {
            self.stop_locked(name).await?;
        }
        self.start_locked(name, 0).await
    }

    /// Drop a sleeping restart task, if one exists
    pub(crate) async fn cancel_pending_restart(&self, name: &str) {
        let handle = {
            let mut pending = self.pending_restarts.lock().await;
            pending.remove(name)
        };
        if let Some(handle) = handle {
            handle.abort();
            debug!("Cancelled pending restart for tunnel '{}'", name);
        }
    }

    /// Monitor one spawned process until it exits or is asked to stop
    async fn supervise(
        self,
        name: String,
        mut child: Child,
        mut ready_rx: mpsc::Receiver<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
        stop_requested: Arc<AtomicBool>,
        attempt: u32,
    ) {
        let grace = tokio::time::sleep(self.settings.startup_grace);
        tokio::pin!(grace);
        let mut lines_open = true;

        // Startup phase: readiness line, silent grace period, early exit,
        // or a stop request
        let early_exit: Option<String> = loop {
            tokio::select! {
                maybe = ready_rx.recv(), if lines_open => {
                    match maybe {
                        Some(()) => {
                            debug!("Tunnel '{}' reported readiness", name);
                            break None;
                        }
                        // Output closed without a readiness line; keep
                        // waiting on the exit or the grace period
                        None => lines_open = false,
                    }
                }
                () = &mut grace => {
                    debug!(
                        "Tunnel '{}' survived the {}s startup grace period",
                        name,
                        self.settings.startup_grace.as_secs()
                    );
                    break None;
                }
                status = child.wait() => {
                    break Some(exit_reason(status));
                }
                _ = shutdown_rx.recv() => {
                    self.terminate_child(&name, &mut child).await;
                    self.finish_stopped(&name, "stopped during startup").await;
                    return;
                }
            }
        };

        if let Some(reason) = early_exit {
            self.handle_exit(&name, reason, &stop_requested, attempt).await;
            return;
        }

        if let Err(e) = self.store.set_status(&name, TunnelStatus::Running).await {
            debug!("Failed to record running status for '{}': {}", name, e);
        }
        info!("Tunnel '{}' is running", name);
        self.broadcast(TunnelEvent::Running { name: name.clone() });

        // Steady state: wait for exit or stop
        tokio::select! {
            status = child.wait() => {
                self.handle_exit(&name, exit_reason(status), &stop_requested, attempt).await;
            }
            _ = shutdown_rx.recv() => {
                self.terminate_child(&name, &mut child).await;
                self.finish_stopped(&name, "stopped by operator").await;
            }
        }
    }

    /// Graceful termination: SIGTERM, bounded wait, SIGKILL escalation
    async fn terminate_child(&self, name: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to tunnel '{}' (pid {})", name, pid);
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Tunnel '{}' exited with {} after SIGTERM", name, status);
                    return;
                }
                Ok(Err(e)) => {
                    warn!("Failed to await tunnel '{}' after SIGTERM: {}", name, e);
                    return;
                }
                Err(_) => warn!(
                    "Tunnel '{}' did not exit within {:?}, escalating to SIGKILL",
                    name, self.settings.stop_timeout
                ),
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill tunnel '{}': {}", name, e);
        }
    }

    async fn finish_stopped(&self, name: &str, reason: &str) {
        self.remove_process(name).await;
        if let Err(e) = self.store.set_status(name, TunnelStatus::Stopped).await {
            // The tunnel record may have been deleted while stopping
            debug!("Failed to record stopped status for '{}': {}", name, e);
        }
        info!("Tunnel '{}' stopped ({})", name, reason);
        self.broadcast(TunnelEvent::Stopped {
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Exit watcher tail: requested stops settle at stopped; everything
    /// else is a crash with bounded automatic restart
    async fn handle_exit(
        &self,
        name: &str,
        reason: String,
        stop_requested: &AtomicBool,
        attempt: u32,
    ) {
        self.remove_process(name).await;

        if stop_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.store.set_status(name, TunnelStatus::Stopped).await {
                debug!("Failed to record stopped status for '{}': {}", name, e);
            }
            info!("Tunnel '{}' stopped ({})", name, reason);
            self.broadcast(TunnelEvent::Stopped {
                name: name.to_string(),
                reason,
            });
            return;
        }

        warn!("Tunnel '{}' exited unexpectedly: {}", name, reason);
        if let Err(e) = self.store.set_status(name, TunnelStatus::Crashed).await {
            debug!("Failed to record crashed status for '{}': {}", name, e);
        }
        self.broadcast(TunnelEvent::Crashed {
            name: name.to_string(),
            reason,
        });

        if attempt >= self.settings.restart_max_attempts {
            if self.settings.restart_max_attempts > 0 {
                error!(
                    "Tunnel '{}' crashed after {} restart attempt(s); leaving it crashed for manual intervention",
                    name, attempt
                );
            }
            return;
        }

        let next_attempt = attempt + 1;
        let delay = self.settings.restart_base_delay * 2u32.pow(attempt);
        info!(
            "Scheduling restart {}/{} for tunnel '{}' in {:?}",
            next_attempt, self.settings.restart_max_attempts, name, delay
        );
        self.broadcast(TunnelEvent::RestartScheduled {
            name: name.to_string(),
            attempt: next_attempt,
            delay,
        });

        let supervisor = self.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.try_restart(task_name, next_attempt).await;
        });

        let mut pending = self.pending_restarts.lock().await;
        pending.insert(name.to_string(), handle);
    }

    /// Body of a scheduled restart. The operator may have intervened while
    /// we slept; anything other than an untouched crashed tunnel drops the
    /// restart silently.
    ///
    /// Returns a boxed future rather than an `async fn` to break the
    /// auto-trait inference cycle between `start_locked`, `supervise`, and
    /// this function (each spawns or awaits the next); naming a concrete
    /// `Send` return type terminates that cycle.
    fn try_restart<'a>(
        &'a self,
        name: String,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.lock_ops(&name).await;

            {
                let mut pending = self.pending_restarts.lock().await;
                pending.remove(&name);
            }

            let tunnel = match self.store.get(&name).await {
                Ok(tunnel) => tunnel,
                Err(_) => {
                    debug!("Tunnel '{}' no longer exists, dropping restart", name);
                    return;
                }
            };
            if tunnel.status != TunnelStatus::Crashed {
                debug!(
                    "Tunnel '{}' is {} rather than crashed, dropping restart",
                    name, tunnel.status
                );
                return;
            }
            if self.is_supervised(&name).await {
                return;
            }

            info!(
                "Restarting tunnel '{}' (attempt {}/{})",
                name, attempt, self.settings.restart_max_attempts
            );
            if let Err(e) = self.start_locked(&name, attempt).await {
                error!("Automatic restart of tunnel '{}' failed: {}", name, e);
            }
        })
    }

    async fn remove_process(&self, name: &str) {
        let mut processes = self.processes.write().await;
        processes.remove(name);
    }

    fn broadcast(&self, event: TunnelEvent) {
        if let Err(e) = self.event_tx.send(event) {
            debug!("No event subscribers: {}", e);
        }
    }
}

/// The readiness line cloudflared prints once a connection to the edge is
/// established. Kept as a narrow predicate so the pattern can follow the
/// external tool's output format.
fn is_ready_line(line: &str) -> bool {
    line.contains("Registered tunnel connection")
}

fn exit_reason(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => format!("process exited with {}", status),
        Err(e) => format!("failed to await process: {}", e),
    }
}

/// Log every output line of a supervised process and forward readiness
async fn scan_output<R>(stream: R, name: String, ready_tx: mpsc::Sender<()>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "cloudflared", "[{}] {}", name, line);
        if is_ready_line(&line) {
            let _ = ready_tx.try_send(());
        }
    }
}
