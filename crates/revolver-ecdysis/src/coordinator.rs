//! Restart coordination.
//!
//! One attempt runs at a time. An attempt builds a complete new backend
//! before touching any proxy:
//!
//! 1. new session id and one ephemeral port per logical port
//! 2. new supervisor started, launch confirmed, ports accepting connections
//! 3. every proxy renewed to the new backend
//! 4. the previous supervisor is stopped once every proxy has drained it
//!
//! A failure before step 3 cancels the attempt and leaves the previous
//! backend serving. Step 3 cannot fail.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::command::ScriptBundle;
use crate::error::RestartError;
use crate::ports::allocate_ports;
use crate::proxy::ReverseProxy;
use crate::proxy_protocol::ProxyHeader;
use crate::session::SessionId;
use crate::supervisor::{ProcessSupervisor, SupervisorState, Workload};
use crate::trigger::{Retrigger, Trigger};

/// Default time a new backend gets to accept connections after launch.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A public port, its logical name and the variable that tells the
/// service which ephemeral port to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub port: u16,
    pub name: String,
    pub env: String,
}

impl PortBinding {
    pub fn new(port: u16, name: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
            env: env.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Working directory of every script.
    pub work_dir: PathBuf,
    pub scripts: ScriptBundle,
    pub ports: Vec<PortBinding>,
    pub ready_timeout: Duration,
}

/// Result of one trigger.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// The new backend is live and receiving new connections.
    Completed(SessionId),
    /// The attempt was aborted; the previous backend is untouched.
    Failed(RestartError),
    /// Another attempt was in progress.
    Dropped,
}

/// The backend currently receiving new connections.
struct Generation {
    session: SessionId,
    supervisor: ProcessSupervisor,
    ports: HashMap<String, u16>,
}

struct Inner {
    settings: CoordinatorSettings,
    /// Proxies keyed by the logical port name they serve.
    proxies: Vec<(String, ReverseProxy)>,
    workload: Arc<dyn Workload>,
    root: CancellationToken,
    processing: AtomicBool,
    /// Notified whenever an attempt finishes.
    idle: Notify,
    current: Mutex<Option<Generation>>,
    supervisors: Mutex<Vec<ProcessSupervisor>>,
    span: Span,
}

/// Clears the in-progress flag however the attempt ends.
struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
    idle: &'a Notify,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

/// Sequences restarts across every proxy.
///
/// Cloning is cheap; clones share the same state and reentrancy guard.
#[derive(Clone)]
pub struct RestartCoordinator {
    inner: Arc<Inner>,
}

impl RestartCoordinator {
    /// `proxies` pairs each proxy with the logical port name it serves.
    /// Every attempt is scoped to a child of `root`.
    pub fn new(
        settings: CoordinatorSettings,
        proxies: Vec<(String, ReverseProxy)>,
        workload: Arc<dyn Workload>,
        root: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                proxies,
                workload,
                root,
                processing: AtomicBool::new(false),
                idle: Notify::new(),
                current: Mutex::new(None),
                supervisors: Mutex::new(Vec::new()),
                span: info_span!("restart_coordinator"),
            }),
        }
    }

    /// Session id of the backend receiving new connections.
    pub fn current_session(&self) -> Option<SessionId> {
        self.lock_current().as_ref().map(|g| g.session)
    }

    /// Backend ports of the current generation, keyed by logical name.
    pub fn current_ports(&self) -> Option<HashMap<String, u16>> {
        self.lock_current().as_ref().map(|g| g.ports.clone())
    }

    /// Supervisor of the backend receiving new connections.
    pub fn current_supervisor(&self) -> Option<ProcessSupervisor> {
        self.lock_current().as_ref().map(|g| g.supervisor.clone())
    }

    /// Supervisors whose workload has not returned yet.
    pub fn live_supervisors(&self) -> Vec<ProcessSupervisor> {
        let mut supervisors = self.lock_supervisors();
        supervisors.retain(|s| s.state() != SupervisorState::Exited);
        supervisors.clone()
    }

    /// Run one restart attempt, unless one is already in progress.
    pub async fn trigger(&self, trigger: Trigger) -> TriggerOutcome {
        match &trigger {
            Trigger::Initial => info!(parent: &self.inner.span, "Starting initial backend"),
            Trigger::Changed(event) => info!(
                parent: &self.inner.span,
                paths = ?event.paths,
                kind = ?event.kind,
                "File changes detected"
            ),
        }

        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(parent: &self.inner.span, "Restart already in progress, dropping trigger");
            return TriggerOutcome::Dropped;
        }
        let _guard = ProcessingGuard {
            flag: &self.inner.processing,
            idle: &self.inner.idle,
        };

        let session = SessionId::new();
        let span = info_span!(parent: &self.inner.span, "restart", session = %session);

        let attempt = self.inner.root.child_token();
        match self.attempt(session, &attempt).instrument(span.clone()).await {
            Ok(()) => {
                info!(parent: &span, "Backend is live");
                TriggerOutcome::Completed(session)
            }
            Err(e) => {
                attempt.cancel();
                error!(parent: &span, error = %e, "Restart failed, keeping previous backend");
                TriggerOutcome::Failed(e)
            }
        }
    }

    /// Wait until the attempt in progress (if any) has ended and every
    /// supervisor this coordinator started has exited.
    pub async fn wait_stopped(&self) {
        self.wait_idle().await;
        let supervisors = self.live_supervisors();
        join_all(supervisors.iter().map(|s| s.wait_for_stop())).await;
    }

    /// Wait up to `grace` for every supervisor to exit. Returns `false` if
    /// some were still running when the grace period expired.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.wait_stopped()).await.is_ok()
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.processing.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn attempt(
        &self,
        session: SessionId,
        token: &CancellationToken,
    ) -> Result<(), RestartError> {
        if token.is_cancelled() {
            return Err(RestartError::Cancelled);
        }
        let settings = &self.inner.settings;

        let ports = allocate_ports(settings.ports.iter().map(|p| p.name.as_str()))
            .map_err(RestartError::PortAllocation)?;
        let env: HashMap<String, String> = settings
            .ports
            .iter()
            .filter_map(|b| ports.get(&b.name).map(|port| (b.env.clone(), port.to_string())))
            .collect();
        info!(?ports, "Allocated backend ports");

        let supervisor = ProcessSupervisor::new(&settings.work_dir, settings.scripts.clone());
        if !supervisor.start(token, env, Arc::clone(&self.inner.workload)) {
            return Err(RestartError::StartRejected);
        }
        self.lock_supervisors().push(supervisor.clone());

        tokio::select! {
            launched = supervisor.wait_for_launch() => {
                if !launched {
                    return Err(RestartError::LaunchFailed);
                }
            }
            _ = token.cancelled() => return Err(RestartError::Cancelled),
        }
        debug!("Service launched, waiting for ports");

        tokio::select! {
            ready = wait_ready(&ports, settings.ready_timeout) => ready?,
            _ = supervisor.wait_for_service_exit() => return Err(RestartError::ExitedBeforeReady),
            _ = token.cancelled() => return Err(RestartError::Cancelled),
        }

        let drained = self.renew_all(session, &ports);

        let previous = self.lock_current().replace(Generation {
            session,
            supervisor,
            ports,
        });
        if let Some(previous) = previous {
            self.spawn_retire(previous, drained);
        }

        Ok(())
    }

    /// Point every proxy at the new backend. Returns one drain signal per
    /// proxy for the destination it replaced.
    ///
    /// Backend addresses are plain loopback sockets, so no proxy can refuse
    /// them and the switch is never partial.
    fn renew_all(
        &self,
        session: SessionId,
        ports: &HashMap<String, u16>,
    ) -> Vec<oneshot::Receiver<()>> {
        let name = session.to_string();
        let mut drained = Vec::with_capacity(self.inner.proxies.len());

        for (port_name, proxy) in &self.inner.proxies {
            let Some(&port) = ports.get(port_name) else {
                warn!(port = %port_name, "No backend port allocated for proxy");
                continue;
            };

            let (tx, rx) = oneshot::channel();
            proxy.renew_resolved(&name, backend_addr(port), move || {
                let _ = tx.send(());
            });
            drained.push(rx);
        }

        drained
    }

    fn spawn_retire(&self, previous: Generation, drained: Vec<oneshot::Receiver<()>>) {
        let span = info_span!(
            parent: &self.inner.span,
            "retire",
            session = %previous.session
        );
        tokio::spawn(
            async move {
                // A dropped sender means the proxy shut down; stop regardless.
                join_all(drained).await;
                info!("Previous backend drained, stopping it");
                if !previous.supervisor.stop() {
                    debug!("Previous supervisor already exited");
                }
            }
            .instrument(span),
        );
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Generation>> {
        self.inner.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_supervisors(&self) -> MutexGuard<'_, Vec<ProcessSupervisor>> {
        self.inner.supervisors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Retrigger for RestartCoordinator {
    fn retrigger(&self, trigger: Trigger) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.trigger(trigger).await;
        });
    }
}

fn backend_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Wait until every port accepts a TCP connection.
///
/// Each probe announces itself with a PROXY v2 `LOCAL` header so backends
/// that expect a preamble treat it as a health check.
async fn wait_ready(ports: &HashMap<String, u16>, timeout: Duration) -> Result<(), RestartError> {
    let deadline = Instant::now() + timeout;

    for &port in ports.values() {
        loop {
            let probe = TcpStream::connect(backend_addr(port));
            match tokio::time::timeout_at(deadline, probe).await {
                Ok(Ok(mut stream)) => {
                    let _ = stream.write_all(&ProxyHeader::encode_local()).await;
                    debug!(port, "Port accepting connections");
                    break;
                }
                Ok(Err(_)) => {}
                Err(_) => return Err(RestartError::NotReady { port, timeout }),
            }

            if Instant::now() + READY_POLL_INTERVAL >= deadline {
                return Err(RestartError::NotReady { port, timeout });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    Ok(())
}
