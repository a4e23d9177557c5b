//! Lifecycle of one supervised service process.
//!
//! A supervisor is single-use: it starts its workload once, and after the
//! workload has exited it is discarded. Restarting means building a new
//! supervisor.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Exited
//!             \__________\___________________/
//!                 (workload returned early)
//! ```
//!
//! `Stopping` is also entered when the service process exits on its own;
//! the workload may still be running its cleanup at that point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::command::ScriptBundle;
use crate::error::CommandError;

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Never started.
    Idle,
    /// Workload spawned, service not launched yet (e.g. still building).
    Starting,
    /// Service process launched.
    Running,
    /// Stop requested or service gone, waiting for the workload to return.
    Stopping,
    /// Workload returned. Terminal.
    Exited,
}

/// Something a supervisor can run: usually [`crate::CommandSet`].
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Run until the service exits or `invocation.cancel` fires.
    ///
    /// Implementations call [`Invocation::mark_launched`] once the
    /// long-lived service process is up.
    async fn run(&self, invocation: Invocation) -> Result<(), CommandError>;
}

/// Everything a workload needs for one run.
pub struct Invocation {
    /// Cancelled when the supervisor is stopped or the run shuts down.
    pub cancel: CancellationToken,
    /// Variables added to the inherited environment.
    pub env: HashMap<String, String>,
    pub work_dir: PathBuf,
    pub scripts: ScriptBundle,
    shared: Arc<Shared>,
}

impl Invocation {
    /// Report that the service process has been launched.
    pub fn mark_launched(&self) {
        self.shared.transition(SupervisorState::Starting, SupervisorState::Running);
    }

    /// Report that the service process has exited without being stopped.
    pub fn mark_exited(&self) {
        self.shared.transition(SupervisorState::Running, SupervisorState::Stopping);
    }
}

struct Shared {
    work_dir: PathBuf,
    scripts: ScriptBundle,
    running: AtomicBool,
    used: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    state: watch::Sender<SupervisorState>,
}

impl Shared {
    fn transition(&self, from: SupervisorState, to: SupervisorState) {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

/// Owns the lifecycle of one service process.
///
/// Cloning is cheap; clones observe and control the same process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(work_dir: impl Into<PathBuf>, scripts: ScriptBundle) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            shared: Arc::new(Shared {
                work_dir: work_dir.into(),
                scripts,
                running: AtomicBool::new(false),
                used: AtomicBool::new(false),
                cancel: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.shared.work_dir
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    /// Launch `workload` under a child of `parent`.
    ///
    /// Returns `false` if this supervisor is running or has already run.
    pub fn start(
        &self,
        parent: &CancellationToken,
        env: HashMap<String, String>,
        workload: Arc<dyn Workload>,
    ) -> bool {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Supervisor already running");
            return false;
        }
        if self.shared.used.swap(true, Ordering::SeqCst) {
            self.shared.running.store(false, Ordering::SeqCst);
            debug!("Supervisor already used");
            return false;
        }

        let cancel = parent.child_token();
        *self.lock_cancel() = Some(cancel.clone());
        self.shared.state.send_replace(SupervisorState::Starting);

        let invocation = Invocation {
            cancel,
            env,
            work_dir: self.shared.work_dir.clone(),
            scripts: self.shared.scripts.clone(),
            shared: Arc::clone(&self.shared),
        };

        let shared = Arc::clone(&self.shared);
        let span = info_span!("supervisor", work_dir = %self.shared.work_dir.display());
        tokio::spawn(
            async move {
                match workload.run(invocation).await {
                    Ok(()) => info!("Service exited"),
                    Err(e) if e.is_cancelled() => debug!(error = %e, "Service cancelled"),
                    Err(e) => error!(error = %e, "Service failed"),
                }
                shared.running.store(false, Ordering::SeqCst);
                shared.state.send_replace(SupervisorState::Exited);
            }
            .instrument(span),
        );

        true
    }

    /// Cancel the workload. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        self.shared.state.send_if_modified(|state| {
            if matches!(*state, SupervisorState::Starting | SupervisorState::Running) {
                *state = SupervisorState::Stopping;
                true
            } else {
                false
            }
        });

        if let Some(cancel) = self.lock_cancel().as_ref() {
            cancel.cancel();
        }
        true
    }

    /// Wait until the workload has returned. Returns at once if it never
    /// started.
    pub async fn wait_for_stop(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(*state, SupervisorState::Idle | SupervisorState::Exited))
            .await;
    }

    /// Wait until the service process is gone, whether stopped, crashed or
    /// never launched.
    pub async fn wait_for_service_exit(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx
            .wait_for(|state| {
                matches!(
                    *state,
                    SupervisorState::Idle | SupervisorState::Stopping | SupervisorState::Exited
                )
            })
            .await;
    }

    /// Wait until the service is launched.
    ///
    /// Returns `false` if the workload ended or was stopped first.
    pub async fn wait_for_launch(&self) -> bool {
        let mut rx = self.shared.state.subscribe();
        let launched = match rx
            .wait_for(|state| *state != SupervisorState::Starting)
            .await
        {
            Ok(state) => *state == SupervisorState::Running,
            Err(_) => false,
        };
        launched
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.shared.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }
}
