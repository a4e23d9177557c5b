//! Restart triggers and trailing-edge debouncing of change events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// What happened to the changed paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A filtered filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub paths: Vec<PathBuf>,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, paths: Vec<PathBuf>) -> Self {
        Self { paths, kind }
    }
}

/// Why a restart was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The synthetic trigger that brings up the first backend.
    Initial,
    /// Source files changed.
    Changed(ChangeEvent),
}

/// Receives change notifications from a file watcher.
///
/// Called from the watcher's own thread, so implementations must not block.
pub trait ChangeHandler: Send + Sync {
    fn handle(&self, event: &ChangeEvent);

    fn handle_error(&self, error: &str) {
        warn!(error, "File watcher error");
    }
}

/// Something that can be asked to restart.
pub trait Retrigger: Send + Sync + 'static {
    /// Request a restart without waiting for it.
    fn retrigger(&self, trigger: Trigger);
}

/// Coalesces bursts of change events into one trigger.
///
/// Every event restarts the quiet window; once `window` passes without
/// events, the last event is forwarded to the target.
#[derive(Clone)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl Debouncer {
    /// Spawn the debounce task. It stops when `cancel` fires or every
    /// handle is dropped.
    pub fn spawn(window: Duration, target: Arc<dyn Retrigger>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = info_span!("debouncer", window = ?window);
        tokio::spawn(debounce(window, rx, target, cancel).instrument(span));
        Self { tx }
    }
}

impl ChangeHandler for Debouncer {
    fn handle(&self, event: &ChangeEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("Debouncer stopped, dropping change");
        }
    }
}

async fn debounce(
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    target: Arc<dyn Retrigger>,
    cancel: CancellationToken,
) {
    let mut pending: Option<ChangeEvent> = None;
    let quiet = tokio::time::sleep(window);
    tokio::pin!(quiet);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => {
                let Some(event) = event else { return };
                quiet.as_mut().reset(Instant::now() + window);
                pending = Some(event);
            }
            _ = &mut quiet, if pending.is_some() => {
                if let Some(event) = pending.take() {
                    debug!(paths = ?event.paths, "Quiet window passed, triggering restart");
                    target.retrigger(Trigger::Changed(event));
                }
            }
        }
    }
}
