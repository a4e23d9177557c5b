//! Error types for the proxy, the command runner and the restart coordinator.

use std::fmt;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// The script step a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Runs once, to completion, before the service starts (e.g. a build).
    Preload,
    /// The long-lived service process.
    Run,
    /// Runs once after the service context is cancelled.
    Cleanup,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Preload => write!(f, "preload"),
            Step::Run => write!(f, "run"),
            Step::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Reverse proxy errors.
///
/// Everything except `Bind` and `Accept` is local to a single client
/// connection; the proxy keeps serving.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listen socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Too many consecutive accept failures
    #[error("Accept failed {attempts} times in a row: {source}")]
    Accept {
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    /// Address resolution failed
    #[error("Failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Address resolved to nothing
    #[error("No address found for {0}")]
    Unresolvable(String),

    /// A connection arrived before any backend was registered
    #[error("No destination configured")]
    NoDestination,

    /// The backend refused or dropped the dial
    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Writing the PROXY preamble took too long
    #[error("Timed out writing PROXY preamble to {0}")]
    PreambleTimeout(SocketAddr),

    /// An inbound PROXY header was present but malformed
    #[error("Invalid PROXY header: {0}")]
    InvalidHeader(String),

    /// IO error on an established connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Create a new invalid header error.
    pub fn invalid_header(msg: impl Into<String>) -> Self {
        Self::InvalidHeader(msg.into())
    }
}

/// Command runner errors.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Blank command string
    #[error("Command is empty")]
    Empty,

    /// Malformed quoting
    #[error("Failed to parse command `{command}`: {reason}")]
    Parse { command: String, reason: String },

    /// The program could not be started
    #[error("Failed to spawn {step} command `{program}`: {source}")]
    Spawn {
        step: Step,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program exited unsuccessfully
    #[error("{step} command exited with {status}")]
    Failed { step: Step, status: ExitStatus },

    /// The context was cancelled while the step was running
    #[error("{0} command was cancelled")]
    Cancelled(Step),

    /// Cleanup ran past its deadline
    #[error("{step} command did not finish within {timeout:?}")]
    TimedOut { step: Step, timeout: Duration },

    /// IO error while waiting on a child
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    pub(crate) fn parse(command: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is the expected result of cancelling the context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Errors that abort a single restart attempt.
///
/// The previous backend keeps serving whenever one of these is returned.
#[derive(Debug, Error)]
pub enum RestartError {
    /// No free ephemeral port could be reserved
    #[error("Failed to allocate ports: {0}")]
    PortAllocation(#[source] std::io::Error),

    /// The new supervisor refused to start
    #[error("Supervisor refused to start")]
    StartRejected,

    /// The workload ended before launching the service (e.g. preload failed)
    #[error("Service exited before launch")]
    LaunchFailed,

    /// The workload launched but exited before its ports accepted connections
    #[error("Service exited before accepting connections")]
    ExitedBeforeReady,

    /// A port never started accepting connections
    #[error("Service did not accept connections on port {port} within {timeout:?}")]
    NotReady { port: u16, timeout: Duration },

    /// The whole run is shutting down
    #[error("Restart cancelled")]
    Cancelled,
}
