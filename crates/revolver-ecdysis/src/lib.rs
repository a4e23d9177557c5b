//! # revolver-ecdysis
//!
//! Zero-downtime restarts for a locally-run service.
//!
//! ## Overview
//!
//! A restart never drops a client connection:
//! 1. A [`ReverseProxy`] owns the public port for the whole run and forwards
//!    each connection to the current backend, prefixed by a PROXY v2 preamble
//! 2. The [`RestartCoordinator`] builds a new backend on fresh ephemeral ports
//!    and waits until it is live
//! 3. Every proxy is retargeted; in-flight sessions stay on the old backend
//! 4. Once the old backend has no sessions left, its [`ProcessSupervisor`] is
//!    stopped and its cleanup script runs
//!
//! ## Child Environment
//!
//! The service inherits the full parent environment plus one variable per
//! configured port (e.g. `HTTP_PORT=49152`). The service must bind to that
//! port, not a hardcoded one.
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("revolver-ecdysis requires a Unix platform (Linux or macOS)");

mod command;
mod coordinator;
mod error;
mod ports;
mod proxy;
mod proxy_protocol;
mod session;
mod shutdown;
mod supervisor;
mod trigger;

pub use command::{parse_command, CommandSet, ScriptBundle, CLEANUP_TIMEOUT, DEFAULT_STOP_GRACE};
pub use coordinator::{
    CoordinatorSettings, PortBinding, RestartCoordinator, TriggerOutcome, DEFAULT_READY_TIMEOUT,
};
pub use error::{CommandError, ProxyError, RestartError, Step};
pub use ports::allocate_ports;
pub use proxy::{
    ReverseProxy, DEFAULT_DRAIN_INTERVAL, DEFAULT_READ_HEADER_TIMEOUT, PREAMBLE_WRITE_TIMEOUT,
};
pub use proxy_protocol::{AddressFamily, DecodeOutcome, ProxyHeader};
pub use session::SessionId;
pub use shutdown::{GracefulShutdown, ShutdownSignal, ShutdownSignals};
pub use supervisor::{Invocation, ProcessSupervisor, SupervisorState, Workload};
pub use trigger::{ChangeEvent, ChangeHandler, ChangeKind, Debouncer, Retrigger, Trigger};
