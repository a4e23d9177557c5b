//! Shell-style command parsing and the preload/run/cleanup workload.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::error::{CommandError, Step};
use crate::supervisor::{Invocation, Workload};

/// Upper bound for the cleanup command.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time between SIGTERM and SIGKILL when stopping a service.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// The three command strings that make up a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptBundle {
    /// Runs to completion before the service starts. Empty means none.
    pub preload: String,
    /// The long-lived service process.
    pub run: String,
    /// Runs once after the service has been stopped. Empty means none.
    pub cleanup: String,
}

impl ScriptBundle {
    pub fn new(
        preload: impl Into<String>,
        run: impl Into<String>,
        cleanup: impl Into<String>,
    ) -> Self {
        Self {
            preload: preload.into(),
            run: run.into(),
            cleanup: cleanup.into(),
        }
    }
}

/// Split a command line into its argument vector.
///
/// Fields are separated by runs of spaces or tabs. A field starting with
/// `"` extends to the matching quote and may contain separators; `""`
/// inside a quoted field is a literal quote.
///
/// ```
/// # use revolver_ecdysis::parse_command;
/// let argv = parse_command(r#"echo "hello world""#).unwrap();
/// assert_eq!(argv, ["echo", "hello world"]);
/// ```
pub fn parse_command(command: &str) -> Result<Vec<String>, CommandError> {
    let is_sep = |c: &char| *c == ' ' || *c == '\t';
    let mut chars = command.trim_end_matches(['\r', '\n']).chars().peekable();
    let mut fields = Vec::new();

    loop {
        while chars.next_if(is_sep).is_some() {}
        let Some(&first) = chars.peek() else { break };

        let mut field = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(CommandError::parse(command, "unterminated quote")),
                    Some('"') if chars.next_if_eq(&'"').is_some() => field.push('"'),
                    Some('"') => break,
                    Some(c) => field.push(c),
                }
            }
            if chars.peek().is_some_and(|c| !is_sep(c)) {
                return Err(CommandError::parse(
                    command,
                    "unexpected text after closing quote",
                ));
            }
        } else {
            while let Some(c) = chars.next_if(|c| !is_sep(c)) {
                if c == '"' {
                    return Err(CommandError::parse(command, "quote inside unquoted field"));
                }
                field.push(c);
            }
        }
        fields.push(field);
    }

    if fields.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(fields)
}

fn parse_optional(command: &str) -> Result<Option<Vec<String>>, CommandError> {
    if command.trim().is_empty() {
        return Ok(None);
    }
    parse_command(command).map(Some)
}

/// Runs a [`ScriptBundle`]: preload, then the service, then cleanup.
///
/// Every command runs in the invocation's working directory, in its own
/// process group, with the parent environment plus the invocation's
/// overrides. Output goes to the parent's stdout/stderr.
#[derive(Debug, Clone)]
pub struct CommandSet {
    stop_grace: Duration,
}

impl CommandSet {
    pub fn new(stop_grace: Duration) -> Self {
        Self { stop_grace }
    }

    async fn run_service(
        &self,
        argv: &[String],
        invocation: &Invocation,
    ) -> Result<(), CommandError> {
        let mut child = spawn(Step::Run, argv, invocation)?;
        invocation.mark_launched();
        info!(pid = child.id(), program = %argv[0], "Service launched");

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                invocation.mark_exited();
                warn!(%status, "Service exited before being stopped");
                // Cleanup belongs after cancellation, even for a dead service.
                invocation.cancel.cancelled().await;
                check(Step::Run, status)
            }
            _ = invocation.cancel.cancelled() => {
                let status = terminate(&mut child, self.stop_grace).await?;
                debug!(%status, "Service terminated");
                Err(CommandError::Cancelled(Step::Run))
            }
        }
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_GRACE)
    }
}

#[async_trait]
impl Workload for CommandSet {
    async fn run(&self, invocation: Invocation) -> Result<(), CommandError> {
        let run = parse_command(&invocation.scripts.run)?;
        let preload = parse_optional(&invocation.scripts.preload)?;
        let cleanup = parse_optional(&invocation.scripts.cleanup)?;

        if let Some(preload) = preload {
            let mut child = spawn(Step::Preload, &preload, &invocation)?;
            let status = tokio::select! {
                status = child.wait() => status?,
                _ = invocation.cancel.cancelled() => {
                    terminate(&mut child, self.stop_grace).await?;
                    return Err(CommandError::Cancelled(Step::Preload));
                }
            };
            check(Step::Preload, status)?;
            debug!("Preload finished");
        }

        let result = self.run_service(&run, &invocation).await;

        if let Some(cleanup) = cleanup {
            run_cleanup(&cleanup, &invocation).await;
        }

        result
    }
}

fn spawn(step: Step, argv: &[String], invocation: &Invocation) -> Result<Child, CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;
    debug!(%step, program, ?args, "Spawning command");

    Command::new(program)
        .args(args)
        .current_dir(&invocation.work_dir)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            step,
            program: program.clone(),
            source,
        })
}

fn check(step: Step, status: ExitStatus) -> Result<(), CommandError> {
    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Failed { step, status })
    }
}

/// Best effort: failures are logged, never returned.
async fn run_cleanup(argv: &[String], invocation: &Invocation) {
    let result = async {
        let mut child = spawn(Step::Cleanup, argv, invocation)?;
        match tokio::time::timeout(CLEANUP_TIMEOUT, child.wait()).await {
            Ok(status) => check(Step::Cleanup, status?),
            Err(_) => {
                terminate(&mut child, Duration::ZERO).await?;
                Err(CommandError::TimedOut {
                    step: Step::Cleanup,
                    timeout: CLEANUP_TIMEOUT,
                })
            }
        }
    }
    .await;

    match result {
        Ok(()) => debug!("Cleanup finished"),
        Err(e) => error!(error = %e, "Cleanup failed"),
    }
}

/// SIGTERM the child's process group, then SIGKILL it if the child is
/// still alive after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    signal_group(pid, libc::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                pid,
                ?grace,
                "Process group still alive after SIGTERM, killing"
            );
            signal_group(pid, libc::SIGKILL);
            child.wait().await
        }
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // Negative pid addresses the group the child leads (process_group(0)).
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(
            pid,
            signal,
            error = %io::Error::last_os_error(),
            "Failed to signal process group"
        );
    }
}
