//! External command hooks
//!
//! Launches the commands configured as `runOnInit`, `runOnDemand`,
//! `runOnReady`, `runOnRead` and `runOnNotReady`. `$VAR` placeholders in
//! the command line are substituted from the environment map, which is also
//! exported to the child process.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Pause between restarts of a command with restart enabled
const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Variables exported to hook commands
pub type Environment = HashMap<String, String>;

/// Callback invoked whenever the command exits on its own
pub type OnExitFunc = Box<dyn Fn(std::io::Result<std::process::ExitStatus>) + Send + Sync>;

/// Tracks every command launched through it, so that shutdown can stop
/// whatever is still running in one sweep.
///
/// Individual commands are still closed through their own [`Cmd`] handles
/// at the right lifecycle moments; the pool is the backstop.
#[derive(Default)]
pub struct CmdPool {
    cancels: Mutex<Vec<CancellationToken>>,
}

impl CmdPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch a command and register it with the pool.
    ///
    /// Same contract as [`Cmd::new`]; the returned handle closes this
    /// command individually.
    pub fn spawn(
        &self,
        cmdline: &str,
        restart: bool,
        env: Environment,
        on_exit: Option<OnExitFunc>,
    ) -> Cmd {
        let cmd = Cmd::new(cmdline, restart, env, on_exit);

        let mut cancels = self.cancels.lock();
        cancels.retain(|cancel| !cancel.is_cancelled());
        cancels.push(cmd.cancel.clone());
        cmd
    }

    /// Number of commands not yet closed
    pub fn len(&self) -> usize {
        let mut cancels = self.cancels.lock();
        cancels.retain(|cancel| !cancel.is_cancelled());
        cancels.len()
    }

    /// Whether no launched command is still tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every command still running. Does not wait for the
    /// children to exit.
    pub fn close(&self) {
        for cancel in self.cancels.lock().drain(..) {
            cancel.cancel();
        }
    }
}

/// A running external command
///
/// The command is spawned on creation and, when `restart` is set, relaunched
/// after a fixed pause each time it exits, until [`Cmd::close`] is called.
pub struct Cmd {
    cancel: CancellationToken,
}

impl Cmd {
    /// Launch `cmdline` with the given environment.
    pub fn new(
        cmdline: &str,
        restart: bool,
        env: Environment,
        on_exit: Option<OnExitFunc>,
    ) -> Self {
        let cancel = CancellationToken::new();

        // Substitute placeholders up front so the same command line works
        // regardless of the child's shell quoting rules.
        let mut cmdline = cmdline.to_string();
        for (key, val) in &env {
            cmdline = cmdline.replace(&format!("${key}"), val);
        }

        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let exited = run_once(&cmdline, &env, &token).await;

                let cancelled = exited.is_none();
                if cancelled {
                    break;
                }

                if let (Some(on_exit), Some(status)) = (&on_exit, exited) {
                    on_exit(status);
                }

                if !restart {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(RESTART_PAUSE) => {}
                    _ = token.cancelled() => break,
                }
            }

            // Marks the command as finished, so pools stop tracking it.
            token.cancel();
        });

        Self { cancel }
    }

    /// Terminate the command. Does not wait for the child to exit.
    ///
    /// Dropping a `Cmd` without calling this leaves the command running to
    /// completion, which is what one-shot notification hooks rely on.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Run the command once. Returns `None` when cancelled, otherwise the exit
/// status (or the spawn error).
async fn run_once(
    cmdline: &str,
    env: &Environment,
    cancel: &CancellationToken,
) -> Option<std::io::Result<std::process::ExitStatus>> {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(cmdline)
        .envs(env)
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(command = cmdline, error = %e, "failed to launch command");
            return Some(Err(e));
        }
    };

    tokio::select! {
        status = child.wait() => {
            tracing::debug!(command = cmdline, status = ?status, "command exited");
            Some(status)
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    }
}
