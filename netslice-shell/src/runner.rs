use std::{fmt, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::{timeouts, Error, Output, Result, ShellCommand};

/// Executes [`ShellCommand`]s on behalf of a [`Shell`](crate::Shell).
#[async_trait]
pub trait CommandRunner: fmt::Debug + Send + Sync + 'static {
    /// Runs the command to completion and returns its output, whatever the exit status.
    ///
    /// Returns [`Error::Timeout`] if the command does not finish within its timeout.
    async fn output(&self, cmd: &ShellCommand) -> Result<Output>;

    /// Starts the command as a long-running daemon.
    async fn spawn(&self, cmd: &ShellCommand) -> Result<Box<dyn Daemon>>;
}

/// A long-running process started with [`CommandRunner::spawn`].
#[async_trait]
pub trait Daemon: fmt::Debug + Send + Sync {
    /// The program this daemon runs.
    fn program(&self) -> &str;

    fn pid(&self) -> Option<u32>;

    /// Returns `true` while the process has not exited.
    fn is_alive(&mut self) -> bool;

    /// Asks the process to terminate and kills it if it is still alive after `grace`.
    async fn stop(&mut self, grace: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Prefix every command with `sudo`.
    pub sudo: bool,
}

impl RunnerOptions {
    pub const fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }
}

/// Runs commands on the local host with [`tokio::process`].
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    options: RunnerOptions,
}

impl SystemRunner {
    pub const fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    fn command(&self, cmd: &ShellCommand) -> Command {
        let mut command = if self.options.sudo {
            let mut command = Command::new("sudo");
            command.arg(cmd.get_program());
            command
        } else {
            Command::new(cmd.get_program())
        };

        command.args(cmd.get_args()).stdin(Stdio::null()).kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, cmd: &ShellCommand) -> Result<Output> {
        let mut command = self.command(cmd);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(%cmd, "running command");

        let child = command
            .spawn()
            .map_err(|source| Error::Io { command: cmd.to_string(), source })?;

        // Dropping the future on timeout kills the child.
        match tokio::time::timeout(cmd.get_timeout(), child.wait_with_output()).await {
            Ok(result) => {
                let output: Output = result
                    .map_err(|source| Error::Io { command: cmd.to_string(), source })?
                    .into();

                if !output.is_success() {
                    tracing::debug!(?output.stderr, ?output.code, %cmd, "command returned non-zero status");
                }

                Ok(output)
            }
            Err(_) => {
                tracing::warn!(%cmd, timeout = ?cmd.get_timeout(), "command timed out");
                Err(Error::Timeout { command: cmd.to_string(), after: cmd.get_timeout() })
            }
        }
    }

    async fn spawn(&self, cmd: &ShellCommand) -> Result<Box<dyn Daemon>> {
        let mut command = self.command(cmd);
        command.stdout(Stdio::null()).stderr(Stdio::null());

        tracing::debug!(%cmd, "spawning daemon");

        let child = command
            .spawn()
            .map_err(|source| Error::Io { command: cmd.to_string(), source })?;

        Ok(Box::new(SystemDaemon {
            program: cmd.get_program().to_string(),
            child,
            sudo: self.options.sudo,
            term_timeout: timeouts::QUICK,
        }))
    }
}

#[derive(Debug)]
struct SystemDaemon {
    program: String,
    child: Child,
    sudo: bool,
    /// Bound on the `kill -TERM` command itself.
    term_timeout: Duration,
}

#[async_trait]
impl Daemon for SystemDaemon {
    fn program(&self) -> &str {
        &self.program
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };

        // SIGTERM first so the daemon can release the interface. With sudo, the signal is
        // relayed to the real process.
        let mut term = if self.sudo {
            let mut command = Command::new("sudo");
            command.arg("kill");
            command
        } else {
            Command::new("kill")
        };
        term.args(["-TERM", &pid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.term_timeout, term.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(?e, pid, program = %self.program, "failed to send SIGTERM"),
            Err(_) => {
                let timeout = self.term_timeout;
                tracing::warn!(pid, program = %self.program, ?timeout, "SIGTERM timed out, killing");
                return self.kill(pid).await;
            }
        }

        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            tracing::warn!(pid, program = %self.program, ?grace, "daemon ignored SIGTERM, killing");
            return self.kill(pid).await;
        }

        tracing::debug!(pid, program = %self.program, "daemon stopped");
        Ok(())
    }
}

impl SystemDaemon {
    async fn kill(&mut self, pid: u32) -> Result<()> {
        self.child.kill().await.map_err(|source| Error::Io { command: format!("kill {pid}"), source })?;

        tracing::debug!(pid, program = %self.program, "daemon killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_runner_captures_output() {
        let _ = tracing_subscriber::fmt::try_init();

        let runner = SystemRunner::default();
        let output = runner.output(&ShellCommand::by_str("echo netslice").unwrap()).await.unwrap();

        assert!(output.is_success());
        assert_eq!(output.stdout.trim(), "netslice");
    }

    #[tokio::test]
    async fn system_runner_reports_non_zero() {
        let runner = SystemRunner::default();
        let output = runner.output(&ShellCommand::new("false")).await.unwrap();

        assert!(!output.is_success());
        assert_eq!(output.code, Some(1));
    }

    #[tokio::test]
    async fn system_runner_times_out() {
        let runner = SystemRunner::default();
        let cmd = ShellCommand::new("sleep").arg("5").timeout(Duration::from_millis(100));

        let err = runner.output(&cmd).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn system_runner_missing_program_is_io_error() {
        let runner = SystemRunner::default();
        let cmd = ShellCommand::new("netslice-definitely-not-a-program").timeout(timeouts::QUICK);

        assert!(matches!(runner.output(&cmd).await, Err(Error::Io { .. })));
    }

    #[test]
    fn daemons_can_be_held_across_awaits() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}

        assert_send_sync::<Box<dyn Daemon>>();
        assert_send_sync::<Vec<Box<dyn Daemon>>>();
    }

    #[tokio::test]
    async fn system_daemon_stops() {
        let runner = SystemRunner::default();
        let mut daemon = runner.spawn(&ShellCommand::new("sleep").arg("30")).await.unwrap();

        assert!(daemon.is_alive());
        assert_eq!(daemon.program(), "sleep");

        daemon.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!daemon.is_alive());
    }

    #[tokio::test]
    async fn system_daemon_stop_is_bounded_when_sigterm_hangs() {
        let _ = tracing_subscriber::fmt::try_init();

        let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        // A `sudo kill` stuck on a password prompt never finishes within its bound.
        let mut daemon = SystemDaemon {
            program: "sleep".to_string(),
            child,
            sudo: false,
            term_timeout: Duration::ZERO,
        };

        let stopped = tokio::time::timeout(Duration::from_secs(5), daemon.stop(Duration::from_secs(30))).await;
        assert!(matches!(stopped, Ok(Ok(()))), "{stopped:?}");
        assert!(!daemon.is_alive());
    }
}
