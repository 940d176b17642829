use std::sync::Arc;

use crate::{
    CommandRunner, Daemon, Error, Output, Result, RunnerOptions, ShellCommand, SystemRunner,
};

/// A cheap, cloneable handle for running commands through a [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct Shell {
    runner: Arc<dyn CommandRunner>,
}

impl Shell {
    pub fn new<R: CommandRunner>(runner: R) -> Self {
        Self { runner: Arc::new(runner) }
    }

    /// A shell running commands on the local host.
    pub fn system(options: RunnerOptions) -> Self {
        Self::new(SystemRunner::new(options))
    }

    /// Runs the command and returns its output, whatever the exit status.
    pub async fn output(&self, cmd: ShellCommand) -> Result<Output> {
        self.runner.output(&cmd).await
    }

    /// Runs the command, failing with [`Error::NonZero`] on a non-zero exit status.
    pub async fn run(&self, cmd: ShellCommand) -> Result<Output> {
        let output = self.runner.output(&cmd).await?;
        if !output.is_success() {
            return Err(Error::NonZero { command: cmd.to_string(), output });
        }

        Ok(output)
    }

    /// Runs the command, treating a non-zero exit whose stderr matches any of `tolerated` as
    /// success. See [`tolerate`](crate::tolerate) for the common pattern sets.
    pub async fn run_tolerant(&self, cmd: ShellCommand, tolerated: &[&str]) -> Result<Output> {
        let output = self.runner.output(&cmd).await?;
        if output.is_success() {
            return Ok(output);
        }

        if output.stderr_matches(tolerated) {
            tracing::debug!(%cmd, stderr = %output.stderr.trim(), "tolerated command failure");
            return Ok(output);
        }

        Err(Error::NonZero { command: cmd.to_string(), output })
    }

    /// Runs the command and returns whether it exited successfully.
    pub async fn succeeds(&self, cmd: ShellCommand) -> Result<bool> {
        Ok(self.runner.output(&cmd).await?.is_success())
    }

    /// Starts the command as a long-running daemon.
    pub async fn spawn(&self, cmd: ShellCommand) -> Result<Box<dyn Daemon>> {
        self.runner.spawn(&cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::FakeHost, tolerate};

    #[tokio::test]
    async fn run_fails_on_non_zero() {
        let shell = Shell::new(FakeHost::new());

        let err = shell.run(ShellCommand::by_str("ip link show eth9").unwrap()).await.unwrap_err();
        assert!(err.stderr().unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn run_tolerant_accepts_matching_stderr() {
        let host = FakeHost::new();
        let shell = Shell::new(host.clone());

        let add = || ShellCommand::by_str("ip link add name br-test type bridge").unwrap();
        shell.run(add()).await.unwrap();

        assert!(shell.run(add()).await.is_err());
        shell.run_tolerant(add(), tolerate::ALREADY_EXISTS).await.unwrap();

        let err = shell
            .run_tolerant(ShellCommand::by_str("ip link set br-missing up").unwrap(), tolerate::ALREADY_EXISTS)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonZero { .. }));
    }

    #[tokio::test]
    async fn succeeds_reports_exit_status() {
        let host = FakeHost::new().with_missing_program("hostapd");
        let shell = Shell::new(host);

        assert!(shell.succeeds(ShellCommand::by_str("which dnsmasq").unwrap()).await.unwrap());
        assert!(!shell.succeeds(ShellCommand::by_str("which hostapd").unwrap()).await.unwrap());
    }
}
