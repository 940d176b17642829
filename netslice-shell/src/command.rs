//! Shell commands and their results.

use std::{fmt, io, process, time::Duration};

/// Timeouts for the different families of commands.
pub mod timeouts {
    use std::time::Duration;

    /// Availability checks such as `which` or `iw dev <if> info`.
    pub const QUICK: Duration = Duration::from_secs(2);
    /// Link, address, scheduler and firewall changes.
    pub const DEFAULT: Duration = Duration::from_secs(5);
    /// Container runtime network operations.
    pub const DOCKER: Duration = Duration::from_secs(20);
    /// Starting containers, which may pull images.
    pub const CONTAINER_RUN: Duration = Duration::from_secs(30);
}

/// Substrings of stderr that make a failed command count as an idempotent success.
pub mod tolerate {
    /// The resource to create is already there.
    pub const ALREADY_EXISTS: &[&str] = &["File exists", "already exists", "already in use"];

    /// The resource to remove is already gone.
    pub const NOT_FOUND: &[&str] = &[
        "Cannot find device",
        "No such file or directory",
        "does not exist",
        "No such network",
        "No such container",
        "not found",
        "Cannot delete qdisc with handle of zero",
        "Bad rule",
    ];
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {:?}: {}", output.code, output.stderr.trim())]
    NonZero { command: String, output: Output },
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
}

impl Error {
    /// Returns the stderr of a command that exited with a non-zero status.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::NonZero { output, .. } => Some(&output.stderr),
            _ => None,
        }
    }

    /// Returns `true` if the command was killed because it ran past its timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// The exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// A successful output with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self { code: Some(0), stdout: stdout.into(), stderr: String::new() }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self { code: Some(code), stdout: String::new(), stderr: stderr.into() }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns `true` if stderr contains any of the given patterns.
    pub fn stderr_matches(&self, patterns: &[&str]) -> bool {
        patterns.iter().any(|p| self.stderr.contains(p))
    }
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            code: value.status.code(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// A command to run, with the timeout it must complete within.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ShellCommand {
    /// Creates a command for `program` with the default timeout.
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), timeout: timeouts::DEFAULT }
    }

    /// Parses the command provided as a string, separating args with whitespaces.
    pub fn by_str(cmd: &str) -> Result<Self> {
        let mut iter = cmd.split_ascii_whitespace();
        let program = iter.next().ok_or(Error::Empty)?;
        Ok(Self::new(program).args(iter))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the timeout of the command.
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub const fn get_timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
