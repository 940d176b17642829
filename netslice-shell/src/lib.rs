//! Running OS-level configuration commands with bounded timeouts.
//!
//! Every command is a [`ShellCommand`]: a program, its arguments and a timeout. Commands are
//! executed by a [`CommandRunner`], which is [`SystemRunner`] in production. Higher layers talk
//! to a cheap, cloneable [`Shell`] handle that adds the success/failure policies the rest of the
//! workspace relies on (strict, tolerant of "already exists"/"not found", or plain exit-status
//! checks).

mod command;
pub use command::{timeouts, tolerate, Error, Output, Result, ShellCommand};

mod runner;
pub use runner::{CommandRunner, Daemon, RunnerOptions, SystemRunner};

mod shell;
pub use shell::Shell;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
