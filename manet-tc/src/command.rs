//! Utilities for running host commands with [`tokio::process::Command`].
//!
//! Every command runs with a bounded timeout; a command that outlives it is killed.

use std::{
    ffi::OsStr,
    io,
    process::{self, Stdio},
    time::Duration,
};

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("non-zero exit status ({}): {}", .0.status, .0.stderr.trim())]
    NonZero(Output),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// The captured standard error of a failed command, if it ran at all.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::NonZero(output) => Some(&output.stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runs host commands, each bounded by `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct Runner {
    timeout: Duration,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

impl Runner {
    /// Upper bound for a single scheduler invocation.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the command provided as strings, separating args with whitespaces.
    pub async fn by_str(&self, cmd: &str) -> Result<Output> {
        let mut iter = cmd.split_ascii_whitespace();
        let program = iter.next().ok_or(Error::Empty)?;
        self.run(program, iter).await
    }

    /// Runs `program` with `args`, failing on a non-zero exit status.
    pub async fn run<I, S>(&self, program: &str, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(?cmd, "running command");

        let child = cmd.spawn()?;
        let output: Output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??
            .into();

        if !output.status.success() {
            tracing::debug!(?output.stderr, ?output.status, ?cmd, "command returned non-zero status");
            return Err(Error::NonZero(output));
        }

        Ok(output)
    }
}
