use std::{fmt, net::Ipv4Addr, path::PathBuf};

use async_trait::async_trait;

use crate::{command, stats, ShapingClass};

/// Errors raised by a [`SchedulerBackend`] for a single operation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("`{command}` failed: {source}")]
    Command {
        command: String,
        #[source]
        source: command::Error,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] stats::ParseError),
    #[error("injected failure on {0}")]
    Injected(String),
}

/// The primitive operations the host packet scheduler must support.
///
/// Implementations install exactly what they are asked to; ordering, numbering and failure
/// recovery are the job of the [`RuleCompiler`](crate::RuleCompiler).
#[async_trait]
pub trait SchedulerBackend: fmt::Debug + Send + Sync + 'static {
    /// Removes every class, stage and rule from the interface. Finding nothing to remove is
    /// not an error.
    async fn reset_interface(&self) -> Result<(), BackendError>;

    /// Installs the root qdisc, the root class capped at `bandwidth_kbps` and the default class.
    async fn set_root_cap(&self, bandwidth_kbps: u64) -> Result<(), BackendError>;

    /// Adds a rate-limited class below the root class.
    async fn add_class(&self, class: &ShapingClass) -> Result<(), BackendError>;

    /// Attaches the delay/jitter/loss stage to an existing class.
    async fn add_emulation_stage(&self, class: &ShapingClass) -> Result<(), BackendError>;

    /// Steers packets destined to `destination` into the class.
    async fn add_steering_rule(
        &self,
        class: &ShapingClass,
        destination: Ipv4Addr,
    ) -> Result<(), BackendError>;

    /// Reads the current cumulative interface and class counters.
    async fn read_counters(&self) -> Result<stats::Counters, BackendError>;
}
