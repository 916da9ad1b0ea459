//! Periodic metrics record consumed by the dashboard.

use std::{io, path::PathBuf};

use manet_model::NodeId;
use serde::Serialize;
use tracing::trace;

use crate::telemetry::{unix_timestamp, NodeReport};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Record<'a> {
    timestamp: f64,
    #[serde(flatten)]
    report: &'a NodeReport,
}

/// Writes `drone<id>.json` into a shared directory. Readers never observe a partial file.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    dir: PathBuf,
    path: PathBuf,
    staging: PathBuf,
}

impl MetricsSink {
    pub fn new(dir: impl Into<PathBuf>, id: NodeId) -> Self {
        let dir = dir.into();
        Self {
            path: dir.join(format!("drone{id}.json")),
            staging: dir.join(format!(".drone{id}.json.tmp")),
            dir,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Replaces the record with `report`.
    pub async fn write(&self, report: &NodeReport) -> Result<(), MetricsError> {
        let record = Record { timestamp: unix_timestamp(), report };
        let bytes = serde_json::to_vec(&record)?;

        let io_err = |path: &PathBuf| {
            let path = path.clone();
            move |source| MetricsError::Io { path, source }
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err(&self.dir))?;
        tokio::fs::write(&self.staging, &bytes).await.map_err(io_err(&self.staging))?;
        tokio::fs::rename(&self.staging, &self.path).await.map_err(io_err(&self.path))?;

        trace!(path = %self.path.display(), bytes = bytes.len(), "metrics written");
        Ok(())
    }
}
