//! Error types shared by the reducers and the harvest loop.

use thiserror::Error;

/// Failures that can stop a harvest run.
///
/// Per-stack resolution failures never show up here; the resolver degrades
/// them to an empty trace instead.
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("target process {pid} is not alive: {reason}")]
    TargetNotAlive { pid: u32, reason: String },

    #[error("failed to access probe table `{table}`: {source}")]
    TableAccess {
        table: &'static str,
        #[source]
        source: libbpf_rs::Error,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    pub(crate) fn table(table: &'static str, source: libbpf_rs::Error) -> Self {
        HarvestError::TableAccess { table, source }
    }
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
