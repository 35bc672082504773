//! Error types shared by every stage of the collector.

use std::path::PathBuf;

/// Top-level error enum for the footprint library.
///
/// Variants map onto how far a failure is allowed to travel: per-feature
/// failures (`GeometryResolution`) and per-batch failures (`Persist`) are
/// absorbed by the worker loop, per-link failures (`BanSignal`,
/// `TransportFailure`) are retried, and `ConnectivityExhausted` /
/// `RetriesExhausted` end one worker's shard. `InvalidConfig` is only raised
/// before any worker is launched.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker {slot} could not reach the network after {rotations} identity rotations")]
    ConnectivityExhausted { slot: u16, rotations: u32 },

    #[error("worker {slot} issued a request before its identity was connected")]
    NotConnected { slot: u16 },

    #[error("ban signal from query service (HTTP {status})")]
    BanSignal { status: u16 },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("gave up on link after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<CollectError>,
    },

    #[error("could not resolve geometry for {kind} {id}: {reason}")]
    GeometryResolution {
        kind: &'static str,
        id: i64,
        reason: String,
    },

    #[error("failed to append to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control channel error: {0}")]
    ControlChannel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CollectError {
    /// Whether the fetch loop should rotate identity and try the link again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectError::BanSignal { .. } | CollectError::TransportFailure(_)
        )
    }
}

pub type CollectResult<T> = Result<T, CollectError>;
