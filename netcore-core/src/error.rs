//! Error type shared by the connector and both channels.

use std::time::Duration;

use crate::wire::FrameEncodeError;

/// Everything the bus can report to the application.
///
/// Transient I/O faults on an established link are recovered internally and never show up
/// here; only construction faults and per-call outcomes do.
#[derive(Debug, thiserror::Error)]
pub enum NetCoreError {
    #[error("invalid link spec: {0}")]
    InvalidSpec(String),
    /// Could not acquire the initial socket or port. Fatal to startup.
    #[error("failed to open {channel} channel on {target}: {source}")]
    Construction {
        channel: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("synced call is missing a correlation id")]
    MissingCorrelationId,
    #[error("reliable link is not connected")]
    NotConnected,
    #[error("synced call timed out after {0:?}")]
    Timeout(Duration),
    #[error("link lost before a response arrived")]
    LinkLost,
    #[error("return value already set")]
    ReturnValueAlreadySet,
    #[error("message is not a synced request")]
    NotSyncedRequest,
    #[error("value codec error: {0}")]
    Value(#[from] bincode::Error),
    #[error("frame encode error: {0}")]
    Frame(#[from] FrameEncodeError),
}

impl NetCoreError {
    /// True for the two outcomes a synced caller may want to retry on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetCoreError::Timeout(_) | NetCoreError::LinkLost | NetCoreError::NotConnected
        )
    }
}
