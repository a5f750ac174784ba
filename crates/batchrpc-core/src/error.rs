//! Error types for transports, individual calls, scopes and configuration.

use std::sync::Arc;

use thiserror::Error;

use crate::request::ItemId;

/// Errors that can occur while a transport executes a request.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, reset, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Backend answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if the backend reported the target as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// Failure delivered to one completion handle.
///
/// Cloneable so a batch-wide failure can be handed to every handle of the
/// group; the underlying transport error is shared.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The batch succeeded but did not contain this item.
    #[error("{resource}/{id} not found")]
    ItemNotFound { resource: String, id: ItemId },

    /// The batch succeeded but the backend reported an error for this item.
    #[error("{resource}/{id} failed with status {status}: {message}")]
    ItemFailed {
        resource: String,
        id: ItemId,
        status: u16,
        message: String,
    },

    /// The batched call itself failed; every item of the group gets this.
    #[error("batch call {batch} failed: {source}")]
    BatchTransport {
        batch: String,
        #[source]
        source: Arc<TransportError>,
    },

    /// An unbatched single-item call failed.
    #[error("call to {resource}/{id} failed: {source}")]
    SingleCall {
        resource: String,
        id: ItemId,
        #[source]
        source: Arc<TransportError>,
    },

    /// The caller stopped waiting after the handle's timeout.
    #[error("call timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The item's value could not be converted into the requested type.
    #[error("could not decode response: {0}")]
    Deserialization(String),

    /// The call was issued on a scope that had already been closed.
    #[error("execution scope already closed")]
    ScopeClosed,

    /// The dispatcher went away without resolving the handle.
    #[error("call abandoned before completion")]
    Abandoned,
}

impl CallError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ItemNotFound { .. })
    }

    /// Returns `true` if the backend was never reached or answered with a
    /// transport-level failure, as opposed to an item-level one.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::BatchTransport { .. } | Self::SingleCall { .. })
    }
}

/// Errors raised while building a [`BatchingConfig`](crate::config::BatchingConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid operation pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("max batch size for '{pattern}' must be at least 1")]
    InvalidMaxBatchSize { pattern: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}
