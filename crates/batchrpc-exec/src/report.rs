//! What a scope did on close, and the errors it raises.

use std::sync::Arc;

use thiserror::Error;

use batchrpc_core::error::TransportError;
use batchrpc_core::request::BatchKey;

/// Record of one backend call made on behalf of a scope.
#[derive(Debug, Clone)]
pub struct FlushSummary {
    pub key: BatchKey,
    /// Human-readable call name, e.g. `greetings batch_get(reqs: 1, ids: 3)`.
    pub name: String,
    /// Number of completion handles served by this call.
    pub items: usize,
    /// `false` for calls issued directly because batching was disabled.
    pub batched: bool,
    /// Set when the backend call itself failed.
    pub failure: Option<Arc<TransportError>>,
    /// The flush task died before reporting, so whether the backend was
    /// reached is unknown.
    pub lost: bool,
}

impl FlushSummary {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Every backend call made by a closed scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeReport {
    pub flushes: Vec<FlushSummary>,
}

impl ScopeReport {
    /// Number of transport invocations the scope made. Lost flushes are
    /// not counted.
    pub fn transport_calls(&self) -> usize {
        self.flushes.iter().filter(|f| !f.lost).count()
    }

    /// Returns `true` if a call with the given display name was made.
    pub fn has_call(&self, name: &str) -> bool {
        self.flushes.iter().any(|f| f.name == name)
    }

    /// Failed batched flushes. Unbatched calls fail on their own handle only.
    pub fn failed_groups(&self) -> impl Iterator<Item = &FlushSummary> {
        self.flushes.iter().filter(|f| f.batched && f.is_failure())
    }
}

/// Raised by scope close when one or more groups failed to flush.
///
/// Every completion handle has already been resolved when this is returned.
#[derive(Debug, Clone, Error)]
#[error("{} of {} batch flush(es) failed", .failures.len(), .report.flushes.len())]
pub struct ScopeFlushFailure {
    pub failures: Vec<FlushSummary>,
    pub report: ScopeReport,
}

impl ScopeFlushFailure {
    /// `Ok(report)` if no group failed, otherwise the aggregate failure.
    pub(crate) fn check(report: ScopeReport) -> Result<ScopeReport, Self> {
        let failures: Vec<FlushSummary> = report.failed_groups().cloned().collect();
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(Self { failures, report })
        }
    }
}

/// Error returned by a fallible scope body.
#[derive(Debug, Error)]
pub enum ScopeError<E> {
    /// The body returned an error. The scope was still flushed first; if
    /// that flush failed too, the failure is kept in `flush`.
    #[error("scope body failed: {error}")]
    Body {
        error: E,
        flush: Option<ScopeFlushFailure>,
    },

    #[error(transparent)]
    Flush(#[from] ScopeFlushFailure),
}

impl<E> ScopeError<E> {
    /// The body's error, if the body failed.
    pub fn body(&self) -> Option<&E> {
        match self {
            Self::Body { error, .. } => Some(error),
            Self::Flush(_) => None,
        }
    }

    /// The flush failure, whether or not the body also failed.
    pub fn flush_failure(&self) -> Option<&ScopeFlushFailure> {
        match self {
            Self::Body { flush, .. } => flush.as_ref(),
            Self::Flush(failure) => Some(failure),
        }
    }
}
