//! batchrpc-exec: execution scopes that coalesce single-item calls into
//! batched backend calls.
//!
//! # Flow
//! ```text
//! ExecutionGroup::open() ─► ExecutionScope::call(req) ─► BatchAccumulator
//!                                                           │ key → PendingGroup
//!                     size / window / scope close ─────────►│
//!                                                           ▼
//!                                  Dispatcher ─► Transport::execute_batch
//!                                      │
//!                                      └─► split by item id ─► CompletionHandle
//! ```
//!
//! Calls with equal [`BatchKey`](batchrpc_core::BatchKey)s issued in one
//! scope share a backend call, at most `max_batch_size` items each. Every
//! handle is resolved exactly once, and [`ExecutionScope::close`] only
//! returns after all of them have settled.

mod accumulator;
mod client;
mod dispatcher;
mod group;
mod handle;
mod report;
mod scope;

pub use accumulator::{FlushMode, GroupOptions};
pub use client::ResourceClient;
pub use handle::CompletionHandle;
pub use report::{FlushSummary, ScopeError, ScopeFlushFailure, ScopeReport};
pub use scope::{ExecutionGroup, ExecutionScope};
