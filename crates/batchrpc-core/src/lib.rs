//! batchrpc-core: foundation traits and types for BatchRPC.
//!
//! # Overview
//!
//! BatchRPC coalesces independent single-item calls issued inside an
//! execution scope into batched backend calls. The core crate defines:
//!
//! - [`BatchKey`]: identity of requests that may be merged
//! - [`SingleRequest`] / [`BatchRequest`] / [`BatchResponse`]: request and response shapes
//! - [`Transport`] / [`RequestBuilder`]: collaborator traits
//! - [`BatchingConfig`]: pattern-based batching policy
//! - [`TransportError`] / [`CallError`]: structured error types

pub mod config;
pub mod error;
pub mod request;
pub mod transport;

pub use config::{
    BatchingConfig, BatchingConfigProvider, BatchingPolicy, InboundOperation, OperationTarget,
    DEFAULT_MAX_BATCH_SIZE,
};
pub use error::{CallError, ConfigError, TransportError};
pub use request::{BatchKey, BatchRequest, BatchResponse, ItemError, ItemId, SingleRequest};
pub use transport::{DefaultRequestBuilder, RequestBuilder, Transport};
