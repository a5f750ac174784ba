//! Fluent per-resource client.
//!
//! Calls made with a scope go through that scope's accumulator and may be
//! batched; [`ResourceClient::fetch`] bypasses batching and hits the
//! transport directly.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use batchrpc_core::error::CallError;
use batchrpc_core::request::{ItemId, SingleRequest};
use batchrpc_core::transport::Transport;

use crate::handle::CompletionHandle;
use crate::scope::ExecutionScope;

/// Client for one resource (e.g. `greetings`).
#[derive(Clone)]
pub struct ResourceClient {
    resource: String,
    transport: Arc<dyn Transport>,
}

impl ResourceClient {
    pub fn new(resource: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            resource: resource.into(),
            transport,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// `get` one entity inside `scope`.
    pub fn get<T: DeserializeOwned>(
        &self,
        scope: &ExecutionScope,
        id: impl Into<ItemId>,
    ) -> CompletionHandle<T> {
        self.call(scope, "get", id, Value::Null)
    }

    /// `get` with batch-compatible parameters such as a field projection.
    /// Only calls with equal parameters share a batch.
    pub fn get_with<T: DeserializeOwned>(
        &self,
        scope: &ExecutionScope,
        id: impl Into<ItemId>,
        params: Value,
    ) -> CompletionHandle<T> {
        self.call(scope, "get", id, params)
    }

    /// Issue any single-item method inside `scope`.
    pub fn call<T: DeserializeOwned>(
        &self,
        scope: &ExecutionScope,
        method: &str,
        id: impl Into<ItemId>,
        params: Value,
    ) -> CompletionHandle<T> {
        let req = SingleRequest::with_params(self.resource.as_str(), method, id, params);
        scope.call(req).typed()
    }

    /// Fetch one entity immediately, outside any scope.
    pub async fn fetch<T: DeserializeOwned>(&self, id: impl Into<ItemId>) -> Result<T, CallError> {
        let req = SingleRequest::new(self.resource.as_str(), "get", id);
        let id = req.id.clone();
        let value = self.transport.execute_single(req).await.map_err(|e| {
            if e.is_not_found() {
                CallError::ItemNotFound {
                    resource: self.resource.clone(),
                    id: id.clone(),
                }
            } else {
                CallError::SingleCall {
                    resource: self.resource.clone(),
                    id: id.clone(),
                    source: Arc::new(e),
                }
            }
        })?;
        serde_json::from_value(value).map_err(|e| CallError::Deserialization(e.to_string()))
    }
}

impl std::fmt::Debug for ResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClient")
            .field("resource", &self.resource)
            .field("transport", &self.transport.name())
            .finish()
    }
}
