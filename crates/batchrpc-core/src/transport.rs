//! Collaborator traits: the transport that executes calls and the builder
//! that turns a group of single-item requests into one batch request.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{BatchKey, BatchRequest, BatchResponse, ItemId, SingleRequest};

/// The backend that actually executes calls.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Execute one batched call covering every id in `req`.
    async fn execute_batch(&self, req: BatchRequest) -> Result<BatchResponse, TransportError>;

    /// Execute an unbatched single-item call.
    async fn execute_single(&self, req: SingleRequest) -> Result<Value, TransportError>;

    /// Return the transport's identifier (base URL or name).
    fn name(&self) -> &str;
}

/// Builds the batched backend request for a group of item ids.
pub trait RequestBuilder: Send + Sync + 'static {
    fn build_batch_request(&self, key: &BatchKey, params: &Value, ids: &[ItemId]) -> BatchRequest;
}

/// Names the batch method `batch_<method>` and forwards params unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRequestBuilder;

impl RequestBuilder for DefaultRequestBuilder {
    fn build_batch_request(&self, key: &BatchKey, params: &Value, ids: &[ItemId]) -> BatchRequest {
        BatchRequest {
            key: key.clone(),
            batch_method: format!("batch_{}", key.method()),
            ids: ids.to_vec(),
            params: params.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_builder_keeps_order_and_duplicates() {
        let key = BatchKey::new("greetings", "get");
        let ids: Vec<ItemId> = vec![3.into(), 1.into(), 3.into()];
        let req = DefaultRequestBuilder.build_batch_request(&key, &Value::Null, &ids);
        assert_eq!(req.batch_method, "batch_get");
        assert_eq!(req.ids, ids);
        assert_eq!(req.key, key);
    }
}
