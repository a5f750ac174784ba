//! Turns a sealed group into one backend call and splits the outcome back
//! onto each item's completion handle.
//!
//! Every responder handed to the dispatcher is resolved exactly once:
//!
//! - batch success: per item, its value, its backend error, or `ItemNotFound`
//! - batch failure: the same transport error for every item in the group
//!
//! Groups with a single item skip batch overhead and go through
//! [`Transport::execute_single`].

use std::sync::Arc;

use tracing::Instrument;

use batchrpc_core::error::{CallError, TransportError};
use batchrpc_core::request::{BatchKey, BatchResponse, ItemError, ItemId, SingleRequest};
use batchrpc_core::transport::{RequestBuilder, Transport};

use crate::group::PendingGroup;
use crate::handle::{CallResult, Responder};
use crate::report::FlushSummary;

#[derive(Clone)]
pub(crate) struct Dispatcher {
    transport: Arc<dyn Transport>,
    builder: Arc<dyn RequestBuilder>,
}

impl Dispatcher {
    pub(crate) fn new(transport: Arc<dyn Transport>, builder: Arc<dyn RequestBuilder>) -> Self {
        Self { transport, builder }
    }

    /// Flush one sealed group.
    pub(crate) async fn flush(&self, group: PendingGroup) -> FlushSummary {
        let (key, params, mut items) = group.into_parts();

        if items.len() == 1 {
            if let Some((id, responder)) = items.pop() {
                let req = SingleRequest { key, id, params };
                return self.single(req, responder, true).await;
            }
        }

        let ids: Vec<ItemId> = items.iter().map(|(id, _)| id.clone()).collect();
        let req = self.builder.build_batch_request(&key, &params, &ids);
        let name = format!(
            "{} {}(reqs: {}, ids: {})",
            key.resource(),
            req.batch_method,
            req.distinct_ids(),
            req.ids.len()
        );
        let span = tracing::debug_span!("flush", call = %name, transport = %self.transport.name());

        async move {
            tracing::debug!(items = items.len(), "sending batch");
            let total = items.len();
            match self.transport.execute_batch(req).await {
                Ok(response) => {
                    for (id, responder) in items {
                        responder.resolve(split(&key, &response, id));
                    }
                    tracing::debug!("batch settled");
                    FlushSummary {
                        key,
                        name,
                        items: total,
                        batched: true,
                        failure: None,
                        lost: false,
                    }
                }
                Err(e) => {
                    let source = Arc::new(e);
                    tracing::warn!(error = %source, "batch call failed, failing every item");
                    for (_, responder) in items {
                        responder.resolve(Err(CallError::BatchTransport {
                            batch: name.clone(),
                            source: source.clone(),
                        }));
                    }
                    FlushSummary {
                        key,
                        name,
                        items: total,
                        batched: true,
                        failure: Some(source),
                        lost: false,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Issue a call that was never accumulated because batching is disabled.
    pub(crate) async fn unbatched(&self, req: SingleRequest, responder: Responder) -> FlushSummary {
        self.single(req, responder, false).await
    }

    async fn single(&self, req: SingleRequest, responder: Responder, batched: bool) -> FlushSummary {
        let key = req.key.clone();
        let id = req.id.clone();
        let name = format!("{} {}({})", key.resource(), key.method(), id);
        tracing::debug!(call = %name, batched, "sending single call");

        let (result, failure): (CallResult, _) = match self.transport.execute_single(req).await {
            Ok(value) => (Ok(value), None),
            Err(e) if e.is_not_found() => (Err(not_found(&key, id)), None),
            Err(e) => {
                let source = Arc::new(e);
                tracing::warn!(call = %name, error = %source, "single call failed");
                let err = if batched {
                    CallError::BatchTransport {
                        batch: name.clone(),
                        source: source.clone(),
                    }
                } else {
                    CallError::SingleCall {
                        resource: key.resource().to_string(),
                        id,
                        source: source.clone(),
                    }
                };
                (Err(err), Some(source))
            }
        };
        responder.resolve(result);

        FlushSummary {
            key,
            name,
            items: 1,
            batched,
            failure,
            lost: false,
        }
    }
}

/// Pick one item's outcome out of a successful batch response.
fn split(key: &BatchKey, response: &BatchResponse, id: ItemId) -> CallResult {
    if let Some(value) = response.results.get(&id) {
        return Ok(value.clone());
    }
    match response.errors.get(&id) {
        Some(err) => Err(item_error(key, id, err)),
        None => Err(not_found(key, id)),
    }
}

fn item_error(key: &BatchKey, id: ItemId, err: &ItemError) -> CallError {
    if err.is_not_found() {
        return not_found(key, id);
    }
    CallError::ItemFailed {
        resource: key.resource().to_string(),
        id,
        status: err.status,
        message: err.message.clone(),
    }
}

fn not_found(key: &BatchKey, id: ItemId) -> CallError {
    CallError::ItemNotFound {
        resource: key.resource().to_string(),
        id,
    }
}

/// Build the summary for a flush task that died before reporting.
pub(crate) fn lost_flush(key: BatchKey, err: impl std::fmt::Display) -> FlushSummary {
    FlushSummary {
        name: format!("{} {}(lost)", key.resource(), key.method()),
        key,
        items: 0,
        batched: true,
        failure: Some(Arc::new(TransportError::Other(format!(
            "flush task failed: {err}"
        )))),
        lost: true,
    }
}
