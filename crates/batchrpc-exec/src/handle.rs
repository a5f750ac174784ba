//! Per-call completion handles.
//!
//! A handle is created with pending status when a call is issued and is
//! resolved exactly once by the dispatcher through its [`Responder`]. The
//! caller only ever reads it.

use std::future::IntoFuture;
use std::marker::PhantomData;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use batchrpc_core::error::CallError;

pub(crate) type CallResult = Result<Value, CallError>;

/// Write side of a completion handle. Owned by the dispatcher.
pub(crate) struct Responder {
    tx: oneshot::Sender<CallResult>,
}

impl Responder {
    /// Resolve the handle. A caller that already gave up (dropped or timed
    /// out) simply never observes the value.
    pub(crate) fn resolve(self, result: CallResult) {
        let _ = self.tx.send(result);
    }
}

/// Create a pending handle and the responder that resolves it.
pub(crate) fn channel(timeout: Option<Duration>) -> (Responder, CompletionHandle<Value>) {
    let (tx, rx) = oneshot::channel();
    (
        Responder { tx },
        CompletionHandle {
            rx,
            timeout,
            _marker: PhantomData,
        },
    )
}

/// The caller's view of one issued call.
///
/// Await it directly (`handle.await`) or through [`wait`](Self::wait) /
/// [`wait_timeout`](Self::wait_timeout). A timeout fails only this handle;
/// the batched backend call it belongs to keeps running.
#[must_use = "a completion handle does nothing unless awaited"]
pub struct CompletionHandle<T = Value> {
    rx: oneshot::Receiver<CallResult>,
    timeout: Option<Duration>,
    _marker: PhantomData<fn() -> T>,
}

impl CompletionHandle<Value> {
    /// A handle that is already settled with `result`.
    pub(crate) fn resolved(result: CallResult) -> Self {
        let (responder, handle) = channel(None);
        responder.resolve(result);
        handle
    }

    /// Reinterpret the handle's value as `T` when it resolves.
    pub fn typed<T: DeserializeOwned>(self) -> CompletionHandle<T> {
        CompletionHandle {
            rx: self.rx,
            timeout: self.timeout,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> CompletionHandle<T> {
    /// Override the timeout applied by [`wait`](Self::wait).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Wait for the call to settle, honouring the handle's timeout if any.
    pub async fn wait(self) -> Result<T, CallError> {
        match self.timeout {
            Some(timeout) => self.wait_timeout(timeout).await,
            None => settle(self.rx.await),
        }
    }

    /// Wait at most `timeout` for the call to settle.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T, CallError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(received) => settle(received),
            Err(_) => Err(CallError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn settle<T: DeserializeOwned>(
    received: Result<CallResult, oneshot::error::RecvError>,
) -> Result<T, CallError> {
    let value = received.map_err(|_| CallError::Abandoned)??;
    serde_json::from_value(value).map_err(|e| CallError::Deserialization(e.to_string()))
}

impl<T: DeserializeOwned + Send + 'static> IntoFuture for CompletionHandle<T> {
    type Output = Result<T, CallError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<T> std::fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("timeout", &self.timeout)
            .finish()
    }
}
