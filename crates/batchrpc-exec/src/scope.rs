//! Execution groups and the scopes they open.
//!
//! An [`ExecutionGroup`] holds the collaborators (transport, request builder,
//! batching config). Each scope it opens gets a fresh accumulator; calls
//! issued through the scope are coalesced until the scope closes.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use batchrpc_core::{BatchingConfig, Transport};
//! # use batchrpc_exec::{ExecutionGroup, ResourceClient};
//! # async fn demo(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = BatchingConfig::new()
//!     .add_batching_enabled("*.*/*.*", true)?
//!     .add_max_batch_size("*.*/*.*", 3)?;
//! let group = ExecutionGroup::new(transport.clone()).with_config(Arc::new(config));
//! let greetings = ResourceClient::new("greetings", transport);
//!
//! let handles = group
//!     .with_batching(|scope| async move {
//!         (1..=3)
//!             .map(|id| greetings.get::<serde_json::Value>(&scope, id))
//!             .collect::<Vec<_>>()
//!     })
//!     .await?;
//! for handle in handles {
//!     println!("{:?}", handle.await);
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use serde_json::Value;

use batchrpc_core::config::{BatchingConfig, BatchingConfigProvider, InboundOperation};
use batchrpc_core::request::SingleRequest;
use batchrpc_core::transport::{DefaultRequestBuilder, RequestBuilder, Transport};

use crate::accumulator::{BatchAccumulator, FlushMode, GroupOptions};
use crate::dispatcher::Dispatcher;
use crate::handle::CompletionHandle;
use crate::report::{ScopeError, ScopeFlushFailure, ScopeReport};

/// Factory for execution scopes sharing one set of collaborators.
#[derive(Clone)]
pub struct ExecutionGroup {
    transport: Arc<dyn Transport>,
    builder: Arc<dyn RequestBuilder>,
    config: Arc<dyn BatchingConfigProvider>,
    options: GroupOptions,
    runtime: Option<Handle>,
}

impl ExecutionGroup {
    /// A group over `transport` with batching disabled until a config is set.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            builder: Arc::new(DefaultRequestBuilder),
            config: Arc::new(BatchingConfig::new()),
            options: GroupOptions::default(),
            runtime: None,
        }
    }

    pub fn with_config(mut self, config: Arc<dyn BatchingConfigProvider>) -> Self {
        self.config = config;
        self
    }

    pub fn with_request_builder(mut self, builder: Arc<dyn RequestBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.options.flush_mode = mode;
        self
    }

    pub fn with_flush_window(mut self, window: Duration) -> Self {
        self.options.flush_window = Some(window);
        self
    }

    /// Spawn dispatch work on `runtime`. By default a scope uses the runtime
    /// it is opened on. With no runtime at open or call time, backend calls
    /// wait for [`close`](ExecutionScope::close).
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    /// Open a scope. The caller must [`close`](ExecutionScope::close) it.
    pub fn open(&self) -> ExecutionScope {
        self.open_scope(None)
    }

    /// Open a scope on behalf of an inbound request, so inbound-specific
    /// config patterns apply.
    pub fn open_with_inbound(&self, inbound: InboundOperation) -> ExecutionScope {
        self.open_scope(Some(inbound))
    }

    fn open_scope(&self, inbound: Option<InboundOperation>) -> ExecutionScope {
        let dispatcher = Dispatcher::new(self.transport.clone(), self.builder.clone());
        ExecutionScope {
            accumulator: BatchAccumulator::new(
                dispatcher,
                self.config.clone(),
                inbound,
                self.options.clone(),
                self.runtime.clone().or_else(|| Handle::try_current().ok()),
            ),
        }
    }

    /// Run `body` inside a fresh scope, then close it.
    ///
    /// The scope is closed, and every handle issued in it settled, before
    /// this returns. This also holds when `body` panics; the panic is
    /// resumed after the flush.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T, ScopeFlushFailure>
    where
        F: FnOnce(ExecutionScope) -> Fut,
        Fut: Future<Output = T>,
    {
        let (value, closed) = self.run_scope(body).await;
        closed.map(|_| value)
    }

    /// Alias of [`run`](Self::run).
    pub async fn with_batching<F, Fut, T>(&self, body: F) -> Result<T, ScopeFlushFailure>
    where
        F: FnOnce(ExecutionScope) -> Fut,
        Fut: Future<Output = T>,
    {
        self.run(body).await
    }

    /// Like [`run`](Self::run) for bodies that can fail. The scope is flushed
    /// before the body's error is returned. A body error takes precedence
    /// over a flush failure, which is then carried alongside it.
    pub async fn try_run<F, Fut, T, E>(&self, body: F) -> Result<T, ScopeError<E>>
    where
        F: FnOnce(ExecutionScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.run_scope(body).await {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(flush)) => Err(ScopeError::Flush(flush)),
            (Err(error), closed) => Err(ScopeError::Body {
                error,
                flush: closed.err(),
            }),
        }
    }

    /// Run `body` in a fresh scope and close it, returning both outcomes.
    async fn run_scope<F, Fut, T>(&self, body: F) -> (T, Result<ScopeReport, ScopeFlushFailure>)
    where
        F: FnOnce(ExecutionScope) -> Fut,
        Fut: Future<Output = T>,
    {
        let scope = self.open();
        let body_scope = scope.clone();
        let outcome = AssertUnwindSafe(async move { body(body_scope).await })
            .catch_unwind()
            .await;
        let closed = scope.close().await;

        match outcome {
            Ok(value) => (value, closed),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Window during which calls are coalesced.
///
/// Cheap to clone; every clone feeds the same accumulator. Calls made after
/// the scope closed resolve with [`CallError::ScopeClosed`](batchrpc_core::CallError::ScopeClosed).
#[derive(Clone)]
pub struct ExecutionScope {
    accumulator: BatchAccumulator,
}

impl ExecutionScope {
    /// Issue one call. Never blocks; the handle resolves after a flush.
    ///
    /// Safe to call from any thread, including ones outside the runtime
    /// the scope was opened on.
    pub fn call(&self, req: SingleRequest) -> CompletionHandle<Value> {
        self.accumulator.enqueue(req)
    }

    pub fn is_closed(&self) -> bool {
        self.accumulator.is_closed()
    }

    /// Flush every outstanding group and wait for all handles to settle.
    ///
    /// Returns [`ScopeFlushFailure`] if any batched flush failed; the
    /// affected handles have been resolved with the failure by then.
    pub async fn close(self) -> Result<ScopeReport, ScopeFlushFailure> {
        let flushes = self.accumulator.close().await;
        let report = ScopeReport { flushes };
        for failed in report.failed_groups() {
            tracing::warn!(call = %failed.name, items = failed.items, "group failed to flush");
        }
        ScopeFlushFailure::check(report)
    }
}

impl std::fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("closed", &self.is_closed())
            .finish()
    }
}
