//! Per-scope accumulator that routes single-item calls into pending groups.
//!
//! All state sits behind one mutex with short critical sections; nothing is
//! awaited while it is held. A group leaves the map (sealed by size, expired
//! by the flush window, or drained on close) under the lock, so no group can
//! be dispatched twice.
//!
//! Dispatch tasks are spawned on the runtime captured when the scope was
//! opened, so calls may be issued from threads outside that runtime. A
//! scope opened with no runtime at all parks its work until `close()`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};

use batchrpc_core::config::{BatchingConfigProvider, BatchingPolicy, InboundOperation, OperationTarget};
use batchrpc_core::error::CallError;
use batchrpc_core::request::{BatchKey, SingleRequest};

use crate::dispatcher::{self, Dispatcher};
use crate::group::PendingGroup;
use crate::handle::{self, CompletionHandle, Responder};
use crate::report::FlushSummary;

/// When a group that reached its max batch size is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Dispatch the full group immediately and start a new one.
    #[default]
    Eager,
    /// Park full groups and dispatch everything when the scope closes.
    OnClose,
}

/// Accumulator settings shared by every scope of an execution group.
#[derive(Debug, Clone, Default)]
pub struct GroupOptions {
    pub flush_mode: FlushMode,
    /// Dispatch a group this long after its first call, even if the scope
    /// is still open. `None` waits for size or close.
    pub flush_window: Option<Duration>,
}

struct InFlight {
    key: BatchKey,
    task: JoinHandle<FlushSummary>,
}

#[derive(Default)]
struct State {
    open: HashMap<BatchKey, PendingGroup>,
    sealed: Vec<PendingGroup>,
    /// Unbatched calls issued while no runtime was reachable.
    deferred: Vec<(SingleRequest, Responder)>,
    policies: HashMap<BatchKey, BatchingPolicy>,
    in_flight: Vec<InFlight>,
    timers: Vec<AbortHandle>,
    next_generation: u64,
    calls: usize,
    closed: bool,
}

struct Inner {
    dispatcher: Dispatcher,
    config: Arc<dyn BatchingConfigProvider>,
    inbound: Option<InboundOperation>,
    options: GroupOptions,
    runtime: Option<Handle>,
    state: Mutex<State>,
}

#[derive(Clone)]
pub(crate) struct BatchAccumulator {
    inner: Arc<Inner>,
}

impl BatchAccumulator {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        config: Arc<dyn BatchingConfigProvider>,
        inbound: Option<InboundOperation>,
        options: GroupOptions,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                config,
                inbound,
                options,
                runtime,
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runtime to spawn dispatch work on: the one captured at open, else
    /// the caller's.
    fn runtime(&self) -> Option<Handle> {
        self.inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    /// Route one call. Returns its handle before any backend activity.
    pub(crate) fn enqueue(&self, req: SingleRequest) -> CompletionHandle {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return CompletionHandle::resolved(Err(CallError::ScopeClosed));
        }
        state.calls += 1;

        let policy = self.policy_for(state, &req.key);
        let (responder, handle) = handle::channel(policy.timeout);

        if !policy.enabled {
            match self.runtime() {
                Some(runtime) => {
                    let key = req.key.clone();
                    let dispatcher = self.inner.dispatcher.clone();
                    let task = runtime.spawn(async move { dispatcher.unbatched(req, responder).await });
                    state.in_flight.push(InFlight { key, task });
                }
                None => {
                    tracing::debug!(key = %req.key, "no runtime, call deferred until close");
                    state.deferred.push((req, responder));
                }
            }
            return handle;
        }

        let SingleRequest { key, id, params } = req;
        let mut armed = None;
        let group = match state.open.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let generation = state.next_generation;
                state.next_generation += 1;
                armed = Some((entry.key().clone(), generation));
                let key = entry.key().clone();
                entry.insert(PendingGroup::new(key, params, policy.max_batch_size, generation))
            }
        };
        let sealed_key = group.push(id, responder).then(|| group.key().clone());

        if let (Some((key, generation)), Some(window)) = (armed, self.inner.options.flush_window) {
            if sealed_key.is_none() {
                self.arm_timer(state, key, generation, window);
            }
        }

        if let Some(key) = sealed_key {
            if let Some(group) = state.open.remove(&key) {
                self.seal(state, group);
            }
        }

        handle
    }

    /// Resolve and cache the policy for `key`; config is consulted once per
    /// key per scope.
    fn policy_for(&self, state: &mut State, key: &BatchKey) -> BatchingPolicy {
        if let Some(policy) = state.policies.get(key) {
            return *policy;
        }
        let target = OperationTarget::for_key(key, self.inner.inbound.as_ref());
        let policy = self.inner.config.policy(&target);
        tracing::debug!(
            key = %key,
            enabled = policy.enabled,
            max_batch_size = policy.max_batch_size,
            "resolved batching policy"
        );
        state.policies.insert(key.clone(), policy);
        policy
    }

    fn seal(&self, state: &mut State, group: PendingGroup) {
        match self.inner.options.flush_mode {
            FlushMode::Eager => {
                tracing::debug!(key = %group.key(), items = group.len(), "group full, flushing");
                self.spawn_flush(state, group);
            }
            FlushMode::OnClose => {
                tracing::debug!(key = %group.key(), items = group.len(), "group full, parked until close");
                state.sealed.push(group);
            }
        }
    }

    fn spawn_flush(&self, state: &mut State, group: PendingGroup) {
        let Some(runtime) = self.runtime() else {
            tracing::debug!(key = %group.key(), "no runtime, group parked until close");
            state.sealed.push(group);
            return;
        };
        let key = group.key().clone();
        let dispatcher = self.inner.dispatcher.clone();
        let task = runtime.spawn(async move { dispatcher.flush(group).await });
        state.in_flight.push(InFlight { key, task });
    }

    fn arm_timer(&self, state: &mut State, key: BatchKey, generation: u64, window: Duration) {
        let Some(runtime) = self.runtime() else {
            tracing::debug!(key = %key, "no runtime, flush window not armed");
            return;
        };
        let this = self.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(window).await;
            this.expire(&key, generation);
        });
        state.timers.push(timer.abort_handle());
    }

    /// Flush window elapsed for the group opened with `generation`.
    fn expire(&self, key: &BatchKey, generation: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        let current = state
            .open
            .get(key)
            .is_some_and(|g| g.generation() == generation);
        if !current {
            return;
        }
        if let Some(group) = state.open.remove(key) {
            tracing::debug!(key = %key, items = group.len(), "flush window elapsed");
            self.spawn_flush(state, group);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Flush every outstanding group and wait until every handle issued
    /// through this accumulator has settled. Idempotent.
    pub(crate) async fn close(&self) -> Vec<FlushSummary> {
        let (mut groups, deferred, timers, calls) = {
            let mut state = self.lock();
            if state.closed {
                return Vec::new();
            }
            state.closed = true;
            let mut groups: Vec<PendingGroup> = state.sealed.drain(..).collect();
            groups.extend(state.open.drain().map(|(_, g)| g));
            (
                groups,
                std::mem::take(&mut state.deferred),
                std::mem::take(&mut state.timers),
                state.calls,
            )
        };
        for timer in timers {
            timer.abort();
        }
        if calls == 0 {
            return Vec::new();
        }

        groups.sort_by_key(|g| g.generation());
        tracing::debug!(groups = groups.len(), deferred = deferred.len(), calls, "closing scope");

        let dispatcher = &self.inner.dispatcher;
        let flushes = groups
            .into_iter()
            .map(|g| dispatcher.flush(g).boxed())
            .chain(
                deferred
                    .into_iter()
                    .map(|(req, responder)| dispatcher.unbatched(req, responder).boxed()),
            );
        let mut summaries = future::join_all(flushes.collect::<Vec<BoxFuture<'_, FlushSummary>>>()).await;

        loop {
            let pending = std::mem::take(&mut self.lock().in_flight);
            if pending.is_empty() {
                break;
            }
            let (keys, tasks): (Vec<_>, Vec<_>) =
                pending.into_iter().map(|f| (f.key, f.task)).unzip();
            for (key, joined) in keys.into_iter().zip(future::join_all(tasks).await) {
                match joined {
                    Ok(summary) => summaries.push(summary),
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "flush task did not complete");
                        summaries.push(dispatcher::lost_flush(key, e));
                    }
                }
            }
        }

        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use batchrpc_core::config::BatchingConfig;
    use batchrpc_core::error::TransportError;
    use batchrpc_core::request::{BatchRequest, BatchResponse, ItemId};
    use batchrpc_core::transport::{DefaultRequestBuilder, Transport};
    use serde_json::{json, Value};

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<ItemId>>>,
        singles: Mutex<Vec<ItemId>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn execute_batch(&self, req: BatchRequest) -> Result<BatchResponse, TransportError> {
            self.batches.lock().unwrap().push(req.ids.clone());
            Ok(req
                .ids
                .iter()
                .fold(BatchResponse::default(), |r, id| r.with_result(id.clone(), json!(id))))
        }

        async fn execute_single(&self, req: SingleRequest) -> Result<Value, TransportError> {
            self.singles.lock().unwrap().push(req.id.clone());
            Ok(json!(req.id))
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn accumulator(
        transport: Arc<Recorder>,
        config: BatchingConfig,
        options: GroupOptions,
    ) -> BatchAccumulator {
        BatchAccumulator::new(
            Dispatcher::new(transport, Arc::new(DefaultRequestBuilder)),
            Arc::new(config),
            None,
            options,
            None,
        )
    }

    fn enabled(max: usize) -> BatchingConfig {
        BatchingConfig::new()
            .add_batching_enabled("*.*/*.*", true)
            .unwrap()
            .add_max_batch_size("*.*/*.*", max)
            .unwrap()
    }

    fn get(id: i64) -> SingleRequest {
        SingleRequest::new("greetings", "get", id)
    }

    #[tokio::test]
    async fn eager_flush_starts_new_group() {
        let transport = Arc::new(Recorder::default());
        let acc = accumulator(transport.clone(), enabled(2), GroupOptions::default());

        let handles: Vec<_> = (1..=5).map(|id| acc.enqueue(get(id))).collect();
        {
            let state = acc.lock();
            // Two full groups went out; the fifth call sits in a fresh group.
            assert_eq!(state.in_flight.len(), 2);
            assert_eq!(state.open.len(), 1);
        }
        let summaries = acc.close().await;
        assert_eq!(summaries.len(), 3);

        let mut batches = transport.batches.lock().unwrap().clone();
        batches.sort();
        assert_eq!(batches, vec![vec![1.into(), 2.into()], vec![3.into(), 4.into()]]);
        assert_eq!(*transport.singles.lock().unwrap(), vec![ItemId::from(5)]);
        for (i, h) in handles.into_iter().enumerate() {
            let expected = i as i64 + 1;
            assert_eq!(h.await.unwrap(), json!(expected));
        }
    }

    #[tokio::test]
    async fn on_close_mode_parks_full_groups() {
        let transport = Arc::new(Recorder::default());
        let options = GroupOptions {
            flush_mode: FlushMode::OnClose,
            flush_window: None,
        };
        let acc = accumulator(transport.clone(), enabled(2), options);

        let handles: Vec<_> = (1..=4).map(|id| acc.enqueue(get(id))).collect();
        {
            let state = acc.lock();
            assert!(state.in_flight.is_empty());
            assert_eq!(state.sealed.len(), 2);
        }
        assert!(transport.batches.lock().unwrap().is_empty());

        acc.close().await;
        assert_eq!(transport.batches.lock().unwrap().len(), 2);
        for h in handles {
            assert!(h.await.is_ok());
        }
    }

    #[tokio::test]
    async fn policy_is_cached_per_key() {
        struct Counting(Mutex<usize>);
        impl BatchingConfigProvider for Counting {
            fn is_batching_enabled(&self, _: &OperationTarget) -> bool {
                *self.0.lock().unwrap() += 1;
                true
            }
            fn max_batch_size(&self, _: &OperationTarget) -> usize {
                10
            }
        }

        let config = Arc::new(Counting(Mutex::new(0)));
        let acc = BatchAccumulator::new(
            Dispatcher::new(Arc::new(Recorder::default()), Arc::new(DefaultRequestBuilder)),
            config.clone(),
            None,
            GroupOptions::default(),
            None,
        );
        for id in 0..5 {
            let _ = acc.enqueue(get(id));
        }
        let _ = acc.enqueue(SingleRequest::new("albums", "get", 1));
        acc.close().await;
        assert_eq!(*config.0.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn flush_window_dispatches_before_close() {
        let transport = Arc::new(Recorder::default());
        let options = GroupOptions {
            flush_mode: FlushMode::Eager,
            flush_window: Some(Duration::from_millis(10)),
        };
        let acc = accumulator(transport.clone(), enabled(100), options);

        let first = acc.enqueue(get(1));
        let second = acc.enqueue(get(2));
        assert_eq!(first.await.unwrap(), json!(1));
        assert_eq!(second.await.unwrap(), json!(2));
        assert_eq!(transport.batches.lock().unwrap().len(), 1);

        let summaries = acc.close().await;
        assert_eq!(summaries.len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_late_calls() {
        let acc = accumulator(Arc::new(Recorder::default()), enabled(3), GroupOptions::default());
        let _ = acc.enqueue(get(1));
        assert_eq!(acc.close().await.len(), 1);
        assert!(acc.is_closed());
        assert!(acc.close().await.is_empty());
        assert!(matches!(acc.enqueue(get(2)).await, Err(CallError::ScopeClosed)));
    }

    #[tokio::test]
    async fn empty_scope_does_no_work() {
        let transport = Arc::new(Recorder::default());
        let acc = accumulator(transport.clone(), enabled(3), GroupOptions::default());
        assert!(acc.close().await.is_empty());
        assert!(transport.batches.lock().unwrap().is_empty());
        assert!(transport.singles.lock().unwrap().is_empty());
    }
}
