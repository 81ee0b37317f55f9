use crate::blueprint::FrozenBluePrint;
use crate::chunk::Chunk;
use crate::flow::FlowShared;
use crate::guard::DispatchGuard;
use crate::monitor::MonitorEvent;
use crate::stream::StreamItem;
use crate::EventData;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::stream::StreamExt;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidecore::{
    CaseCond, CollectMode, DataStore, DispatchError, FlowError, LayerStack, ListenerAction,
    TriggerKind, Value, WhenMode,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Knobs applied when creating an execution
#[derive(Default)]
pub struct ExecutionOptions {
    /// Upper bound on concurrently running chunk handlers
    ///
    /// A handler holds its permit until it returns, so a handler that emits
    /// and awaits further chunks counts against the bound the whole time.
    pub concurrency: Option<usize>,
    pub guard: Option<Arc<dyn DispatchGuard>>,
}

#[derive(Default)]
struct CollectRound {
    filled: HashMap<String, Value>,
    fired: bool,
}

struct ForEachRound {
    expected: HashSet<String>,
    results: Vec<(usize, Value)>,
}

/// One run of a flow: a frozen blueprint plus private runtime state
///
/// Created through [`crate::Flow`]; listeners registered on the flow after
/// creation are not seen by this execution. The result slot is
/// single-assignment, first writer wins.
pub struct Execution {
    id: String,
    blueprint: Arc<FrozenBluePrint>,
    shared: Arc<FlowShared>,
    runtime_data: DataStore,
    result: Mutex<Option<Result<Value, DispatchError>>>,
    result_notify: Notify,
    failure: Mutex<Option<DispatchError>>,
    stream_tx: UnboundedSender<StreamItem>,
    stream_rx: Mutex<Option<UnboundedReceiver<StreamItem>>>,
    limiter: Option<Arc<Semaphore>>,
    guard: Option<Arc<dyn DispatchGuard>>,
    emit_count: AtomicU64,
    collect_rounds: Mutex<HashMap<String, CollectRound>>,
    when_rounds: Mutex<HashMap<String, HashMap<String, Value>>>,
    foreach_rounds: Mutex<HashMap<String, ForEachRound>>,
}

impl Execution {
    pub(crate) fn new(
        blueprint: Arc<FrozenBluePrint>,
        shared: Arc<FlowShared>,
        options: ExecutionOptions,
    ) -> Arc<Self> {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: format!("execution-{}", Uuid::new_v4().simple()),
            blueprint,
            shared,
            runtime_data: DataStore::new(),
            result: Mutex::new(None),
            result_notify: Notify::new(),
            failure: Mutex::new(None),
            stream_tx,
            stream_rx: Mutex::new(Some(stream_rx)),
            limiter: options.concurrency.map(|n| Arc::new(Semaphore::new(n))),
            guard: options.guard,
            emit_count: AtomicU64::new(0),
            collect_rounds: Mutex::new(HashMap::new()),
            when_rounds: Mutex::new(HashMap::new()),
            foreach_rounds: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Dispatch one occurrence to its listeners and await the whole subtree
    ///
    /// Each listener runs as its own tokio task; the returned future resolves
    /// once every listener and everything it transitively emitted has
    /// settled. Panicked listener tasks are captured as dispatch failures.
    pub(crate) fn dispatch(
        self: Arc<Self>,
        kind: TriggerKind,
        target: String,
        value: Value,
        layers: LayerStack,
    ) -> BoxFuture<'static, ()> {
        async move {
            if kind == TriggerKind::Event {
                let count = self.emit_count.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(guard) = &self.guard {
                    if !guard.allow_emit(&target, count).await {
                        warn!(execution = self.id(), event = %target, count, "emit denied by guard");
                        return;
                    }
                }
                self.publish(MonitorEvent::EventEmitted {
                    execution: self.id.clone(),
                    event: target.clone(),
                    at: Utc::now(),
                });
            }
            let listeners = self.blueprint.listeners(kind, &target);
            debug!(
                execution = self.id(),
                ?kind,
                target = %target,
                listeners = listeners.len(),
                "dispatch"
            );
            if listeners.is_empty() {
                return;
            }
            let handles: Vec<_> = listeners
                .into_iter()
                .map(|listener| {
                    let execution = self.clone();
                    let target = target.clone();
                    let value = value.clone();
                    let layers = layers.clone();
                    tokio::spawn(execution.interpret(listener.action, kind, target, value, layers))
                })
                .collect();
            for handle in join_all(handles).await {
                if handle.is_err() {
                    self.record_failure(DispatchError::TaskPanicked(target.clone()));
                }
            }
        }
        .boxed()
    }

    /// Manually fire an event into this execution
    pub async fn emit(self: Arc<Self>, event: impl Into<String>, value: impl Into<Value>) {
        self.dispatch(
            TriggerKind::Event,
            event.into(),
            value.into(),
            LayerStack::root(),
        )
        .await;
    }

    async fn interpret(
        self: Arc<Self>,
        action: ListenerAction,
        kind: TriggerKind,
        target: String,
        value: Value,
        layers: LayerStack,
    ) {
        match action {
            ListenerAction::RunChunk { chunk } => {
                self.run_chunk(chunk, target, value, layers).await;
            }
            ListenerAction::Match { id } => {
                self.run_match(id, target, value, layers).await;
            }
            ListenerAction::Forward { event } => {
                self.dispatch(TriggerKind::Event, event, value, layers).await;
            }
            ListenerAction::ResultSink => {
                self.set_result(value);
            }
            ListenerAction::Collect { group, slot } => {
                self.run_collect(group, slot, value, layers).await;
            }
            ListenerAction::WhenKeys { id } => {
                self.run_when(id, kind, target, value, layers).await;
            }
            ListenerAction::Batch { id } => {
                self.run_batch(id, target, value, layers).await;
            }
            ListenerAction::ForEach { id } => {
                self.run_foreach(id, value, layers).await;
            }
            ListenerAction::EndForEach { id } => {
                self.run_end_foreach(&id, value, &layers);
            }
        }
    }

    async fn run_chunk(
        self: Arc<Self>,
        name: String,
        triggered_by: String,
        value: Value,
        layers: LayerStack,
    ) {
        let Some(chunk) = self.blueprint.chunks.get(&name).cloned() else {
            self.record_failure(DispatchError::MissingChunk(name));
            return;
        };
        match self
            .clone()
            .run_chunk_value(&chunk, triggered_by, value, layers.clone())
            .await
        {
            Ok(output) => {
                self.dispatch(TriggerKind::Event, chunk.trigger().to_string(), output, layers)
                    .await;
            }
            Err(failure) => self.record_failure(failure),
        }
    }

    /// Run a chunk handler under the concurrency limiter, without emitting
    /// its trigger event.
    async fn run_chunk_value(
        self: Arc<Self>,
        chunk: &Chunk,
        triggered_by: String,
        value: Value,
        layers: LayerStack,
    ) -> Result<Value, DispatchError> {
        let permit = match &self.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        };
        self.publish(MonitorEvent::ChunkStarted {
            execution: self.id.clone(),
            chunk: chunk.name().to_string(),
            at: Utc::now(),
        });
        let data = EventData::new(triggered_by, value, layers, self.clone());
        let outcome = (chunk.handler())(data).await;
        drop(permit);
        match outcome {
            Ok(output) => {
                self.publish(MonitorEvent::ChunkCompleted {
                    execution: self.id.clone(),
                    chunk: chunk.name().to_string(),
                    at: Utc::now(),
                });
                Ok(output)
            }
            Err(cause) => {
                error!(
                    execution = self.id(),
                    chunk = chunk.name(),
                    error = %cause,
                    "chunk handler failed"
                );
                self.publish(MonitorEvent::ChunkFailed {
                    execution: self.id.clone(),
                    chunk: chunk.name().to_string(),
                    error: cause.to_string(),
                    at: Utc::now(),
                });
                Err(DispatchError::Chunk {
                    chunk: chunk.name().to_string(),
                    source: cause,
                })
            }
        }
    }

    async fn run_match(self: Arc<Self>, id: String, target: String, value: Value, layers: LayerStack) {
        let Some(decl) = self.blueprint.matches.get(&id).cloned() else {
            return;
        };
        // Pick the winning event before dispatching so no case borrow is
        // held across the await.
        let mut hit_event = None;
        for case in &decl.cases {
            let hit = match &case.cond {
                CaseCond::Value(expected) => *expected == value,
                CaseCond::Predicate(name) => match self.blueprint.predicates.get(name) {
                    Some(predicate) => {
                        let data = EventData::new(
                            target.clone(),
                            value.clone(),
                            layers.clone(),
                            self.clone(),
                        );
                        predicate(&data)
                    }
                    None => {
                        self.record_failure(DispatchError::MissingPredicate(name.clone()));
                        return;
                    }
                },
            };
            if hit {
                hit_event = Some(case.event.clone());
                break;
            }
        }
        if let Some(event) = hit_event.or(decl.else_event) {
            self.dispatch(TriggerKind::Event, event, value, layers)
                .await;
        }
    }

    async fn run_collect(self: Arc<Self>, group: String, slot: String, value: Value, layers: LayerStack) {
        let Some(decl) = self.blueprint.collects.get(&group).cloned() else {
            return;
        };
        let round_key = format!("{group}@{}", layers.path());
        let fire = {
            let mut rounds = self.collect_rounds.lock();
            let round = rounds.entry(round_key.clone()).or_default();
            if round.fired || round.filled.contains_key(&slot) {
                None
            } else {
                round.filled.insert(slot, value);
                if decl.slots.iter().all(|s| round.filled.contains_key(s)) {
                    let payload = Value::Object(
                        decl.slots
                            .iter()
                            .map(|s| {
                                (s.clone(), round.filled.get(s).cloned().unwrap_or(Value::Null))
                            })
                            .collect(),
                    );
                    match decl.mode {
                        CollectMode::And => round.fired = true,
                        CollectMode::FilledThenEmpty => {
                            rounds.remove(&round_key);
                        }
                    }
                    Some(payload)
                } else {
                    None
                }
            }
        };
        if let Some(payload) = fire {
            self.dispatch(TriggerKind::Event, decl.event, payload, layers)
                .await;
        }
    }

    async fn run_when(
        self: Arc<Self>,
        id: String,
        kind: TriggerKind,
        target: String,
        value: Value,
        layers: LayerStack,
    ) {
        let Some(decl) = self.blueprint.whens.get(&id).cloned() else {
            return;
        };
        match decl.mode {
            WhenMode::SimpleOr => {
                self.dispatch(TriggerKind::Event, decl.event, value, layers)
                    .await;
            }
            WhenMode::Or => {
                let payload = Value::object([
                    ("kind".to_string(), Value::from(kind_name(kind))),
                    ("key".to_string(), Value::from(target)),
                    ("value".to_string(), value),
                ]);
                self.dispatch(TriggerKind::Event, decl.event, payload, layers)
                    .await;
            }
            WhenMode::And => {
                let round_key = format!("{id}@{}", layers.path());
                let fire = {
                    let mut rounds = self.when_rounds.lock();
                    let changed = rounds.entry(round_key.clone()).or_default();
                    changed.insert(composite_key(kind, &target), value);
                    let complete = decl
                        .keys
                        .iter()
                        .all(|k| changed.contains_key(&composite_key(k.kind, &k.key)));
                    if complete {
                        let payload = Value::Object(
                            decl.keys
                                .iter()
                                .map(|k| {
                                    (
                                        k.key.clone(),
                                        changed
                                            .get(&composite_key(k.kind, &k.key))
                                            .cloned()
                                            .unwrap_or(Value::Null),
                                    )
                                })
                                .collect(),
                        );
                        rounds.remove(&round_key);
                        Some(payload)
                    } else {
                        None
                    }
                };
                if let Some(payload) = fire {
                    self.dispatch(TriggerKind::Event, decl.event, payload, layers)
                        .await;
                }
            }
        }
    }

    async fn run_batch(self: Arc<Self>, id: String, target: String, value: Value, layers: LayerStack) {
        let Some(decl) = self.blueprint.batches.get(&id).cloned() else {
            return;
        };
        // Collected eagerly so the branch borrow ends before the await.
        let branch_runs: Vec<_> = decl
            .branches
            .iter()
            .map(|branch| {
                let execution = self.clone();
                let name = branch.name.clone();
                let chunk_name = branch.chunk.clone();
                let triggered_by = target.clone();
                let value = value.clone();
                let layers = layers.clone();
                async move {
                    let Some(chunk) = execution.blueprint.chunks.get(&chunk_name).cloned() else {
                        return (name, Err(DispatchError::MissingChunk(chunk_name)));
                    };
                    let outcome = execution
                        .run_chunk_value(&chunk, triggered_by, value, layers)
                        .await;
                    (name, outcome)
                }
            })
            .collect();
        let outcomes: Vec<(String, Result<Value, DispatchError>)> = match decl.concurrency {
            Some(limit) if limit > 0 => {
                futures::stream::iter(branch_runs)
                    .buffer_unordered(limit)
                    .collect()
                    .await
            }
            _ => join_all(branch_runs).await,
        };
        let mut by_name = HashMap::new();
        let mut failed = false;
        for (name, outcome) in outcomes {
            match outcome {
                Ok(output) => {
                    by_name.insert(name, output);
                }
                Err(failure) => {
                    failed = true;
                    self.record_failure(failure);
                }
            }
        }
        if failed {
            return;
        }
        let payload = Value::Object(
            decl.branches
                .iter()
                .map(|branch| {
                    (
                        branch.name.clone(),
                        by_name.remove(&branch.name).unwrap_or(Value::Null),
                    )
                })
                .collect(),
        );
        self.dispatch(TriggerKind::Event, decl.event, payload, layers)
            .await;
    }

    async fn run_foreach(self: Arc<Self>, id: String, value: Value, layers: LayerStack) {
        let Some(decl) = self.blueprint.foreaches.get(&id).cloned() else {
            return;
        };
        let elements = match value {
            Value::Array(items) => items,
            single => vec![single],
        };
        if elements.is_empty() {
            self.dispatch(TriggerKind::Event, decl.end_event, Value::Array(Vec::new()), layers)
                .await;
            return;
        }
        // One instance layer per invocation keeps concurrent rounds of the
        // same construct apart, one element layer routes joins back here.
        let instance = layers.pushed(0);
        let round_key = format!("{id}@{}", instance.path());
        let mut element_layers = Vec::with_capacity(elements.len());
        let mut expected = HashSet::new();
        for index in 0..elements.len() {
            let stack = instance.pushed(index);
            if let Some(top) = stack.top() {
                expected.insert(top.mark.clone());
            }
            element_layers.push(stack);
        }
        self.foreach_rounds.lock().insert(
            round_key.clone(),
            ForEachRound {
                expected,
                results: Vec::new(),
            },
        );
        let sends = elements
            .into_iter()
            .zip(element_layers)
            .enumerate()
            .map(|(index, (element, stack))| {
                let payload = if decl.with_index {
                    Value::Array(vec![Value::from(index), element])
                } else {
                    element
                };
                self.clone()
                    .dispatch(TriggerKind::Event, decl.send_event.clone(), payload, stack)
            });
        match decl.concurrency {
            Some(limit) if limit > 0 => {
                futures::stream::iter(sends)
                    .buffer_unordered(limit)
                    .collect::<Vec<()>>()
                    .await;
            }
            _ => {
                join_all(sends).await;
            }
        }
        let mut results = self
            .foreach_rounds
            .lock()
            .remove(&round_key)
            .map(|round| round.results)
            .unwrap_or_default();
        if decl.sort_by_index {
            results.sort_by_key(|(index, _)| *index);
        }
        let payload = Value::Array(results.into_iter().map(|(_, v)| v).collect());
        self.dispatch(TriggerKind::Event, decl.end_event, payload, layers)
            .await;
    }

    fn run_end_foreach(&self, id: &str, value: Value, layers: &LayerStack) {
        let Some(top) = layers.top() else {
            return;
        };
        let round_key = format!("{id}@{}", layers.popped().path());
        let mut rounds = self.foreach_rounds.lock();
        if let Some(round) = rounds.get_mut(&round_key) {
            // Removing the mark makes a second arrival for the same element
            // a no-op.
            if round.expected.remove(&top.mark) {
                round.results.push((top.index, value));
            }
        }
    }

    // --- result slot ---

    /// Resolve the result unless a value or failure already did
    pub fn set_result(&self, value: Value) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(Ok(value));
            drop(slot);
            self.publish(MonitorEvent::ResultResolved {
                execution: self.id.clone(),
                at: Utc::now(),
            });
            self.result_notify.notify_waiters();
        }
    }

    pub(crate) fn record_failure(&self, failure: DispatchError) {
        {
            let mut first = self.failure.lock();
            if first.is_none() {
                *first = Some(failure.clone());
            } else {
                warn!(execution = self.id(), error = %failure, "failure after the first, retained cause wins");
                return;
            }
        }
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(Err(failure));
            drop(slot);
            self.result_notify.notify_waiters();
        }
    }

    /// First captured dispatch failure, if any
    pub fn first_failure(&self) -> Option<DispatchError> {
        self.failure.lock().clone()
    }

    pub fn try_result(&self) -> Option<Result<Value, DispatchError>> {
        self.result.lock().clone()
    }

    /// Wait until the result slot is resolved by a value or a failure
    pub async fn wait_result(&self) -> Result<Value, DispatchError> {
        loop {
            let notified = self.result_notify.notified();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    pub async fn get_result(&self) -> Result<Value, FlowError> {
        Ok(self.wait_result().await?)
    }

    // --- runtime data ---

    pub fn get_runtime_data(&self, key: &str) -> Option<Value> {
        self.runtime_data.get(key)
    }

    pub async fn set_runtime_data(self: Arc<Self>, key: impl Into<String>, value: impl Into<Value>) {
        self.set_runtime_data_at(key.into(), value.into(), LayerStack::root())
            .await;
    }

    pub(crate) async fn set_runtime_data_at(self: Arc<Self>, key: String, value: Value, layers: LayerStack) {
        let stored = self.runtime_data.set(key.clone(), value);
        self.dispatch(TriggerKind::RuntimeData, key, stored, layers)
            .await;
    }

    pub async fn append_runtime_data(self: Arc<Self>, key: impl Into<String>, value: impl Into<Value>) {
        self.append_runtime_data_at(key.into(), value.into(), LayerStack::root())
            .await;
    }

    pub(crate) async fn append_runtime_data_at(self: Arc<Self>, key: String, value: Value, layers: LayerStack) {
        let stored = self.runtime_data.append(key.clone(), value);
        self.dispatch(TriggerKind::RuntimeData, key, stored, layers)
            .await;
    }

    pub async fn del_runtime_data(self: Arc<Self>, key: &str) {
        self.del_runtime_data_at(key.to_string(), LayerStack::root())
            .await;
    }

    pub(crate) async fn del_runtime_data_at(self: Arc<Self>, key: String, layers: LayerStack) {
        self.runtime_data.del(&key);
        self.dispatch(TriggerKind::RuntimeData, key, Value::Null, layers)
            .await;
    }

    // --- flow data passthrough ---

    pub fn get_flow_data(&self, key: &str) -> Option<Value> {
        self.shared.flow_data().get(key)
    }

    pub async fn set_flow_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let stored = self.shared.flow_data().set(key.clone(), value.into());
        self.shared.broadcast_flow_data(&key, stored).await;
    }

    pub async fn append_flow_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let stored = self.shared.flow_data().append(key.clone(), value.into());
        self.shared.broadcast_flow_data(&key, stored).await;
    }

    pub async fn del_flow_data(&self, key: &str) {
        self.shared.flow_data().del(key);
        self.shared.broadcast_flow_data(key, Value::Null).await;
    }

    // --- stream ---

    pub fn put_into_stream(&self, value: impl Into<Value>) {
        self.stream_tx.send(StreamItem::Item(value.into())).ok();
    }

    pub fn stop_stream(&self) {
        if self.stream_tx.send(StreamItem::Stop).is_ok() {
            self.publish(MonitorEvent::StreamStopped {
                execution: self.id.clone(),
                at: Utc::now(),
            });
        }
    }

    pub(crate) fn take_stream(&self) -> Result<UnboundedReceiver<StreamItem>, FlowError> {
        self.stream_rx
            .lock()
            .take()
            .ok_or(FlowError::StreamConsumed)
    }

    /// Claim this execution's runtime stream; a second claim fails
    pub fn runtime_stream(
        self: Arc<Self>,
        timeout: Option<std::time::Duration>,
    ) -> Result<crate::RuntimeStream, FlowError> {
        let rx = self.take_stream()?;
        Ok(crate::RuntimeStream::new(rx, timeout, self))
    }

    pub(crate) fn publish(&self, event: MonitorEvent) {
        self.shared.publish(event);
    }
}

fn kind_name(kind: TriggerKind) -> &'static str {
    match kind {
        TriggerKind::Event => "event",
        TriggerKind::RuntimeData => "runtime_data",
        TriggerKind::FlowData => "flow_data",
    }
}

fn composite_key(kind: TriggerKind, key: &str) -> String {
    format!("{}:{key}", kind_name(kind))
}
