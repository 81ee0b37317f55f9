use crate::blueprint::{BluePrint, HandlerBundle};
use crate::chunk::{Chunk, Handler, IntoHandler};
use crate::execution::{Execution, ExecutionOptions};
use crate::monitor::MonitorEvent;
use crate::process::Process;
use crate::stream::RuntimeStream;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidecore::{
    BluePrintSnapshot, BuildError, CollectMode, DataStore, DispatchError, FlowError, KeyRef,
    LayerStack, TriggerKind, Value, WhenMode, START_EVENT,
};
use tokio::sync::broadcast;
use tracing::info;

const MONITOR_CAPACITY: usize = 256;

/// State shared by a flow and all of its executions
pub(crate) struct FlowShared {
    flow_data: DataStore,
    executions: Mutex<HashMap<String, Weak<Execution>>>,
    monitor: broadcast::Sender<MonitorEvent>,
}

impl FlowShared {
    fn new() -> Arc<Self> {
        let (monitor, _) = broadcast::channel(MONITOR_CAPACITY);
        Arc::new(Self {
            flow_data: DataStore::new(),
            executions: Mutex::new(HashMap::new()),
            monitor,
        })
    }

    pub(crate) fn flow_data(&self) -> &DataStore {
        &self.flow_data
    }

    pub(crate) fn publish(&self, event: MonitorEvent) {
        self.monitor.send(event).ok();
    }

    fn register(&self, execution: &Arc<Execution>) {
        self.executions
            .lock()
            .insert(execution.id().to_string(), Arc::downgrade(execution));
    }

    fn unregister(&self, id: &str) {
        self.executions.lock().remove(id);
    }

    fn live_executions(&self) -> Vec<Arc<Execution>> {
        let mut registry = self.executions.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.values().filter_map(Weak::upgrade).collect()
    }

    /// Deliver a flow_data change to every live execution, awaited
    pub(crate) async fn broadcast_flow_data(&self, key: &str, value: Value) {
        let executions = self.live_executions();
        join_all(executions.into_iter().map(|execution| {
            execution.dispatch(
                TriggerKind::FlowData,
                key.to_string(),
                value.clone(),
                LayerStack::root(),
            )
        }))
        .await;
    }
}

/// A blueprint bound to shared flow state, ready to run
///
/// Cloning yields another handle onto the same blueprint and shared state.
#[derive(Clone)]
pub struct Flow {
    blueprint: BluePrint,
    shared: Arc<FlowShared>,
}

impl Flow {
    pub fn new() -> Self {
        Self::with_blue_print(BluePrint::new())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::with_blue_print(BluePrint::named(name))
    }

    pub fn with_blue_print(blueprint: BluePrint) -> Self {
        Self {
            blueprint,
            shared: FlowShared::new(),
        }
    }

    /// Rebuild a flow from a serialized snapshot plus same-named handlers
    pub fn load_blue_print(
        snapshot: &BluePrintSnapshot,
        bundle: &HandlerBundle,
    ) -> Result<Self, BuildError> {
        Ok(Self::with_blue_print(BluePrint::from_snapshot(
            snapshot, bundle,
        )?))
    }

    pub fn name(&self) -> String {
        self.blueprint.name()
    }

    pub fn blue_print(&self) -> &BluePrint {
        &self.blueprint
    }

    /// Serializable topology of the current blueprint
    pub fn save_blue_print(&self) -> BluePrintSnapshot {
        self.blueprint.snapshot()
    }

    /// A flow over a deep copy of this blueprint, handlers carried along
    pub fn copy(&self) -> Flow {
        Self::with_blue_print(self.blueprint.copy())
    }

    pub fn chunk(
        &self,
        name: impl Into<String>,
        handler: impl IntoHandler,
    ) -> Result<Chunk, BuildError> {
        self.blueprint.add_chunk(name, handler)
    }

    pub fn chunk_named(&self, name: &str) -> Option<Chunk> {
        self.blueprint.chunk_named(name)
    }

    /// Subscribe to the flow's monitor bus
    pub fn monitor(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.monitor.subscribe()
    }

    // --- flow data ---

    pub fn get_flow_data(&self, key: &str) -> Option<Value> {
        self.shared.flow_data.get(key)
    }

    pub async fn set_flow_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let stored = self.shared.flow_data.set(key.clone(), value.into());
        self.shared.broadcast_flow_data(&key, stored).await;
    }

    pub async fn append_flow_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let stored = self.shared.flow_data.append(key.clone(), value.into());
        self.shared.broadcast_flow_data(&key, stored).await;
    }

    pub async fn del_flow_data(&self, key: &str) {
        self.shared.flow_data.del(key);
        self.shared.broadcast_flow_data(key, Value::Null).await;
    }

    // --- builder entry points ---

    /// Builder cursor at the start event
    pub fn on_start(&self) -> Process {
        Process::at(self.blueprint.clone(), TriggerKind::Event, START_EVENT)
    }

    pub fn to(&self, handler: impl IntoHandler) -> Result<Process, BuildError> {
        self.on_start().to(handler)
    }

    pub fn to_chunk(&self, chunk: &Chunk) -> Result<Process, BuildError> {
        self.on_start().to_chunk(chunk)
    }

    pub fn side_branch(&self, handler: impl IntoHandler) -> Result<Process, BuildError> {
        self.on_start().side_branch(handler)
    }

    pub fn batch<S: Into<String>>(
        &self,
        branches: impl IntoIterator<Item = (S, Handler)>,
        concurrency: Option<usize>,
    ) -> Result<Process, BuildError> {
        self.on_start().batch(branches, concurrency)
    }

    pub fn for_each(&self) -> Result<Process, BuildError> {
        self.on_start().for_each()
    }

    pub fn collect(
        &self,
        group: impl Into<String>,
        slot: impl Into<String>,
        mode: CollectMode,
    ) -> Result<Process, BuildError> {
        self.on_start().collect(group, slot, mode)
    }

    /// Builder cursor at an arbitrary event
    pub fn when_event(&self, event: impl Into<String>) -> Process {
        Process::at(self.blueprint.clone(), TriggerKind::Event, event)
    }

    /// Builder cursor at a chunk's completion trigger
    pub fn when_chunk(&self, chunk: &Chunk) -> Process {
        self.blueprint.ensure_chunk(chunk);
        Process::at(self.blueprint.clone(), TriggerKind::Event, chunk.trigger())
    }

    pub fn when_runtime_data(&self, key: impl Into<String>) -> Process {
        Process::at(self.blueprint.clone(), TriggerKind::RuntimeData, key)
    }

    pub fn when_flow_data(&self, key: impl Into<String>) -> Process {
        Process::at(self.blueprint.clone(), TriggerKind::FlowData, key)
    }

    /// Wait on a combination of keys, then continue from the fire event
    pub fn when(&self, keys: Vec<KeyRef>, mode: WhenMode) -> Process {
        Process::waiting_on(self.blueprint.clone(), keys, mode)
    }

    // --- execution ---

    pub fn create_execution(&self) -> Arc<Execution> {
        self.create_execution_with(ExecutionOptions::default())
    }

    pub fn create_execution_with(&self, options: ExecutionOptions) -> Arc<Execution> {
        let execution = Execution::new(self.blueprint.freeze(), self.shared.clone(), options);
        self.shared.register(&execution);
        execution
    }

    /// Unsubscribe an execution from flow_data broadcasts
    pub fn remove_execution(&self, id: &str) {
        self.shared.unregister(id);
    }

    /// Run from the start event and wait for a result or first failure
    pub async fn start(&self, initial: impl Into<Value>) -> Result<Value, FlowError> {
        let execution = self.create_execution();
        self.run_to_result(execution, initial.into()).await
    }

    pub async fn start_with_options(
        &self,
        initial: impl Into<Value>,
        options: ExecutionOptions,
    ) -> Result<Value, FlowError> {
        let execution = self.create_execution_with(options);
        self.run_to_result(execution, initial.into()).await
    }

    pub async fn start_with_timeout(
        &self,
        initial: impl Into<Value>,
        limit: Duration,
    ) -> Result<Value, FlowError> {
        match tokio::time::timeout(limit, self.start(initial)).await {
            Ok(result) => result,
            Err(_) => Err(FlowError::ResultTimeout(limit)),
        }
    }

    /// Fire the start event and return the live execution without waiting
    pub fn start_detached(&self, initial: impl Into<Value>) -> Arc<Execution> {
        let execution = self.create_execution();
        self.announce(&execution);
        tokio::spawn(execution.clone().dispatch(
            TriggerKind::Event,
            START_EVENT.to_string(),
            initial.into(),
            LayerStack::root(),
        ));
        execution
    }

    /// Run from the start event, returning the execution's runtime stream
    ///
    /// The stream stops automatically once the dispatch subtree settles, or
    /// earlier through `stop_stream`.
    pub fn get_runtime_stream(
        &self,
        initial: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> Result<RuntimeStream, FlowError> {
        let execution = self.create_execution();
        let rx = execution.take_stream()?;
        self.announce(&execution);
        let run = execution.clone().dispatch(
            TriggerKind::Event,
            START_EVENT.to_string(),
            initial.into(),
            LayerStack::root(),
        );
        let stopper = execution.clone();
        tokio::spawn(async move {
            run.await;
            stopper.stop_stream();
        });
        Ok(RuntimeStream::new(rx, timeout, execution))
    }

    async fn run_to_result(
        &self,
        execution: Arc<Execution>,
        initial: Value,
    ) -> Result<Value, FlowError> {
        self.announce(&execution);
        let run = tokio::spawn(execution.clone().dispatch(
            TriggerKind::Event,
            START_EVENT.to_string(),
            initial,
            LayerStack::root(),
        ));
        tokio::select! {
            result = execution.wait_result() => Ok(result?),
            joined = run => {
                if joined.is_err() {
                    execution.record_failure(DispatchError::TaskPanicked(START_EVENT.to_string()));
                }
                match execution.try_result() {
                    Some(result) => Ok(result?),
                    None => match execution.first_failure() {
                        Some(failure) => Err(FlowError::Dispatch(failure)),
                        None => Err(FlowError::NoResult),
                    },
                }
            }
        }
    }

    fn announce(&self, execution: &Arc<Execution>) {
        info!(
            flow = %self.blueprint.name(),
            execution = execution.id(),
            "execution started"
        );
        self.shared.publish(MonitorEvent::ExecutionStarted {
            execution: execution.id().to_string(),
            at: Utc::now(),
        });
    }
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}
