use crate::Execution;
use std::sync::Arc;
use tidecore::{LayerStack, Value};

/// Per-invocation context handed to chunk handlers and predicates
///
/// Carries the triggering occurrence and a handle back to the execution, so
/// handlers can read and mutate data stores, emit further events, stream
/// partial output, or resolve the result directly.
#[derive(Clone)]
pub struct EventData {
    event: String,
    value: Value,
    layers: LayerStack,
    execution: Arc<Execution>,
}

impl EventData {
    pub(crate) fn new(
        event: String,
        value: Value,
        layers: LayerStack,
        execution: Arc<Execution>,
    ) -> Self {
        Self {
            event,
            value,
            layers,
            execution,
        }
    }

    /// Name of the occurrence that triggered this invocation
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    pub fn execution_id(&self) -> &str {
        self.execution.id()
    }

    pub fn execution(&self) -> &Arc<Execution> {
        &self.execution
    }

    /// Emit an event in this invocation's nesting context and await its
    /// downstream subtree.
    pub async fn emit(&self, event: impl Into<String>, value: impl Into<Value>) {
        self.execution
            .clone()
            .dispatch(
                tidecore::TriggerKind::Event,
                event.into(),
                value.into(),
                self.layers.clone(),
            )
            .await;
    }

    pub fn get_runtime_data(&self, key: &str) -> Option<Value> {
        self.execution.get_runtime_data(key)
    }

    pub async fn set_runtime_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.execution
            .clone()
            .set_runtime_data_at(key.into(), value.into(), self.layers.clone())
            .await;
    }

    pub async fn append_runtime_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.execution
            .clone()
            .append_runtime_data_at(key.into(), value.into(), self.layers.clone())
            .await;
    }

    pub async fn del_runtime_data(&self, key: &str) {
        self.execution
            .clone()
            .del_runtime_data_at(key.to_string(), self.layers.clone())
            .await;
    }

    pub fn get_flow_data(&self, key: &str) -> Option<Value> {
        self.execution.get_flow_data(key)
    }

    pub async fn set_flow_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.execution.set_flow_data(key, value).await;
    }

    pub async fn append_flow_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.execution.append_flow_data(key, value).await;
    }

    pub async fn del_flow_data(&self, key: &str) {
        self.execution.del_flow_data(key).await;
    }

    pub fn put_into_stream(&self, value: impl Into<Value>) {
        self.execution.put_into_stream(value);
    }

    pub fn stop_stream(&self) {
        self.execution.stop_stream();
    }

    /// Resolve the execution result; a no-op if already resolved
    pub fn set_result(&self, value: impl Into<Value>) {
        self.execution.set_result(value.into());
    }
}
