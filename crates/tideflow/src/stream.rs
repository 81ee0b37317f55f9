use crate::Execution;
use std::sync::Arc;
use std::time::Duration;
use tidecore::{FlowError, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

/// Item on an execution's stream queue
#[derive(Debug, Clone)]
pub(crate) enum StreamItem {
    Item(Value),
    Stop,
}

/// Pull sequence over values pushed by in-flight handlers
///
/// Ends on the stop sentinel, or when the per-item timeout elapses with no
/// new item. Without a timeout, `next` waits indefinitely. Ending the stream
/// never cancels outstanding handler tasks.
pub struct RuntimeStream {
    rx: UnboundedReceiver<StreamItem>,
    timeout: Option<Duration>,
    execution: Arc<Execution>,
    done: bool,
}

impl RuntimeStream {
    pub(crate) fn new(
        rx: UnboundedReceiver<StreamItem>,
        timeout: Option<Duration>,
        execution: Arc<Execution>,
    ) -> Self {
        Self {
            rx,
            timeout,
            execution,
            done: false,
        }
    }

    pub fn execution(&self) -> &Arc<Execution> {
        &self.execution
    }

    /// Next streamed value, a terminal error, or `None` once the stream ended
    pub async fn next(&mut self) -> Option<Result<Value, FlowError>> {
        if self.done {
            return None;
        }
        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(
                        execution = self.execution.id(),
                        ?limit,
                        "runtime stream idle past timeout"
                    );
                    self.done = true;
                    return Some(Err(FlowError::StreamTimeout(limit)));
                }
            },
            None => self.rx.recv().await,
        };
        match received {
            Some(StreamItem::Item(value)) => Some(Ok(value)),
            Some(StreamItem::Stop) | None => {
                self.done = true;
                self.execution
                    .first_failure()
                    .map(|failure| Err(FlowError::Dispatch(failure)))
            }
        }
    }

    /// Drain the rest of the stream into a vector, ignoring a terminal error
    pub async fn collect_values(mut self) -> Vec<Value> {
        let mut values = Vec::new();
        while let Some(Ok(value)) = self.next().await {
            values.push(value);
        }
        values
    }
}
