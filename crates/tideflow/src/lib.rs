//! Trigger-based flow engine
//!
//! Flows are built from chunks (async handlers) wired together by events.
//! A [`BluePrint`] holds the static graph, a [`Flow`] binds it to shared
//! flow data, and each [`Execution`] runs the graph with private runtime
//! state. Emitting an event awaits its entire downstream subtree, which is
//! what makes joins and the result slot deterministic.
//!
//! ```no_run
//! use tideflow::{Flow, Value};
//!
//! # async fn demo() -> tidecore::Result<()> {
//! let flow = Flow::new();
//! flow.to(|data: tideflow::EventData| async move {
//!     Ok(Value::from(format!("hello {}", data.value().as_str().unwrap_or(""))))
//! })?
//! .end()?;
//!
//! let result = flow.start("tide").await?;
//! assert_eq!(result, Value::from("hello tide"));
//! # Ok(())
//! # }
//! ```

mod blueprint;
mod chunk;
mod event_data;
mod execution;
mod flow;
mod guard;
mod monitor;
mod process;
mod stream;

pub use blueprint::{BluePrint, HandlerBundle};
pub use chunk::{handler, Chunk, Handler, HandlerFuture, IntoHandler, Predicate};
pub use event_data::EventData;
pub use execution::{Execution, ExecutionOptions};
pub use flow::Flow;
pub use guard::{DispatchGuard, EmitBudget};
pub use monitor::MonitorEvent;
pub use process::{ForEachOptions, Process};
pub use stream::RuntimeStream;

pub use tidecore::{
    BluePrintSnapshot, BuildError, ChunkError, CollectMode, DispatchError, FlowError, KeyRef,
    LayerStack, TriggerKind, Value, WhenMode, START_EVENT,
};
