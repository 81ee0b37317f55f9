use crate::EventData;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tidecore::{ChunkError, Value};
use uuid::Uuid;

pub type HandlerFuture = BoxFuture<'static, Result<Value, ChunkError>>;

/// Async unit of work: context in, value out
pub type Handler = Arc<dyn Fn(EventData) -> HandlerFuture + Send + Sync>;

/// Sync predicate used by conditional branches
pub type Predicate = Arc<dyn Fn(&EventData) -> bool + Send + Sync>;

/// Conversion from async closures into boxed handlers
pub trait IntoHandler {
    fn into_handler(self) -> Handler;
}

impl<F, Fut> IntoHandler for F
where
    F: Fn(EventData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ChunkError>> + Send + 'static,
{
    fn into_handler(self) -> Handler {
        Arc::new(move |data| self(data).boxed())
    }
}

/// Box an async closure as a [`Handler`]
///
/// Useful where heterogeneous closures must share a type, e.g. batch branch
/// lists.
pub fn handler<H: IntoHandler>(h: H) -> Handler {
    h.into_handler()
}

pub(crate) fn auto_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// A named unit of work bound to a handler, immutable once registered
///
/// Completing a chunk emits its trigger event with the handler's return
/// value as payload; default edges are listeners on that trigger.
#[derive(Clone)]
pub struct Chunk {
    name: String,
    trigger: String,
    handler: Handler,
}

impl Chunk {
    pub(crate) fn new(name: impl Into<String>, handler: Handler) -> Self {
        let name = name.into();
        let trigger = Self::trigger_for(&name);
        Self {
            name,
            trigger,
            handler,
        }
    }

    pub(crate) fn trigger_for(name: &str) -> String {
        format!("@chunk/{name}")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completion event fired after the handler returns
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }
}
