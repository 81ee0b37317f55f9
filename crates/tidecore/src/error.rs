use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("runtime stream idle for {0:?}")]
    StreamTimeout(Duration),

    #[error("runtime stream already consumed")]
    StreamConsumed,

    #[error("no result within {0:?}")]
    ResultTimeout(Duration),

    #[error("execution finished without resolving a result")]
    NoResult,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Graph construction failures, raised synchronously at build or load time
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("duplicate chunk name: {0}")]
    DuplicateChunk(String),

    #[error("unresolved chunk reference: {0}")]
    UnknownChunk(String),

    #[error("missing handler for chunk '{0}'")]
    MissingHandler(String),

    #[error("missing predicate '{0}'")]
    MissingPredicate(String),

    #[error("'{closer}' without matching '{opener}'")]
    UnbalancedScope {
        opener: &'static str,
        closer: &'static str,
    },

    #[error("'{call}' inside an unclosed '{scope}' scope")]
    UnclosedScope {
        call: &'static str,
        scope: &'static str,
    },

    #[error("'{call}' is not valid here: {reason}")]
    InvalidCall {
        call: &'static str,
        reason: String,
    },

    #[error("collect group '{0}' declared with conflicting modes")]
    CollectModeConflict(String),

    #[error("duplicate collect slot '{slot}' in group '{group}'")]
    DuplicateSlot { group: String, slot: String },

    #[error("duplicate batch branch name: {0}")]
    DuplicateBranch(String),
}

/// Error returned by a chunk handler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChunkError {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid payload: expected {expected}, got {actual}")]
    InvalidPayload { expected: String, actual: String },
}

impl ChunkError {
    pub fn failed(message: impl Into<String>) -> Self {
        ChunkError::ExecutionFailed(message.into())
    }
}

impl From<String> for ChunkError {
    fn from(message: String) -> Self {
        ChunkError::ExecutionFailed(message)
    }
}

impl From<&str> for ChunkError {
    fn from(message: &str) -> Self {
        ChunkError::ExecutionFailed(message.to_string())
    }
}

/// Runtime failures captured per execution; the first occurrence becomes the
/// raised cause at the next synchronization point.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("chunk '{chunk}' failed: {source}")]
    Chunk {
        chunk: String,
        #[source]
        source: ChunkError,
    },

    #[error("task for event '{0}' panicked")]
    TaskPanicked(String),

    #[error("chunk '{0}' not registered at dispatch time")]
    MissingChunk(String),

    #[error("predicate '{0}' not registered at dispatch time")]
    MissingPredicate(String),
}
