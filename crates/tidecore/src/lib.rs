//! Core data model for the tideflow engine
//!
//! This crate provides the serializable types the engine is built on: the
//! payload `Value`, the shared key-value `DataStore`, nesting layers, the
//! blueprint topology declarations and their interchange formats. It has no
//! async runtime dependencies.

mod error;
mod graph;
mod layer;
mod store;
mod topology;
mod value;

pub use error::{BuildError, ChunkError, DispatchError, FlowError};
pub use graph::{snapshot_graph, to_mermaid};
pub use layer::{Layer, LayerStack};
pub use store::DataStore;
pub use topology::{
    BatchBranch, BatchDecl, BluePrintSnapshot, CaseCond, CaseDecl, CollectDecl, CollectMode,
    ForEachDecl, KeyRef, Listener, ListenerAction, MatchDecl, TriggerKind, WhenDecl, WhenMode,
    START_EVENT,
};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
