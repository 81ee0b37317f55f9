use crate::{BuildError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event every execution begins with
pub const START_EVENT: &str = "@start";

/// What kind of occurrence a listener is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    RuntimeData,
    FlowData,
}

/// A case condition: a literal compared for equality, or a named predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CaseCond {
    Value(Value),
    Predicate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDecl {
    pub cond: CaseCond,
    pub event: String,
}

/// Conditional / pattern-match construct: cases evaluated in declaration
/// order, first hit wins, no hit and no else short-circuits silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecl {
    pub id: String,
    pub cases: Vec<CaseDecl>,
    pub else_event: Option<String>,
    pub end_event: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectMode {
    /// Fire once per round, keep the fill-set until reset
    And,
    /// Fire and clear the fill-set so a group inside a loop re-fills
    FilledThenEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectDecl {
    pub group: String,
    pub mode: CollectMode,
    /// Statically declared slots, in declaration order
    pub slots: Vec<String>,
    pub event: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenMode {
    /// Fire once all named keys changed since arming, then re-arm
    And,
    /// Fire on any change, yielding (kind, key, value)
    Or,
    /// Fire on any change, yielding only the raw value
    SimpleOr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub kind: TriggerKind,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenDecl {
    pub id: String,
    pub mode: WhenMode,
    pub keys: Vec<KeyRef>,
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachDecl {
    pub id: String,
    pub send_event: String,
    pub end_event: String,
    pub with_index: bool,
    pub sort_by_index: bool,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchBranch {
    /// Declared branch name, keys the joined output
    pub name: String,
    /// Registered chunk backing the branch
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDecl {
    pub id: String,
    pub branches: Vec<BatchBranch>,
    pub concurrency: Option<usize>,
    pub event: String,
}

/// What a listener does when its trigger fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ListenerAction {
    /// Run a chunk handler, then emit its completion trigger
    RunChunk { chunk: String },
    /// Evaluate a match construct's cases in order
    Match { id: String },
    /// Re-emit the payload under another event (branch merge)
    Forward { event: String },
    /// Resolve the execution result with the chain value (first writer wins)
    ResultSink,
    /// Report the chain value into a collect group slot
    Collect { group: String, slot: String },
    /// Feed a key change into a when construct
    WhenKeys { id: String },
    /// Fan out declared branches against the same input and join them
    Batch { id: String },
    /// Fan out one sub-invocation per element of the payload sequence
    ForEach { id: String },
    /// Join per-element results of a for_each body
    EndForEach { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    pub action: ListenerAction,
}

/// Static, serializable description of a flow graph
///
/// Handlers and predicates are referenced by name only; loading a snapshot
/// requires re-supplying same-named handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BluePrintSnapshot {
    pub name: String,
    pub chunks: Vec<String>,
    pub predicates: Vec<String>,
    pub on_event: BTreeMap<String, Vec<Listener>>,
    pub on_runtime_data: BTreeMap<String, Vec<Listener>>,
    pub on_flow_data: BTreeMap<String, Vec<Listener>>,
    pub matches: BTreeMap<String, MatchDecl>,
    pub collects: BTreeMap<String, CollectDecl>,
    pub whens: BTreeMap<String, WhenDecl>,
    pub foreaches: BTreeMap<String, ForEachDecl>,
    pub batches: BTreeMap<String, BatchDecl>,
}

impl BluePrintSnapshot {
    /// Check that every chunk reference resolves to a declared chunk
    pub fn validate(&self) -> Result<(), BuildError> {
        let known: std::collections::HashSet<&str> =
            self.chunks.iter().map(|c| c.as_str()).collect();
        let tables = [&self.on_event, &self.on_runtime_data, &self.on_flow_data];
        for table in tables {
            for listeners in table.values() {
                for listener in listeners {
                    if let ListenerAction::RunChunk { chunk } = &listener.action {
                        if !known.contains(chunk.as_str()) {
                            return Err(BuildError::UnknownChunk(chunk.clone()));
                        }
                    }
                }
            }
        }
        for batch in self.batches.values() {
            for branch in &batch.branches {
                if !known.contains(branch.chunk.as_str()) {
                    return Err(BuildError::UnknownChunk(branch.chunk.clone()));
                }
            }
        }
        Ok(())
    }

    /// Mapping-oriented interchange format
    pub fn to_flat_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_flat_json(json: &str) -> crate::Result<Self> {
        let snapshot: BluePrintSnapshot = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Nested-object interchange format, structurally equivalent to the flat
    /// one: listeners grouped under their trigger binding.
    pub fn to_nested_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(&NestedSnapshot::from(self))?)
    }

    pub fn from_nested_json(json: &str) -> crate::Result<Self> {
        let nested: NestedSnapshot = serde_json::from_str(json)?;
        let snapshot = nested.into_snapshot();
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TriggerRef {
    kind: TriggerKind,
    target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Binding {
    trigger: TriggerRef,
    listeners: Vec<Listener>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConstructSet {
    matches: Vec<MatchDecl>,
    collects: Vec<CollectDecl>,
    whens: Vec<WhenDecl>,
    foreaches: Vec<ForEachDecl>,
    batches: Vec<BatchDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NestedSnapshot {
    name: String,
    chunks: Vec<String>,
    predicates: Vec<String>,
    bindings: Vec<Binding>,
    constructs: ConstructSet,
}

impl From<&BluePrintSnapshot> for NestedSnapshot {
    fn from(snapshot: &BluePrintSnapshot) -> Self {
        let mut bindings = Vec::new();
        let tables = [
            (TriggerKind::Event, &snapshot.on_event),
            (TriggerKind::RuntimeData, &snapshot.on_runtime_data),
            (TriggerKind::FlowData, &snapshot.on_flow_data),
        ];
        for (kind, table) in tables {
            for (target, listeners) in table {
                bindings.push(Binding {
                    trigger: TriggerRef {
                        kind,
                        target: target.clone(),
                    },
                    listeners: listeners.clone(),
                });
            }
        }
        NestedSnapshot {
            name: snapshot.name.clone(),
            chunks: snapshot.chunks.clone(),
            predicates: snapshot.predicates.clone(),
            bindings,
            constructs: ConstructSet {
                matches: snapshot.matches.values().cloned().collect(),
                collects: snapshot.collects.values().cloned().collect(),
                whens: snapshot.whens.values().cloned().collect(),
                foreaches: snapshot.foreaches.values().cloned().collect(),
                batches: snapshot.batches.values().cloned().collect(),
            },
        }
    }
}

impl NestedSnapshot {
    fn into_snapshot(self) -> BluePrintSnapshot {
        let mut on_event = BTreeMap::new();
        let mut on_runtime_data = BTreeMap::new();
        let mut on_flow_data = BTreeMap::new();
        for binding in self.bindings {
            let table = match binding.trigger.kind {
                TriggerKind::Event => &mut on_event,
                TriggerKind::RuntimeData => &mut on_runtime_data,
                TriggerKind::FlowData => &mut on_flow_data,
            };
            table.insert(binding.trigger.target, binding.listeners);
        }
        BluePrintSnapshot {
            name: self.name,
            chunks: self.chunks,
            predicates: self.predicates,
            on_event,
            on_runtime_data,
            on_flow_data,
            matches: self
                .constructs
                .matches
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            collects: self
                .constructs
                .collects
                .into_iter()
                .map(|d| (d.group.clone(), d))
                .collect(),
            whens: self
                .constructs
                .whens
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            foreaches: self
                .constructs
                .foreaches
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            batches: self
                .constructs
                .batches
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
        }
    }
}
