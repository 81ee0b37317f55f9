use crate::chunk::{auto_name, Chunk, Handler, IntoHandler, Predicate};
use crate::EventData;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tidecore::{
    BatchDecl, BluePrintSnapshot, BuildError, CaseCond, CollectDecl, CollectMode, ForEachDecl,
    Listener, ListenerAction, MatchDecl, TriggerKind, WhenDecl,
};
use uuid::Uuid;

#[derive(Default)]
struct Registry {
    name: String,
    chunks: HashMap<String, Chunk>,
    predicates: HashMap<String, Predicate>,
    on_event: HashMap<String, Vec<Listener>>,
    on_runtime_data: HashMap<String, Vec<Listener>>,
    on_flow_data: HashMap<String, Vec<Listener>>,
    matches: HashMap<String, MatchDecl>,
    collects: HashMap<String, CollectDecl>,
    whens: HashMap<String, WhenDecl>,
    foreaches: HashMap<String, ForEachDecl>,
    batches: HashMap<String, BatchDecl>,
}

impl Registry {
    fn table_mut(&mut self, kind: TriggerKind) -> &mut HashMap<String, Vec<Listener>> {
        match kind {
            TriggerKind::Event => &mut self.on_event,
            TriggerKind::RuntimeData => &mut self.on_runtime_data,
            TriggerKind::FlowData => &mut self.on_flow_data,
        }
    }
}

/// Live blueprint: chunk and listener registries plus construct topology
///
/// Cheap to clone; builder cursors share the same registry through this
/// handle. Executions snapshot the registry at creation time, so listeners
/// added afterwards do not affect already-running executions.
#[derive(Clone)]
pub struct BluePrint {
    inner: Arc<Mutex<Registry>>,
}

impl BluePrint {
    pub fn new() -> Self {
        Self::named(format!("blueprint-{}", Uuid::new_v4().simple()))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                name: name.into(),
                ..Registry::default()
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    /// Register a handler under an explicit name; duplicates are a build error
    pub fn add_chunk(
        &self,
        name: impl Into<String>,
        handler: impl IntoHandler,
    ) -> Result<Chunk, BuildError> {
        let name = name.into();
        let mut registry = self.inner.lock();
        if registry.chunks.contains_key(&name) {
            return Err(BuildError::DuplicateChunk(name));
        }
        let chunk = Chunk::new(name.clone(), handler.into_handler());
        registry.chunks.insert(name, chunk.clone());
        Ok(chunk)
    }

    /// Register a handler under a generated, collision-free name
    pub fn add_anonymous_chunk(&self, handler: impl IntoHandler) -> Chunk {
        self.add_boxed_chunk(handler.into_handler())
    }

    pub(crate) fn add_boxed_chunk(&self, handler: Handler) -> Chunk {
        let chunk = Chunk::new(auto_name("chunk"), handler);
        self.inner
            .lock()
            .chunks
            .insert(chunk.name().to_string(), chunk.clone());
        chunk
    }

    /// Look a registered chunk up by name
    pub fn chunk_named(&self, name: &str) -> Option<Chunk> {
        self.inner.lock().chunks.get(name).cloned()
    }

    /// Register a chunk handle that may come from another build site
    pub(crate) fn ensure_chunk(&self, chunk: &Chunk) {
        self.inner
            .lock()
            .chunks
            .entry(chunk.name().to_string())
            .or_insert_with(|| chunk.clone());
    }

    pub(crate) fn add_listener(
        &self,
        kind: TriggerKind,
        target: impl Into<String>,
        action: ListenerAction,
    ) -> String {
        let id = format!("listener-{}", Uuid::new_v4().simple());
        let listener = Listener {
            id: id.clone(),
            action,
        };
        self.inner
            .lock()
            .table_mut(kind)
            .entry(target.into())
            .or_default()
            .push(listener);
        id
    }

    /// Attach a raw handler to an event, outside the builder DSL
    pub fn add_event_handler(&self, event: impl Into<String>, handler: impl IntoHandler) -> Chunk {
        let chunk = self.add_anonymous_chunk(handler);
        self.add_listener(
            TriggerKind::Event,
            event,
            ListenerAction::RunChunk {
                chunk: chunk.name().to_string(),
            },
        );
        chunk
    }

    /// Attach a raw handler to runtime_data changes of a key
    pub fn add_runtime_data_handler(
        &self,
        key: impl Into<String>,
        handler: impl IntoHandler,
    ) -> Chunk {
        let chunk = self.add_anonymous_chunk(handler);
        self.add_listener(
            TriggerKind::RuntimeData,
            key,
            ListenerAction::RunChunk {
                chunk: chunk.name().to_string(),
            },
        );
        chunk
    }

    /// Attach a raw handler to flow_data changes of a key
    pub fn add_flow_data_handler(
        &self,
        key: impl Into<String>,
        handler: impl IntoHandler,
    ) -> Chunk {
        let chunk = self.add_anonymous_chunk(handler);
        self.add_listener(
            TriggerKind::FlowData,
            key,
            ListenerAction::RunChunk {
                chunk: chunk.name().to_string(),
            },
        );
        chunk
    }

    pub(crate) fn insert_match(&self, decl: MatchDecl) {
        self.inner.lock().matches.insert(decl.id.clone(), decl);
    }

    pub(crate) fn update_match<R>(
        &self,
        id: &str,
        update: impl FnOnce(&mut MatchDecl) -> R,
    ) -> Option<R> {
        self.inner.lock().matches.get_mut(id).map(update)
    }

    /// Declare one slot of a collect group; the group's mode must agree
    /// across declarations.
    pub(crate) fn insert_collect_slot(
        &self,
        group: &str,
        slot: &str,
        mode: CollectMode,
    ) -> Result<String, BuildError> {
        let mut registry = self.inner.lock();
        let decl = registry
            .collects
            .entry(group.to_string())
            .or_insert_with(|| CollectDecl {
                group: group.to_string(),
                mode,
                slots: Vec::new(),
                event: format!("@collect/{group}"),
            });
        if decl.mode != mode {
            return Err(BuildError::CollectModeConflict(group.to_string()));
        }
        if decl.slots.iter().any(|s| s == slot) {
            return Err(BuildError::DuplicateSlot {
                group: group.to_string(),
                slot: slot.to_string(),
            });
        }
        decl.slots.push(slot.to_string());
        Ok(decl.event.clone())
    }

    pub(crate) fn insert_when(&self, decl: WhenDecl) {
        self.inner.lock().whens.insert(decl.id.clone(), decl);
    }

    pub(crate) fn insert_foreach(&self, decl: ForEachDecl) {
        self.inner.lock().foreaches.insert(decl.id.clone(), decl);
    }

    pub(crate) fn update_foreach<R>(
        &self,
        id: &str,
        update: impl FnOnce(&mut ForEachDecl) -> R,
    ) -> Option<R> {
        self.inner.lock().foreaches.get_mut(id).map(update)
    }

    pub(crate) fn insert_batch(&self, decl: BatchDecl) {
        self.inner.lock().batches.insert(decl.id.clone(), decl);
    }

    /// Deep-copy this blueprint with handlers bundled in-process
    pub fn copy(&self) -> BluePrint {
        let registry = self.inner.lock();
        BluePrint {
            inner: Arc::new(Mutex::new(Registry {
                name: registry.name.clone(),
                chunks: registry.chunks.clone(),
                predicates: registry.predicates.clone(),
                on_event: registry.on_event.clone(),
                on_runtime_data: registry.on_runtime_data.clone(),
                on_flow_data: registry.on_flow_data.clone(),
                matches: registry.matches.clone(),
                collects: registry.collects.clone(),
                whens: registry.whens.clone(),
                foreaches: registry.foreaches.clone(),
                batches: registry.batches.clone(),
            })),
        }
    }

    /// Export the static topology; handlers are referenced by name only
    pub fn snapshot(&self) -> BluePrintSnapshot {
        let registry = self.inner.lock();
        let mut chunks: Vec<String> = registry.chunks.keys().cloned().collect();
        chunks.sort();
        let mut predicates: Vec<String> = registry.predicates.keys().cloned().collect();
        predicates.sort();
        BluePrintSnapshot {
            name: registry.name.clone(),
            chunks,
            predicates,
            on_event: registry
                .on_event
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            on_runtime_data: registry
                .on_runtime_data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            on_flow_data: registry
                .on_flow_data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            matches: registry
                .matches
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            collects: registry
                .collects
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            whens: registry
                .whens
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            foreaches: registry
                .foreaches
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            batches: registry
                .batches
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Rehydrate a blueprint from a snapshot, re-supplying same-named
    /// handlers and predicates from the bundle.
    pub fn from_snapshot(
        snapshot: &BluePrintSnapshot,
        bundle: &HandlerBundle,
    ) -> Result<BluePrint, BuildError> {
        snapshot.validate()?;
        let mut chunks = HashMap::new();
        for name in &snapshot.chunks {
            let handler = bundle
                .handlers
                .get(name)
                .cloned()
                .ok_or_else(|| BuildError::MissingHandler(name.clone()))?;
            chunks.insert(name.clone(), Chunk::new(name.clone(), handler));
        }
        let mut predicates = HashMap::new();
        for name in &snapshot.predicates {
            let predicate = bundle
                .predicates
                .get(name)
                .cloned()
                .ok_or_else(|| BuildError::MissingPredicate(name.clone()))?;
            predicates.insert(name.clone(), predicate);
        }
        Ok(BluePrint {
            inner: Arc::new(Mutex::new(Registry {
                name: snapshot.name.clone(),
                chunks,
                predicates,
                on_event: snapshot
                    .on_event
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                on_runtime_data: snapshot
                    .on_runtime_data
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                on_flow_data: snapshot
                    .on_flow_data
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                matches: snapshot
                    .matches
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                collects: snapshot
                    .collects
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                whens: snapshot
                    .whens
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                foreaches: snapshot
                    .foreaches
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                batches: snapshot
                    .batches
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })),
        })
    }

    /// Frozen copy handed to a new execution
    pub(crate) fn freeze(&self) -> Arc<FrozenBluePrint> {
        let registry = self.inner.lock();
        Arc::new(FrozenBluePrint {
            chunks: registry.chunks.clone(),
            predicates: registry.predicates.clone(),
            on_event: registry.on_event.clone(),
            on_runtime_data: registry.on_runtime_data.clone(),
            on_flow_data: registry.on_flow_data.clone(),
            matches: registry.matches.clone(),
            collects: registry.collects.clone(),
            whens: registry.whens.clone(),
            foreaches: registry.foreaches.clone(),
            batches: registry.batches.clone(),
        })
    }
}

impl Default for BluePrint {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-execution snapshot of the registries
pub(crate) struct FrozenBluePrint {
    pub chunks: HashMap<String, Chunk>,
    pub predicates: HashMap<String, Predicate>,
    pub on_event: HashMap<String, Vec<Listener>>,
    pub on_runtime_data: HashMap<String, Vec<Listener>>,
    pub on_flow_data: HashMap<String, Vec<Listener>>,
    pub matches: HashMap<String, MatchDecl>,
    pub collects: HashMap<String, CollectDecl>,
    pub whens: HashMap<String, WhenDecl>,
    pub foreaches: HashMap<String, ForEachDecl>,
    pub batches: HashMap<String, BatchDecl>,
}

impl FrozenBluePrint {
    pub fn listeners(&self, kind: TriggerKind, target: &str) -> Vec<Listener> {
        let table = match kind {
            TriggerKind::Event => &self.on_event,
            TriggerKind::RuntimeData => &self.on_runtime_data,
            TriggerKind::FlowData => &self.on_flow_data,
        };
        table.get(target).cloned().unwrap_or_default()
    }
}

/// Named handlers and predicates supplied when loading a snapshot
#[derive(Default)]
pub struct HandlerBundle {
    handlers: HashMap<String, Handler>,
    predicates: HashMap<String, Predicate>,
}

impl HandlerBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, name: impl Into<String>, handler: impl IntoHandler) -> Self {
        self.handlers.insert(name.into(), handler.into_handler());
        self
    }

    pub fn with_predicate(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&EventData) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.insert(name.into(), Arc::new(predicate));
        self
    }
}

/// Case conditions accepted by the builder DSL
pub(crate) enum CondSpec {
    Value(tidecore::Value),
    Predicate(Predicate),
}

impl CondSpec {
    pub(crate) fn register(self, blueprint: &BluePrint) -> CaseCond {
        match self {
            CondSpec::Value(value) => CaseCond::Value(value),
            CondSpec::Predicate(predicate) => {
                let name = auto_name("predicate");
                blueprint
                    .inner
                    .lock()
                    .predicates
                    .insert(name.clone(), predicate);
                CaseCond::Predicate(name)
            }
        }
    }
}
