use crate::blueprint::{BluePrint, CondSpec};
use crate::chunk::{auto_name, Chunk, Handler, IntoHandler};
use crate::EventData;
use std::collections::HashSet;
use tidecore::{
    BatchBranch, BatchDecl, BuildError, CaseDecl, CollectMode, ForEachDecl, KeyRef, ListenerAction,
    MatchDecl, TriggerKind, WhenDecl, WhenMode,
};

/// Options for a `for_each` fan-out
#[derive(Debug, Clone, Copy, Default)]
pub struct ForEachOptions {
    /// Deliver `[index, element]` to the body instead of the bare element
    pub with_index: bool,
    /// Upper bound on concurrently dispatched elements
    pub concurrency: Option<usize>,
}

enum Frame {
    Match {
        id: String,
        end_event: String,
        branch_open: bool,
        has_else: bool,
    },
    ForEach {
        id: String,
        end_event: String,
    },
}

impl Frame {
    fn opener(&self) -> &'static str {
        match self {
            Frame::Match { .. } => "match_case",
            Frame::ForEach { .. } => "for_each",
        }
    }
}

/// Chainable graph builder over a blueprint
///
/// Carries a cursor (the trigger new listeners attach to) and a scope stack
/// for open `match_case` / `for_each` constructs. Every call validates
/// eagerly and fails with a [`BuildError`] rather than producing a graph
/// that misbehaves at dispatch time.
pub struct Process {
    blueprint: BluePrint,
    cursor: (TriggerKind, String),
    scopes: Vec<Frame>,
}

impl Process {
    pub(crate) fn at(blueprint: BluePrint, kind: TriggerKind, target: impl Into<String>) -> Self {
        Self {
            blueprint,
            cursor: (kind, target.into()),
            scopes: Vec::new(),
        }
    }

    pub(crate) fn waiting_on(blueprint: BluePrint, keys: Vec<KeyRef>, mode: WhenMode) -> Self {
        let id = auto_name("when");
        let event = format!("@when/{id}");
        blueprint.insert_when(WhenDecl {
            id: id.clone(),
            mode,
            keys: keys.clone(),
            event: event.clone(),
        });
        for key in keys {
            blueprint.add_listener(key.kind, key.key, ListenerAction::WhenKeys { id: id.clone() });
        }
        Self::at(blueprint, TriggerKind::Event, event)
    }

    /// Trigger the cursor currently points at
    pub fn cursor(&self) -> (TriggerKind, &str) {
        (self.cursor.0, &self.cursor.1)
    }

    fn check_chain_allowed(&self, call: &'static str) -> Result<(), BuildError> {
        if let Some(Frame::Match {
            branch_open: false, ..
        }) = self.scopes.last()
        {
            return Err(BuildError::InvalidCall {
                call,
                reason: "open a case before chaining inside 'match_case'".to_string(),
            });
        }
        Ok(())
    }

    fn attach(&self, action: ListenerAction) {
        self.blueprint
            .add_listener(self.cursor.0, self.cursor.1.clone(), action);
    }

    // --- linear chaining ---

    /// Append a handler and advance the cursor to its completion trigger
    pub fn to(self, handler: impl IntoHandler) -> Result<Self, BuildError> {
        self.check_chain_allowed("to")?;
        let chunk = self.blueprint.add_anonymous_chunk(handler);
        self.advance_to(&chunk)
    }

    /// Append a registered chunk and advance to its completion trigger
    pub fn to_chunk(self, chunk: &Chunk) -> Result<Self, BuildError> {
        self.check_chain_allowed("to_chunk")?;
        self.blueprint.ensure_chunk(chunk);
        self.advance_to(chunk)
    }

    fn advance_to(mut self, chunk: &Chunk) -> Result<Self, BuildError> {
        self.attach(ListenerAction::RunChunk {
            chunk: chunk.name().to_string(),
        });
        self.cursor = (TriggerKind::Event, chunk.trigger().to_string());
        Ok(self)
    }

    /// Fork a handler off the current trigger without moving the cursor
    pub fn side_branch(self, handler: impl IntoHandler) -> Result<Self, BuildError> {
        self.check_chain_allowed("side_branch")?;
        let chunk = self.blueprint.add_anonymous_chunk(handler);
        self.attach(ListenerAction::RunChunk {
            chunk: chunk.name().to_string(),
        });
        Ok(self)
    }

    /// Mark the current trigger as the default result sink
    ///
    /// Fails while a `match_case` or `for_each` scope is still open.
    pub fn end(self) -> Result<Self, BuildError> {
        if let Some(frame) = self.scopes.last() {
            return Err(BuildError::UnclosedScope {
                call: "end",
                scope: frame.opener(),
            });
        }
        self.attach(ListenerAction::ResultSink);
        Ok(self)
    }

    // --- conditional branching ---

    /// Open a conditional scope; follow with `case` / `case_pred` /
    /// `case_else` and close with `end_match`.
    pub fn match_case(mut self) -> Result<Self, BuildError> {
        self.check_chain_allowed("match_case")?;
        let id = auto_name("match");
        let end_event = format!("@match/{id}/end");
        self.blueprint.insert_match(MatchDecl {
            id: id.clone(),
            cases: Vec::new(),
            else_event: None,
            end_event: end_event.clone(),
        });
        self.attach(ListenerAction::Match { id: id.clone() });
        self.scopes.push(Frame::Match {
            id,
            end_event,
            branch_open: false,
            has_else: false,
        });
        Ok(self)
    }

    /// Open a case taken when the incoming value equals `expected`
    pub fn case(self, expected: impl Into<tidecore::Value>) -> Result<Self, BuildError> {
        self.open_case("case", CondSpec::Value(expected.into()))
    }

    /// Open a case taken when the predicate holds for the incoming context
    pub fn case_pred(
        self,
        predicate: impl Fn(&EventData) -> bool + Send + Sync + 'static,
    ) -> Result<Self, BuildError> {
        self.open_case("case_pred", CondSpec::Predicate(std::sync::Arc::new(predicate)))
    }

    fn open_case(mut self, call: &'static str, cond: CondSpec) -> Result<Self, BuildError> {
        let Some(Frame::Match { id, has_else, .. }) = self.scopes.last() else {
            return Err(BuildError::UnbalancedScope {
                opener: "match_case",
                closer: call,
            });
        };
        if *has_else {
            return Err(BuildError::InvalidCall {
                call,
                reason: "'case_else' already closes this conditional".to_string(),
            });
        }
        let id = id.clone();
        self.close_open_branch();
        let cond = cond.register(&self.blueprint);
        let event = self
            .blueprint
            .update_match(&id, |decl| {
                let event = format!("@match/{id}/case{}", decl.cases.len());
                decl.cases.push(CaseDecl {
                    cond,
                    event: event.clone(),
                });
                event
            })
            .ok_or_else(|| BuildError::InvalidCall {
                call,
                reason: "conditional declaration missing".to_string(),
            })?;
        if let Some(Frame::Match { branch_open, .. }) = self.scopes.last_mut() {
            *branch_open = true;
        }
        self.cursor = (TriggerKind::Event, event);
        Ok(self)
    }

    /// Open the fallback branch taken when no case matched
    pub fn case_else(mut self) -> Result<Self, BuildError> {
        let Some(Frame::Match { id, has_else, .. }) = self.scopes.last() else {
            return Err(BuildError::UnbalancedScope {
                opener: "match_case",
                closer: "case_else",
            });
        };
        if *has_else {
            return Err(BuildError::InvalidCall {
                call: "case_else",
                reason: "'case_else' already declared".to_string(),
            });
        }
        let id = id.clone();
        self.close_open_branch();
        let event = format!("@match/{id}/else");
        self.blueprint
            .update_match(&id, |decl| decl.else_event = Some(event.clone()));
        if let Some(Frame::Match {
            branch_open,
            has_else,
            ..
        }) = self.scopes.last_mut()
        {
            *branch_open = true;
            *has_else = true;
        }
        self.cursor = (TriggerKind::Event, event);
        Ok(self)
    }

    /// Close the conditional; all branches merge at its end event
    pub fn end_match(mut self) -> Result<Self, BuildError> {
        let Some(Frame::Match { .. }) = self.scopes.last() else {
            return Err(BuildError::UnbalancedScope {
                opener: "match_case",
                closer: "end_match",
            });
        };
        self.close_open_branch();
        if let Some(Frame::Match { end_event, .. }) = self.scopes.pop() {
            self.cursor = (TriggerKind::Event, end_event);
        }
        Ok(self)
    }

    fn close_open_branch(&mut self) {
        let pending = match self.scopes.last_mut() {
            Some(Frame::Match {
                end_event,
                branch_open,
                ..
            }) if *branch_open => {
                *branch_open = false;
                Some(end_event.clone())
            }
            _ => None,
        };
        if let Some(event) = pending {
            self.attach(ListenerAction::Forward { event });
        }
    }

    // --- if/elif/else sugar ---

    pub fn if_eq(self, expected: impl Into<tidecore::Value>) -> Result<Self, BuildError> {
        self.match_case()?.case(expected)
    }

    pub fn if_cond(
        self,
        predicate: impl Fn(&EventData) -> bool + Send + Sync + 'static,
    ) -> Result<Self, BuildError> {
        self.match_case()?.case_pred(predicate)
    }

    pub fn elif_eq(self, expected: impl Into<tidecore::Value>) -> Result<Self, BuildError> {
        self.case(expected)
    }

    pub fn elif_cond(
        self,
        predicate: impl Fn(&EventData) -> bool + Send + Sync + 'static,
    ) -> Result<Self, BuildError> {
        self.case_pred(predicate)
    }

    pub fn else_cond(self) -> Result<Self, BuildError> {
        self.case_else()
    }

    pub fn end_cond(self) -> Result<Self, BuildError> {
        self.end_match()
    }

    // --- joins ---

    /// Report the chain value into `(group, slot)`; the cursor moves to the
    /// group's fire event.
    pub fn collect(
        mut self,
        group: impl Into<String>,
        slot: impl Into<String>,
        mode: CollectMode,
    ) -> Result<Self, BuildError> {
        self.check_chain_allowed("collect")?;
        let group = group.into();
        let slot = slot.into();
        let event = self.blueprint.insert_collect_slot(&group, &slot, mode)?;
        self.attach(ListenerAction::Collect { group, slot });
        self.cursor = (TriggerKind::Event, event);
        Ok(self)
    }

    /// Fan declared branches out against the chain value and join them into
    /// a declaration-ordered object.
    pub fn batch<S: Into<String>>(
        mut self,
        branches: impl IntoIterator<Item = (S, Handler)>,
        concurrency: Option<usize>,
    ) -> Result<Self, BuildError> {
        self.check_chain_allowed("batch")?;
        let id = auto_name("batch");
        let event = format!("@batch/{id}");
        let mut seen = HashSet::new();
        let mut declared = Vec::new();
        for (name, handler) in branches {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(BuildError::DuplicateBranch(name));
            }
            let chunk = self.blueprint.add_boxed_chunk(handler);
            declared.push(BatchBranch {
                name,
                chunk: chunk.name().to_string(),
            });
        }
        self.blueprint.insert_batch(BatchDecl {
            id: id.clone(),
            branches: declared,
            concurrency,
            event: event.clone(),
        });
        self.attach(ListenerAction::Batch { id });
        self.cursor = (TriggerKind::Event, event);
        Ok(self)
    }

    /// Open a per-element scope over the chain value; close with
    /// `end_for_each` or `end_for_each_sorted`.
    pub fn for_each(self) -> Result<Self, BuildError> {
        self.for_each_with(ForEachOptions::default())
    }

    pub fn for_each_with(mut self, options: ForEachOptions) -> Result<Self, BuildError> {
        self.check_chain_allowed("for_each")?;
        let id = auto_name("foreach");
        let send_event = format!("@foreach/{id}/send");
        let end_event = format!("@foreach/{id}/end");
        self.blueprint.insert_foreach(ForEachDecl {
            id: id.clone(),
            send_event: send_event.clone(),
            end_event: end_event.clone(),
            with_index: options.with_index,
            sort_by_index: false,
            concurrency: options.concurrency,
        });
        self.attach(ListenerAction::ForEach { id: id.clone() });
        self.scopes.push(Frame::ForEach { id, end_event });
        self.cursor = (TriggerKind::Event, send_event);
        Ok(self)
    }

    /// Close the loop scope, joining element results in completion order
    pub fn end_for_each(self) -> Result<Self, BuildError> {
        self.close_for_each("end_for_each", false)
    }

    /// Close the loop scope, joining element results by element index
    pub fn end_for_each_sorted(self) -> Result<Self, BuildError> {
        self.close_for_each("end_for_each_sorted", true)
    }

    fn close_for_each(mut self, closer: &'static str, sorted: bool) -> Result<Self, BuildError> {
        let Some(Frame::ForEach { id, .. }) = self.scopes.last() else {
            return Err(BuildError::UnbalancedScope {
                opener: "for_each",
                closer,
            });
        };
        let id = id.clone();
        if sorted {
            self.blueprint
                .update_foreach(&id, |decl| decl.sort_by_index = true);
        }
        self.attach(ListenerAction::EndForEach { id });
        if let Some(Frame::ForEach { end_event, .. }) = self.scopes.pop() {
            self.cursor = (TriggerKind::Event, end_event);
        }
        Ok(self)
    }
}
