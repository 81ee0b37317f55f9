use async_trait::async_trait;

/// Admission control consulted before each event dispatch
///
/// A denial drops the dispatch and its downstream subtree. Guards bound
/// runaway emit loops; they are not part of dispatch correctness.
#[async_trait]
pub trait DispatchGuard: Send + Sync {
    /// `count` is the number of event dispatches so far in this execution,
    /// including the one being admitted.
    async fn allow_emit(&self, event: &str, count: u64) -> bool;
}

/// Guard admitting at most `max` event dispatches per execution
pub struct EmitBudget {
    max: u64,
}

impl EmitBudget {
    pub fn new(max: u64) -> Self {
        Self { max }
    }
}

#[async_trait]
impl DispatchGuard for EmitBudget {
    async fn allow_emit(&self, _event: &str, count: u64) -> bool {
        count <= self.max
    }
}
