use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One nesting level: which iteration of an enclosing loop produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub mark: String,
    pub index: usize,
}

/// Stack of nesting layers carried by every event
///
/// Join and wait state is keyed by the full layer path so each nesting level
/// gets its own independent round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStack(Vec<Layer>);

impl LayerStack {
    pub fn root() -> Self {
        Self::default()
    }

    /// A copy of this stack with one more layer pushed
    pub fn pushed(&self, index: usize) -> Self {
        let mut layers = self.0.clone();
        layers.push(Layer {
            mark: Uuid::new_v4().simple().to_string(),
            index,
        });
        LayerStack(layers)
    }

    /// A copy of this stack with the top layer popped
    pub fn popped(&self) -> Self {
        let mut layers = self.0.clone();
        layers.pop();
        LayerStack(layers)
    }

    pub fn top(&self) -> Option<&Layer> {
        self.0.last()
    }

    /// Layer one below the top
    pub fn parent(&self) -> Option<&Layer> {
        self.0.len().checked_sub(2).and_then(|i| self.0.get(i))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Stable key identifying this nesting context
    pub fn path(&self) -> String {
        if self.0.is_empty() {
            "root".to_string()
        } else {
            self.0
                .iter()
                .map(|l| l.mark.as_str())
                .collect::<Vec<_>>()
                .join("/")
        }
    }
}
