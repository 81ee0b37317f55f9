use crate::Value;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Key-value store backing runtime_data and flow_data
///
/// Writers race freely; the last write wins. Change notification is the
/// owner's concern, the store only reports the post-write value.
#[derive(Default)]
pub struct DataStore {
    inner: RwLock<HashMap<String, Value>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Set a key, returning the stored value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Value {
        let value = value.into();
        self.inner.write().insert(key.into(), value.clone());
        value
    }

    /// Append to an array under `key`, returning the stored array
    ///
    /// A missing key becomes a one-element array; a non-array value is
    /// wrapped as `[old, new]`.
    pub fn append(&self, key: impl Into<String>, value: impl Into<Value>) -> Value {
        let key = key.into();
        let value = value.into();
        let mut inner = self.inner.write();
        let entry = inner.entry(key).or_insert_with(|| Value::Array(Vec::new()));
        match &mut *entry {
            Value::Array(items) => items.push(value),
            other => {
                let old = other.clone();
                *other = Value::Array(vec![old, value]);
            }
        }
        entry.clone()
    }

    /// Remove a key, returning the previous value if any
    pub fn del(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}
