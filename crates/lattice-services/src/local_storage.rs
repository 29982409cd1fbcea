//! Process-wide string key/value store backing the localStorage.* RPCs.

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct LocalStorage {
    items: Arc<DashMap<String, String>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).map(|v| v.clone())
    }

    /// Stores and echoes the value back, so setItem can answer the caller.
    pub fn set_item(&self, key: &str, value: &str) -> String {
        self.items.insert(key.to_string(), value.to_string());
        value.to_string()
    }

    pub fn remove_item(&self, key: &str) {
        self.items.remove(key);
    }

    pub fn clear(&self) {
        self.items.clear();
    }
}
