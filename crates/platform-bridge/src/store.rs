//! Durable key-value storage trait.

use crate::{BridgeError, BridgeResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// Trait for durable key-value backends.
///
/// Writes are expected to be durable once the call returns.
pub trait KeyValueStore: Send + Sync {
    /// Retrieve a value
    fn get(&self, key: &str) -> BridgeResult<Option<String>>;

    /// Store a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> BridgeResult<()>;

    /// Delete a value, returning whether it existed
    fn remove(&self, key: &str) -> BridgeResult<bool>;

    /// Check if a key exists
    fn has(&self, key: &str) -> BridgeResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Process-local store, used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BridgeResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| BridgeError::Storage("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BridgeResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> BridgeResult<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
        assert!(store.has("k").unwrap());

        assert!(store.remove("k").unwrap());
        assert!(!store.remove("k").unwrap());
        assert!(!store.has("k").unwrap());
    }
}
