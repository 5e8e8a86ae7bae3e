use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::errors::{AuthError, Result};

const EVENT_CAPACITY: usize = 64;

/// One key update inside an atomic batch. `None` removes the key.
pub type KeyChange = (String, Option<String>);

/// Change notification emitted once per applied batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub keys: Vec<String>,
}

/// Shared key-value storage area with change notification.
///
/// Every handle onto the same area sees the same data, and every subscriber
/// is told about every write, whichever handle made it.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Apply a batch of changes atomically
    async fn apply(&self, changes: Vec<KeyChange>) -> Result<()>;

    /// Receive an event for each batch that changed at least one value
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// In-memory storage area. Clones share the same area.
#[derive(Debug, Clone)]
pub struct MemoryKeyValueStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `changes` to `entries`, returning the keys whose value changed
pub(crate) fn apply_changes(
    entries: &mut HashMap<String, String>,
    changes: Vec<KeyChange>,
) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in changes {
        let modified = match value {
            Some(v) if entries.get(&key) == Some(&v) => false,
            Some(v) => {
                entries.insert(key.clone(), v);
                true
            }
            None => entries.remove(&key).is_some(),
        };
        if modified {
            changed.push(key);
        }
    }
    changed
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| AuthError::Storage("Lock poisoned".to_string()))?
            .get(key)
            .cloned())
    }

    async fn apply(&self, changes: Vec<KeyChange>) -> Result<()> {
        let changed = {
            let mut entries = self
                .entries
                .write()
                .map_err(|_| AuthError::Storage("Lock poisoned".to_string()))?;
            apply_changes(&mut entries, changes)
        };

        if !changed.is_empty() {
            // No receivers is fine
            let _ = self.events.send(StorageEvent { keys: changed });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
