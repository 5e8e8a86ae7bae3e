use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fs2::FileExt;
use tokio::fs;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::errors::{AuthError, Result};
use crate::store::{KeyChange, KeyValueStore, StorageEvent, apply_changes};

const EVENT_CAPACITY: usize = 64;

/// File-backed storage area for credentials that outlive the process
///
/// All keys live in a single JSON document so a batch is written with one
/// atomic rename.
///
/// # Directory Structure
/// ```text
/// ~/.config/mockwise/storage/
/// ├── lock                   # Advisory lock file
/// └── storage.json           # Key-value document
/// ```
#[derive(Debug)]
pub struct FileKeyValueStore {
    data_file: PathBuf,
    lock_file: PathBuf,
    /// Last contents read from or written to disk
    cache: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl FileKeyValueStore {
    /// Open (or create) a store rooted at `storage_dir`
    pub async fn open(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        fs::create_dir_all(&storage_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&storage_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let data_file = storage_dir.join("storage.json");
        let lock_file = storage_dir.join("lock");
        let entries = read_document(&data_file).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            data_file,
            lock_file,
            cache: RwLock::new(entries),
            events,
        })
    }

    /// Get default storage directory for the current platform
    pub fn default_storage_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("", "", "mockwise").ok_or_else(|| {
            AuthError::Storage("Could not determine config directory".to_string())
        })?;

        Ok(project_dirs.config_dir().join("storage"))
    }

    /// Acquire an exclusive lock on the storage
    fn acquire_lock(&self) -> Result<std::fs::File> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| AuthError::LockTimeout)?;

        Ok(lock_file)
    }

    async fn write_document(&self, entries: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.data_file.with_extension("tmp");
        fs::write(&temp_path, json).await?;
        fs::File::open(&temp_path).await?.sync_all().await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&temp_path, &self.data_file).await?;
        Ok(())
    }

    /// Re-read the document and emit an event for keys another process
    /// changed since the last read or write.
    pub async fn reload(&self) -> Result<()> {
        let on_disk = read_document(&self.data_file).await?;
        let mut cache = self.cache.write().await;

        let mut changed: Vec<String> = on_disk
            .iter()
            .filter(|(k, v)| cache.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(cache.keys().filter(|k| !on_disk.contains_key(*k)).cloned());

        if changed.is_empty() {
            return Ok(());
        }

        changed.sort();
        tracing::debug!(keys = ?changed, "Storage changed on disk");
        *cache = on_disk;
        drop(cache);

        let _ = self.events.send(StorageEvent { keys: changed });
        Ok(())
    }

    /// Poll the backing file every `every` for writes made by other
    /// processes. The task stops once the store is dropped.
    pub fn watch_external(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = store.reload().await {
                    tracing::warn!("Failed to reload storage file: {}", e);
                }
            }
        })
    }
}

async fn read_document(path: &Path) -> Result<HashMap<String, String>> {
    match fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| AuthError::Storage(format!("Invalid storage document: {}", e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn apply(&self, changes: Vec<KeyChange>) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let mut cache = self.cache.write().await;

        // Start from the disk state so writes from other processes survive
        let mut entries = read_document(&self.data_file).await?;
        let mut changed = apply_changes(&mut entries, changes);
        self.write_document(&entries).await?;

        for (k, v) in cache.iter() {
            if entries.get(k) != Some(v) && !changed.contains(k) {
                changed.push(k.clone());
            }
        }
        for k in entries.keys() {
            if !cache.contains_key(k) && !changed.contains(k) {
                changed.push(k.clone());
            }
        }
        *cache = entries;
        drop(cache);

        if !changed.is_empty() {
            let _ = self.events.send(StorageEvent { keys: changed });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
