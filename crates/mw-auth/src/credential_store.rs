//! Single source of truth for the active [`Credential`].
//!
//! The store keeps a snapshot of the credential in a `watch` channel so reads
//! never block, writes through to a durable or ephemeral key-value area
//! depending on [`Credential::persistent`], and follows writes made by other
//! contexts sharing those areas.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::keys;
use crate::credential::Credential;
use crate::errors::{AuthError, Result};
use crate::store::{KeyChange, KeyValueStore, MemoryKeyValueStore, StorageEvent};

/// Owner of the active credential for one context (tab or process)
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

struct Inner {
    durable: Arc<dyn KeyValueStore>,
    ephemeral: Arc<dyn KeyValueStore>,
    current: watch::Sender<Option<Credential>>,
    listeners: Vec<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("current", &*self.inner.current.borrow())
            .finish()
    }
}

impl CredentialStore {
    /// Open a store over a durable and an ephemeral area.
    ///
    /// Must be called from within a tokio runtime: one listener task per
    /// area follows changes made by other contexts.
    pub async fn open(
        durable: Arc<dyn KeyValueStore>,
        ephemeral: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        // Subscribe before the initial read so no write slips between them
        let durable_events = durable.subscribe();
        let ephemeral_events = ephemeral.subscribe();

        let initial = load(ephemeral.as_ref(), durable.as_ref()).await?;
        let (current, _) = watch::channel(initial);

        let listeners = vec![
            spawn_listener(
                durable_events,
                current.clone(),
                durable.clone(),
                ephemeral.clone(),
            ),
            spawn_listener(
                ephemeral_events,
                current.clone(),
                durable.clone(),
                ephemeral.clone(),
            ),
        ];

        Ok(Self {
            inner: Arc::new(Inner {
                durable,
                ephemeral,
                current,
                listeners,
            }),
        })
    }

    /// Store backed by two fresh in-memory areas
    pub async fn in_memory() -> Result<Self> {
        Self::open(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryKeyValueStore::new()),
        )
        .await
    }

    /// Current credential snapshot
    pub fn get(&self) -> Option<Credential> {
        self.inner.current.borrow().clone()
    }

    /// Make `credential` the active one in every context
    pub async fn set(&self, credential: Credential) -> Result<()> {
        let (target, other) = if credential.persistent {
            (&self.inner.durable, &self.inner.ephemeral)
        } else {
            (&self.inner.ephemeral, &self.inner.durable)
        };

        target
            .apply(vec![
                (
                    keys::AUTH_TOKEN.to_string(),
                    Some(credential.access_token.clone()),
                ),
                (
                    keys::REFRESH_TOKEN.to_string(),
                    Some(credential.refresh_token.clone()),
                ),
                (
                    keys::AUTH_EXPIRES_AT.to_string(),
                    Some(credential.expires_at.to_rfc3339()),
                ),
            ])
            .await?;
        // Written second so other contexts never observe an empty store mid-update
        other.apply(removals()).await?;

        debug!(
            expires_at = %credential.expires_at,
            persistent = credential.persistent,
            "Credential stored"
        );
        publish(&self.inner.current, Some(credential));
        Ok(())
    }

    /// Remove the credential from every area (logout)
    pub async fn clear(&self) -> Result<()> {
        self.inner.ephemeral.apply(removals()).await?;
        self.inner.durable.apply(removals()).await?;

        debug!("Credential cleared");
        publish(&self.inner.current, None);
        Ok(())
    }

    /// Observe credential changes from this and every other context.
    ///
    /// The receiver only wakes when the value actually changed. Dropping it
    /// unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.inner.current.subscribe()
    }
}

fn removals() -> Vec<KeyChange> {
    [keys::AUTH_TOKEN, keys::REFRESH_TOKEN, keys::AUTH_EXPIRES_AT]
        .into_iter()
        .map(|k| (k.to_string(), None))
        .collect()
}

/// Replace the snapshot, waking subscribers only on an actual change
fn publish(current: &watch::Sender<Option<Credential>>, next: Option<Credential>) {
    current.send_if_modified(|value| {
        if *value == next {
            false
        } else {
            *value = next;
            true
        }
    });
}

/// Read the credential, preferring the ephemeral area
async fn load(
    ephemeral: &dyn KeyValueStore,
    durable: &dyn KeyValueStore,
) -> Result<Option<Credential>> {
    if let Some(credential) = load_from(ephemeral, false).await? {
        return Ok(Some(credential));
    }
    load_from(durable, true).await
}

async fn load_from(area: &dyn KeyValueStore, persistent: bool) -> Result<Option<Credential>> {
    let (Some(access_token), Some(refresh_token), Some(expires_at)) = (
        area.get(keys::AUTH_TOKEN).await?,
        area.get(keys::REFRESH_TOKEN).await?,
        area.get(keys::AUTH_EXPIRES_AT).await?,
    ) else {
        return Ok(None);
    };

    let expires_at = DateTime::parse_from_rfc3339(&expires_at)
        .map_err(|e| AuthError::Storage(format!("Invalid {}: {}", keys::AUTH_EXPIRES_AT, e)))?
        .with_timezone(&Utc);

    Ok(Some(Credential {
        access_token,
        refresh_token,
        expires_at,
        persistent,
    }))
}

fn spawn_listener(
    mut events: broadcast::Receiver<StorageEvent>,
    current: watch::Sender<Option<Credential>>,
    durable: Arc<dyn KeyValueStore>,
    ephemeral: Arc<dyn KeyValueStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }

            match load(ephemeral.as_ref(), durable.as_ref()).await {
                Ok(next) => publish(&current, next),
                Err(e) => warn!("Failed to reload credential after storage change: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn credential(token: &str, persistent: bool) -> Credential {
        Credential {
            access_token: token.to_string(),
            refresh_token: format!("{token}-refresh"),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
            persistent,
        }
    }

    /// Two contexts sharing the same storage areas
    async fn two_tabs() -> (CredentialStore, CredentialStore) {
        let durable = Arc::new(MemoryKeyValueStore::new());
        let ephemeral = Arc::new(MemoryKeyValueStore::new());
        let a = CredentialStore::open(durable.clone(), ephemeral.clone())
            .await
            .unwrap();
        let b = CredentialStore::open(durable, ephemeral).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_set_get_clear() {
        let store = CredentialStore::in_memory().await.unwrap();
        assert!(store.get().is_none());

        let cred = credential("t1", false);
        store.set(cred.clone()).await.unwrap();
        let loaded = store.get().unwrap();
        assert_eq!(loaded.access_token, "t1");
        // RFC 3339 keeps sub-second precision
        assert_eq!(loaded.expires_at, cred.expires_at);

        store.clear().await.unwrap();
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn test_persistent_flag_selects_area() {
        let durable = Arc::new(MemoryKeyValueStore::new());
        let ephemeral = Arc::new(MemoryKeyValueStore::new());
        let store = CredentialStore::open(durable.clone(), ephemeral.clone())
            .await
            .unwrap();

        store.set(credential("t1", true)).await.unwrap();
        assert!(durable.get(keys::AUTH_TOKEN).await.unwrap().is_some());
        assert!(ephemeral.get(keys::AUTH_TOKEN).await.unwrap().is_none());

        store.set(credential("t2", false)).await.unwrap();
        assert!(durable.get(keys::AUTH_TOKEN).await.unwrap().is_none());
        assert_eq!(
            ephemeral.get(keys::AUTH_TOKEN).await.unwrap().as_deref(),
            Some("t2")
        );
    }

    #[tokio::test]
    async fn test_restores_existing_credential() {
        let durable = Arc::new(MemoryKeyValueStore::new());
        let ephemeral = Arc::new(MemoryKeyValueStore::new());
        let first = CredentialStore::open(durable.clone(), ephemeral.clone())
            .await
            .unwrap();
        first.set(credential("t1", true)).await.unwrap();

        let second = CredentialStore::open(durable, ephemeral).await.unwrap();
        let restored = second.get().unwrap();
        assert_eq!(restored.access_token, "t1");
        assert!(restored.persistent);
    }

    #[tokio::test]
    async fn test_cross_context_set_is_observed() {
        let (tab_a, tab_b) = two_tabs().await;
        let mut changes = tab_b.subscribe();

        tab_a.set(credential("t1", false)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), changes.changed())
            .await
            .expect("change notification")
            .unwrap();
        assert_eq!(
            changes.borrow_and_update().as_ref().unwrap().access_token,
            "t1"
        );
        assert_eq!(tab_b.get().unwrap().access_token, "t1");
    }

    #[tokio::test]
    async fn test_cross_context_clear_is_observed() {
        let (tab_a, tab_b) = two_tabs().await;
        tab_a.set(credential("t1", true)).await.unwrap();

        let mut changes = tab_b.subscribe();
        tokio::time::timeout(Duration::from_secs(1), changes.wait_for(|c| c.is_some()))
            .await
            .expect("set observed")
            .unwrap();

        tab_a.clear().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), changes.wait_for(|c| c.is_none()))
            .await
            .expect("clear observed")
            .unwrap();
        assert!(tab_b.get().is_none());
    }

    #[tokio::test]
    async fn test_identical_write_does_not_notify() {
        let store = CredentialStore::in_memory().await.unwrap();
        let cred = credential("t1", false);
        store.set(cred.clone()).await.unwrap();

        let mut changes = store.subscribe();
        store.set(cred).await.unwrap();
        tokio::task::yield_now().await;

        assert!(!changes.has_changed().unwrap());
    }
}
