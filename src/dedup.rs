//! Bounded per-session set of recently seen message ids.
//!
//! Eviction is by insertion order: once the set grows past its maximum the
//! oldest keys go first, regardless of how recently they were looked up.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::config::DedupConfig;
use crate::error::DatabaseError;
use crate::store::Database;

#[derive(Default)]
struct Inner {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

pub struct DedupStore {
    session_id: String,
    db: Arc<dyn Database>,
    max_entries: usize,
    inner: Mutex<Inner>,
}

impl DedupStore {
    pub fn new(session_id: &str, db: Arc<dyn Database>, max_entries: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            db,
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Build a store pre-loaded with the newest persisted keys. Keys older
    /// than the retention window are pruned first.
    pub async fn load(
        session_id: &str,
        db: Arc<dyn Database>,
        config: &DedupConfig,
    ) -> Result<Self, DatabaseError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(config.retention).unwrap_or(chrono::Duration::days(3));
        let pruned = db.prune_dedup_keys(session_id, cutoff).await?;
        let keys = db.load_dedup_keys(session_id, config.max_entries).await?;

        let store = Self::new(session_id, db, config.max_entries);
        {
            let mut inner = store.lock();
            for key in keys {
                store.insert_locked(&mut inner, key);
            }
        }
        tracing::debug!(session = %session_id, pruned, loaded = store.len(), "Dedup cache loaded");
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert_locked(&self, inner: &mut Inner, key: String) -> bool {
        if !inner.keys.insert(key.clone()) {
            return false;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.max_entries {
            if let Some(old) = inner.order.pop_front() {
                inner.keys.remove(&old);
            }
        }
        true
    }

    pub fn has(&self, key: &str) -> bool {
        self.lock().keys.contains(key)
    }

    /// Record a key. Returns `true` when it was new. New keys are persisted
    /// in the background; a failed write is logged and not retried.
    pub fn add(&self, key: &str) -> bool {
        let added = {
            let mut inner = self.lock();
            self.insert_locked(&mut inner, key.to_string())
        };
        if added {
            let db = Arc::clone(&self.db);
            let session_id = self.session_id.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = db.insert_dedup_key(&session_id, &key).await {
                    tracing::warn!(
                        session = %session_id,
                        key = %key,
                        "Failed to persist dedup key: {e}"
                    );
                }
            });
        }
        added
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use std::time::Duration;

    async fn test_db() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn has_after_add() {
        let store = DedupStore::new("s1", test_db().await, 10);
        assert!(!store.has("m1"));
        assert!(store.add("m1"));
        assert!(store.has("m1"));
        assert!(!store.add("m1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn evicts_oldest_inserted_first() {
        let store = DedupStore::new("s1", test_db().await, 3);
        for k in ["a", "b", "c"] {
            store.add(k);
        }
        // Looking up "a" does not refresh it.
        assert!(store.has("a"));
        store.add("d");
        assert!(!store.has("a"));
        assert!(store.has("b") && store.has("c") && store.has("d"));
    }

    #[tokio::test]
    async fn reload_sees_persisted_keys() {
        let db = test_db().await;
        let store = DedupStore::new("s1", Arc::clone(&db), 10);
        store.add("persisted");

        // Persistence is fire-and-forget; give it a moment.
        for _ in 0..50 {
            if !db.load_dedup_keys("s1", 10).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let reloaded = DedupStore::load("s1", db, &DedupConfig::default())
            .await
            .unwrap();
        assert!(reloaded.has("persisted"));
        assert!(!reloaded.has("other"));
    }
}
