//! InMemoryRecordStore - 開発・テスト用の RecordStore
//!
//! revision を単調増加させ、`compare_and_swap` で古い書き込みを拒否します。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::ports::{Record, RecordStore, StoreError, Versioned};

/// In-memory keyed store of versioned records.
pub struct InMemoryRecordStore<R: Record> {
    records: Arc<Mutex<HashMap<R::Key, Versioned<R>>>>,
}

impl<R: Record> InMemoryRecordStore<R> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl<R: Record> Default for InMemoryRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for InMemoryRecordStore<R> {
    async fn get(&self, key: R::Key) -> Result<Option<Versioned<R>>, StoreError> {
        Ok(self.records.lock().await.get(&key).cloned())
    }

    async fn insert(&self, record: R) -> Result<Versioned<R>, StoreError> {
        let mut records = self.records.lock().await;
        let key = record.key();
        if records.contains_key(&key) {
            return Err(StoreError::already_exists::<R>(key));
        }
        let versioned = Versioned {
            revision: 1,
            value: record,
        };
        records.insert(key, versioned.clone());
        Ok(versioned)
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: R,
    ) -> Result<Versioned<R>, StoreError> {
        let mut records = self.records.lock().await;
        let key = record.key();
        let Some(current) = records.get_mut(&key) else {
            return Err(StoreError::not_found::<R>(key));
        };
        if current.revision != expected_revision {
            return Err(StoreError::RevisionMismatch {
                kind: R::KIND,
                key: key.to_string(),
                expected: expected_revision,
                actual: current.revision,
            });
        }
        *current = Versioned {
            revision: expected_revision + 1,
            value: record,
        };
        Ok(current.clone())
    }

    async fn delete(&self, key: R::Key) -> Result<Option<R>, StoreError> {
        Ok(self.records.lock().await.remove(&key).map(|v| v.value))
    }

    async fn keys(&self) -> Result<Vec<R::Key>, StoreError> {
        Ok(self.records.lock().await.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskId, TaskType};
    use chrono::Utc;
    use ulid::Ulid;

    fn task() -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("import-show"),
            serde_json::json!({}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = InMemoryRecordStore::<Task>::new();
        let t = task();
        let stored = store.insert(t.clone()).await.unwrap();
        assert_eq!(stored.revision, 1);

        let fetched = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(fetched.value, t);
        assert_eq!(store.keys().await.unwrap(), vec![t.id]);
    }

    #[tokio::test]
    async fn double_insert_is_rejected() {
        let store = InMemoryRecordStore::<Task>::new();
        let t = task();
        store.insert(t.clone()).await.unwrap();
        assert!(matches!(
            store.insert(t).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn stale_revision_loses() {
        let store = InMemoryRecordStore::<Task>::new();
        let t = task();
        store.insert(t.clone()).await.unwrap();

        let mut a = t.clone();
        a.progress = 10;
        let mut b = t.clone();
        b.progress = 20;

        assert_eq!(store.compare_and_swap(1, a).await.unwrap().revision, 2);
        let err = store.compare_and_swap(1, b).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RevisionMismatch { expected: 1, actual: 2, .. }
        ));
        assert_eq!(store.get(t.id).await.unwrap().unwrap().value.progress, 10);
    }

    #[tokio::test]
    async fn delete_returns_the_record_once() {
        let store = InMemoryRecordStore::<Task>::new();
        let t = task();
        store.insert(t.clone()).await.unwrap();
        assert!(store.delete(t.id).await.unwrap().is_some());
        assert!(store.delete(t.id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }
}
