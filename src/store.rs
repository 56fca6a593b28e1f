//! Durable stores for watch channels and queue items.
//!
//! Both stores keep their documents in memory and, when opened on a data
//! directory, rewrite a JSON snapshot (`channels.json`, `queue.json`) after
//! every mutation. Each mutation touches exactly one document, so every
//! state transition is a single conditional update and no caller needs a
//! lock spanning several calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;
use crate::types::{QueueItem, QueueStatus, WatchChannel, WatchResource};

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get(&self, channel_id: &str) -> Result<Option<WatchChannel>, StoreError>;

    async fn find_by_resource(
        &self,
        resource: &WatchResource,
    ) -> Result<Option<WatchChannel>, StoreError>;

    /// Store `channel`, replacing any channel already registered for the same
    /// resource. Returns the replaced channel.
    async fn put(&self, channel: WatchChannel) -> Result<Option<WatchChannel>, StoreError>;

    async fn remove(&self, channel_id: &str) -> Result<Option<WatchChannel>, StoreError>;

    async fn list(&self) -> Result<Vec<WatchChannel>, StoreError>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert unless a document with the same id exists. Returns whether the
    /// insert happened.
    async fn insert_if_absent(&self, item: QueueItem) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError>;

    /// Up to `limit` items in `status`, oldest first.
    async fn find_by_status(
        &self,
        status: QueueStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Replace the stored item with `item` only if the stored version still
    /// equals `expected_version`. The written document gets
    /// `expected_version + 1`. Returns `false` when the race was lost.
    async fn update_if_version(
        &self,
        item: QueueItem,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<QueueStatus, usize>, StoreError>;
}

/// Serialised, ordered snapshot writes to one JSON file.
struct Snapshot {
    path: Option<PathBuf>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Snapshot {
    fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn read<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// `take` is evaluated after the write lock is held, so the last writer
    /// always persists the newest state.
    async fn write<T, F>(&self, take: F) -> Result<(), StoreError>
    where
        T: Serialize + Send,
        F: FnOnce() -> Vec<T> + Send,
    {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let content = serde_json::to_string_pretty(&take())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn prepare_dir(data_dir: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(data_dir)?;
    Ok(())
}

pub struct JsonChannelStore {
    channels: Mutex<HashMap<String, WatchChannel>>,
    snapshot: Snapshot,
}

impl JsonChannelStore {
    pub fn in_memory() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            snapshot: Snapshot::new(None),
        }
    }

    /// Open (or create) `channels.json` under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        prepare_dir(data_dir)?;
        let path = data_dir.join("channels.json");
        let items: Vec<WatchChannel> = Snapshot::read(&path)?;
        let channels = items.into_iter().map(|c| (c.id.clone(), c)).collect();
        Ok(Self {
            channels: Mutex::new(channels),
            snapshot: Snapshot::new(Some(path)),
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        self.snapshot
            .write(|| {
                let mut items: Vec<WatchChannel> = self.channels.lock().values().cloned().collect();
                items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                items
            })
            .await
    }
}

#[async_trait]
impl ChannelStore for JsonChannelStore {
    async fn get(&self, channel_id: &str) -> Result<Option<WatchChannel>, StoreError> {
        Ok(self.channels.lock().get(channel_id).cloned())
    }

    async fn find_by_resource(
        &self,
        resource: &WatchResource,
    ) -> Result<Option<WatchChannel>, StoreError> {
        Ok(self
            .channels
            .lock()
            .values()
            .find(|c| &c.resource == resource)
            .cloned())
    }

    async fn put(&self, channel: WatchChannel) -> Result<Option<WatchChannel>, StoreError> {
        let replaced = {
            let mut channels = self.channels.lock();
            let previous_id = channels
                .values()
                .find(|c| c.resource == channel.resource)
                .map(|c| c.id.clone());
            let replaced = previous_id.and_then(|id| channels.remove(&id));
            channels.insert(channel.id.clone(), channel);
            replaced
        };
        self.persist().await?;
        Ok(replaced)
    }

    async fn remove(&self, channel_id: &str) -> Result<Option<WatchChannel>, StoreError> {
        let removed = self.channels.lock().remove(channel_id);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<WatchChannel>, StoreError> {
        let mut items: Vec<WatchChannel> = self.channels.lock().values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }
}

pub struct JsonQueueStore {
    items: Mutex<HashMap<String, QueueItem>>,
    snapshot: Snapshot,
}

impl JsonQueueStore {
    pub fn in_memory() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            snapshot: Snapshot::new(None),
        }
    }

    /// Open (or create) `queue.json` under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        prepare_dir(data_dir)?;
        let path = data_dir.join("queue.json");
        let items: Vec<QueueItem> = Snapshot::read(&path)?;
        let items = items.into_iter().map(|i| (i.id.clone(), i)).collect();
        Ok(Self {
            items: Mutex::new(items),
            snapshot: Snapshot::new(Some(path)),
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        self.snapshot
            .write(|| {
                let mut items: Vec<QueueItem> = self.items.lock().values().cloned().collect();
                items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                items
            })
            .await
    }
}

#[async_trait]
impl QueueStore for JsonQueueStore {
    async fn insert_if_absent(&self, item: QueueItem) -> Result<bool, StoreError> {
        let inserted = {
            let mut items = self.items.lock();
            if items.contains_key(&item.id) {
                false
            } else {
                items.insert(item.id.clone(), item);
                true
            }
        };
        if inserted {
            self.persist().await?;
        }
        Ok(inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.items.lock().get(id).cloned())
    }

    async fn find_by_status(
        &self,
        status: QueueStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut matching: Vec<QueueItem> = self
            .items
            .lock()
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn update_if_version(
        &self,
        mut item: QueueItem,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let updated = {
            let mut items = self.items.lock();
            match items.get_mut(&item.id) {
                None => return Err(StoreError::NotFound(item.id)),
                Some(current) if current.version != expected_version => false,
                Some(current) => {
                    item.version = expected_version + 1;
                    *current = item;
                    true
                }
            }
        };
        if updated {
            self.persist().await?;
        }
        Ok(updated)
    }

    async fn count_by_status(&self) -> Result<HashMap<QueueStatus, usize>, StoreError> {
        let mut counts = HashMap::new();
        for item in self.items.lock().values() {
            *counts.entry(item.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn channel(id: &str, resource: WatchResource) -> WatchChannel {
        let now = Utc::now();
        WatchChannel {
            id: id.to_string(),
            resource,
            resource_id: format!("res-{id}"),
            resource_uri: None,
            token: "tok".to_string(),
            expiration: now + Duration::days(7),
            created_at: now,
        }
    }

    fn item(id: &str) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: id.to_string(),
            item_type: "t".to_string(),
            status: QueueStatus::Pending,
            payload: serde_json::json!({"n": 1}),
            attempts: 0,
            created_at: now,
            updated_at: now,
            lease_until: None,
            dedup_key: None,
            last_error: None,
            version: 0,
        }
    }

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("push-ingest-{label}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn put_replaces_channel_for_same_resource() {
        let store = JsonChannelStore::in_memory();
        store
            .put(channel("a", WatchResource::calendar("primary")))
            .await
            .unwrap();
        let replaced = store
            .put(channel("b", WatchResource::calendar("primary")))
            .await
            .unwrap();

        assert_eq!(replaced.map(|c| c.id), Some("a".to_string()));
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "b");
    }

    #[tokio::test]
    async fn channels_survive_reopen() {
        let dir = temp_dir("channels");
        {
            let store = JsonChannelStore::open(&dir).unwrap();
            store
                .put(channel("a", WatchResource::gmail("a@x.com")))
                .await
                .unwrap();
        }
        let reopened = JsonChannelStore::open(&dir).unwrap();
        let found = reopened
            .find_by_resource(&WatchResource::gmail("a@x.com"))
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.id), Some("a".to_string()));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first_document() {
        let store = JsonQueueStore::in_memory();
        assert!(store.insert_if_absent(item("x")).await.unwrap());

        let mut second = item("x");
        second.payload = serde_json::json!({"n": 2});
        assert!(!store.insert_if_absent(second).await.unwrap());

        let stored = store.get("x").await.unwrap().unwrap();
        assert_eq!(stored.payload, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn stale_version_loses_update() {
        let store = JsonQueueStore::in_memory();
        store.insert_if_absent(item("x")).await.unwrap();

        let mut first = item("x");
        first.status = QueueStatus::Leased;
        assert!(store.update_if_version(first, 0).await.unwrap());

        let mut second = item("x");
        second.status = QueueStatus::Leased;
        assert!(!store.update_if_version(second, 0).await.unwrap());

        assert_eq!(store.get("x").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn update_of_missing_item_is_not_found() {
        let store = JsonQueueStore::in_memory();
        let err = store.update_if_version(item("ghost"), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn queue_survives_reopen() {
        let dir = temp_dir("queue");
        {
            let store = JsonQueueStore::open(&dir).unwrap();
            store.insert_if_absent(item("x")).await.unwrap();
        }
        let reopened = JsonQueueStore::open(&dir).unwrap();
        assert!(reopened.get("x").await.unwrap().is_some());
        let _ = std::fs::remove_dir_all(dir);
    }
}
