//! MetadataStore: the durable `poolGroupGuid -> PoolRecord` map.
//!
//! Writes are whole-file replacements (write to a sibling temp file, then
//! rename) so a crash mid-write never leaves a half-written primary file.
//! A file that fails to parse is quarantined rather than overwritten in
//! place, so a corrupt write is never silently lost.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{MetadataCollection, PoolRecord};
use crate::error::Result;

pub struct MetadataStore {
    path: PathBuf,
    collection: RwLock<MetadataCollection>,
}

impl MetadataStore {
    /// Loads the collection from `path`, creating it if absent and
    /// quarantining it if present but unparseable.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let collection = match tokio::fs::read_to_string(&path).await {
            Err(_) => {
                info!(path = %path.display(), "metadata file absent, creating empty collection");
                let fresh = MetadataCollection::default();
                write_collection(&path, &fresh).await?;
                fresh
            }
            Ok(raw) => match serde_json::from_str::<MetadataCollection>(&raw) {
                Ok(collection) => collection,
                Err(e) => {
                    let quarantine = quarantine_path(&path);
                    warn!(
                        path = %path.display(),
                        quarantine = %quarantine.display(),
                        error = %e,
                        "metadata file corrupt, quarantining"
                    );
                    tokio::fs::rename(&path, &quarantine).await.ok();
                    let fresh = MetadataCollection::default();
                    write_collection(&path, &fresh).await?;
                    fresh
                }
            },
        };

        Ok(Self {
            path,
            collection: RwLock::new(collection),
        })
    }

    /// Removes any existing entry with the same `poolGroupGuid` or the same
    /// `lastMdDeviceName` (preventing stale duplicates), appends, bumps
    /// `lastUpdated`, and persists.
    pub async fn save(&self, record: PoolRecord) -> Result<()> {
        let mut collection = self.collection.write().await;
        collection.pools.retain(|existing| {
            existing.pool_group_guid != record.pool_group_guid
                && !(record.last_md_device_name.is_some()
                    && existing.last_md_device_name == record.last_md_device_name)
        });
        collection.pools.push(record);
        collection.last_updated = Utc::now();
        write_collection(&self.path, &collection).await
    }

    pub async fn remove(&self, pool_group_guid: Uuid) -> Result<bool> {
        let mut collection = self.collection.write().await;
        let before = collection.pools.len();
        collection.pools.retain(|r| r.pool_group_guid != pool_group_guid);
        let removed = collection.pools.len() != before;
        if removed {
            collection.last_updated = Utc::now();
            write_collection(&self.path, &collection).await?;
        }
        Ok(removed)
    }

    pub async fn remove_all(&self) -> Result<()> {
        let mut collection = self.collection.write().await;
        collection.pools.clear();
        collection.last_updated = Utc::now();
        write_collection(&self.path, &collection).await
    }

    pub async fn get_by_guid(&self, pool_group_guid: Uuid) -> Option<PoolRecord> {
        self.collection
            .read()
            .await
            .pools
            .iter()
            .find(|r| r.pool_group_guid == pool_group_guid)
            .cloned()
    }

    pub async fn get_by_md_device_name(&self, name: &str) -> Option<PoolRecord> {
        self.collection
            .read()
            .await
            .pools
            .iter()
            .find(|r| r.last_md_device_name.as_deref() == Some(name))
            .cloned()
    }

    pub async fn all(&self) -> Vec<PoolRecord> {
        self.collection.read().await.pools.clone()
    }
}

async fn write_collection(path: &Path, collection: &MetadataCollection) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(collection)?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn quarantine_path(path: &Path) -> PathBuf {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    let mut quarantine = path.as_os_str().to_owned();
    quarantine.push(format!(".corrupt.{ts}"));
    PathBuf::from(quarantine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexSet;
    use std::collections::BTreeMap;

    fn sample_record(guid: Uuid, md_name: &str) -> PoolRecord {
        let mut serials = IndexSet::new();
        serials.insert("S1".to_string());
        PoolRecord::new(guid, "pool1".into(), serials, BTreeMap::new())
            .tap_md(md_name)
    }

    trait TapMd {
        fn tap_md(self, md_name: &str) -> Self;
    }
    impl TapMd for PoolRecord {
        fn tap_md(mut self, md_name: &str) -> Self {
            self.last_md_device_name = Some(md_name.to_string());
            self
        }
    }

    #[tokio::test]
    async fn missing_file_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool-metadata.json");
        let store = MetadataStore::load(&path).await.unwrap();
        assert!(store.all().await.is_empty());
        assert!(tokio::fs::metadata(&path).await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool-metadata.json");
        tokio::fs::write(&path, "not valid json").await.unwrap();

        let store = MetadataStore::load(&path).await.unwrap();
        assert!(store.all().await.is_empty());

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut found_quarantine = false;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains(".corrupt.") {
                found_quarantine = true;
            }
        }
        assert!(found_quarantine);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool-metadata.json");
        let store = MetadataStore::load(&path).await.unwrap();

        let guid = Uuid::new_v4();
        let record = sample_record(guid, "md0");
        store.save(record.clone()).await.unwrap();

        let reloaded = MetadataStore::load(&path).await.unwrap();
        let fetched = reloaded.get_by_guid(guid).await.unwrap();
        assert_eq!(fetched.label, record.label);
        assert_eq!(fetched.drive_serials, record.drive_serials);
        assert_eq!(fetched.last_md_device_name, record.last_md_device_name);
    }

    #[tokio::test]
    async fn save_replaces_stale_entry_with_same_md_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool-metadata.json");
        let store = MetadataStore::load(&path).await.unwrap();

        let first = sample_record(Uuid::new_v4(), "md0");
        store.save(first).await.unwrap();

        let second = sample_record(Uuid::new_v4(), "md0");
        store.save(second.clone()).await.unwrap();

        let all = store.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].pool_group_guid, second.pool_group_guid);
    }

    #[tokio::test]
    async fn remove_deletes_matching_guid_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool-metadata.json");
        let store = MetadataStore::load(&path).await.unwrap();

        let keep = sample_record(Uuid::new_v4(), "md0");
        let drop = sample_record(Uuid::new_v4(), "md1");
        store.save(keep.clone()).await.unwrap();
        store.save(drop.clone()).await.unwrap();

        let removed = store.remove(drop.pool_group_guid).await.unwrap();
        assert!(removed);
        assert_eq!(store.all().await.len(), 1);
        assert!(store.get_by_guid(keep.pool_group_guid).await.is_some());
    }
}
