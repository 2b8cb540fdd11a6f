//! # Record Storage for the Device Client
//!
//! Durable storage for the credential cache, the template cache and the
//! pending sync queue. Records are opaque JSON documents addressed by
//! collection and id.
//!
//! [`FileStore`] keeps one file per record and replaces it atomically
//! (write to a temporary file, fsync, rename), so a reader never observes a
//! half-written record. [`MemoryStore`] backs tests and benchmarks.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use shared::{
    config::StorageConfig,
    error::{IdentityError, IdentityResult},
};

/// Logical group of records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Credentials,
    Templates,
    PendingSync,
    SyncRecords,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Credentials,
        Collection::Templates,
        Collection::PendingSync,
        Collection::SyncRecords,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Collection::Credentials => "credentials",
            Collection::Templates => "templates",
            Collection::PendingSync => "pending",
            Collection::SyncRecords => "sync_records",
        }
    }
}

/// Durable key-value storage with atomic upsert by id
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or atomically replace a record
    async fn put(&self, collection: Collection, id: &str, record: Vec<u8>) -> IdentityResult<()>;

    async fn get(&self, collection: Collection, id: &str) -> IdentityResult<Option<Vec<u8>>>;

    /// Returns whether a record was removed
    async fn remove(&self, collection: Collection, id: &str) -> IdentityResult<bool>;

    /// Every record in the collection, in no particular order
    async fn list(&self, collection: Collection) -> IdentityResult<Vec<Vec<u8>>>;
}

/// Serialize `value` and store it under `id`
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn RecordStore,
    collection: Collection,
    id: &str,
    value: &T,
) -> IdentityResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(collection, id, bytes).await
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn RecordStore,
    collection: Collection,
    id: &str,
) -> IdentityResult<Option<T>> {
    match store.get(collection, id).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Load every record of a collection, skipping undecodable ones
pub async fn load_all<T: DeserializeOwned>(
    store: &dyn RecordStore,
    collection: Collection,
) -> IdentityResult<Vec<T>> {
    let mut records = Vec::new();
    for bytes in store.list(collection).await? {
        match serde_json::from_slice(&bytes) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                collection = collection.dir_name(),
                error = %e,
                "Skipping undecodable record"
            ),
        }
    }
    Ok(records)
}

fn validate_id(id: &str) -> IdentityResult<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidArgument(format!("invalid record id '{}'", id)))
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// One JSON file per record under `<data_path>/<collection>/<id>.json`
pub struct FileStore {
    /// Path to storage directory
    root: PathBuf,
}

impl FileStore {
    /// Open the store, creating the collection directories if needed
    pub async fn open(config: &StorageConfig) -> IdentityResult<Self> {
        info!(path = ?config.data_path, "Opening record store");

        for collection in Collection::ALL {
            tokio::fs::create_dir_all(config.data_path.join(collection.dir_name())).await?;
        }

        Ok(Self {
            root: config.data_path.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, collection: Collection, id: &str) -> PathBuf {
        self.root
            .join(collection.dir_name())
            .join(format!("{}.json", id))
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn put(&self, collection: Collection, id: &str, record: Vec<u8>) -> IdentityResult<()> {
        validate_id(id)?;
        let path = self.record_path(collection, id);
        let tmp_path = self
            .root
            .join(collection.dir_name())
            .join(format!(".{}.tmp", id));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&record).await?;
        file.sync_all().await?;
        drop(file);

        // Owner-only read/write (Unix)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms).await?;
        }

        tokio::fs::rename(&tmp_path, &path).await?;
        sync_dir(&self.root.join(collection.dir_name())).await?;

        debug!(collection = collection.dir_name(), id = %id, "Record stored");
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> IdentityResult<Option<Vec<u8>>> {
        validate_id(id)?;
        match tokio::fs::read(self.record_path(collection, id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, collection: Collection, id: &str) -> IdentityResult<bool> {
        validate_id(id)?;
        match tokio::fs::remove_file(self.record_path(collection, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, collection: Collection) -> IdentityResult<Vec<Vec<u8>>> {
        let dir = self.root.join(collection.dir_name());
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut records = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => records.push(bytes),
                // Removed between read_dir and read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(records)
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Volatile store for tests and benchmarks
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(Collection, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.records
            .read()
            .keys()
            .filter(|(c, _)| *c == collection)
            .count()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put(&self, collection: Collection, id: &str, record: Vec<u8>) -> IdentityResult<()> {
        validate_id(id)?;
        self.records.write().insert((collection, id.to_string()), record);
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> IdentityResult<Option<Vec<u8>>> {
        Ok(self.records.read().get(&(collection, id.to_string())).cloned())
    }

    async fn remove(&self, collection: Collection, id: &str) -> IdentityResult<bool> {
        Ok(self.records.write().remove(&(collection, id.to_string())).is_some())
    }

    async fn list(&self, collection: Collection) -> IdentityResult<Vec<Vec<u8>>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|(_, bytes)| bytes.clone())
            .collect())
    }
}

/// Flush a directory entry so a completed rename survives power loss
async fn sync_dir(dir: &Path) -> IdentityResult<()> {
    #[cfg(unix)]
    tokio::fs::File::open(dir).await?.sync_all().await?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
