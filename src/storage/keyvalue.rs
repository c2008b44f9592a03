//! Keyvalue fallback backend
//!
//! Mimics a small synchronous string key-value store: each key is one small
//! file in a flat directory. Photo bytes are stored as Base64 data-URL
//! strings under `demedia_photo_<id>`, metadata as JSON under
//! `demedia_meta_<id>`, and a manually maintained JSON array under
//! `demedia_photo_index` tracks all live ids, since the store has no native
//! enumeration. Every mutation keeps the index consistent with actual key
//! presence.
//!
//! Base64 inflates binary payloads by roughly a third and the assumed total
//! quota is small, so a hard per-photo ceiling is enforced at store time.

use chrono::Utc;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{PhotoPayload, StorageAdapter, StorageKind, StoredPhoto};
use crate::error::{PhotoStorageError, PhotoStorageErrorCode, Result};
use crate::types::{PhotoMetadata, PhotoMetadataPatch, StorageStats};
use crate::util;

const PHOTO_KEY_PREFIX: &str = "demedia_photo_";
const META_KEY_PREFIX: &str = "demedia_meta_";
const INDEX_KEY: &str = "demedia_photo_index";

/// Default per-photo ceiling (5 MB of raw bytes)
pub const DEFAULT_MAX_PHOTO_BYTES: u64 = 5 * 1024 * 1024;

/// Assumed total quota for statistics (10 MB, the usual budget for this
/// kind of store)
pub const ESTIMATED_QUOTA: u64 = 10 * 1024 * 1024;

fn io_error(message: &str, cause: std::io::Error) -> PhotoStorageError {
    // Out-of-space failures surface as quota errors, everything else as
    // unknown.
    let out_of_space = cause.raw_os_error() == Some(28) // ENOSPC
        || cause.to_string().to_lowercase().contains("no space");
    let code = if out_of_space {
        PhotoStorageErrorCode::QuotaExceeded
    } else {
        PhotoStorageErrorCode::UnknownError
    };
    PhotoStorageError::with_cause(code, message, cause)
}

/// A directory of one-file-per-key string values
struct StringStore {
    dir: PathBuf,
}

impl StringStore {
    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.key_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&format!("failed to read key {}", key), e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::write(self.key_path(key), value)
            .map_err(|e| io_error(&format!("failed to write key {}", key), e))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&format!("failed to remove key {}", key), e)),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.key_path(key).exists()
    }
}

pub struct KeyValueAdapter {
    store: Arc<Mutex<StringStore>>,
    max_photo_bytes: u64,
}

fn photo_key(id: Uuid) -> String {
    format!("{}{}", PHOTO_KEY_PREFIX, id)
}

fn meta_key(id: Uuid) -> String {
    format!("{}{}", META_KEY_PREFIX, id)
}

fn parse_metadata(raw: &str) -> Result<PhotoMetadata> {
    serde_json::from_str(raw).map_err(|e| {
        PhotoStorageError::with_cause(
            PhotoStorageErrorCode::StorageCorrupted,
            "stored metadata is not valid JSON",
            e,
        )
    })
}

impl KeyValueAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_max_photo_bytes(dir, DEFAULT_MAX_PHOTO_BYTES)
    }

    pub fn with_max_photo_bytes(dir: impl Into<PathBuf>, max_photo_bytes: u64) -> Self {
        Self {
            store: Arc::new(Mutex::new(StringStore { dir: dir.into() })),
            max_photo_bytes,
        }
    }

    fn read_index(store: &StringStore) -> Result<Vec<Uuid>> {
        match store.get(INDEX_KEY)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                PhotoStorageError::with_cause(
                    PhotoStorageErrorCode::StorageCorrupted,
                    "photo index is not valid JSON",
                    e,
                )
            }),
            None => Ok(Vec::new()),
        }
    }

    fn write_index(store: &StringStore, index: &[Uuid]) -> Result<()> {
        let raw = serde_json::to_string(index).map_err(|e| {
            PhotoStorageError::with_cause(
                PhotoStorageErrorCode::MetadataError,
                "failed to serialize photo index",
                e,
            )
        })?;
        store.set(INDEX_KEY, &raw)
    }

    fn write_metadata(store: &StringStore, metadata: &PhotoMetadata) -> Result<()> {
        let raw = serde_json::to_string(metadata).map_err(|e| {
            PhotoStorageError::with_cause(
                PhotoStorageErrorCode::MetadataError,
                "failed to serialize metadata",
                e,
            )
        })?;
        store.set(&meta_key(metadata.id), &raw)
    }

    /// Background `last_accessed` bookkeeping; failure is logged, never
    /// propagated.
    fn touch_last_accessed(&self, id: Uuid) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let store = store.lock().unwrap();
            let result = (|| -> Result<()> {
                if let Some(raw) = store.get(&meta_key(id))? {
                    let mut metadata = parse_metadata(&raw)?;
                    metadata.last_accessed = Utc::now();
                    Self::write_metadata(&store, &metadata)?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                log::warn!("failed to update last_accessed for {}: {}", id, e);
            }
        });
    }
}

#[async_trait::async_trait]
impl StorageAdapter for KeyValueAdapter {
    fn kind(&self) -> StorageKind {
        StorageKind::KeyValue
    }

    async fn initialize(&self) -> Result<()> {
        let store = self.store.lock().unwrap();
        std::fs::create_dir_all(&store.dir).map_err(|e| {
            PhotoStorageError::with_cause(
                PhotoStorageErrorCode::InitializationFailed,
                format!("failed to create keyvalue directory {}", store.dir.display()),
                e,
            )
        })
    }

    async fn store(&self, id: Uuid, data: &[u8], metadata: &PhotoMetadata) -> Result<()> {
        if data.len() as u64 > self.max_photo_bytes {
            return Err(PhotoStorageError::new(
                PhotoStorageErrorCode::QuotaExceeded,
                format!(
                    "photo of {} bytes exceeds the {} byte keyvalue limit",
                    data.len(),
                    self.max_photo_bytes
                ),
            ));
        }

        let store = self.store.lock().unwrap();
        let data_url = util::encode_data_url(&metadata.mime_type, data);

        store.set(&photo_key(id), &data_url)?;
        if let Err(e) = Self::write_metadata(&store, metadata) {
            // Keep the pair consistent: roll back the payload write.
            let _ = store.remove(&photo_key(id));
            return Err(e);
        }

        let indexed = (|| -> Result<()> {
            let mut index = Self::read_index(&store)?;
            if !index.contains(&id) {
                index.push(id);
                Self::write_index(&store, &index)?;
            }
            Ok(())
        })();
        if let Err(e) = indexed {
            // An unindexed pair would be invisible to enumeration forever;
            // roll both keys back so the store stays consistent.
            let _ = store.remove(&photo_key(id));
            let _ = store.remove(&meta_key(id));
            return Err(e);
        }
        Ok(())
    }

    async fn retrieve(&self, id: Uuid) -> Result<Option<StoredPhoto>> {
        let stored = {
            let store = self.store.lock().unwrap();
            let data_url = store.get(&photo_key(id))?;
            let raw_metadata = store.get(&meta_key(id))?;
            match (data_url, raw_metadata) {
                (Some(data_url), Some(raw)) => Some(StoredPhoto {
                    data: PhotoPayload::DataUrl(data_url),
                    metadata: parse_metadata(&raw)?,
                }),
                (None, None) => None,
                // Half a record is unreadable either way; report it rather
                // than pretending the photo is intact.
                _ => {
                    return Err(PhotoStorageError::new(
                        PhotoStorageErrorCode::StorageCorrupted,
                        format!("photo {} has a dangling payload or metadata key", id),
                    ))
                }
            }
        };

        if stored.is_some() {
            self.touch_last_accessed(id);
        }
        Ok(stored)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let store = self.store.lock().unwrap();
        store.remove(&photo_key(id))?;
        store.remove(&meta_key(id))?;

        let mut index = Self::read_index(&store)?;
        if index.contains(&id) {
            index.retain(|entry| *entry != id);
            Self::write_index(&store, &index)?;
        }
        Ok(())
    }

    async fn get_metadata(&self, id: Uuid) -> Result<Option<PhotoMetadata>> {
        let store = self.store.lock().unwrap();
        store
            .get(&meta_key(id))?
            .map(|raw| parse_metadata(&raw))
            .transpose()
    }

    async fn update_metadata(&self, id: Uuid, patch: PhotoMetadataPatch) -> Result<PhotoMetadata> {
        let store = self.store.lock().unwrap();
        let raw = store
            .get(&meta_key(id))?
            .ok_or_else(|| PhotoStorageError::not_found(id))?;
        let mut metadata = parse_metadata(&raw)?;
        patch.apply(&mut metadata);
        Self::write_metadata(&store, &metadata)?;
        Ok(metadata)
    }

    async fn list_all(&self) -> Result<Vec<PhotoMetadata>> {
        let store = self.store.lock().unwrap();
        let index = Self::read_index(&store)?;
        let mut records = Vec::with_capacity(index.len());
        for id in index {
            match store.get(&meta_key(id))? {
                Some(raw) => records.push(parse_metadata(&raw)?),
                None => log::warn!("index references missing metadata for {}", id),
            }
        }
        Ok(records)
    }

    async fn stats(&self) -> Result<StorageStats> {
        let records = self.list_all().await?;
        let used: u64 = records.iter().map(|m| m.size).sum();
        Ok(StorageStats {
            used,
            available: util::estimate_available_space(Some(ESTIMATED_QUOTA), used),
            photo_count: records.len() as u64,
            oldest_photo: records.iter().map(|m| m.created_at).min(),
            newest_photo: records.iter().map(|m| m.created_at).max(),
        })
    }

    async fn is_available(&self) -> bool {
        if self.initialize().await.is_err() {
            return false;
        }
        // Probe with a throwaway key, the way availability is classically
        // detected for this kind of store.
        let store = self.store.lock().unwrap();
        let probe = "demedia_availability_probe";
        store.set(probe, "ok").is_ok()
            && store.get(probe).ok().flatten().as_deref() == Some("ok")
            && store.remove(probe).is_ok()
    }

    async fn clear(&self) -> Result<()> {
        let store = self.store.lock().unwrap();
        let index = Self::read_index(&store)?;
        for id in index {
            store.remove(&photo_key(id))?;
            store.remove(&meta_key(id))?;
        }
        store.remove(INDEX_KEY)
    }
}
