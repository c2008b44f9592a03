//! Storage backends for photo payloads and metadata
//!
//! Two backends implement one shared contract so the service can treat them
//! interchangeably: an indexed, transactional SQLite backend (primary) and a
//! small file-per-key fallback that mimics a string key-value store.

pub mod indexed;
pub mod keyvalue;

use async_trait::async_trait;
use uuid::Uuid;

pub use indexed::IndexedAdapter;
pub use keyvalue::KeyValueAdapter;

use crate::error::Result;
use crate::types::{PhotoMetadata, PhotoMetadataPatch, StorageStats};
use crate::util;

/// Which backend a service instance ended up on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Indexed,
    KeyValue,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Indexed => "indexed",
            StorageKind::KeyValue => "keyvalue",
        }
    }
}

/// Photo payload as persisted by a backend.
///
/// The indexed backend stores raw bytes; the keyvalue backend stores Base64
/// data-URL strings. `to_bytes` normalizes either form for callers.
#[derive(Clone, Debug)]
pub enum PhotoPayload {
    Bytes(Vec<u8>),
    DataUrl(String),
}

impl PhotoPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            PhotoPayload::Bytes(bytes) => Ok(bytes.clone()),
            PhotoPayload::DataUrl(url) => util::decode_data_url(url).map(|(_, bytes)| bytes),
        }
    }
}

/// A retrieved photo: payload plus its metadata record
#[derive(Clone, Debug)]
pub struct StoredPhoto {
    pub data: PhotoPayload,
    pub metadata: PhotoMetadata,
}

/// Contract shared by both storage backends.
///
/// Bytes and metadata always move together as one logical unit: a metadata
/// record must never exist without its payload, and vice versa.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Idempotent, concurrency-safe setup of the underlying store
    async fn initialize(&self) -> Result<()>;

    /// Persist payload and metadata as one unit; overwrites an existing id
    async fn store(&self, id: Uuid, data: &[u8], metadata: &PhotoMetadata) -> Result<()>;

    /// Fetch payload and metadata; `None` when absent.
    ///
    /// A successful retrieval triggers a fire-and-forget `last_accessed`
    /// update whose failure never fails the retrieval itself.
    async fn retrieve(&self, id: Uuid) -> Result<Option<StoredPhoto>>;

    /// Remove payload and metadata; idempotent
    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn get_metadata(&self, id: Uuid) -> Result<Option<PhotoMetadata>>;

    /// Merge a partial update onto an existing record; `PhotoNotFound` when
    /// the record does not exist
    async fn update_metadata(&self, id: Uuid, patch: PhotoMetadataPatch) -> Result<PhotoMetadata>;

    /// Every metadata record, order unspecified
    async fn list_all(&self) -> Result<Vec<PhotoMetadata>>;

    /// Aggregates over all records; all-zero when the store is empty
    async fn stats(&self) -> Result<StorageStats>;

    /// Capability probe; must not error
    async fn is_available(&self) -> bool;

    /// Remove all photos and metadata unconditionally
    async fn clear(&self) -> Result<()>;
}
