//! The photo store façade
//!
//! Single public API surface for the rest of the application: backend
//! selection with fallback, compression policy, the media-URL cache,
//! post-reference bookkeeping, and orphan cleanup. Data flows one way:
//! caller → service → (compressor, chosen adapter) → disk; retrieval flows
//! back through URL synthesis.

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::compress::{self, CompressionOptions};
use crate::error::{PhotoStorageError, PhotoStorageErrorCode, Result};
use crate::storage::indexed::DB_FILE_NAME;
use crate::storage::{IndexedAdapter, KeyValueAdapter, StorageAdapter, StorageKind};
use crate::types::{PhotoFile, PhotoMetadata, PhotoMetadataPatch, StorageStats};
use crate::util::{self, MediaUrlRegistry};

const MB: u64 = 1024 * 1024;

/// Configuration for a [`PhotoStore`]
#[derive(Clone, Debug)]
pub struct PhotoStoreConfig {
    /// Base directory for both backends
    pub data_dir: PathBuf,

    /// Originals larger than this are compressed before persistence
    pub compression_threshold: u64,

    /// Absolute ceiling on a stored payload, checked after compression
    pub max_photo_size: u64,

    /// Optional quota for the indexed backend; `None` means unknown
    pub quota: Option<u64>,

    /// Bounds and format for the compression pipeline; the quality field is
    /// overridden per file by the size staircase
    pub compression: CompressionOptions,
}

impl Default for PhotoStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./demedia_data"),
            compression_threshold: MB,
            max_photo_size: 5 * MB,
            quota: None,
            compression: CompressionOptions::default(),
        }
    }
}

impl PhotoStoreConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    fn keyvalue_dir(&self) -> PathBuf {
        self.data_dir.join("keyvalue")
    }
}

/// Client-side photo persistence engine.
///
/// Initialization is idempotent and concurrency-safe: near-simultaneous
/// first calls converge on exactly one adapter construction by awaiting a
/// shared in-flight future. The indexed backend is preferred; the keyvalue
/// backend is the fallback.
pub struct PhotoStore {
    config: PhotoStoreConfig,
    adapter: tokio::sync::OnceCell<Arc<dyn StorageAdapter>>,
    url_cache: Mutex<MediaUrlRegistry>,
}

impl PhotoStore {
    pub fn new(config: PhotoStoreConfig) -> Self {
        Self {
            config,
            adapter: tokio::sync::OnceCell::new(),
            url_cache: Mutex::new(MediaUrlRegistry::new()),
        }
    }

    /// Select and initialize a backend; safe to call any number of times
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_initialized().await.map(|_| ())
    }

    async fn ensure_initialized(&self) -> Result<Arc<dyn StorageAdapter>> {
        self.adapter
            .get_or_try_init(|| async {
                let indexed: Arc<dyn StorageAdapter> = Arc::new(IndexedAdapter::new(
                    self.config.db_path(),
                    self.config.quota,
                ));
                if indexed.is_available().await {
                    log::info!("photo storage using indexed backend");
                    return Ok(indexed);
                }

                log::warn!("indexed backend unavailable, falling back to keyvalue");
                let keyvalue: Arc<dyn StorageAdapter> =
                    Arc::new(KeyValueAdapter::new(self.config.keyvalue_dir()));
                if keyvalue.is_available().await {
                    log::info!("photo storage using keyvalue backend");
                    return Ok(keyvalue);
                }

                Err(PhotoStorageError::new(
                    PhotoStorageErrorCode::StorageUnavailable,
                    "no usable storage backend",
                ))
            })
            .await
            .cloned()
    }

    /// Validate, compress if worthwhile, and persist a photo.
    ///
    /// Returns the generated id. The stored record starts orphaned
    /// (`post_ids` empty) until a post claims it.
    pub async fn store_photo(&self, file: &PhotoFile) -> Result<Uuid> {
        let adapter = self.ensure_initialized().await?;

        util::validate_mime_type(&file.mime_type)?;

        // Best-effort quota check; proceed when availability is unknown.
        let stats = adapter.stats().await?;
        if stats.available > 0 && file.size() > stats.available {
            return Err(PhotoStorageError::new(
                PhotoStorageErrorCode::QuotaExceeded,
                format!(
                    "file of {} bytes does not fit in {} available bytes",
                    file.size(),
                    stats.available
                ),
            ));
        }

        // SVG has no raster form to re-encode, and re-encoding a GIF keeps
        // only the first frame; both are stored verbatim.
        let compressible = !matches!(file.mime_type.as_str(), "image/svg+xml" | "image/gif");
        let natural_dimensions = if file.mime_type == "image/svg+xml" {
            (0, 0)
        } else {
            compress::image_dimensions(file)?
        };

        let (bytes, (width, height), compressed, original_size) = if compressible
            && compress::should_compress(file, self.config.compression_threshold)
        {
            let options = CompressionOptions {
                quality: compress::optimal_quality(file.size()),
                ..self.config.compression
            };
            let output = compress::compress(file, &options)?;
            log::debug!(
                "compressed {} from {} to {} bytes at quality {}",
                file.name,
                file.size(),
                output.bytes.len(),
                options.quality
            );
            (
                output.bytes,
                (output.width, output.height),
                true,
                Some(file.size()),
            )
        } else {
            (file.bytes.clone(), natural_dimensions, false, None)
        };

        if bytes.len() as u64 > self.config.max_photo_size {
            return Err(PhotoStorageError::new(
                PhotoStorageErrorCode::InvalidFile,
                format!(
                    "photo is {} bytes after compression, above the {} byte maximum",
                    bytes.len(),
                    self.config.max_photo_size
                ),
            ));
        }

        let id = util::generate_photo_id();
        let mut metadata = PhotoMetadata::new(
            id,
            &file.name,
            &file.mime_type,
            bytes.len() as u64,
            width,
            height,
        );
        metadata.compressed = compressed;
        metadata.original_size = original_size;

        adapter.store(id, &bytes, &metadata).await?;
        Ok(id)
    }

    /// Store several photos concurrently, tolerating individual failures.
    ///
    /// Errors only when every file failed; otherwise returns the ids that
    /// succeeded, so callers compare lengths to detect partial failure.
    pub async fn store_photos(&self, files: &[PhotoFile]) -> Result<Vec<Uuid>> {
        let results = join_all(files.iter().map(|file| self.store_photo(file))).await;

        let mut ids = Vec::new();
        let mut first_error = None;
        for (file, result) in files.iter().zip(results) {
            match result {
                Ok(id) => ids.push(id),
                Err(e) => {
                    log::warn!("failed to store {}: {}", file.name, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if ids.is_empty() {
            if let Some(error) = first_error {
                return Err(error);
            }
        }
        Ok(ids)
    }

    /// Displayable URL for a stored photo, cached per id
    pub async fn photo_url(&self, id: Uuid) -> Result<String> {
        if let Some(url) = self.url_cache.lock().unwrap().url_for(id) {
            return Ok(url);
        }

        let adapter = self.ensure_initialized().await?;
        let stored = adapter
            .retrieve(id)
            .await?
            .ok_or_else(|| PhotoStorageError::not_found(id))?;
        let bytes = stored.data.to_bytes()?;

        self.url_cache
            .lock()
            .unwrap()
            .materialize(id, &bytes, &stored.metadata.mime_type)
    }

    pub async fn photo_metadata(&self, id: Uuid) -> Result<Option<PhotoMetadata>> {
        let adapter = self.ensure_initialized().await?;
        adapter.get_metadata(id).await
    }

    pub async fn all_photos(&self) -> Result<Vec<PhotoMetadata>> {
        let adapter = self.ensure_initialized().await?;
        adapter.list_all().await
    }

    /// Delete a photo, revoking any cached URL first so nothing leaks
    pub async fn delete_photo(&self, id: Uuid) -> Result<()> {
        let adapter = self.ensure_initialized().await?;
        self.url_cache.lock().unwrap().revoke(id);
        adapter.delete(id).await
    }

    /// Delete several photos concurrently; any individual failure is
    /// propagated, since a partial delete leaves an ambiguous state the
    /// caller should know about.
    pub async fn delete_photos(&self, ids: &[Uuid]) -> Result<()> {
        let adapter = self.ensure_initialized().await?;
        {
            let mut cache = self.url_cache.lock().unwrap();
            for id in ids {
                cache.revoke(*id);
            }
        }

        let results = join_all(ids.iter().map(|id| adapter.delete(*id))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let adapter = self.ensure_initialized().await?;
        adapter.stats().await
    }

    /// Delete every photo no post references; returns how many were removed
    pub async fn cleanup_orphaned_photos(&self) -> Result<u64> {
        let adapter = self.ensure_initialized().await?;
        let mut removed = 0;
        for metadata in adapter.list_all().await? {
            if metadata.is_orphaned() {
                self.url_cache.lock().unwrap().revoke(metadata.id);
                adapter.delete(metadata.id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("cleaned up {} orphaned photos", removed);
        }
        Ok(removed)
    }

    /// Record that a post references this photo; adding the same reference
    /// twice is a no-op
    pub async fn add_post_reference(&self, photo_id: Uuid, post_id: &str) -> Result<()> {
        let adapter = self.ensure_initialized().await?;
        let metadata = adapter
            .get_metadata(photo_id)
            .await?
            .ok_or_else(|| PhotoStorageError::not_found(photo_id))?;

        if metadata.post_ids.iter().any(|p| p == post_id) {
            return Ok(());
        }
        let mut post_ids = metadata.post_ids;
        post_ids.push(post_id.to_string());
        adapter
            .update_metadata(photo_id, PhotoMetadataPatch::with_post_ids(post_ids))
            .await?;
        Ok(())
    }

    /// Drop a post reference. Silently no-ops when the photo is already
    /// gone: the post's content may well be deleted after its photo.
    pub async fn remove_post_reference(&self, photo_id: Uuid, post_id: &str) -> Result<()> {
        let adapter = self.ensure_initialized().await?;
        let metadata = match adapter.get_metadata(photo_id).await? {
            Some(metadata) => metadata,
            None => {
                log::debug!(
                    "remove_post_reference: photo {} already deleted, ignoring",
                    photo_id
                );
                return Ok(());
            }
        };

        if metadata.post_ids.iter().any(|p| p == post_id) {
            let mut post_ids = metadata.post_ids;
            post_ids.retain(|p| p != post_id);
            adapter
                .update_metadata(photo_id, PhotoMetadataPatch::with_post_ids(post_ids))
                .await?;
        }
        Ok(())
    }

    /// Capability probe; never errors
    pub async fn is_storage_available(&self) -> bool {
        match self.ensure_initialized().await {
            Ok(adapter) => adapter.is_available().await,
            Err(_) => false,
        }
    }

    /// Which backend the store settled on; `None` before initialization
    pub fn storage_type(&self) -> Option<StorageKind> {
        self.adapter.get().map(|adapter| adapter.kind())
    }

    /// Remove all photos and metadata, and revoke every cached URL
    pub async fn clear(&self) -> Result<()> {
        let adapter = self.ensure_initialized().await?;
        self.url_cache.lock().unwrap().revoke_all();
        adapter.clear().await
    }

    /// Revoke every cached media URL; call on teardown
    pub fn clear_url_cache(&self) {
        self.url_cache.lock().unwrap().revoke_all();
    }

    /// Number of currently cached media URLs
    pub fn cached_url_count(&self) -> usize {
        self.url_cache.lock().unwrap().len()
    }
}

impl Drop for PhotoStore {
    fn drop(&mut self) {
        self.url_cache.lock().unwrap().revoke_all();
    }
}
