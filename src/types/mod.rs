//! Core data types for the photo persistence engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::error::{PhotoStorageError, PhotoStorageErrorCode, Result};
use crate::util;

/// An image handed to the engine by the application layer.
///
/// Mirrors what a file picker produces: a name, a MIME type, and the raw
/// bytes. The engine never touches the filesystem location the file came
/// from.
#[derive(Clone, Debug)]
pub struct PhotoFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl PhotoFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, inferring the MIME type from the extension
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let mime_type = util::infer_mime_type(&name)
            .ok_or_else(|| {
                PhotoStorageError::new(
                    PhotoStorageErrorCode::InvalidFile,
                    format!("cannot determine image type for {}", name),
                )
            })?
            .to_string();
        let bytes = std::fs::read(path).map_err(|e| {
            PhotoStorageError::with_cause(
                PhotoStorageErrorCode::InvalidFile,
                format!("failed to read {}", path.display()),
                e,
            )
        })?;
        Ok(Self {
            name,
            mime_type,
            bytes,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Metadata record kept alongside every stored photo
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoMetadata {
    /// Primary key across both backends, assigned once at store time
    pub id: Uuid,

    /// Original filename as uploaded
    pub filename: String,

    /// MIME type of the original file; retained even when compression
    /// re-encodes the payload
    pub mime_type: String,

    /// Size in bytes of the currently stored payload
    pub size: u64,

    /// Pixel width of the stored image; zero for vector images (SVG),
    /// which have no probed raster size
    pub width: u32,

    /// Pixel height of the stored image; zero for vector images (SVG),
    /// which have no probed raster size
    pub height: u32,

    /// Set once at store time, never mutated
    pub created_at: DateTime<Utc>,

    /// Updated on every successful retrieval
    pub last_accessed: DateTime<Utc>,

    /// Posts that reference this photo; empty means the photo is orphaned
    pub post_ids: Vec<String>,

    /// Whether the stored bytes differ from the original upload
    pub compressed: bool,

    /// Pre-compression byte count, present only when `compressed` is true
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
}

impl PhotoMetadata {
    /// Build a fresh record for a newly stored photo
    pub fn new(
        id: Uuid,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        width: u32,
        height: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            filename: filename.into(),
            mime_type: mime_type.into(),
            size,
            width,
            height,
            created_at: now,
            last_accessed: now,
            post_ids: Vec::new(),
            compressed: false,
            original_size: None,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.post_ids.is_empty()
    }
}

/// Partial update applied on top of an existing metadata record.
///
/// Only the mutable fields are representable; `created_at`, dimensions, and
/// provenance are immutable after store.
#[derive(Clone, Debug, Default)]
pub struct PhotoMetadataPatch {
    pub last_accessed: Option<DateTime<Utc>>,
    pub post_ids: Option<Vec<String>>,
}

impl PhotoMetadataPatch {
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            last_accessed: Some(now),
            ..Default::default()
        }
    }

    pub fn with_post_ids(post_ids: Vec<String>) -> Self {
        Self {
            post_ids: Some(post_ids),
            ..Default::default()
        }
    }

    /// Merge this patch onto an existing record
    pub fn apply(self, metadata: &mut PhotoMetadata) {
        if let Some(last_accessed) = self.last_accessed {
            metadata.last_accessed = last_accessed;
        }
        if let Some(post_ids) = self.post_ids {
            metadata.post_ids = post_ids;
        }
    }
}

/// Aggregate storage statistics, computed on demand
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// Total bytes of stored photo payloads
    pub used: u64,

    /// Best-effort available bytes; zero when the quota is unknown
    pub available: u64,

    pub photo_count: u64,

    pub oldest_photo: Option<DateTime<Utc>>,
    pub newest_photo: Option<DateTime<Utc>>,
}
