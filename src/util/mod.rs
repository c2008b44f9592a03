//! Stateless helpers shared across the engine
//!
//! ID generation, file validation, Base64/data-URL conversion, the
//! materialized media-URL registry, quota estimation, timeout wrapping, and
//! small async rate-control helpers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{PhotoStorageError, PhotoStorageErrorCode, Result};
use crate::types::PhotoFile;

/// MIME types accepted by the engine
pub const ACCEPTED_IMAGE_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
];

/// Generate the opaque identifier for a newly stored photo
pub fn generate_photo_id() -> Uuid {
    Uuid::new_v4()
}

pub fn is_accepted_image_type(mime_type: &str) -> bool {
    ACCEPTED_IMAGE_TYPES.contains(&mime_type)
}

/// Reject MIME types outside the accepted set
pub fn validate_mime_type(mime_type: &str) -> Result<()> {
    if !is_accepted_image_type(mime_type) {
        return Err(PhotoStorageError::new(
            PhotoStorageErrorCode::InvalidFile,
            format!("unsupported image type: {}", mime_type),
        ));
    }
    Ok(())
}

/// Validate type and size of an incoming file
pub fn validate_photo_file(file: &PhotoFile, max_size: u64) -> Result<()> {
    validate_mime_type(&file.mime_type)?;
    if file.size() > max_size {
        return Err(PhotoStorageError::new(
            PhotoStorageErrorCode::InvalidFile,
            format!("file size {} exceeds maximum {}", file.size(), max_size),
        ));
    }
    Ok(())
}

/// Infer a MIME type from a filename extension
pub fn infer_mime_type(filename: &str) -> Option<&'static str> {
    let extension = filename.rsplit('.').next()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

/// Encode bytes as a `data:<mime>;base64,<payload>` string
pub fn encode_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, BASE64.encode(bytes))
}

/// Parse a data URL back into its MIME type and raw bytes
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>)> {
    let rest = data_url.strip_prefix("data:").ok_or_else(|| {
        PhotoStorageError::new(
            PhotoStorageErrorCode::StorageCorrupted,
            "stored payload is not a data URL",
        )
    })?;
    let (header, payload) = rest.split_once(',').ok_or_else(|| {
        PhotoStorageError::new(
            PhotoStorageErrorCode::StorageCorrupted,
            "malformed data URL: missing payload separator",
        )
    })?;
    let mime_type = header.strip_suffix(";base64").ok_or_else(|| {
        PhotoStorageError::new(
            PhotoStorageErrorCode::StorageCorrupted,
            "malformed data URL: expected base64 encoding",
        )
    })?;
    let bytes = BASE64.decode(payload).map_err(|e| {
        PhotoStorageError::with_cause(
            PhotoStorageErrorCode::StorageCorrupted,
            "malformed data URL: invalid base64 payload",
            e,
        )
    })?;
    Ok((mime_type.to_string(), bytes))
}

/// Best-effort free-space estimate: configured quota minus used bytes,
/// zero when no quota is known
pub fn estimate_available_space(quota: Option<u64>, used: u64) -> u64 {
    quota.map(|q| q.saturating_sub(used)).unwrap_or(0)
}

/// Race a future against a timer, rejecting with `OperationTimeout` if the
/// timer wins. The underlying operation keeps running in the background.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(PhotoStorageError::new(
            PhotoStorageErrorCode::OperationTimeout,
            format!("operation timed out after {:?}", duration),
        )),
    }
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        _ => ".bin",
    }
}

struct MediaUrlEntry {
    url: String,
    // Holding the handle keeps the file alive; dropping it revokes the URL.
    _file: NamedTempFile,
}

/// Registry of materialized media URLs.
///
/// Stands in for object-URL lifecycle management: payloads are written to
/// named temporary files and handed out as `file://` URLs; revoking an entry
/// drops the backing file. The registry is owned by the service and must be
/// kept coherent with deletions.
#[derive(Default)]
pub struct MediaUrlRegistry {
    entries: HashMap<Uuid, MediaUrlEntry>,
}

impl MediaUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached URL for a photo, if one was already materialized
    pub fn url_for(&self, id: Uuid) -> Option<String> {
        self.entries.get(&id).map(|e| e.url.clone())
    }

    /// Write the payload to a temp file and cache the resulting URL
    pub fn materialize(&mut self, id: Uuid, bytes: &[u8], mime_type: &str) -> Result<String> {
        if let Some(entry) = self.entries.get(&id) {
            return Ok(entry.url.clone());
        }

        let mut file = tempfile::Builder::new()
            .prefix("demedia-")
            .suffix(extension_for_mime(mime_type))
            .tempfile()
            .map_err(|e| {
                PhotoStorageError::with_cause(
                    PhotoStorageErrorCode::UnknownError,
                    "failed to materialize media file",
                    e,
                )
            })?;
        file.write_all(bytes).map_err(|e| {
            PhotoStorageError::with_cause(
                PhotoStorageErrorCode::UnknownError,
                "failed to write media file",
                e,
            )
        })?;

        let url = format!("file://{}", file.path().display());
        self.entries.insert(
            id,
            MediaUrlEntry {
                url: url.clone(),
                _file: file,
            },
        );
        Ok(url)
    }

    /// Revoke the URL for a photo; returns whether an entry existed
    pub fn revoke(&mut self, id: Uuid) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Revoke every cached URL
    pub fn revoke_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trailing-edge debouncer: only the last call within the delay window runs
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn call<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        let mut pending = self.pending.lock().unwrap();
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Leading-edge throttler: at most one call per interval runs
pub struct Throttler {
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl Throttler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: Mutex::new(None),
        }
    }

    /// Run the callback if the interval has elapsed; returns whether it ran
    pub fn call<F>(&self, callback: F) -> bool
    where
        F: FnOnce(),
    {
        let mut last_run = self.last_run.lock().unwrap();
        let now = Instant::now();
        match *last_run {
            Some(previous) if now.duration_since(previous) < self.interval => false,
            _ => {
                *last_run = Some(now);
                drop(last_run);
                callback();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_accepted_types() {
        assert!(is_accepted_image_type("image/jpeg"));
        assert!(is_accepted_image_type("image/svg+xml"));
        assert!(!is_accepted_image_type("video/mp4"));
        assert!(!is_accepted_image_type("application/pdf"));
    }

    #[test]
    fn test_validate_mime_type() {
        assert!(validate_mime_type("image/gif").is_ok());
        let err = validate_mime_type("text/html").unwrap_err();
        assert_eq!(err.code, PhotoStorageErrorCode::InvalidFile);
    }

    #[test]
    fn test_validate_photo_file() {
        let good = PhotoFile::new("a.png", "image/png", vec![0u8; 100]);
        assert!(validate_photo_file(&good, 1000).is_ok());

        let wrong_type = PhotoFile::new("a.mp4", "video/mp4", vec![0u8; 100]);
        let err = validate_photo_file(&wrong_type, 1000).unwrap_err();
        assert_eq!(err.code, PhotoStorageErrorCode::InvalidFile);

        let too_big = PhotoFile::new("a.png", "image/png", vec![0u8; 2000]);
        let err = validate_photo_file(&too_big, 1000).unwrap_err();
        assert_eq!(err.code, PhotoStorageErrorCode::InvalidFile);
    }

    #[test]
    fn test_infer_mime_type() {
        assert_eq!(infer_mime_type("photo.JPG"), Some("image/jpeg"));
        assert_eq!(infer_mime_type("icon.webp"), Some("image/webp"));
        assert_eq!(infer_mime_type("doc.txt"), None);
        assert_eq!(infer_mime_type("noextension"), None);
    }

    #[test]
    fn test_data_url_round_trip() {
        let bytes = vec![1u8, 2, 3, 250, 255];
        let url = encode_data_url("image/png", &bytes);
        assert!(url.starts_with("data:image/png;base64,"));

        let (mime, decoded) = decode_data_url(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn test_decode_data_url_rejects_garbage() {
        for bad in ["plain text", "data:image/png,raw", "data:image/png;base64,@@"] {
            let err = decode_data_url(bad).unwrap_err();
            assert_eq!(err.code, PhotoStorageErrorCode::StorageCorrupted);
        }
    }

    #[test]
    fn test_estimate_available_space() {
        assert_eq!(estimate_available_space(Some(100), 30), 70);
        assert_eq!(estimate_available_space(Some(100), 200), 0);
        assert_eq!(estimate_available_space(None, 30), 0);
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let ok = with_timeout(Duration::from_millis(100), async { Ok(5u32) }).await;
        assert_eq!(ok.unwrap(), 5);

        let slow = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(5u32)
        })
        .await;
        assert_eq!(
            slow.unwrap_err().code,
            PhotoStorageErrorCode::OperationTimeout
        );
    }

    #[test]
    fn test_media_url_registry_lifecycle() {
        let mut registry = MediaUrlRegistry::new();
        let id = Uuid::new_v4();
        assert!(registry.url_for(id).is_none());

        let url = registry
            .materialize(id, b"pretend-image", "image/jpeg")
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(".jpg"));
        assert_eq!(registry.url_for(id), Some(url.clone()));

        // Second materialize returns the cached URL
        let again = registry.materialize(id, b"different", "image/jpeg").unwrap();
        assert_eq!(again, url);

        let path = url.trim_start_matches("file://").to_string();
        assert!(std::path::Path::new(&path).exists());

        assert!(registry.revoke(id));
        assert!(!registry.revoke(id));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_debouncer_runs_only_last_call() {
        let counter = Arc::new(AtomicU32::new(0));
        let debouncer = Debouncer::new(Duration::from_millis(20));

        for _ in 0..5 {
            let counter = counter.clone();
            debouncer.call(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_throttler_leading_edge() {
        let throttler = Throttler::new(Duration::from_secs(60));
        let mut runs = 0;
        assert!(throttler.call(|| runs += 1));
        assert!(!throttler.call(|| runs += 1));
        assert_eq!(runs, 1);
    }
}
