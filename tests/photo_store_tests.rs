//! End-to-end tests for the photo store façade

use demedia_photos::{
    PhotoFile, PhotoStore, PhotoStoreConfig, PhotoStorageErrorCode, StorageKind,
};
use image::{DynamicImage, GenericImageView, ImageOutputFormat, RgbImage};
use std::io::Cursor;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic noise image; noise defeats lossless compression, which
/// makes it easy to build inputs above the compression threshold.
fn noise_image(width: u32, height: u32) -> DynamicImage {
    let mut seed: u32 = 0x2545_f491;
    let mut next = move || {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (seed >> 24) as u8
    };
    let image = RgbImage::from_fn(width, height, |_, _| image::Rgb([next(), next(), next()]));
    DynamicImage::ImageRgb8(image)
}

fn noise_png(name: &str, width: u32, height: u32) -> PhotoFile {
    let mut cursor = Cursor::new(Vec::new());
    noise_image(width, height)
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .unwrap();
    PhotoFile::new(name, "image/png", cursor.into_inner())
}

fn noise_gif(name: &str, width: u32, height: u32) -> PhotoFile {
    let mut cursor = Cursor::new(Vec::new());
    noise_image(width, height)
        .write_to(&mut cursor, ImageOutputFormat::Gif)
        .unwrap();
    PhotoFile::new(name, "image/gif", cursor.into_inner())
}

fn small_png(name: &str, width: u32, height: u32) -> PhotoFile {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 40])
    });
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .unwrap();
    PhotoFile::new(name, "image/png", cursor.into_inner())
}

fn fetch_url(url: &str) -> Vec<u8> {
    let path = url.strip_prefix("file://").expect("expected a file URL");
    std::fs::read(path).expect("URL should point at a readable file")
}

#[tokio::test]
async fn round_trip_preserves_dimensions() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let file = small_png("beach.png", 320, 200);
    let id = store.store_photo(&file).await.unwrap();

    let metadata = store.photo_metadata(id).await.unwrap().unwrap();
    assert_eq!((metadata.width, metadata.height), (320, 200));
    assert_eq!(metadata.filename, "beach.png");
    assert!(!metadata.compressed);

    let url = store.photo_url(id).await.unwrap();
    let fetched = image::load_from_memory(&fetch_url(&url)).unwrap();
    assert_eq!(fetched.dimensions(), (320, 200));
}

#[tokio::test]
async fn delete_is_idempotent_and_lookups_fail_after() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let id = store.store_photo(&small_png("a.png", 16, 16)).await.unwrap();
    store.delete_photo(id).await.unwrap();
    store.delete_photo(id).await.unwrap();

    assert!(store.photo_metadata(id).await.unwrap().is_none());
    let err = store.photo_url(id).await.unwrap_err();
    assert_eq!(err.code, PhotoStorageErrorCode::PhotoNotFound);
}

#[tokio::test]
async fn orphan_cleanup_removes_only_unreferenced_photos() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let kept = store.store_photo(&small_png("kept.png", 8, 8)).await.unwrap();
    let orphan_a = store.store_photo(&small_png("a.png", 8, 8)).await.unwrap();
    let orphan_b = store.store_photo(&small_png("b.png", 8, 8)).await.unwrap();

    store.add_post_reference(kept, "post-1").await.unwrap();

    let removed = store.cleanup_orphaned_photos().await.unwrap();
    assert_eq!(removed, 2);

    let remaining = store.all_photos().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, kept);
    assert!(store.photo_metadata(orphan_a).await.unwrap().is_none());
    assert!(store.photo_metadata(orphan_b).await.unwrap().is_none());
}

#[tokio::test]
async fn bulk_store_tolerates_partial_failure() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let files = vec![
        small_png("one.png", 12, 12),
        PhotoFile::new("bad.pdf", "application/pdf", vec![0u8; 10]),
        small_png("two.png", 12, 12),
    ];

    let ids = store.store_photos(&files).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(store.all_photos().await.unwrap().len(), 2);
}

#[tokio::test]
async fn bulk_store_fails_when_every_file_fails() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let files = vec![
        PhotoFile::new("bad.pdf", "application/pdf", vec![0u8; 10]),
        PhotoFile::new("bad.mp4", "video/mp4", vec![0u8; 10]),
    ];
    let err = store.store_photos(&files).await.unwrap_err();
    assert_eq!(err.code, PhotoStorageErrorCode::InvalidFile);
}

#[tokio::test]
async fn bulk_delete_removes_all() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let files = vec![small_png("a.png", 8, 8), small_png("b.png", 8, 8)];
    let ids = store.store_photos(&files).await.unwrap();

    store.delete_photos(&ids).await.unwrap();
    assert!(store.all_photos().await.unwrap().is_empty());
}

#[tokio::test]
async fn large_photo_is_compressed_and_bounded() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    // Noise PNG well above the 1 MB compression threshold and wider than
    // the 1920 bound.
    let file = noise_png("holiday.png", 2400, 1600);
    let original_size = file.size();
    assert!(original_size > 1024 * 1024);

    let id = store.store_photo(&file).await.unwrap();
    let metadata = store.photo_metadata(id).await.unwrap().unwrap();

    assert!(metadata.compressed);
    assert_eq!(metadata.original_size, Some(original_size));
    // Scaled to fit 1920x1920 preserving the 3:2 aspect ratio
    assert_eq!((metadata.width, metadata.height), (1920, 1280));
    // Final payload respects the absolute ceiling and actually shrank
    assert!(metadata.size <= 5 * 1024 * 1024);
    assert!(metadata.size < original_size);
    // Provenance is retained even though the payload was re-encoded
    assert_eq!(metadata.mime_type, "image/png");

    let url = store.photo_url(id).await.unwrap();
    let fetched = image::load_from_memory(&fetch_url(&url)).unwrap();
    assert_eq!(fetched.dimensions(), (1920, 1280));
}

#[tokio::test]
async fn small_photo_is_stored_verbatim() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let file = small_png("tiny.png", 100, 100);
    let id = store.store_photo(&file).await.unwrap();
    let metadata = store.photo_metadata(id).await.unwrap().unwrap();

    assert!(!metadata.compressed);
    assert_eq!(metadata.size, file.size());
    assert_eq!((metadata.width, metadata.height), (100, 100));

    let url = store.photo_url(id).await.unwrap();
    assert_eq!(fetch_url(&url), file.bytes);
}

#[tokio::test]
async fn svg_is_stored_without_compression() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"/>"#.to_vec();
    let file = PhotoFile::new("icon.svg", "image/svg+xml", svg.clone());

    let id = store.store_photo(&file).await.unwrap();
    let metadata = store.photo_metadata(id).await.unwrap().unwrap();
    assert!(!metadata.compressed);
    assert_eq!(metadata.mime_type, "image/svg+xml");
    // Vector images have no probed raster size
    assert_eq!((metadata.width, metadata.height), (0, 0));

    let url = store.photo_url(id).await.unwrap();
    assert_eq!(fetch_url(&url), svg);
}

#[tokio::test]
async fn gif_is_stored_verbatim_even_above_threshold() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    // Re-encoding a GIF would keep only its first frame, so even a GIF
    // above the compression threshold must pass through untouched.
    let file = noise_gif("party.gif", 1400, 1200);
    assert!(file.size() > 1024 * 1024);

    let id = store.store_photo(&file).await.unwrap();
    let metadata = store.photo_metadata(id).await.unwrap().unwrap();

    assert!(!metadata.compressed);
    assert!(metadata.original_size.is_none());
    assert_eq!(metadata.size, file.size());
    assert_eq!(metadata.mime_type, "image/gif");
    assert_eq!((metadata.width, metadata.height), (1400, 1200));

    let url = store.photo_url(id).await.unwrap();
    assert_eq!(fetch_url(&url), file.bytes);
}

#[tokio::test]
async fn fallback_backend_supports_full_lifecycle() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    // Force the indexed probe to fail by occupying its database path.
    std::fs::create_dir_all(dir.path().join("demedia-photos.db")).unwrap();

    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));
    store.initialize().await.unwrap();
    assert_eq!(store.storage_type(), Some(StorageKind::KeyValue));

    let file = small_png("kv.png", 24, 24);
    let id = store.store_photo(&file).await.unwrap();

    let url = store.photo_url(id).await.unwrap();
    let fetched = image::load_from_memory(&fetch_url(&url)).unwrap();
    assert_eq!(fetched.dimensions(), (24, 24));

    store.add_post_reference(id, "p1").await.unwrap();
    assert_eq!(store.cleanup_orphaned_photos().await.unwrap(), 0);
    store.remove_post_reference(id, "p1").await.unwrap();
    assert_eq!(store.cleanup_orphaned_photos().await.unwrap(), 1);
    assert!(store.all_photos().await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_first_calls_share_one_initialization() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path())));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .store_photo(&small_png(&format!("img-{}.png", i), 10, 10))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.storage_type(), Some(StorageKind::Indexed));
    assert_eq!(store.all_photos().await.unwrap().len(), 8);
    assert_eq!(store.storage_stats().await.unwrap().photo_count, 8);
}

#[tokio::test]
async fn stats_reflect_store_and_delete() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = PhotoStore::new(PhotoStoreConfig::with_data_dir(dir.path()));

    let empty = store.storage_stats().await.unwrap();
    assert_eq!(empty.photo_count, 0);
    assert_eq!(empty.used, 0);

    let id = store.store_photo(&small_png("a.png", 32, 32)).await.unwrap();
    let after_store = store.storage_stats().await.unwrap();
    assert_eq!(after_store.photo_count, 1);
    assert!(after_store.used > 0);
    assert!(after_store.oldest_photo.is_some());

    store.delete_photo(id).await.unwrap();
    let after_delete = store.storage_stats().await.unwrap();
    assert_eq!(after_delete.photo_count, 0);
    assert_eq!(after_delete.used, 0);
}
