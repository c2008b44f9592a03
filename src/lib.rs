// deMedia - client-side photo persistence engine

pub mod compress;
pub mod error;
pub mod service;
pub mod storage;
pub mod types;
pub mod util;

pub use error::{retry_with_backoff, PhotoStorageError, PhotoStorageErrorCode, RetryOptions};
pub use service::{PhotoStore, PhotoStoreConfig};
pub use storage::{PhotoPayload, StorageAdapter, StorageKind, StoredPhoto};
pub use types::{PhotoFile, PhotoMetadata, PhotoMetadataPatch, StorageStats};
