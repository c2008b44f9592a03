//! Indexed storage backend on embedded SQLite
//!
//! The primary backend: payload bytes and metadata live in separate tables
//! (`photos`, `metadata`, plus `post_refs` for the multi-valued post
//! references) and always move together inside a single transaction.
//! Initialization is idempotent and concurrency-safe; concurrent callers
//! share one in-flight open instead of racing separate opens.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{PhotoPayload, StorageAdapter, StorageKind, StoredPhoto};
use crate::error::{PhotoStorageError, PhotoStorageErrorCode, Result};
use crate::types::{PhotoMetadata, PhotoMetadataPatch, StorageStats};
use crate::util;

pub const DB_FILE_NAME: &str = "demedia-photos.db";
const SCHEMA_VERSION: i64 = 1;

pub struct IndexedAdapter {
    db_path: PathBuf,
    quota: Option<u64>,
    conn: tokio::sync::OnceCell<Arc<Mutex<Connection>>>,
}

fn unknown_error(message: &str, cause: rusqlite::Error) -> PhotoStorageError {
    PhotoStorageError::with_cause(PhotoStorageErrorCode::UnknownError, message, cause)
}

fn corrupted(message: String) -> PhotoStorageError {
    PhotoStorageError::new(PhotoStorageErrorCode::StorageCorrupted, message)
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| corrupted(format!("invalid stored timestamp: {}", millis)))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| corrupted(format!("invalid stored photo id: {}", raw)))
}

struct MetadataRow {
    id: String,
    filename: String,
    mime_type: String,
    size: i64,
    width: i64,
    height: i64,
    created_at: i64,
    last_accessed: i64,
    compressed: bool,
    original_size: Option<i64>,
}

impl MetadataRow {
    fn into_metadata(self, post_ids: Vec<String>) -> Result<PhotoMetadata> {
        Ok(PhotoMetadata {
            id: parse_id(&self.id)?,
            filename: self.filename,
            mime_type: self.mime_type,
            size: self.size as u64,
            width: self.width as u32,
            height: self.height as u32,
            created_at: millis_to_datetime(self.created_at)?,
            last_accessed: millis_to_datetime(self.last_accessed)?,
            post_ids,
            compressed: self.compressed,
            original_size: self.original_size.map(|s| s as u64),
        })
    }
}

const METADATA_COLUMNS: &str =
    "id, filename, mime_type, size, width, height, created_at, last_accessed, compressed, original_size";

fn row_to_metadata_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetadataRow> {
    Ok(MetadataRow {
        id: row.get(0)?,
        filename: row.get(1)?,
        mime_type: row.get(2)?,
        size: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        created_at: row.get(6)?,
        last_accessed: row.get(7)?,
        compressed: row.get(8)?,
        original_size: row.get(9)?,
    })
}

fn load_post_ids(conn: &Connection, id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT post_id FROM post_refs WHERE photo_id = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn load_metadata(conn: &Connection, id: &str) -> Result<Option<PhotoMetadata>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM metadata WHERE id = ?1", METADATA_COLUMNS),
            params![id],
            row_to_metadata_row,
        )
        .optional()
        .map_err(|e| unknown_error("failed to read metadata", e))?;

    match row {
        Some(row) => {
            let post_ids =
                load_post_ids(conn, id).map_err(|e| unknown_error("failed to read post refs", e))?;
            row.into_metadata(post_ids).map(Some)
        }
        None => Ok(None),
    }
}

fn write_metadata(tx: &rusqlite::Transaction<'_>, metadata: &PhotoMetadata) -> rusqlite::Result<()> {
    let id = metadata.id.to_string();
    tx.execute(
        "INSERT OR REPLACE INTO metadata
             (id, filename, mime_type, size, width, height, created_at, last_accessed, compressed, original_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            metadata.filename,
            metadata.mime_type,
            metadata.size as i64,
            metadata.width as i64,
            metadata.height as i64,
            metadata.created_at.timestamp_millis(),
            metadata.last_accessed.timestamp_millis(),
            metadata.compressed,
            metadata.original_size.map(|s| s as i64),
        ],
    )?;
    tx.execute("DELETE FROM post_refs WHERE photo_id = ?1", params![id])?;
    for post_id in &metadata.post_ids {
        tx.execute(
            "INSERT OR IGNORE INTO post_refs (photo_id, post_id) VALUES (?1, ?2)",
            params![id, post_id],
        )?;
    }
    Ok(())
}

impl IndexedAdapter {
    pub fn new(db_path: impl Into<PathBuf>, quota: Option<u64>) -> Self {
        Self {
            db_path: db_path.into(),
            quota,
            conn: tokio::sync::OnceCell::new(),
        }
    }

    fn open_database(db_path: &PathBuf) -> Result<Connection> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PhotoStorageError::with_cause(
                        PhotoStorageErrorCode::InitializationFailed,
                        format!("failed to create database directory {}", parent.display()),
                        e,
                    )
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| {
            PhotoStorageError::with_cause(
                PhotoStorageErrorCode::InitializationFailed,
                format!("failed to open database {}", db_path.display()),
                e,
            )
        })?;

        Self::upgrade_schema(&conn).map_err(|e| {
            PhotoStorageError::with_cause(
                PhotoStorageErrorCode::InitializationFailed,
                "failed to create database schema",
                e,
            )
        })?;

        Ok(conn)
    }

    /// Create the stores only if absent, then stamp the schema version
    fn upgrade_schema(conn: &Connection) -> rusqlite::Result<()> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS photos (
                 id   TEXT PRIMARY KEY,
                 data BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS metadata (
                 id            TEXT PRIMARY KEY,
                 filename      TEXT NOT NULL,
                 mime_type     TEXT NOT NULL,
                 size          INTEGER NOT NULL,
                 width         INTEGER NOT NULL,
                 height        INTEGER NOT NULL,
                 created_at    INTEGER NOT NULL,
                 last_accessed INTEGER NOT NULL,
                 compressed    INTEGER NOT NULL,
                 original_size INTEGER
             );
             CREATE INDEX IF NOT EXISTS idx_metadata_created_at ON metadata(created_at);
             CREATE INDEX IF NOT EXISTS idx_metadata_last_accessed ON metadata(last_accessed);
             CREATE TABLE IF NOT EXISTS post_refs (
                 photo_id TEXT NOT NULL,
                 post_id  TEXT NOT NULL,
                 PRIMARY KEY (photo_id, post_id)
             );
             CREATE INDEX IF NOT EXISTS idx_post_refs_post_id ON post_refs(post_id);",
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let db_path = self.db_path.clone();
        self.conn
            .get_or_try_init(|| async move {
                let conn = Self::open_database(&db_path)?;
                log::debug!("opened photo database at {}", db_path.display());
                Ok(Arc::new(Mutex::new(conn)))
            })
            .await
            .cloned()
    }

    /// Background `last_accessed` bookkeeping; failure is logged, never
    /// propagated.
    fn touch_last_accessed(&self, conn: Arc<Mutex<Connection>>, id: Uuid) {
        tokio::spawn(async move {
            let now = Utc::now().timestamp_millis();
            let result = conn.lock().unwrap().execute(
                "UPDATE metadata SET last_accessed = ?1 WHERE id = ?2",
                params![now, id.to_string()],
            );
            if let Err(e) = result {
                log::warn!("failed to update last_accessed for {}: {}", id, e);
            }
        });
    }
}

#[async_trait::async_trait]
impl StorageAdapter for IndexedAdapter {
    fn kind(&self) -> StorageKind {
        StorageKind::Indexed
    }

    async fn initialize(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn store(&self, id: Uuid, data: &[u8], metadata: &PhotoMetadata) -> Result<()> {
        let conn = self.connection().await?;
        let mut conn = conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| unknown_error("failed to begin transaction", e))?;

        tx.execute(
            "INSERT OR REPLACE INTO photos (id, data) VALUES (?1, ?2)",
            params![id.to_string(), data],
        )
        .map_err(|e| unknown_error("failed to write photo data", e))?;
        write_metadata(&tx, metadata).map_err(|e| unknown_error("failed to write metadata", e))?;

        tx.commit()
            .map_err(|e| unknown_error("failed to commit photo store", e))
    }

    async fn retrieve(&self, id: Uuid) -> Result<Option<StoredPhoto>> {
        let conn = self.connection().await?;
        let stored = {
            let guard = conn.lock().unwrap();
            let id_str = id.to_string();

            let data: Option<Vec<u8>> = guard
                .query_row(
                    "SELECT data FROM photos WHERE id = ?1",
                    params![id_str],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| unknown_error("failed to read photo data", e))?;

            match data {
                Some(data) => match load_metadata(&guard, &id_str)? {
                    Some(metadata) => Some(StoredPhoto {
                        data: PhotoPayload::Bytes(data),
                        metadata,
                    }),
                    None => {
                        return Err(corrupted(format!(
                            "photo {} has payload but no metadata",
                            id
                        )))
                    }
                },
                None => None,
            }
        };

        if stored.is_some() {
            self.touch_last_accessed(conn, id);
        }
        Ok(stored)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.connection().await?;
        let mut conn = conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| unknown_error("failed to begin transaction", e))?;

        let id_str = id.to_string();
        for sql in [
            "DELETE FROM photos WHERE id = ?1",
            "DELETE FROM metadata WHERE id = ?1",
            "DELETE FROM post_refs WHERE photo_id = ?1",
        ] {
            tx.execute(sql, params![id_str])
                .map_err(|e| unknown_error("failed to delete photo", e))?;
        }

        tx.commit()
            .map_err(|e| unknown_error("failed to commit photo delete", e))
    }

    async fn get_metadata(&self, id: Uuid) -> Result<Option<PhotoMetadata>> {
        let conn = self.connection().await?;
        let guard = conn.lock().unwrap();
        load_metadata(&guard, &id.to_string())
    }

    async fn update_metadata(&self, id: Uuid, patch: PhotoMetadataPatch) -> Result<PhotoMetadata> {
        let conn = self.connection().await?;
        let mut conn = conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| unknown_error("failed to begin transaction", e))?;

        let mut metadata = load_metadata(&tx, &id.to_string())?
            .ok_or_else(|| PhotoStorageError::not_found(id))?;
        patch.apply(&mut metadata);
        write_metadata(&tx, &metadata)
            .map_err(|e| unknown_error("failed to update metadata", e))?;

        tx.commit()
            .map_err(|e| unknown_error("failed to commit metadata update", e))?;
        Ok(metadata)
    }

    async fn list_all(&self) -> Result<Vec<PhotoMetadata>> {
        let conn = self.connection().await?;
        let guard = conn.lock().unwrap();

        let rows: Vec<MetadataRow> = {
            let mut stmt = guard
                .prepare(&format!("SELECT {} FROM metadata", METADATA_COLUMNS))
                .map_err(|e| unknown_error("failed to list metadata", e))?;
            let mapped = stmt
                .query_map([], row_to_metadata_row)
                .map_err(|e| unknown_error("failed to list metadata", e))?;
            mapped
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| unknown_error("failed to list metadata", e))?
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let post_ids = load_post_ids(&guard, &row.id)
                .map_err(|e| unknown_error("failed to read post refs", e))?;
            records.push(row.into_metadata(post_ids)?);
        }
        Ok(records)
    }

    async fn stats(&self) -> Result<StorageStats> {
        let conn = self.connection().await?;
        let guard = conn.lock().unwrap();

        let (count, used, oldest, newest): (i64, i64, Option<i64>, Option<i64>) = guard
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0), MIN(created_at), MAX(created_at)
                 FROM metadata",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|e| unknown_error("failed to compute stats", e))?;

        Ok(StorageStats {
            used: used as u64,
            available: util::estimate_available_space(self.quota, used as u64),
            photo_count: count as u64,
            oldest_photo: oldest.map(millis_to_datetime).transpose()?,
            newest_photo: newest.map(millis_to_datetime).transpose()?,
        })
    }

    async fn is_available(&self) -> bool {
        match self.connection().await {
            Ok(conn) => {
                let guard = conn.lock().unwrap();
                guard
                    .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .is_ok()
            }
            Err(e) => {
                log::debug!("indexed backend unavailable: {}", e);
                false
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.connection().await?;
        let mut conn = conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| unknown_error("failed to begin transaction", e))?;
        tx.execute_batch("DELETE FROM photos; DELETE FROM metadata; DELETE FROM post_refs;")
            .map_err(|e| unknown_error("failed to clear storage", e))?;
        tx.commit()
            .map_err(|e| unknown_error("failed to commit clear", e))
    }
}
