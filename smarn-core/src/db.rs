//! Screenshot store — metadata table + sqlite-vec index in one SQLite file
//!
//! Every screenshot is split across two tables that share an id space:
//! - `screenshots` — id, image path, application name, capture timestamp
//! - `screenshot_vectors` — a `vec0` virtual table keyed by `rowid` holding
//!   the embedding, searched by cosine distance
//!
//! Writes touch both halves inside one transaction, so readers on other pooled
//! connections see either none or both of them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use thiserror::Error;

use crate::config::{DatabaseConfig, SmarnConfig};
use crate::error::SmarnError;
use crate::models::{NearestScreenshot, ScreenshotEntry, StoredScreenshot};

/// Largest `k` the vec0 KNN query accepts.
pub const MAX_K: usize = 4096;

const METADATA_TABLE: &str = "screenshots";
const VECTOR_TABLE: &str = "screenshot_vectors";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid embedding: expected {expected} dimensions, got {actual}")]
    InvalidEmbedding { expected: usize, actual: usize },

    #[error("k must be a positive integer")]
    InvalidK,

    #[error("Invalid store configuration: {0}")]
    Config(String),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

static REGISTER_VEC: Once = Once::new();

/// Register sqlite-vec as an auto-extension so every connection opened
/// afterwards (by any pool) has `vec0` available.
fn register_sqlite_vec() {
    REGISTER_VEC.call_once(|| {
        // SAFETY: sqlite3_vec_init has the SQLite extension entry-point ABI;
        // auto_extension only stores the pointer and calls it per connection.
        let rc = unsafe {
            libsqlite3_sys::sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                unsafe extern "C" fn(
                    *mut libsqlite3_sys::sqlite3,
                    *mut *mut std::os::raw::c_char,
                    *const libsqlite3_sys::sqlite3_api_routines,
                ) -> std::os::raw::c_int,
            >(
                sqlite_vec::sqlite3_vec_init as *const ()
            )))
        };
        if rc != libsqlite3_sys::SQLITE_OK {
            tracing::error!(code = rc, "Failed to register sqlite-vec auto-extension");
        }
    });
}

/// Handle to the screenshot store. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
    dimensions: usize,
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("path", &self.path)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Open (creating if needed) the SQLite file at `path`.
    ///
    /// Does not create tables; call [`VectorStore::initialize`] once after opening.
    pub async fn open(
        path: impl AsRef<Path>,
        dimensions: usize,
        config: &DatabaseConfig,
    ) -> Result<Self, StoreError> {
        if dimensions == 0 {
            return Err(StoreError::Config(
                "embedding dimensions must be greater than 0".to_string(),
            ));
        }

        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        register_sqlite_vec();

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        tracing::info!(path = %path.display(), dimensions, "Opened screenshot store");

        Ok(Self {
            pool,
            dimensions,
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Create the metadata table and the vector index if they do not exist.
    ///
    /// Fails with [`StoreError::Corrupt`] if an existing vector index was
    /// created with a different dimensionality.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {METADATA_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image_path TEXT NOT NULL,
                application_name TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL
            )"
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{METADATA_TABLE}_timestamp
             ON {METADATA_TABLE} (timestamp DESC, id DESC)"
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {VECTOR_TABLE} USING vec0(
                embedding float[{}] distance_metric=cosine
            )",
            self.dimensions
        ))
        .execute(&mut *tx)
        .await?;

        let ddl: Option<String> =
            sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE name = ?1")
                .bind(VECTOR_TABLE)
                .fetch_optional(&mut *tx)
                .await?;

        let expected = format!("float[{}]", self.dimensions);
        match ddl {
            Some(sql) if sql.replace(' ', "").contains(&expected) => {}
            Some(sql) => {
                return Err(StoreError::Corrupt(format!(
                    "vector index was created with a different dimensionality (want {expected}): {sql}"
                )));
            }
            None => {
                return Err(StoreError::Corrupt(format!(
                    "vector index {VECTOR_TABLE} missing after creation"
                )));
            }
        }

        tx.commit().await?;
        tracing::info!("Screenshot store tables ready");
        Ok(())
    }

    /// Insert one screenshot stamped with the current time. Returns the new id.
    pub async fn insert(
        &self,
        image_path: &str,
        application_name: &str,
        embedding: &[f32],
    ) -> Result<i64, StoreError> {
        self.insert_at(image_path, application_name, embedding, Utc::now())
            .await
    }

    /// Insert one screenshot with an explicit capture time.
    pub async fn insert_at(
        &self,
        image_path: &str,
        application_name: &str,
        embedding: &[f32],
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.check_dimensions(embedding)?;
        let blob = embedding_to_blob(embedding);

        let mut tx = self.pool.begin().await?;
        let id = insert_metadata(&mut tx, image_path, application_name, timestamp).await?;
        insert_vector(&mut tx, id, &blob).await?;
        tx.commit().await?;

        tracing::debug!(id, image_path, "Inserted screenshot");
        Ok(id)
    }

    /// The entry with the latest timestamp (highest id on ties), or `None`
    /// when the store is empty.
    pub async fn last_entry(&self) -> Result<Option<StoredScreenshot>, StoreError> {
        // One read transaction so both halves come from the same snapshot.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT id, image_path, application_name, timestamp
             FROM {METADATA_TABLE}
             ORDER BY timestamp DESC, id DESC
             LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let entry = entry_from_row(&row)?;

        let blob: Option<Vec<u8>> = sqlx::query_scalar(&format!(
            "SELECT embedding FROM {VECTOR_TABLE} WHERE rowid = ?1"
        ))
        .bind(entry.id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        let blob = blob.ok_or_else(|| {
            StoreError::Corrupt(format!("screenshot {} has no vector row", entry.id))
        })?;

        Ok(Some(StoredScreenshot {
            embedding: blob_to_embedding(&blob)?,
            entry,
        }))
    }

    /// Up to `k` entries ordered by ascending cosine distance to `query`.
    ///
    /// `k` larger than the number of entries returns every entry; `k` above
    /// [`MAX_K`] is capped.
    pub async fn top_k(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<NearestScreenshot>, StoreError> {
        if k == 0 {
            return Err(StoreError::InvalidK);
        }
        self.check_dimensions(query)?;
        let k = k.min(MAX_K) as i64;

        let rows = sqlx::query(&format!(
            "WITH knn AS (
                SELECT rowid, distance
                FROM {VECTOR_TABLE}
                WHERE embedding MATCH ?1 AND k = ?2
            )
            SELECT s.id, s.image_path, s.application_name, s.timestamp, knn.distance
            FROM knn
            JOIN {METADATA_TABLE} s ON s.id = knn.rowid
            ORDER BY knn.distance ASC, s.id ASC"
        ))
        .bind(embedding_to_blob(query))
        .bind(k)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(NearestScreenshot {
                entry: entry_from_row(row)?,
                distance: row.try_get("distance")?,
            });
        }

        if results.is_empty() {
            tracing::debug!("top_k found no entries");
        }
        Ok(results)
    }

    /// Delete every entry from both tables in one transaction.
    /// Returns how many entries were removed.
    pub async fn purge_all(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(&format!("DELETE FROM {METADATA_TABLE}"))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(&format!("DELETE FROM {VECTOR_TABLE}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(removed, "Purged all screenshot entries");
        Ok(removed)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {METADATA_TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.dimensions {
            return Err(StoreError::InvalidEmbedding {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}

/// Open and initialise the store described by `config`.
pub async fn open_configured(config: &SmarnConfig) -> Result<VectorStore, SmarnError> {
    let dimensions = config.embedding.dimensions as usize;
    let store = VectorStore::open(config.database_path(), dimensions, &config.database).await?;
    store.initialize().await?;
    Ok(store)
}

async fn insert_metadata(
    conn: &mut SqliteConnection,
    image_path: &str,
    application_name: &str,
    timestamp: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let id = sqlx::query(&format!(
        "INSERT INTO {METADATA_TABLE} (image_path, application_name, timestamp)
         VALUES (?1, ?2, ?3)"
    ))
    .bind(image_path)
    .bind(application_name)
    .bind(format_timestamp(timestamp))
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

async fn insert_vector(conn: &mut SqliteConnection, id: i64, blob: &[u8]) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {VECTOR_TABLE} (rowid, embedding) VALUES (?1, ?2)"
    ))
    .bind(id)
    .bind(blob)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn entry_from_row(row: &SqliteRow) -> Result<ScreenshotEntry, StoreError> {
    let raw_timestamp: String = row.try_get("timestamp")?;
    Ok(ScreenshotEntry {
        id: row.try_get("id")?,
        image_path: row.try_get("image_path")?,
        application_name: row
            .try_get::<Option<String>, _>("application_name")?
            .unwrap_or_default(),
        timestamp: parse_timestamp(&raw_timestamp)?,
    })
}

/// Fixed-width RFC 3339 (microseconds, `Z`) so text order is time order.
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("invalid timestamp '{value}': {err}")))
}

/// Little-endian f32 blob, the layout vec0 reads directly.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

// ============================================================================
// TESTS
// ============================================================================
