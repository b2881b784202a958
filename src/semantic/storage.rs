//! Durable embedding store.
//!
//! Database file: features.sqlite3
//!
//! store_meta (key -> value):
//! - schema_version: format version (1)
//! - model_id: hex SHA256 of the model name
//! - dimensions: embedding length
//!
//! features (one row per photo):
//! - identifier: TEXT primary key (`<scheme>:<key>`)
//! - dimensions: INTEGER
//! - checksum: INTEGER (CRC32 of the embedding blob)
//! - embedding: BLOB, [f32; dimensions] little-endian
//!
//! Every write is a single statement, so a crash leaves at most the record in
//! flight missing. The connection is behind a mutex, which serializes writers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::library::PhotoId;
use crate::semantic::encoder::ModelFingerprint;

/// Current schema version
const SCHEMA_VERSION: u32 = 1;

/// Bytes per stored float
const FLOAT_WIDTH: usize = 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Embedding store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Version mismatch: store version {0}, supported version {1}")]
    VersionMismatch(u32, u32),

    #[error("Corrupt record {identifier}: {reason}")]
    CorruptRecord { identifier: String, reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Errors from decoding a stored embedding blob.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("blob length {0} is not a multiple of {FLOAT_WIDTH}")]
    Misaligned(usize),

    #[error("blob holds {got} floats, expected {expected}")]
    WrongLength { expected: usize, got: usize },
}

/// Serialize an embedding as little-endian IEEE-754 floats.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * FLOAT_WIDTH);
    for &value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Inverse of [`encode_embedding`]. Bit-exact, NaN payloads included.
pub fn decode_embedding(bytes: &[u8], dimensions: usize) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % FLOAT_WIDTH != 0 {
        return Err(CodecError::Misaligned(bytes.len()));
    }
    let count = bytes.len() / FLOAT_WIDTH;
    if count != dimensions {
        return Err(CodecError::WrongLength {
            expected: dimensions,
            got: count,
        });
    }

    Ok(bytes
        .chunks_exact(FLOAT_WIDTH)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Everything read back from the store.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: HashMap<PhotoId, Vec<f32>>,
    /// Identifiers whose rows could not be decoded, with the reason.
    pub corrupt: Vec<(String, StoreError)>,
}

impl LoadedRecords {
    /// Corrupt rows whose identifier is still well-formed.
    pub fn corrupt_ids(&self) -> impl Iterator<Item = PhotoId> + '_ {
        self.corrupt
            .iter()
            .filter_map(|(identifier, _)| identifier.parse().ok())
    }

    /// Corrupt rows whose identifier is not a valid [`PhotoId`].
    pub fn malformed_identifiers(&self) -> impl Iterator<Item = &str> + '_ {
        self.corrupt
            .iter()
            .map(|(identifier, _)| identifier.as_str())
            .filter(|identifier| identifier.parse::<PhotoId>().is_err())
    }
}

/// Persistence for photo embeddings.
pub trait EmbeddingStore: Send + Sync {
    /// Read every record. Undecodable rows are reported, not fatal.
    fn load_all(&self) -> Result<LoadedRecords, StoreError>;

    /// Insert or replace the record for `id`.
    fn put(&self, id: &PhotoId, embedding: &[f32]) -> Result<(), StoreError>;

    /// Remove the record for `id`. Absent records are not an error.
    fn delete(&self, id: &PhotoId) -> Result<(), StoreError>;

    /// Remove the row stored under `identifier`, well-formed or not.
    fn purge(&self, identifier: &str) -> Result<(), StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

/// SQLite-backed [`EmbeddingStore`].
pub struct SqliteEmbeddingStore {
    path: PathBuf,
    dimensions: usize,
    conn: Mutex<Connection>,
}

impl SqliteEmbeddingStore {
    /// Open (or create) the store at `path` for embeddings of `model`.
    ///
    /// Records written by a different model or dimension are dropped: they
    /// live in another embedding space and can't be compared.
    pub fn open(path: &Path, model: &ModelFingerprint) -> Result<Self, StoreError> {
        let unavailable = |source| StoreError::Unavailable {
            path: path.to_path_buf(),
            source,
        };

        let mut conn = Connection::open(path).map_err(unavailable)?;
        apply_pragmas(&conn).map_err(unavailable)?;
        create_schema(&conn).map_err(unavailable)?;
        Self::check_model(&mut conn, model)?;

        Ok(Self {
            path: path.to_path_buf(),
            dimensions: model.dimensions,
            conn: Mutex::new(conn),
        })
    }

    /// Get the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_model(conn: &mut Connection, model: &ModelFingerprint) -> Result<(), StoreError> {
        let tx = conn.transaction()?;

        let version: Option<String> = tx
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(version) = version {
            let version: u32 = version.parse().unwrap_or(u32::MAX);
            if version > SCHEMA_VERSION {
                return Err(StoreError::VersionMismatch(version, SCHEMA_VERSION));
            }
        }

        let stored_model: Option<String> = tx
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'model_id'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let stored_dims: Option<String> = tx
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'dimensions'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let model_id = model.model_id_hex();
        let dims = model.dimensions.to_string();
        let matches = stored_model.as_deref() == Some(model_id.as_str())
            && stored_dims.as_deref() == Some(dims.as_str());

        if !matches {
            if stored_model.is_some() {
                log::warn!(
                    "Model changed to '{}' ({} dimensions), discarding stored embeddings",
                    model.name,
                    model.dimensions
                );
            }
            tx.execute("DELETE FROM features", [])?;
            for (key, value) in [
                ("schema_version", SCHEMA_VERSION.to_string()),
                ("model_id", model_id),
                ("dimensions", dims),
            ] {
                tx.execute(
                    "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn decode_row(
        &self,
        identifier: &str,
        dimensions: i64,
        checksum: i64,
        blob: &[u8],
    ) -> Result<(PhotoId, Vec<f32>), StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRecord {
            identifier: identifier.to_string(),
            reason,
        };

        let id: PhotoId = identifier.parse().map_err(|e| corrupt(format!("{e}")))?;

        if dimensions != self.dimensions as i64 {
            return Err(corrupt(format!(
                "row claims {} dimensions, store holds {}",
                dimensions, self.dimensions
            )));
        }

        if i64::from(crc32fast::hash(blob)) != checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let embedding =
            decode_embedding(blob, self.dimensions).map_err(|e| corrupt(e.to_string()))?;

        Ok((id, embedding))
    }
}

impl EmbeddingStore for SqliteEmbeddingStore {
    fn load_all(&self) -> Result<LoadedRecords, StoreError> {
        let conn = self.lock()?;
        let unavailable = |source| StoreError::Unavailable {
            path: self.path.clone(),
            source,
        };

        let mut stmt = conn
            .prepare("SELECT identifier, dimensions, checksum, embedding FROM features")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(unavailable)?;

        let mut loaded = LoadedRecords::default();
        for row in rows {
            let (identifier, dimensions, checksum, blob) = row.map_err(unavailable)?;
            match self.decode_row(&identifier, dimensions, checksum, &blob) {
                Ok((id, embedding)) => {
                    loaded.records.insert(id, embedding);
                }
                Err(err) => loaded.corrupt.push((identifier, err)),
            }
        }

        Ok(loaded)
    }

    fn put(&self, id: &PhotoId, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        let blob = encode_embedding(embedding);
        let checksum = i64::from(crc32fast::hash(&blob));

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO features (identifier, dimensions, checksum, embedding)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identifier) DO UPDATE SET
                dimensions = excluded.dimensions,
                checksum = excluded.checksum,
                embedding = excluded.embedding",
            params![id.as_str(), self.dimensions as i64, checksum, blob],
        )?;

        Ok(())
    }

    fn delete(&self, id: &PhotoId) -> Result<(), StoreError> {
        self.purge(id.as_str())
    }

    fn purge(&self, identifier: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM features WHERE identifier = ?1", params![identifier])?;
        Ok(())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM features", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        ",
    )
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS features (
            identifier TEXT PRIMARY KEY,
            dimensions INTEGER NOT NULL,
            checksum INTEGER NOT NULL,
            embedding BLOB NOT NULL
        );
        ",
    )
}
