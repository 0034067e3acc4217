//! Chunk and object metadata.
//!
//! The chunk store only needs the narrow [`ChunkIndex`] trait. [`SqliteIndex`]
//! implements it on top of SQLite and additionally owns the object tables
//! used by the assembler.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::locator::MIN_CHUNK_ID;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Metadata row for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: u64,
    pub size: usize,
    pub hash: Hash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata row for one logical object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Object {
    pub id: u64,
    pub size: u64,
    pub hash: Hash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The metadata operations the chunk store depends on.
///
/// Each call must be atomic on its own; the store never assumes a
/// transaction spanning several calls.
pub trait ChunkIndex: Send + Sync {
    /// Exact lookup by content hash.
    fn find_by_hash(&self, hash: &Hash) -> Result<Option<Chunk>>;

    /// Lookup by id.
    fn find_by_id(&self, id: u64) -> Result<Option<Chunk>>;

    /// Insert a new row and assign it a fresh id.
    ///
    /// Ids are unique, never reused, and never below [`MIN_CHUNK_ID`].
    fn create(&self, size: usize, hash: &Hash) -> Result<Chunk>;

    /// Persist `size` and `hash` of an existing row. Bumps `updated_at`.
    fn save(&self, chunk: &mut Chunk) -> Result<()>;

    /// How many object sequence slots point at the chunk.
    fn count_references(&self, chunk_id: u64) -> Result<u64>;

    /// All chunk rows, ordered by id.
    fn chunks(&self) -> Result<Vec<Chunk>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    size INTEGER NOT NULL,
    hash TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    size INTEGER NOT NULL,
    hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS object_chunks (
    object_id INTEGER NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
    number INTEGER NOT NULL,
    chunk_id INTEGER NOT NULL REFERENCES chunks(id),
    PRIMARY KEY(object_id, number)
);
CREATE INDEX IF NOT EXISTS object_chunks_chunk_id ON object_chunks(chunk_id);
"#;

/// SQLite-backed index.
///
/// A single connection guarded by a mutex; SQLite serializes writers anyway
/// and the store's calls are short.
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteIndex").finish_non_exhaustive()
    }
}

impl SqliteIndex {
    /// Open (creating if needed) an index database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Self::with_connection(conn)
    }

    /// A private in-memory index.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        // AUTOINCREMENT continues from sqlite_sequence, so seeding it makes
        // the first chunk id MIN_CHUNK_ID.
        conn.execute(
            "INSERT INTO sqlite_sequence(name, seq)
             SELECT 'chunks', ?1
             WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = 'chunks')",
            params![MIN_CHUNK_ID as i64 - 1],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert an object row and its chunk sequence in one transaction.
    pub fn create_object(&self, size: u64, hash: &Hash, chunk_ids: &[u64]) -> Result<Object> {
        let now = now_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO objects(size, hash, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![size as i64, hash.to_hex(), now],
        )?;
        let id = tx.last_insert_rowid() as u64;
        insert_sequence(&tx, id, chunk_ids)?;
        tx.commit()?;

        Ok(Object {
            id,
            size,
            hash: *hash,
            created_at: from_millis(now),
            updated_at: from_millis(now),
        })
    }

    pub fn find_object(&self, id: u64) -> Result<Option<Object>> {
        let conn = self.conn.lock();
        let object = conn
            .query_row(
                "SELECT id, size, hash, created_at, updated_at FROM objects WHERE id = ?1",
                params![id as i64],
                object_from_row,
            )
            .optional()?;
        object.transpose()
    }

    /// All object rows, ordered by id.
    pub fn objects(&self) -> Result<Vec<Object>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, size, hash, created_at, updated_at FROM objects ORDER BY id")?;
        let rows = stmt.query_map([], object_from_row)?;
        rows.map(|row| -> Result<_> { row? }).collect()
    }

    /// Chunk ids of an object in sequence order.
    pub fn object_chunk_ids(&self, object_id: u64) -> Result<Vec<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT chunk_id FROM object_chunks WHERE object_id = ?1 ORDER BY number",
        )?;
        let ids = stmt
            .query_map(params![object_id as i64], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(|id| id as u64))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Replace an object's size, hash and chunk sequence in one transaction.
    pub fn save_object(&self, object: &mut Object, chunk_ids: &[u64]) -> Result<()> {
        let now = now_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE objects SET size = ?1, hash = ?2, updated_at = ?3 WHERE id = ?4",
            params![object.size as i64, object.hash.to_hex(), now, object.id as i64],
        )?;
        if updated == 0 {
            return Err(Error::ObjectNotFound { id: object.id });
        }
        tx.execute(
            "DELETE FROM object_chunks WHERE object_id = ?1",
            params![object.id as i64],
        )?;
        insert_sequence(&tx, object.id, chunk_ids)?;
        tx.commit()?;

        object.updated_at = from_millis(now);
        Ok(())
    }

    /// Remove an object and its sequence. Returns false if it did not exist.
    pub fn delete_object(&self, id: u64) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM objects WHERE id = ?1", params![id as i64])?;
        Ok(deleted > 0)
    }
}

impl ChunkIndex for SqliteIndex {
    fn find_by_hash(&self, hash: &Hash) -> Result<Option<Chunk>> {
        let conn = self.conn.lock();
        let chunk = conn
            .query_row(
                "SELECT id, size, hash, created_at, updated_at FROM chunks WHERE hash = ?1",
                params![hash.to_hex()],
                chunk_from_row,
            )
            .optional()?;
        chunk.transpose()
    }

    fn find_by_id(&self, id: u64) -> Result<Option<Chunk>> {
        let conn = self.conn.lock();
        let chunk = conn
            .query_row(
                "SELECT id, size, hash, created_at, updated_at FROM chunks WHERE id = ?1",
                params![id as i64],
                chunk_from_row,
            )
            .optional()?;
        chunk.transpose()
    }

    fn create(&self, size: usize, hash: &Hash) -> Result<Chunk> {
        let now = now_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chunks(size, hash, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![size as i64, hash.to_hex(), now],
        )?;
        let id = conn.last_insert_rowid() as u64;

        Ok(Chunk {
            id,
            size,
            hash: *hash,
            created_at: from_millis(now),
            updated_at: from_millis(now),
        })
    }

    fn save(&self, chunk: &mut Chunk) -> Result<()> {
        let now = now_millis();
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE chunks SET size = ?1, hash = ?2, updated_at = ?3 WHERE id = ?4",
            params![chunk.size as i64, chunk.hash.to_hex(), now, chunk.id as i64],
        )?;
        if updated == 0 {
            return Err(Error::ChunkNotFound { id: chunk.id });
        }
        chunk.updated_at = from_millis(now);
        Ok(())
    }

    fn count_references(&self, chunk_id: u64) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM object_chunks WHERE chunk_id = ?1",
            params![chunk_id as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn chunks(&self) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, size, hash, created_at, updated_at FROM chunks ORDER BY id")?;
        let rows = stmt.query_map([], chunk_from_row)?;
        rows.map(|row| -> Result<_> { row? }).collect()
    }
}

fn insert_sequence(tx: &rusqlite::Transaction<'_>, object_id: u64, chunk_ids: &[u64]) -> Result<()> {
    let mut stmt =
        tx.prepare("INSERT INTO object_chunks(object_id, number, chunk_id) VALUES (?1, ?2, ?3)")?;
    for (number, chunk_id) in chunk_ids.iter().enumerate() {
        stmt.execute(params![object_id as i64, number as i64, *chunk_id as i64])?;
    }
    Ok(())
}

// Row mappers return a nested Result: the outer one for SQLite, the inner one
// for hashes that fail to parse.
fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Chunk>> {
    let hash: String = row.get(2)?;
    let id = row.get::<_, i64>(0)? as u64;
    let size = row.get::<_, i64>(1)? as usize;
    let created_at = from_millis(row.get(3)?);
    let updated_at = from_millis(row.get(4)?);
    Ok(Hash::from_hex(&hash).map(|hash| Chunk {
        id,
        size,
        hash,
        created_at,
        updated_at,
    }))
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Object>> {
    let hash: String = row.get(2)?;
    let id = row.get::<_, i64>(0)? as u64;
    let size = row.get::<_, i64>(1)? as u64;
    let created_at = from_millis(row.get(3)?);
    let updated_at = from_millis(row.get(4)?);
    Ok(Hash::from_hex(&hash).map(|hash| Object {
        id,
        size,
        hash,
        created_at,
        updated_at,
    }))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
