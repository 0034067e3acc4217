//! Chunk creation, append and read.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::index::{Chunk, ChunkIndex};
use crate::locator::{ChunkLocator, TEMP_PREFIX};
use crate::lock::{KeyedLocks, PinGuard, PinTable};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// Maximum size of a single chunk: 1 MiB.
pub const CHUNK_CAPACITY: usize = 1 << 20;

/// Reader over the bytes of one chunk, capped at the size the caller saw.
pub type ChunkReader = io::Take<File>;

/// How an append was applied.
///
/// Only `InPlace` keeps the chunk id. For the other two the caller must
/// re-point its sequence slot at the returned chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    /// The chunk file was extended and its row updated.
    InPlace(Chunk),
    /// The chunk is shared, so the combined content went into a new chunk.
    Forked(Chunk),
    /// The combined content already existed as another chunk.
    Deduplicated(Chunk),
}

impl Appended {
    pub fn chunk(&self) -> &Chunk {
        match self {
            Appended::InPlace(chunk) | Appended::Forked(chunk) | Appended::Deduplicated(chunk) => {
                chunk
            }
        }
    }

    pub fn into_chunk(self) -> Chunk {
        match self {
            Appended::InPlace(chunk) | Appended::Forked(chunk) | Appended::Deduplicated(chunk) => {
                chunk
            }
        }
    }

    /// Whether the result lives under a different id than the input.
    pub fn relocated(&self) -> bool {
        !matches!(self, Appended::InPlace(_))
    }
}

/// A content-addressed chunk store.
///
/// Chunk files live under a [`ChunkLocator`]; metadata lives in a
/// [`ChunkIndex`]. Two chunks never hold the same bytes.
pub struct ChunkStore<I> {
    locator: ChunkLocator,
    index: I,
    algorithm: Algorithm,
    pub(crate) chunk_locks: KeyedLocks<u64>,
    hash_locks: KeyedLocks<Hash>,
    pins: PinTable<u64>,
}

impl<I> fmt::Debug for ChunkStore<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStore")
            .field("locator", &self.locator)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl<I: ChunkIndex> ChunkStore<I> {
    pub fn new(locator: ChunkLocator, index: I, algorithm: Algorithm) -> Self {
        Self {
            locator,
            index,
            algorithm,
            chunk_locks: KeyedLocks::new(),
            hash_locks: KeyedLocks::new(),
            pins: PinTable::new(),
        }
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn locator(&self) -> &ChunkLocator {
        &self.locator
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Fetch a chunk row by id.
    pub fn get(&self, id: u64) -> Result<Chunk> {
        self.index
            .find_by_id(id)?
            .ok_or(Error::ChunkNotFound { id })
    }

    /// Store `content` as a chunk, reusing an existing chunk with the same
    /// bytes when there is one.
    pub fn create_from_bytes(&self, content: &[u8]) -> Result<Chunk> {
        if content.len() > CHUNK_CAPACITY {
            return Err(Error::capacity_exceeded(content.len(), CHUNK_CAPACITY));
        }

        let hash = self.algorithm.digest(content);
        let _hash_guard = self.hash_locks.lock(&hash);

        match self.index.find_by_hash(&hash)? {
            Some(existing) => self.adopt(existing, content),
            None => self.insert(content, hash),
        }
    }

    /// The chunk holding zero bytes. Every object starts from it.
    pub fn create_empty(&self) -> Result<Chunk> {
        self.create_from_bytes(&[])
    }

    /// Append `data` to a chunk.
    ///
    /// Returns how the append was applied together with the number of bytes
    /// the caller's logical position advanced by, which is always
    /// `data.len()`.
    pub fn append_bytes(&self, chunk: &Chunk, data: &[u8]) -> Result<(Appended, usize)> {
        let path = self.locator.path(chunk.id)?;

        // Held across read, hash, and write so concurrent appends to the same
        // chunk see each other's bytes.
        let _chunk_guard = self.chunk_locks.lock(&chunk.id);

        // The caller's copy may be stale if someone else appended first.
        let mut current = self.get(chunk.id)?;

        let available = CHUNK_CAPACITY.saturating_sub(current.size);
        if data.len() > available {
            return Err(Error::capacity_exceeded(data.len(), available));
        }
        if data.is_empty() {
            return Ok((Appended::InPlace(current), 0));
        }

        let mut content = fs::read(&path).map_err(|e| Error::chunk_io(&path, e))?;
        if content.len() != current.size {
            warn!(
                chunk_id = current.id,
                recorded = current.size,
                on_disk = content.len(),
                "chunk size disagrees with index"
            );
            return Err(Error::corrupted_chunk(
                current.id,
                format!(
                    "index records {} bytes, file holds {}",
                    current.size,
                    content.len()
                ),
            ));
        }
        content.extend_from_slice(data);

        let hash = self.algorithm.digest(&content);
        let _hash_guard = self.hash_locks.lock(&hash);

        if let Some(existing) = self.index.find_by_hash(&hash)? {
            debug!(
                chunk_id = current.id,
                target_id = existing.id,
                "append deduplicated"
            );
            let existing = self.adopt(existing, &content)?;
            return Ok((Appended::Deduplicated(existing), data.len()));
        }

        // A pinned chunk is about to gain a reference the index cannot see yet.
        let references = self.index.count_references(current.id)?;
        let pinned = self.pins.is_pinned(&current.id);
        if references > 1 || pinned {
            let forked = self.insert(&content, hash)?;
            debug!(
                chunk_id = current.id,
                forked_id = forked.id,
                references,
                pinned,
                "shared chunk forked on append"
            );
            return Ok((Appended::Forked(forked), data.len()));
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| Error::chunk_io(&path, e))?;
        file.write_all(data)
            .and_then(|()| file.flush())
            .map_err(|e| Error::chunk_io(&path, e))?;

        current.size = content.len();
        current.hash = hash;
        self.index.save(&mut current)?;

        debug!(
            chunk_id = current.id,
            size = current.size,
            "appended in place"
        );
        Ok((Appended::InPlace(current), data.len()))
    }

    /// Store `content` and pin the resulting chunk. See [`pin`](Self::pin).
    pub fn create_pinned(&self, content: &[u8]) -> Result<(Chunk, PinGuard<'_, u64>)> {
        let chunk = self.create_from_bytes(content)?;
        self.pin(&chunk)
    }

    /// Pin a chunk so that appends fork it instead of extending it in place.
    ///
    /// Hold the guard until the chunk is linked into an object, after which
    /// its reference count protects it. If the chunk was extended in place
    /// after `chunk` was read, the content `chunk` describes is stored again
    /// and the chunk holding it is pinned instead.
    pub fn pin(&self, chunk: &Chunk) -> Result<(Chunk, PinGuard<'_, u64>)> {
        let mut target = chunk.clone();
        loop {
            {
                let _chunk_guard = self.chunk_locks.lock(&target.id);
                let current = self.get(target.id)?;
                if current.hash == target.hash {
                    return Ok((current, self.pins.pin(&target.id)));
                }
            }

            debug!(chunk_id = target.id, "chunk extended before pin, restoring prefix");
            // Appends only extend the file, so its first `target.size` bytes are intact.
            let content = self.read_chunk(&target)?;
            target = self.create_from_bytes(&content)?;
        }
    }

    /// Open the chunk's bytes for reading.
    ///
    /// The reader stops after `chunk.size` bytes, so a caller holding an older
    /// copy of the row keeps seeing the content its hash describes.
    pub fn open_reader(&self, chunk: &Chunk) -> Result<ChunkReader> {
        let path = self.locator.path(chunk.id)?;
        let file = File::open(&path).map_err(|e| Error::chunk_io(&path, e))?;
        Ok(file.take(chunk.size as u64))
    }

    /// Read a chunk fully and check it against its recorded hash.
    pub fn read_chunk(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        let path = self.locator.path(chunk.id)?;
        let mut content = Vec::with_capacity(chunk.size);
        self.open_reader(chunk)?
            .read_to_end(&mut content)
            .map_err(|e| Error::chunk_io(&path, e))?;

        if content.len() != chunk.size {
            return Err(Error::corrupted_chunk(
                chunk.id,
                format!("expected {} bytes, read {}", chunk.size, content.len()),
            ));
        }
        let computed = self.algorithm.digest(&content);
        if computed != chunk.hash {
            return Err(Error::corrupted_chunk(
                chunk.id,
                format!("hash mismatch: expected {}, got {}", chunk.hash, computed),
            ));
        }

        Ok(content)
    }

    /// Return a row that already carries `content`'s hash, rewriting its
    /// file if an earlier create never got to write it.
    fn adopt(&self, existing: Chunk, content: &[u8]) -> Result<Chunk> {
        if self.locator.exists(existing.id)? {
            debug!(chunk_id = existing.id, "chunk deduplicated");
            return Ok(existing);
        }

        warn!(chunk_id = existing.id, "index row without chunk file, rewriting");
        self.write_chunk_file(existing.id, content)?;
        Ok(existing)
    }

    /// Allocate a row for new content and write its file.
    ///
    /// If the write fails the row stays behind without a file; the next
    /// create of the same content repairs it through `adopt`.
    fn insert(&self, content: &[u8], hash: Hash) -> Result<Chunk> {
        let chunk = self.index.create(content.len(), &hash)?;
        self.write_chunk_file(chunk.id, content)?;
        debug!(chunk_id = chunk.id, size = chunk.size, "chunk created");
        Ok(chunk)
    }

    /// Write a whole chunk file atomically using tempfile.
    fn write_chunk_file(&self, id: u64, content: &[u8]) -> Result<()> {
        let path = self.locator.ensure_path(id)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::invalid_store(&path, "chunk path has no parent"))?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| Error::chunk_io(dir, e))?;
        temp_file
            .write_all(content)
            .and_then(|()| temp_file.flush())
            .map_err(|e| Error::chunk_io(temp_file.path(), e))?;
        temp_file
            .persist(&path)
            .map_err(|e| Error::chunk_io(&path, e.error))?;

        Ok(())
    }
}
