//! Logical objects assembled from ordered chunk sequences.

use crate::error::{Error, Result};
use crate::index::{Chunk, Object, SqliteIndex};
use crate::lock::KeyedLocks;
use crate::store::{CHUNK_CAPACITY, ChunkReader, ChunkStore};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;

/// Builds and extends objects on top of a chunk store.
///
/// Owns the object rows and their chunk sequences. Appends to one object are
/// serialized; different objects proceed in parallel.
#[derive(Debug)]
pub struct ObjectAssembler {
    store: Arc<ChunkStore<SqliteIndex>>,
    locks: KeyedLocks<u64>,
}

impl ObjectAssembler {
    pub fn new(store: Arc<ChunkStore<SqliteIndex>>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Create an object from in-memory content.
    pub fn create(&self, content: &[u8]) -> Result<Object> {
        self.create_from_reader(content)
    }

    /// Create an object from a stream, one chunk at a time.
    ///
    /// Empty input still gets one sequence slot: the empty chunk.
    pub fn create_from_reader<R: Read>(&self, mut reader: R) -> Result<Object> {
        let mut hasher = self.store.algorithm().hasher();
        let mut chunk_ids = Vec::new();
        // Chunks stay pinned until the sequence row commits.
        let mut pins = Vec::new();
        let mut size = 0u64;

        loop {
            let piece = read_up_to(&mut reader, CHUNK_CAPACITY)?;
            if piece.is_empty() {
                break;
            }
            hasher.update(&piece);
            let (chunk, pin) = self.store.create_pinned(&piece)?;
            chunk_ids.push(chunk.id);
            pins.push(pin);
            size += piece.len() as u64;
        }
        if chunk_ids.is_empty() {
            let (chunk, pin) = self.store.create_pinned(&[])?;
            chunk_ids.push(chunk.id);
            pins.push(pin);
        }

        let object = self
            .store
            .index()
            .create_object(size, &hasher.finalize(), &chunk_ids)?;
        debug!(
            object_id = object.id,
            size,
            chunks = chunk_ids.len(),
            "object created"
        );
        Ok(object)
    }

    /// Append in-memory data to an object.
    pub fn append(&self, id: u64, data: &[u8]) -> Result<Object> {
        self.append_from_reader(id, data)
    }

    /// Append a stream to an object.
    ///
    /// Fills the last chunk first, re-pointing its slot if the chunk store
    /// forked or deduplicated it, then spills into new chunks.
    pub fn append_from_reader<R: Read>(&self, id: u64, mut reader: R) -> Result<Object> {
        let _guard = self.locks.lock(&id);

        let mut object = self.get(id)?;
        let mut chunk_ids = self.store.index().object_chunk_ids(id)?;
        let mut pins = Vec::new();

        // Rehash the existing content before the last chunk changes underneath.
        let mut hasher = self.store.algorithm().hasher();
        for chunk in self.load_chunks(&chunk_ids)? {
            io::copy(&mut self.store.open_reader(&chunk)?, &mut hasher)?;
        }

        if let Some(last_id) = chunk_ids.last_mut() {
            let last = self.store.get(*last_id)?;
            let head = read_up_to(&mut reader, CHUNK_CAPACITY.saturating_sub(last.size))?;
            if !head.is_empty() {
                hasher.update(&head);
                let (appended, written) = self.store.append_bytes(&last, &head)?;
                if appended.relocated() {
                    let (chunk, pin) = self.store.pin(appended.chunk())?;
                    debug!(
                        object_id = id,
                        from = last.id,
                        to = chunk.id,
                        "sequence slot re-pointed"
                    );
                    *last_id = chunk.id;
                    pins.push(pin);
                }
                object.size += written as u64;
            }
        }

        loop {
            let piece = read_up_to(&mut reader, CHUNK_CAPACITY)?;
            if piece.is_empty() {
                break;
            }
            hasher.update(&piece);
            let (chunk, pin) = self.store.create_pinned(&piece)?;
            chunk_ids.push(chunk.id);
            pins.push(pin);
            object.size += piece.len() as u64;
        }

        object.hash = hasher.finalize();
        self.store.index().save_object(&mut object, &chunk_ids)?;
        drop(pins);
        Ok(object)
    }

    pub fn get(&self, id: u64) -> Result<Object> {
        self.store
            .index()
            .find_object(id)?
            .ok_or(Error::ObjectNotFound { id })
    }

    /// All objects, ordered by id.
    pub fn list(&self) -> Result<Vec<Object>> {
        self.store.index().objects()
    }

    /// The object's chunks in sequence order.
    pub fn chunks(&self, id: u64) -> Result<Vec<Chunk>> {
        self.get(id)?;
        let chunk_ids = self.store.index().object_chunk_ids(id)?;
        self.load_chunks(&chunk_ids)
    }

    /// Stream the object's content chunk by chunk.
    pub fn reader(&self, id: u64) -> Result<ObjectReader> {
        Ok(ObjectReader {
            store: Arc::clone(&self.store),
            pending: self.chunks(id)?.into(),
            current: None,
        })
    }

    /// Read the whole object into memory.
    pub fn read(&self, id: u64) -> Result<Vec<u8>> {
        let object = self.get(id)?;
        let mut content = Vec::with_capacity(object.size as usize);
        self.reader(id)?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Drop the object and its sequence. Chunk files stay on disk.
    pub fn delete(&self, id: u64) -> Result<()> {
        let _guard = self.locks.lock(&id);
        if !self.store.index().delete_object(id)? {
            return Err(Error::ObjectNotFound { id });
        }
        debug!(object_id = id, "object deleted");
        Ok(())
    }

    fn load_chunks(&self, chunk_ids: &[u64]) -> Result<Vec<Chunk>> {
        chunk_ids.iter().map(|id| self.store.get(*id)).collect()
    }
}

/// Sequential reader over an object's chunks.
///
/// The chunk rows are captured when the reader is created.
pub struct ObjectReader {
    store: Arc<ChunkStore<SqliteIndex>>,
    pending: VecDeque<Chunk>,
    current: Option<ChunkReader>,
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }

            let Some(chunk) = self.pending.pop_front() else {
                return Ok(0);
            };
            let reader = self.store.open_reader(&chunk).map_err(into_io)?;
            self.current = Some(reader);
        }
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io { source } | Error::ChunkIo { source, .. } => source,
        other => io::Error::other(other),
    }
}

/// Read until `limit` bytes or end of stream.
fn read_up_to<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use crate::locator::ChunkLocator;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectAssembler) {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(
            ChunkLocator::new(temp_dir.path()),
            SqliteIndex::open_in_memory().unwrap(),
            Algorithm::Blake3,
        );
        (temp_dir, ObjectAssembler::new(Arc::new(store)))
    }

    #[test]
    fn test_create_and_read() {
        let (_temp_dir, objects) = setup();

        let object = objects.create(b"hello world").unwrap();
        assert_eq!(object.size, 11);
        assert_eq!(object.hash, Algorithm::Blake3.digest(b"hello world"));
        assert_eq!(objects.read(object.id).unwrap(), b"hello world");
        assert_eq!(objects.chunks(object.id).unwrap().len(), 1);
    }

    #[test]
    fn test_create_empty_object() {
        let (_temp_dir, objects) = setup();

        let object = objects.create(b"").unwrap();
        let chunks = objects.chunks(object.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 0);
        assert_eq!(object.hash, Algorithm::Blake3.empty());
        assert!(objects.read(object.id).unwrap().is_empty());
    }

    #[test]
    fn test_large_object_spans_chunks() {
        let (_temp_dir, objects) = setup();

        let content: Vec<u8> = (0..CHUNK_CAPACITY * 2 + 100)
            .map(|i| (i % 251) as u8)
            .collect();
        let object = objects.create(&content).unwrap();

        let chunks = objects.chunks(object.id).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![CHUNK_CAPACITY, CHUNK_CAPACITY, 100]);
        assert_eq!(objects.read(object.id).unwrap(), content);
    }

    #[test]
    fn test_identical_objects_share_chunks() {
        let (_temp_dir, objects) = setup();

        let a = objects.create(b"duplicate").unwrap();
        let b = objects.create(b"duplicate").unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(
            objects.chunks(a.id).unwrap()[0].id,
            objects.chunks(b.id).unwrap()[0].id
        );
    }

    #[test]
    fn test_append_extends_object() {
        let (_temp_dir, objects) = setup();

        let object = objects.create(b"hello").unwrap();
        let chunk_before = objects.chunks(object.id).unwrap()[0].id;

        let appended = objects.append(object.id, b" world").unwrap();
        assert_eq!(appended.size, 11);
        assert_eq!(appended.hash, Algorithm::Blake3.digest(b"hello world"));
        assert_eq!(objects.read(object.id).unwrap(), b"hello world");
        // Sole owner: extended in place
        assert_eq!(objects.chunks(object.id).unwrap()[0].id, chunk_before);
    }

    #[test]
    fn test_append_to_shared_chunk_leaves_other_object_intact() {
        let (_temp_dir, objects) = setup();

        let a = objects.create(b"common").unwrap();
        let b = objects.create(b"common").unwrap();

        objects.append(a.id, b" suffix").unwrap();

        assert_eq!(objects.read(a.id).unwrap(), b"common suffix");
        assert_eq!(objects.read(b.id).unwrap(), b"common");
        assert_ne!(
            objects.chunks(a.id).unwrap()[0].id,
            objects.chunks(b.id).unwrap()[0].id
        );
    }

    #[test]
    fn test_append_to_empty_objects() {
        let (_temp_dir, objects) = setup();

        // Both start on the shared empty chunk.
        let a = objects.create(b"").unwrap();
        let b = objects.create(b"").unwrap();

        objects.append(a.id, b"first").unwrap();
        objects.append(b.id, b"second").unwrap();

        assert_eq!(objects.read(a.id).unwrap(), b"first");
        assert_eq!(objects.read(b.id).unwrap(), b"second");
    }

    #[test]
    fn test_append_spills_into_new_chunks() {
        let (_temp_dir, objects) = setup();

        let head = vec![1u8; CHUNK_CAPACITY - 10];
        let object = objects.create(&head).unwrap();
        let tail = vec![2u8; CHUNK_CAPACITY + 20];
        let appended = objects.append(object.id, &tail).unwrap();

        let sizes: Vec<usize> = objects
            .chunks(object.id)
            .unwrap()
            .iter()
            .map(|c| c.size)
            .collect();
        assert_eq!(sizes, vec![CHUNK_CAPACITY, CHUNK_CAPACITY, 10]);

        let mut expected = head;
        expected.extend_from_slice(&tail);
        assert_eq!(appended.size, expected.len() as u64);
        assert_eq!(appended.hash, Algorithm::Blake3.digest(&expected));
        assert_eq!(objects.read(object.id).unwrap(), expected);
    }

    #[test]
    fn test_append_deduplicates_into_existing_chunk() {
        let (_temp_dir, objects) = setup();

        let full = objects.create(b"abcdef").unwrap();
        let partial = objects.create(b"abc").unwrap();
        objects.append(partial.id, b"def").unwrap();

        assert_eq!(
            objects.chunks(partial.id).unwrap()[0].id,
            objects.chunks(full.id).unwrap()[0].id
        );
        assert_eq!(objects.read(partial.id).unwrap(), b"abcdef");
    }

    #[test]
    fn test_concurrent_object_appends() {
        let (_temp_dir, objects) = setup();
        let object = objects.create(b"").unwrap();

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let objects = &objects;
                s.spawn(move || {
                    for _ in 0..10 {
                        objects.append(object.id, &[t; 3]).unwrap();
                    }
                });
            }
        });

        let content = objects.read(object.id).unwrap();
        assert_eq!(content.len(), 4 * 10 * 3);
        assert_eq!(objects.get(object.id).unwrap().size, 120);
        assert_eq!(
            objects.get(object.id).unwrap().hash,
            Algorithm::Blake3.digest(&content)
        );
    }

    #[test]
    fn test_delete_object() {
        let (_temp_dir, objects) = setup();

        let object = objects.create(b"gone").unwrap();
        objects.delete(object.id).unwrap();

        assert!(matches!(
            objects.get(object.id),
            Err(Error::ObjectNotFound { .. })
        ));
        assert!(objects.delete(object.id).is_err());
        assert!(objects.list().unwrap().is_empty());
    }

    #[test]
    fn test_missing_object() {
        let (_temp_dir, objects) = setup();
        assert!(matches!(
            objects.append(999, b"x"),
            Err(Error::ObjectNotFound { id: 999 })
        ));
        assert!(objects.reader(999).is_err());
    }

    #[test]
    fn test_pending_link_survives_owner_append() {
        let (_temp_dir, objects) = setup();
        let store = Arc::clone(&objects.store);

        let owner = objects.create(b"shared").unwrap();
        // A second object has deduplicated onto the owner's chunk but not
        // linked it yet.
        let (chunk, pin) = store.create_pinned(b"shared").unwrap();
        assert_eq!(chunk.id, objects.chunks(owner.id).unwrap()[0].id);

        objects.append(owner.id, b" tail").unwrap();
        let late = store
            .index()
            .create_object(6, &chunk.hash, &[chunk.id])
            .unwrap();
        drop(pin);

        assert_eq!(objects.read(owner.id).unwrap(), b"shared tail");
        assert_eq!(objects.read(late.id).unwrap(), b"shared");
    }

    #[test]
    fn test_repeated_pieces_link_one_chunk() {
        let (_temp_dir, objects) = setup();

        let content = vec![7u8; CHUNK_CAPACITY * 2];
        let object = objects.create(&content).unwrap();

        let chunks = objects.chunks(object.id).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, chunks[1].id);
        assert_eq!(objects.read(object.id).unwrap(), content);
    }
}
