//! Index versus disk reconciliation.
//!
//! The index and the chunk files are not updated in one transaction. A crash
//! after the index row is written but before the file is, or after an
//! in-place append but before the row is saved, leaves them disagreeing.
//! This pass finds those cases and optionally repairs the ones that can be
//! repaired without guessing.

use crate::error::{Error, Result};
use crate::index::{Chunk, ChunkIndex};
use crate::store::ChunkStore;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Staging files younger than this may belong to a write still in flight.
pub const TEMP_FILE_GRACE: Duration = Duration::from_secs(60 * 60);

/// Findings from a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Number of index rows examined.
    pub chunks_checked: usize,
    /// Rows whose chunk file does not exist.
    pub missing: Vec<u64>,
    /// Rows whose file length disagrees with the recorded size.
    pub size_mismatch: Vec<u64>,
    /// Rows whose file content does not hash to the recorded hash.
    pub hash_mismatch: Vec<u64>,
    /// Chunk files with no index row.
    pub orphans: Vec<u64>,
    /// Staging files older than [`TEMP_FILE_GRACE`] left by interrupted writes.
    pub temp_files: Vec<PathBuf>,
    /// Over-long files cut back to their recorded size.
    pub truncated: Vec<u64>,
    /// Orphan files deleted.
    pub orphans_removed: usize,
    /// Staging files deleted.
    pub temp_files_removed: usize,
    /// Bytes reclaimed by truncation and orphan removal.
    pub bytes_freed: u64,
}

impl ReconcileReport {
    /// True when nothing is left inconsistent.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.size_mismatch.is_empty()
            && self.hash_mismatch.is_empty()
            && self.orphans.len() == self.orphans_removed
            && self.temp_files.len() == self.temp_files_removed
    }
}

enum Verdict {
    Ok,
    Missing,
    Truncated(u64),
    SizeMismatch,
    HashMismatch,
}

impl<I: ChunkIndex> ChunkStore<I> {
    /// Compare every index row with its file, then look for files without
    /// rows.
    ///
    /// With `repair`, orphan and stale staging files are deleted and files
    /// that are longer
    /// than their row are truncated when the recorded-size prefix still
    /// matches the recorded hash. Other findings are only reported.
    pub fn reconcile(&self, repair: bool) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        // Files first: a create writes its row before its file, so any file
        // seen here already has its row when the rows are listed below.
        let on_disk = self.locator().scan()?;
        let temp_files = self.locator().temp_files()?;
        let rows = self.index().chunks()?;
        let known: HashSet<u64> = rows.iter().map(|chunk| chunk.id).collect();

        for chunk in &rows {
            report.chunks_checked += 1;
            match self.check_chunk(chunk, repair)? {
                Verdict::Ok => {}
                Verdict::Missing => report.missing.push(chunk.id),
                Verdict::Truncated(freed) => {
                    report.truncated.push(chunk.id);
                    report.bytes_freed += freed;
                }
                Verdict::SizeMismatch => report.size_mismatch.push(chunk.id),
                Verdict::HashMismatch => report.hash_mismatch.push(chunk.id),
            }
        }

        for id in on_disk.into_iter().filter(|id| !known.contains(id)) {
            report.orphans.push(id);
            if !repair {
                continue;
            }

            let path = self.locator().path(id)?;
            let len = match fs::metadata(&path) {
                Ok(metadata) => metadata.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::chunk_io(&path, e)),
            };
            fs::remove_file(&path).map_err(|e| Error::chunk_io(&path, e))?;
            self.locator().prune_empty_dirs(id)?;
            report.orphans_removed += 1;
            report.bytes_freed += len;
            info!(chunk_id = id, bytes = len, "removed orphan chunk file");
        }

        for path in temp_files {
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                // Persisted or cleaned up since the walk.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::chunk_io(&path, e)),
            };
            let stale = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= TEMP_FILE_GRACE);
            if !stale {
                continue;
            }

            report.temp_files.push(path.clone());
            if !repair {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::chunk_io(&path, e)),
            }
            self.locator().prune_dirs_above(&path)?;
            report.temp_files_removed += 1;
            report.bytes_freed += metadata.len();
            info!(path = %path.display(), bytes = metadata.len(), "removed stale staging file");
        }

        Ok(report)
    }

    fn check_chunk(&self, chunk: &Chunk, repair: bool) -> Result<Verdict> {
        let path = self.locator().path(chunk.id)?;
        let _guard = self.chunk_locks.lock(&chunk.id);

        let len = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(chunk_id = chunk.id, "chunk file missing");
                return Ok(Verdict::Missing);
            }
            Err(e) => return Err(Error::chunk_io(&path, e)),
        };

        let file = File::open(&path).map_err(|e| Error::chunk_io(&path, e))?;
        let prefix_hash = self
            .algorithm()
            .digest_reader(file.take(chunk.size as u64))?;
        let expected = chunk.size as u64;

        if len == expected {
            if prefix_hash == chunk.hash {
                return Ok(Verdict::Ok);
            }
            warn!(chunk_id = chunk.id, "chunk content does not match its hash");
            return Ok(Verdict::HashMismatch);
        }

        // A longer file whose recorded prefix is intact is an append that
        // never reached the index.
        if len > expected && prefix_hash == chunk.hash {
            if !repair {
                return Ok(Verdict::SizeMismatch);
            }
            OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_len(expected))
                .map_err(|e| Error::chunk_io(&path, e))?;
            info!(
                chunk_id = chunk.id,
                from = len,
                to = expected,
                "truncated unrecorded append"
            );
            return Ok(Verdict::Truncated(len - expected));
        }

        warn!(
            chunk_id = chunk.id,
            recorded = expected,
            on_disk = len,
            "chunk size does not match index"
        );
        Ok(Verdict::SizeMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use crate::index::SqliteIndex;
    use crate::locator::ChunkLocator;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ChunkStore<SqliteIndex>) {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(
            ChunkLocator::new(temp_dir.path()),
            SqliteIndex::open_in_memory().unwrap(),
            Algorithm::Sha256,
        );
        (temp_dir, store)
    }

    #[test]
    fn test_clean_store() {
        let (_temp_dir, store) = setup();
        store.create_from_bytes(b"a").unwrap();
        store.create_from_bytes(b"b").unwrap();

        let report = store.reconcile(false).unwrap();
        assert_eq!(report.chunks_checked, 2);
        assert!(report.is_clean());
    }

    #[test]
    fn test_reports_missing_file() {
        let (_temp_dir, store) = setup();
        let chunk = store.create_from_bytes(b"a").unwrap();
        fs::remove_file(store.locator().path(chunk.id).unwrap()).unwrap();

        let report = store.reconcile(true).unwrap();
        assert_eq!(report.missing, vec![chunk.id]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_reports_hash_mismatch() {
        let (_temp_dir, store) = setup();
        let chunk = store.create_from_bytes(b"abc").unwrap();
        fs::write(store.locator().path(chunk.id).unwrap(), b"xyz").unwrap();

        let report = store.reconcile(true).unwrap();
        assert_eq!(report.hash_mismatch, vec![chunk.id]);
    }

    #[test]
    fn test_truncates_unrecorded_append() {
        let (_temp_dir, store) = setup();
        let chunk = store.create_from_bytes(b"abc").unwrap();
        let path = store.locator().path(chunk.id).unwrap();
        fs::write(&path, b"abcdef").unwrap();

        let report = store.reconcile(false).unwrap();
        assert_eq!(report.size_mismatch, vec![chunk.id]);
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");

        let report = store.reconcile(true).unwrap();
        assert_eq!(report.truncated, vec![chunk.id]);
        assert_eq!(report.bytes_freed, 3);
        assert!(report.is_clean());
        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_short_file_not_repaired() {
        let (_temp_dir, store) = setup();
        let chunk = store.create_from_bytes(b"abcdef").unwrap();
        fs::write(store.locator().path(chunk.id).unwrap(), b"abc").unwrap();

        let report = store.reconcile(true).unwrap();
        assert_eq!(report.size_mismatch, vec![chunk.id]);
        assert!(report.truncated.is_empty());
    }

    #[test]
    fn test_removes_orphans() {
        let (temp_dir, store) = setup();
        store.create_from_bytes(b"kept").unwrap();
        let orphan = store.locator().ensure_path(987654321).unwrap();
        fs::write(&orphan, b"left behind").unwrap();

        let report = store.reconcile(false).unwrap();
        assert_eq!(report.orphans, vec![987654321]);
        assert_eq!(report.orphans_removed, 0);
        assert!(orphan.exists());

        let report = store.reconcile(true).unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.bytes_freed, 11);
        assert!(report.is_clean());
        assert!(!orphan.exists());
        assert!(!temp_dir.path().join("987").exists());
    }

    #[test]
    fn test_removes_stale_temp_files() {
        let (_temp_dir, store) = setup();
        let chunk = store.create_from_bytes(b"kept").unwrap();
        let dir = store.locator().path(chunk.id).unwrap();
        let dir = dir.parent().unwrap();

        let stale = dir.join(".chunk-stale");
        fs::write(&stale, b"partial").unwrap();
        File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - TEMP_FILE_GRACE * 2)
            .unwrap();
        // Fresh staging files may belong to a write in progress.
        let fresh = dir.join(".chunk-fresh");
        fs::write(&fresh, b"in flight").unwrap();

        let report = store.reconcile(false).unwrap();
        assert_eq!(report.temp_files, vec![stale.clone()]);
        assert!(!report.is_clean());
        assert!(stale.exists());

        let report = store.reconcile(true).unwrap();
        assert_eq!(report.temp_files_removed, 1);
        assert_eq!(report.bytes_freed, 7);
        assert!(report.is_clean());
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(store.locator().exists(chunk.id).unwrap());
    }
}
