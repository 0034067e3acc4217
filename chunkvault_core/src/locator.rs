//! Sharded chunk file paths.
//!
//! A chunk id is split into groups of three decimal digits from the right,
//! and each group except the last names a directory level. Chunk `123456789`
//! lives at `123/456/789/123456789`, chunk `10000` at `10/000/10000`. Every
//! directory therefore holds at most 1000 entries.

use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Smallest id with a storage path. Lower ids are reserved.
pub const MIN_CHUNK_ID: u64 = 10_000;

/// Name prefix of the temporary files chunk writes are staged in.
pub const TEMP_PREFIX: &str = ".chunk-";

/// Maps chunk ids to files under a root directory.
#[derive(Debug, Clone)]
pub struct ChunkLocator {
    root: PathBuf,
}

impl ChunkLocator {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory groups for an id, most significant first.
    ///
    /// `123456789` yields `["123", "456", "789"]`.
    pub fn shards(id: u64) -> Result<Vec<String>> {
        if id < MIN_CHUNK_ID {
            return Err(Error::InvalidChunkId { id });
        }

        let digits = id.to_string();
        let head = digits.len() % 3;
        let mut groups = Vec::with_capacity(digits.len() / 3 + 1);
        if head > 0 {
            groups.push(digits[..head].to_string());
        }
        for start in (head..digits.len()).step_by(3) {
            groups.push(digits[start..start + 3].to_string());
        }
        Ok(groups)
    }

    /// Path of the chunk file. Does not touch the filesystem.
    pub fn path(&self, id: u64) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for shard in Self::shards(id)? {
            path.push(shard);
        }
        path.push(id.to_string());
        Ok(path)
    }

    /// Path of the chunk file, creating its shard directories.
    ///
    /// Safe to call concurrently for the same id: `create_dir_all` treats a
    /// directory that appeared in the meantime as success.
    pub fn ensure_path(&self, id: u64) -> Result<PathBuf> {
        let path = self.path(id)?;
        if let Some(dir) = path.parent()
            && !dir.is_dir()
        {
            fs::create_dir_all(dir).map_err(|e| Error::chunk_io(dir, e))?;
        }
        Ok(path)
    }

    /// Whether the chunk file exists.
    pub fn exists(&self, id: u64) -> Result<bool> {
        Ok(self.path(id)?.is_file())
    }

    /// Walk the shard tree and return the ids of every chunk file found,
    /// sorted ascending.
    ///
    /// Files whose name is not a valid id, or that do not sit at the path
    /// their id maps to, are skipped.
    pub fn scan(&self) -> Result<Vec<u64>> {
        Ok(self.walk()?.ids)
    }

    /// Staging files left in the shard tree by chunk writes that never
    /// completed, sorted.
    pub fn temp_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self.walk()?.temp_files)
    }

    fn walk(&self) -> Result<Walk> {
        let mut walk = Walk::default();
        if self.root.is_dir() {
            self.walk_dir(&self.root, &mut walk)?;
        }
        walk.ids.sort_unstable();
        walk.temp_files.sort();
        Ok(walk)
    }

    fn walk_dir(&self, dir: &Path, walk: &mut Walk) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| Error::chunk_io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::chunk_io(dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| Error::chunk_io(&path, e))?;

            if file_type.is_dir() {
                self.walk_dir(&path, walk)?;
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                walk.temp_files.push(path);
                continue;
            }
            if let Ok(id) = name.parse::<u64>()
                && self.path(id).is_ok_and(|expected| expected == path)
            {
                walk.ids.push(id);
            }
        }
        Ok(())
    }

    /// Remove shard directories left empty, from the deepest up.
    pub(crate) fn prune_empty_dirs(&self, id: u64) -> Result<()> {
        self.prune_dirs_above(&self.path(id)?)
    }

    /// Remove empty directories between `path` and the root.
    pub(crate) fn prune_dirs_above(&self, path: &Path) -> Result<()> {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root {
                break;
            }
            match fs::remove_dir(current) {
                Ok(()) => {}
                // Not empty, or already removed by someone else.
                Err(e)
                    if e.kind() == io::ErrorKind::DirectoryNotEmpty
                        || e.kind() == io::ErrorKind::NotFound =>
                {
                    break;
                }
                Err(e) => return Err(Error::chunk_io(current, e)),
            }
            dir = current.parent();
        }
        Ok(())
    }
}

#[derive(Default)]
struct Walk {
    ids: Vec<u64>,
    temp_files: Vec<PathBuf>,
}
