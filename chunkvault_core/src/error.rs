//! Error types for chunkvault_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using chunkvault_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// I/O error on a specific chunk file or shard directory.
    #[error("I/O error at {path}: {source}")]
    ChunkIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The relational index rejected a query or write.
    #[error("Index error: {source}")]
    Index {
        #[from]
        source: rusqlite::Error,
    },

    /// Content does not fit in the remaining chunk capacity.
    #[error("Chunk capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded { requested: usize, available: usize },

    /// Chunk id falls in the reserved range and has no storage path.
    #[error("Invalid chunk id: {id}")]
    InvalidChunkId { id: u64 },

    /// Chunk bytes on disk disagree with the index.
    #[error("Corrupted chunk {id}: {reason}")]
    CorruptedChunk { id: u64, reason: String },

    /// Chunk not found in the index.
    #[error("Chunk not found: {id}")]
    ChunkNotFound { id: u64 },

    /// Object not found in the index.
    #[error("Object not found: {id}")]
    ObjectNotFound { id: u64 },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Vault is invalid or not initialized.
    #[error("Invalid vault at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub fn chunk_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::ChunkIo {
            path: path.into(),
            source,
        }
    }

    /// Create a CapacityExceeded error.
    pub fn capacity_exceeded(requested: usize, available: usize) -> Self {
        Error::CapacityExceeded {
            requested,
            available,
        }
    }

    /// Create a CorruptedChunk error.
    pub fn corrupted_chunk(id: u64, reason: impl Into<String>) -> Self {
        Error::CorruptedChunk {
            id,
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Contract violations: retrying with the same input fails the same way.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::InvalidChunkId { .. }
        )
    }

    /// Errors that indicate a programming bug rather than bad input or I/O.
    ///
    /// A chunk obtained through the index always has a valid id, so seeing
    /// `InvalidChunkId` means some caller fabricated a chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidChunkId { .. })
    }

    /// True for filesystem and index failures.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::ChunkIo { .. } | Error::Index { .. }
        )
    }
}
