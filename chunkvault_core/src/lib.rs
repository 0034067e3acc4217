//! # Chunkvault Core
//!
//! A chunked, content-addressed object store.
//!
//! Objects are stored as ordered sequences of chunks of at most 1 MiB. Each
//! chunk is identified by a numeric id assigned by a relational index, stored
//! once per distinct content (by SHA-256 or BLAKE3 digest), and sharded on
//! disk by its decimal id. Appending to a chunk that several objects share
//! forks it instead of mutating it.
//!
//! ## Features
//!
//! - Deduplication: identical byte sequences are stored once
//! - Copy-on-write appends for shared chunks
//! - Per-chunk locking around append
//! - Sharded layout bounded at 1000 entries per directory
//! - Reconciliation of the index against the chunk files
//!
//! ## Example
//!
//! ```no_run
//! use chunkvault_core::{Algorithm, Vault};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vault = Vault::init("./my-vault", Algorithm::Sha256)?;
//!
//! // Create an object and append to it
//! let object = vault.objects().create(b"hello")?;
//! vault.objects().append(object.id, b" world")?;
//! assert_eq!(vault.objects().read(object.id)?, b"hello world");
//!
//! // Work with chunks directly
//! let chunk = vault.store().create_from_bytes(b"raw bytes")?;
//! let (appended, written) = vault.store().append_bytes(&chunk, b"!")?;
//! println!("{} bytes now in chunk {}", written, appended.chunk().id);
//!
//! // Compare the index with the files on disk
//! let report = vault.reconcile(false)?;
//! println!("clean: {}", report.is_clean());
//! # Ok(())
//! # }
//! ```

mod error;
mod hash;
mod index;
mod locator;
mod lock;
mod object;
mod reconcile;
mod store;
mod vault;

pub use error::{Error, Result};
pub use hash::{Algorithm, HASH_SIZE, Hash, Hasher};
pub use index::{Chunk, ChunkIndex, Object, SqliteIndex};
pub use locator::{ChunkLocator, MIN_CHUNK_ID, TEMP_PREFIX};
pub use lock::{KeyGuard, KeyedLocks, PinGuard, PinTable};
pub use object::{ObjectAssembler, ObjectReader};
pub use reconcile::{ReconcileReport, TEMP_FILE_GRACE};
pub use store::{Appended, CHUNK_CAPACITY, ChunkReader, ChunkStore};
pub use vault::Vault;
