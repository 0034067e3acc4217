//! Vault layout and configuration.

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use crate::index::SqliteIndex;
use crate::locator::ChunkLocator;
use crate::object::ObjectAssembler;
use crate::reconcile::ReconcileReport;
use crate::store::ChunkStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const CONFIG_FILE: &str = "config";
const CHUNKS_DIR: &str = "chunks";
const INDEX_FILE: &str = "index.sqlite";

/// A chunk store, its index and its object assembler under one root.
///
/// Construct one per process and share it by reference.
#[derive(Debug)]
pub struct Vault {
    root: PathBuf,
    store: Arc<ChunkStore<SqliteIndex>>,
    objects: ObjectAssembler,
}

impl Vault {
    /// Initialize a new vault at the given path.
    ///
    /// Creates the directory structure:
    /// - `chunks/` for sharded chunk files
    /// - `index.sqlite` for chunk and object metadata
    /// - `config` file with version and algorithm
    pub fn init<P: AsRef<Path>>(root: P, algorithm: Algorithm) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if root.join(CONFIG_FILE).exists() {
            return Err(Error::invalid_store(&root, "vault already initialized"));
        }

        fs::create_dir_all(root.join(CHUNKS_DIR)).map_err(|e| Error::chunk_io(&root, e))?;

        let config_content = format!("version=1\nalgo={}\n", algorithm.as_str());
        fs::write(root.join(CONFIG_FILE), config_content)?;

        info!(root = %root.display(), algorithm = algorithm.as_str(), "vault initialized");
        Self::assemble(root, algorithm)
    }

    /// Open an existing vault at the given path.
    ///
    /// Validates the layout and reads the configuration.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_store(&root, "directory does not exist"));
        }

        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }
        let algorithm = Self::parse_config(&fs::read_to_string(&config_path)?)?;

        if !root.join(CHUNKS_DIR).is_dir() {
            return Err(Error::invalid_store(&root, "chunks directory missing"));
        }
        if !root.join(INDEX_FILE).is_file() {
            return Err(Error::invalid_store(&root, "index database missing"));
        }

        info!(root = %root.display(), algorithm = algorithm.as_str(), "vault opened");
        Self::assemble(root, algorithm)
    }

    fn assemble(root: PathBuf, algorithm: Algorithm) -> Result<Self> {
        let index = SqliteIndex::open(root.join(INDEX_FILE))?;
        let locator = ChunkLocator::new(root.join(CHUNKS_DIR));
        let store = Arc::new(ChunkStore::new(locator, index, algorithm));
        let objects = ObjectAssembler::new(Arc::clone(&store));

        Ok(Self {
            root,
            store,
            objects,
        })
    }

    /// Parse the config file to extract the algorithm.
    fn parse_config(content: &str) -> Result<Algorithm> {
        let mut version = None;
        let mut algo = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_store(
                CONFIG_FILE,
                format!("unsupported config version: {:?}", version),
            ));
        }

        let algo_str =
            algo.ok_or_else(|| Error::invalid_store(CONFIG_FILE, "missing algo in config"))?;
        Algorithm::parse(algo_str)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> Algorithm {
        self.store.algorithm()
    }

    /// The chunk store.
    pub fn store(&self) -> &ChunkStore<SqliteIndex> {
        &self.store
    }

    /// The object assembler.
    pub fn objects(&self) -> &ObjectAssembler {
        &self.objects
    }

    /// Check index rows against chunk files. See [`ChunkStore::reconcile`].
    pub fn reconcile(&self, repair: bool) -> Result<ReconcileReport> {
        self.store.reconcile(repair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vault_init() {
        let temp_dir = TempDir::new().unwrap();
        let vault = Vault::init(temp_dir.path(), Algorithm::Sha256).unwrap();

        assert!(temp_dir.path().join("config").exists());
        assert!(temp_dir.path().join("chunks").is_dir());
        assert!(temp_dir.path().join("index.sqlite").is_file());
        assert_eq!(vault.algorithm(), Algorithm::Sha256);

        let config = fs::read_to_string(temp_dir.path().join("config")).unwrap();
        assert!(config.contains("version=1"));
        assert!(config.contains("algo=sha256"));
    }

    #[test]
    fn test_vault_init_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        Vault::init(temp_dir.path(), Algorithm::Sha256).unwrap();
        assert!(Vault::init(temp_dir.path(), Algorithm::Blake3).is_err());
    }

    #[test]
    fn test_vault_open_persists_data() {
        let temp_dir = TempDir::new().unwrap();
        let id = {
            let vault = Vault::init(temp_dir.path(), Algorithm::Blake3).unwrap();
            vault.objects().create(b"persisted").unwrap().id
        };

        let vault = Vault::open(temp_dir.path()).unwrap();
        assert_eq!(vault.algorithm(), Algorithm::Blake3);
        assert_eq!(vault.objects().read(id).unwrap(), b"persisted");

        let chunk = &vault.objects().chunks(id).unwrap()[0];
        let path = temp_dir.path().join("chunks").join("10").join("000").join("10000");
        assert_eq!(vault.store().locator().path(chunk.id).unwrap(), path);
    }

    #[test]
    fn test_vault_open_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let result = Vault::open(temp_dir.path().join("nonexistent"));
        assert!(matches!(result, Err(Error::InvalidStore { .. })));
    }

    #[test]
    fn test_vault_open_without_config() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            Vault::open(temp_dir.path()),
            Err(Error::InvalidStore { .. })
        ));
    }

    #[test]
    fn test_parse_config() {
        let config = "version=1\nalgo=sha256\n";
        assert_eq!(Vault::parse_config(config).unwrap(), Algorithm::Sha256);
    }

    #[test]
    fn test_parse_config_with_comments() {
        let config = "# vault config\nversion = 1\n\nalgo = blake3-256\n";
        assert_eq!(Vault::parse_config(config).unwrap(), Algorithm::Blake3);
    }

    #[test]
    fn test_parse_config_invalid_version() {
        assert!(Vault::parse_config("version=2\nalgo=sha256\n").is_err());
    }

    #[test]
    fn test_parse_config_missing_algo() {
        assert!(Vault::parse_config("version=1\n").is_err());
    }

    #[test]
    fn test_parse_config_unknown_algo() {
        assert!(matches!(
            Vault::parse_config("version=1\nalgo=md5\n"),
            Err(Error::UnsupportedAlgorithm { .. })
        ));
    }
}
