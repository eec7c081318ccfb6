//! Directory-backed key-value store.
//!
//! Layout under the store path:
//!
//! ```text
//! MANIFEST              magic + format version
//! LOCK                  exclusive process lock
//! values/<xx>/<sha256>  one file per key, sharded by hash prefix
//! ```
//!
//! Each value file holds the key, the value and a CRC32 of the value. The key
//! index is rebuilt from the value files on open.

use super::backend::KvBackend;
use crate::error::{Result, SyncError};
use crate::types::Hash;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"RNS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes for value files.
const VALUE_MAGIC: &[u8; 4] = b"KVE\0";

/// Current value file format version.
const VALUE_VERSION: u8 = 1;

/// File store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Value cache size (number of entries).
    pub cache_size: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./rnsync-data"),
            cache_size: 1000,
            create_if_missing: true,
        }
    }
}

/// Persistent key-value backend on the local filesystem.
pub struct FileBackend {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Every key currently stored.
    keys: RwLock<BTreeSet<String>>,

    /// LRU cache for recently read values.
    cache: Mutex<LruCache<String, Vec<u8>>>,

    /// Serializes file writes and deletes.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(config.path.join("values"))?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        tracing::info!(path = %config.path.display(), "created file store");
        Ok(Self::assemble(config, lock_file, BTreeSet::new()))
    }

    /// Open an existing store and rebuild its key index.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let values_dir = config.path.join("values");
        fs::create_dir_all(&values_dir)?;
        let keys = Self::rebuild_index(&values_dir)?;

        tracing::info!(path = %config.path.display(), keys = keys.len(), "opened file store");
        Ok(Self::assemble(config, lock_file, keys))
    }

    fn assemble(config: StoreConfig, lock_file: File, keys: BTreeSet<String>) -> Self {
        let cache_size = NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            _lock_file: lock_file,
            keys: RwLock::new(keys),
            cache: Mutex::new(LruCache::new(cache_size)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    fn rebuild_index(values_dir: &Path) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        for shard in fs::read_dir(values_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    // interrupted write; the previous value file is still intact
                    tracing::warn!(path = %path.display(), "removing partial value file");
                    fs::remove_file(&path)?;
                    continue;
                }
                let (key, _) = Self::read_value_file(&path)?;
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let hash = Hash::from_bytes(key.as_bytes());
        self.config
            .path
            .join("values")
            .join(hash.shard_prefix())
            .join(hash.to_hex())
    }

    fn write_value_file(path: &Path, key: &str, value: &[u8]) -> Result<()> {
        let key_bytes = key.as_bytes();
        let key_len = u16::try_from(key_bytes.len())
            .map_err(|_| SyncError::InvalidFormat(format!("key too long: {} bytes", key_bytes.len())))?;

        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }

        // Write beside the target, then rename over it.
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(VALUE_MAGIC)?;
            file.write_all(&[VALUE_VERSION])?;
            file.write_all(&key_len.to_le_bytes())?;
            file.write_all(key_bytes)?;
            file.write_all(&(value.len() as u64).to_le_bytes())?;
            file.write_all(value)?;
            file.write_all(&crc32fast::hash(value).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_value_file(path: &Path) -> Result<(String, Vec<u8>)> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != VALUE_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid value file magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != VALUE_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported value file version: {}",
                version[0]
            )));
        }

        let mut key_len_bytes = [0u8; 2];
        file.read_exact(&mut key_len_bytes)?;
        let mut key_bytes = vec![0u8; u16::from_le_bytes(key_len_bytes) as usize];
        file.read_exact(&mut key_bytes)?;
        let key = String::from_utf8(key_bytes)
            .map_err(|_| SyncError::Corruption(format!("non-utf8 key in {}", path.display())))?;

        let mut value_len_bytes = [0u8; 8];
        file.read_exact(&mut value_len_bytes)?;
        let mut value = vec![0u8; u64::from_le_bytes(value_len_bytes) as usize];
        file.read_exact(&mut value)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&value);
        if stored != computed {
            return Err(SyncError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok((key, value))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;
        Ok(lock_file)
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.cache.lock().get(key).cloned() {
            return Ok(Some(value));
        }
        if !self.keys.read().contains(key) {
            return Ok(None);
        }

        let (stored_key, value) = Self::read_value_file(&self.value_path(key))?;
        if stored_key != key {
            return Err(SyncError::Corruption(format!(
                "value file for {} holds key {}",
                key, stored_key
            )));
        }

        self.cache.lock().put(key.to_string(), value.clone());
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let _lock = self.write_lock.lock();
        Self::write_value_file(&self.value_path(key), key, value)?;
        self.keys.write().insert(key.to_string());
        self.cache.lock().put(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let _lock = self.write_lock.lock();
        self.cache.lock().pop(key);
        if !self.keys.read().contains(key) {
            return Ok(false);
        }
        fs::remove_file(self.value_path(key))?;
        self.keys.write().remove(key);
        Ok(true)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.keys.read().contains(key))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .keys
            .read()
            .range(prefix.to_string()..)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
