//! Checksummed blob store for cloud artifacts and collected-data payloads
//!
//! Every write places a companion `<file>.sha1` holding the ASCII-hex SHA-1
//! of the payload. Reads verify the digest; on mismatch both files are
//! deleted and the caller gets `InvalidData`. A payload file without a
//! companion predates checksum support and is returned unverified.

use serde_json::Value;
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Directory under the persistency root holding all managed files.
const PERSISTENCY_WORKSPACE: &str = "FWE_Persistency";
/// Directory for named collected-data payload files.
const COLLECTED_DATA_DIR: &str = "CollectedData";
const DECODER_MANIFEST_FILE: &str = "DecoderManifest.bin";
const COLLECTION_SCHEME_LIST_FILE: &str = "CollectionSchemeList.bin";
const STATE_TEMPLATE_LIST_FILE: &str = "StateTemplateList.bin";
const METADATA_FILE: &str = "Metadata.json";
const CHECKSUM_SUFFIX: &str = ".sha1";

/// Largest read the store will buffer.
const MAX_READ_SIZE: usize = 10 * 1024 * 1024;

/// Category of persisted data. The first three have fixed filenames; the
/// payload category stores individually named files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    CollectionSchemeList,
    DecoderManifest,
    StateTemplateList,
    EdgeToCloudPayload,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Stored data exceeds capacity")]
    MemoryFull,
    #[error("Stored data failed integrity or size validation")]
    InvalidData,
    #[error("A filename is required for payload data and forbidden otherwise")]
    InvalidFileName,
    #[error("File not found")]
    FileNotFound,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

/// File-backed store rooted at `<base>/FWE_Persistency`. Not internally
/// synchronized; the owner serializes access.
pub struct CacheAndPersist {
    workspace: PathBuf,
    collected_data_path: PathBuf,
    max_persistence_size: u64,
    metadata: Vec<Value>,
}

impl CacheAndPersist {
    pub fn new(base_dir: impl AsRef<Path>, max_persistence_size: u64) -> Result<Self, PersistenceError> {
        let workspace = base_dir.as_ref().join(PERSISTENCY_WORKSPACE);
        let collected_data_path = workspace.join(COLLECTED_DATA_DIR);
        fs::create_dir_all(&collected_data_path)?;
        let mut store = Self {
            workspace,
            collected_data_path,
            max_persistence_size,
            metadata: Vec::new(),
        };
        store.load_metadata();
        Ok(store)
    }

    /// Persist one blob, replacing any previous content under the same key.
    pub fn write(
        &self,
        data: &[u8],
        data_type: DataType,
        filename: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let path = self.path_for(data_type, filename)?;
        if self.total_size() + data.len() as u64 > self.max_persistence_size {
            warn!(
                len = data.len(),
                "Rejecting write that would exceed persistence capacity"
            );
            return Err(PersistenceError::MemoryFull);
        }
        fs::write(&path, data)?;
        fs::write(checksum_path(&path), hex_sha1(data))?;
        Ok(())
    }

    /// Read back a blob of exactly `size` bytes, verifying its checksum
    /// when a companion file exists. Integrity failures delete the payload
    /// and its companion.
    pub fn read(
        &self,
        size: usize,
        data_type: DataType,
        filename: Option<&str>,
    ) -> Result<Vec<u8>, PersistenceError> {
        if size > MAX_READ_SIZE {
            return Err(PersistenceError::MemoryFull);
        }
        let path = self.path_for(data_type, filename)?;
        if !path.exists() {
            return Err(PersistenceError::FileNotFound);
        }
        let data = fs::read(&path)?;
        if data.len() != size {
            warn!(
                expected = size,
                stored = data.len(),
                "Requested size does not match stored size"
            );
            return Err(PersistenceError::InvalidData);
        }
        let companion = checksum_path(&path);
        if companion.exists() {
            let stored_digest = fs::read_to_string(&companion)?;
            if stored_digest.trim() != hex_sha1(&data) {
                error!(path = %path.display(), "Checksum mismatch, deleting corrupted files");
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(&companion);
                return Err(PersistenceError::InvalidData);
            }
        } else {
            // Pre-checksum file, accepted for backward compatibility.
            info!(path = %path.display(), "Reading file without checksum companion");
        }
        Ok(data)
    }

    /// Size of the stored payload, zero if absent.
    pub fn get_size(&self, data_type: DataType, filename: Option<&str>) -> u64 {
        self.path_for(data_type, filename)
            .ok()
            .and_then(|path| fs::metadata(path).ok())
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    /// Delete a blob and its checksum companion.
    pub fn erase(&self, data_type: DataType, filename: Option<&str>) -> Result<(), PersistenceError> {
        let path = self.path_for(data_type, filename)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let companion = checksum_path(&path);
        if companion.exists() {
            fs::remove_file(companion)?;
        }
        Ok(())
    }

    /// Catalog one payload file's upload disposition.
    pub fn add_metadata(&mut self, entry: Value) -> Result<(), PersistenceError> {
        self.metadata.push(entry);
        self.store_metadata()
    }

    pub fn get_metadata(&self) -> &[Value] {
        &self.metadata
    }

    /// Empty the catalog; payload files themselves are untouched.
    pub fn clear_metadata(&mut self) -> Result<(), PersistenceError> {
        self.metadata.clear();
        self.store_metadata()
    }

    fn path_for(&self, data_type: DataType, filename: Option<&str>) -> Result<PathBuf, PersistenceError> {
        match (data_type, filename) {
            (DataType::CollectionSchemeList, None) => {
                Ok(self.workspace.join(COLLECTION_SCHEME_LIST_FILE))
            }
            (DataType::DecoderManifest, None) => Ok(self.workspace.join(DECODER_MANIFEST_FILE)),
            (DataType::StateTemplateList, None) => {
                Ok(self.workspace.join(STATE_TEMPLATE_LIST_FILE))
            }
            (DataType::EdgeToCloudPayload, Some(name)) if !name.is_empty() => {
                Ok(self.collected_data_path.join(name))
            }
            _ => Err(PersistenceError::InvalidFileName),
        }
    }

    fn total_size(&self) -> u64 {
        fn dir_size(path: &Path) -> u64 {
            fs::read_dir(path)
                .map(|entries| {
                    entries
                        .filter_map(|entry| entry.ok())
                        .filter_map(|entry| {
                            let meta = entry.metadata().ok()?;
                            if meta.is_dir() {
                                Some(dir_size(&entry.path()))
                            } else {
                                Some(meta.len())
                            }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        dir_size(&self.workspace)
    }

    fn load_metadata(&mut self) {
        let path = self.workspace.join(METADATA_FILE);
        if let Ok(content) = fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<Value>>(&content) {
                Ok(entries) => self.metadata = entries,
                Err(error) => warn!(%error, "Ignoring unreadable metadata catalog"),
            }
        }
    }

    fn store_metadata(&self) -> Result<(), PersistenceError> {
        let path = self.workspace.join(METADATA_FILE);
        fs::write(path, serde_json::to_vec(&self.metadata)?)?;
        Ok(())
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(CHECKSUM_SUFFIX);
    PathBuf::from(name)
}

fn hex_sha1(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
