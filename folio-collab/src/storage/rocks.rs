//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: bincode [`PersistedSnapshot`] per document, LZ4 compressed
//! - `deltas`:    relay op log, LZ4 compressed, keyed by document and version
//! - `metadata`:  bincode [`DocumentMetadata`]
//!
//! Document ids are arbitrary strings, so every key starts with the id's
//! length as a big-endian `u32` followed by its bytes. No id's key is a
//! prefix of another's, which keeps per-document range scans exact.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::persistence::PersistedSnapshot;

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes per column family
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document record kept alongside its snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub title: Option<String>,
    /// Display names of everyone who has edited the document
    pub collaborators: Vec<String>,
    /// Last op-log version written
    pub version: u64,
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str) -> Self {
        let now = unix_now();
        Self {
            doc_id: doc_id.to_string(),
            title: None,
            collaborators: Vec::new(),
            version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::IoError(e.to_string()))?;
            }
        }

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Write a snapshot and its metadata in one batch.
    pub fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self.metadata_or_new(&snapshot.doc_id)?;
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = doc_key(&snapshot.doc_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, meta.encode()?);
        self.write(batch)?;

        log::debug!(
            "Saved snapshot for {} ({} -> {} bytes)",
            snapshot.doc_id,
            encoded.len(),
            compressed.len()
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, doc_id: &str) -> Result<PersistedSnapshot, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, doc_key(doc_id))?
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(snapshot)
    }

    pub fn document_exists(&self, doc_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_key(doc_id))?.is_some())
    }

    // ─── Op log ───────────────────────────────────────────────────────

    /// Append an op-log entry. Returns its compressed size.
    pub fn store_delta(&self, doc_id: &str, version: u64, delta: &[u8]) -> Result<u64, StoreError> {
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(delta);
        let compressed_len = compressed.len() as u64;

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.version = meta.version.max(version);
        meta.delta_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, delta_key(doc_id, version), &compressed);
        batch.put_cf(&cf_meta, doc_key(doc_id), meta.encode()?);
        self.write(batch)?;

        Ok(compressed_len)
    }

    /// Entries with version `>= since_version`, in version order.
    pub fn load_deltas_since(
        &self,
        doc_id: &str,
        since_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let mut deltas = Vec::new();
        self.scan_deltas(doc_id, since_version, u64::MAX, |version, _, value| {
            let decompressed = lz4_flex::decompress_size_prepended(value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            deltas.push((version, decompressed));
            Ok(())
        })?;
        Ok(deltas)
    }

    pub fn load_all_deltas(&self, doc_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.load_deltas_since(doc_id, 0)
    }

    pub fn delta_count(&self, doc_id: &str) -> Result<u64, StoreError> {
        Ok(self.load_metadata(doc_id)?.delta_count)
    }

    /// Delete entries with version `<= up_to_version`. Returns how many.
    pub fn compact_deltas(&self, doc_id: &str, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        self.scan_deltas(doc_id, 0, up_to_version, |_, key, _| {
            batch.delete_cf(&cf, key);
            count += 1;
            Ok(())
        })?;

        if count > 0 {
            let cf_meta = self.cf(CF_METADATA)?;
            let mut meta = self.metadata_or_new(doc_id)?;
            meta.delta_count = meta.delta_count.saturating_sub(count);
            batch.put_cf(&cf_meta, doc_key(doc_id), meta.encode()?);
            self.write(batch)?;
            log::debug!("Compacted {count} op-log entries for {doc_id}");
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_key(doc_id))? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id.to_string())),
        }
    }

    /// Set the title and merge `collaborators` into the known set.
    pub fn put_document_info(
        &self,
        doc_id: &str,
        title: Option<&str>,
        collaborators: &[String],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut meta = self.metadata_or_new(doc_id)?;
        if let Some(title) = title {
            meta.title = Some(title.to_string());
        }
        for name in collaborators {
            if !meta.collaborators.contains(name) {
                meta.collaborators.push(name.clone());
            }
        }
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, doc_key(doc_id), meta.encode()?);
        self.write(batch)?;
        Ok(meta)
    }

    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match parse_doc_key(&key) {
                Some((doc_id, rest)) if rest.is_empty() => doc_ids.push(doc_id),
                _ => log::warn!("Skipping malformed metadata key ({} bytes)", key.len()),
            }
        }
        Ok(doc_ids)
    }

    /// Remove a document with its snapshot, op log and metadata.
    pub fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_deltas = self.cf(CF_DELTAS)?;

        let key = doc_key(doc_id);
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, &key);
        batch.delete_cf(&cf_meta, &key);
        self.scan_deltas(doc_id, 0, u64::MAX, |_, key, _| {
            batch.delete_cf(&cf_deltas, key);
            Ok(())
        })?;
        self.write(batch)?;
        log::info!("Deleted document {doc_id}");
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn metadata_or_new(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(doc_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(doc_id)),
            Err(e) => Err(e),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Visit op-log entries of `doc_id` with `from <= version <= to`.
    fn scan_deltas<F>(&self, doc_id: &str, from: u64, to: u64, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(u64, &[u8], &[u8]) -> Result<(), StoreError>,
    {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = doc_key(doc_id);
        let start = delta_key(doc_id, from);
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            let Some(version_bytes) = key.strip_prefix(prefix.as_slice()) else {
                break;
            };
            let Ok(version_bytes) = <[u8; 8]>::try_from(version_bytes) else {
                break;
            };
            let version = u64::from_be_bytes(version_bytes);
            if version > to {
                break;
            }
            visit(version, &key, &value)?;
        }
        Ok(())
    }
}

/// `len(doc_id) as u32 BE || doc_id`.
fn doc_key(doc_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + doc_id.len());
    key.extend_from_slice(&(doc_id.len() as u32).to_be_bytes());
    key.extend_from_slice(doc_id.as_bytes());
    key
}

fn delta_key(doc_id: &str, version: u64) -> Vec<u8> {
    let mut key = doc_key(doc_id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Split a key into its document id and the remaining suffix.
fn parse_doc_key(key: &[u8]) -> Option<(String, &[u8])> {
    let len_bytes: [u8; 4] = key.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let id = key.get(4..4 + len)?;
    let id = String::from_utf8(id.to_vec()).ok()?;
    Some((id, &key[4 + len..]))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
