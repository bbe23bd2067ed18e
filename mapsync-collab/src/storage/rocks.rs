//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: Full document snapshots (bincode, LZ4 compressed)
//! - `mutations`: Accepted mutations (bincode, LZ4 compressed, keyed by doc_id:version)
//! - `metadata` : Document metadata (bincode: version, sizes, timestamps)
//!
//! Document ids only contain `[A-Za-z0-9_-]`, so a `0x00` separator keeps
//! mutation keys of one document contiguous and ordered by version.

use mapsync_core::{FeatureCollectionDocument, Mutation, WrappedFeatureCollectionId};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_MUTATIONS: &str = "mutations";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_MUTATIONS, CF_METADATA];

const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mapsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: WrappedFeatureCollectionId,
    /// Authority version of the stored snapshot
    pub version: u64,
    pub feature_count: u64,
    /// Total number of mutations logged
    pub mutation_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: WrappedFeatureCollectionId) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            version: 0,
            feature_count: 0,
            mutation_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(WrappedFeatureCollectionId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode: callers serialise per document)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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

        // Values are already LZ4-compressed by us.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_MUTATIONS => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Save a full snapshot of `doc`, replacing any previous one.
    pub fn save_document(&self, doc: &FeatureCollectionDocument) -> Result<DocumentMetadata, StoreError> {
        self.commit(doc, &[])
    }

    /// Atomically store the snapshot of `doc` together with the mutations
    /// that produced it, each tagged with the version it created.
    pub fn commit(
        &self,
        doc: &FeatureCollectionDocument,
        applied: &[(u64, Mutation)],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_muts = self.cf(CF_MUTATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw = encode(doc)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let mut meta = match self.load_metadata(&doc.id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(doc.id.clone()),
            Err(e) => return Err(e),
        };
        meta.version = doc.version;
        meta.feature_count = doc.len() as u64;
        meta.mutation_count += applied.len() as u64;
        meta.snapshot_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let key = doc.id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        for (version, mutation) in applied {
            let value = lz4_flex::compress_prepend_size(&encode(mutation)?);
            batch.put_cf(&cf_muts, Self::mutation_key(&doc.id, *version), value);
        }
        batch.put_cf(&cf_meta, key, encode(&meta)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load_document(
        &self,
        doc_id: &WrappedFeatureCollectionId,
    ) -> Result<FeatureCollectionDocument, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_str().as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                decode(&raw)
            }
            None => Err(StoreError::NotFound(doc_id.clone())),
        }
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Logged mutations of `doc_id` with version >= `since_version`, in
    /// version order.
    pub fn load_mutations_since(
        &self,
        doc_id: &WrappedFeatureCollectionId,
        since_version: u64,
    ) -> Result<Vec<(u64, Mutation)>, StoreError> {
        let cf = self.cf(CF_MUTATIONS)?;
        let start_key = Self::mutation_key(doc_id, since_version);
        let prefix = Self::mutation_prefix(doc_id);

        let mut mutations = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(version) = Self::version_from_key(&prefix, &key) else {
                break;
            };
            let raw = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            mutations.push((version, decode(&raw)?));
        }

        Ok(mutations)
    }

    /// Delete logged mutations of `doc_id` with version <= `up_to_version`.
    /// Returns how many were removed.
    pub fn compact_mutations(
        &self,
        doc_id: &WrappedFeatureCollectionId,
        up_to_version: u64,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_MUTATIONS)?;
        let start_key = Self::mutation_key(doc_id, 0);
        let prefix = Self::mutation_prefix(doc_id);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match Self::version_from_key(&prefix, &key) {
                Some(version) if version <= up_to_version => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            self.db.write(batch)?;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: &WrappedFeatureCollectionId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_str().as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(doc_id.clone())),
        }
    }

    /// List all document ids in the store.
    pub fn list_documents(&self) -> Result<Vec<WrappedFeatureCollectionId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let raw = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let id = WrappedFeatureCollectionId::parse(raw)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }

        Ok(ids)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn mutation_prefix(doc_id: &WrappedFeatureCollectionId) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(doc_id.as_str().len() + 1);
        prefix.extend_from_slice(doc_id.as_str().as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    /// Mutation key: doc_id bytes, `0x00`, version (8 bytes big-endian).
    fn mutation_key(doc_id: &WrappedFeatureCollectionId, version: u64) -> Vec<u8> {
        let mut key = Self::mutation_prefix(doc_id);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn version_from_key(prefix: &[u8], key: &[u8]) -> Option<u64> {
        let rest = key.strip_prefix(prefix)?;
        let bytes: [u8; 8] = rest.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapsync_core::{ApplyPolicy, Feature, Geometry};

    fn open(dir: &tempfile::TempDir) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn doc_id(raw: &str) -> WrappedFeatureCollectionId {
        WrappedFeatureCollectionId::parse(raw).unwrap()
    }

    fn doc_with(id: &str, n: usize) -> FeatureCollectionDocument {
        let mut doc = FeatureCollectionDocument::empty(doc_id(id));
        for i in 0..n {
            let f = Feature::new(format!("f{i}"), Geometry::Point([i as f64, 0.0]))
                .with_property("name", format!("feature {i}"));
            doc.apply(&Mutation::create(f), ApplyPolicy::Strict).unwrap();
        }
        doc.version = n as u64;
        doc
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn test_document_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = doc_with("roads", 5);

        let meta = store.save_document(&doc).unwrap();
        assert_eq!(meta.version, 5);
        assert_eq!(meta.feature_count, 5);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.load_document(&doc.id).unwrap(), doc);
    }

    #[test]
    fn test_document_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(
            store.load_document(&doc_id("missing")),
            Err(StoreError::NotFound(doc_id("missing")))
        );
    }

    #[test]
    fn test_commit_logs_mutations_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let mut doc = FeatureCollectionDocument::empty(doc_id("wells"));

        for v in 1..=12u64 {
            let m = Mutation::create(Feature::new(format!("w{v}"), Geometry::Point([0.0, 0.0])));
            doc.apply(&m, ApplyPolicy::Authoritative).unwrap();
            doc.version = v;
            store.commit(&doc, &[(v, m)]).unwrap();
        }

        let all = store.load_mutations_since(&doc.id, 0).unwrap();
        assert_eq!(all.len(), 12);
        let versions: Vec<u64> = all.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, (1..=12).collect::<Vec<_>>());

        let tail = store.load_mutations_since(&doc.id, 10).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(store.load_metadata(&doc.id).unwrap().mutation_count, 12);
    }

    #[test]
    fn test_mutation_logs_do_not_bleed_across_prefixed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let short = FeatureCollectionDocument::empty(doc_id("a"));
        let long = FeatureCollectionDocument::empty(doc_id("a1"));

        store.commit(&short, &[(1, Mutation::delete("x"))]).unwrap();
        store
            .commit(&long, &[(1, Mutation::delete("y")), (2, Mutation::delete("z"))])
            .unwrap();

        assert_eq!(store.load_mutations_since(&short.id, 0).unwrap().len(), 1);
        assert_eq!(store.load_mutations_since(&long.id, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_compact_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = FeatureCollectionDocument::empty(doc_id("parcels"));
        let applied: Vec<(u64, Mutation)> = (1..=20).map(|v| (v, Mutation::delete("x"))).collect();
        store.commit(&doc, &applied).unwrap();

        assert_eq!(store.compact_mutations(&doc.id, 10).unwrap(), 10);
        let remaining = store.load_mutations_since(&doc.id, 0).unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].0, 11);
    }

    #[test]
    fn test_list_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for id in ["a", "b", "c"] {
            store.save_document(&doc_with(id, 1)).unwrap();
        }
        store.commit(&doc_with("b", 1), &[(2, Mutation::delete("f0"))]).unwrap();

        let mut listed = store.list_documents().unwrap();
        listed.sort();
        assert_eq!(listed, vec![doc_id("a"), doc_id("b"), doc_id("c")]);
    }

    #[test]
    fn test_reopen_keeps_documents() {
        let dir = tempfile::tempdir().unwrap();
        let doc = doc_with("harbour", 3);
        {
            let store = open(&dir);
            store.save_document(&doc).unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.load_document(&doc.id).unwrap(), doc);
    }

    #[test]
    fn test_compression_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let meta = store.save_document(&doc_with("big", 500)).unwrap();
        let ratio = meta.snapshot_size as f64 / meta.compressed_size as f64;
        assert!(ratio > 1.2, "compression ratio {ratio:.1}x too low");
    }
}
