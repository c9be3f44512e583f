//! RocksDB-backed persistent object store.
//!
//! Column families:
//! - `objects` — `CanvasObject` rows keyed by object id (bincode + LZ4)
//! - `scopes`  — scope index keyed by `user_id:16 | design_id:16 | object_id:16`,
//!   value is a one-byte live flag
//!
//! Every mutation writes the row and its index entry in one `WriteBatch`,
//! so a crash never leaves the index disagreeing with the row.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use vellum_core::{CanvasObject, DesignScope, LocalObject, ObjectId};

use super::{ObjectStore, PersistenceError, UpsertOutcome};

const CF_OBJECTS: &str = "objects";
const CF_SCOPES: &str = "scopes";

const COLUMN_FAMILIES: &[&str] = &[CF_OBJECTS, CF_SCOPES];

const SCOPE_PREFIX_LEN: usize = 32;
const SCOPE_KEY_LEN: usize = 48;

const LIVE: u8 = 1;
const DELETED: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vellum_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
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

/// RocksDB-backed canvas object store.
///
/// RocksDB calls block, so every trait method runs on tokio's blocking
/// pool against a shared handle.
#[derive(Clone)]
pub struct RocksObjectStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl RocksObjectStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
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
        log::info!("Object store opened at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OBJECTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SCOPES => {
                // Prefix-scanned by user_id | design_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                    SCOPE_PREFIX_LEN,
                ));
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.inner.db.flush()?;
        Ok(())
    }

    /// Run `op` on the blocking pool.
    async fn blocking<R, F>(&self, op: F) -> Result<R, PersistenceError>
    where
        R: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<R, PersistenceError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| PersistenceError::Database(format!("Task join error: {e}")))?
    }
}

impl RocksInner {
    // ─── Rows ─────────────────────────────────────────────────────────

    fn read_object(&self, id: &ObjectId) -> Result<Option<CanvasObject>, PersistenceError> {
        let cf = self.cf(CF_OBJECTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_row(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Stage a row and its index entry.
    fn stage(&self, batch: &mut WriteBatch, object: &CanvasObject) -> Result<(), PersistenceError> {
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_scopes = self.cf(CF_SCOPES)?;
        let flag = if object.is_live() { LIVE } else { DELETED };
        batch.put_cf(cf_objects, object.object_id.as_bytes(), encode_row(object)?);
        batch.put_cf(
            cf_scopes,
            scope_key(object.scope(), &object.object_id),
            [flag],
        );
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), PersistenceError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Scope index ──────────────────────────────────────────────────

    /// Visit every index entry of a scope as `(object_id, live)`.
    fn scan_scope(&self, scope: DesignScope) -> Result<Vec<(ObjectId, bool)>, PersistenceError> {
        let cf = self.cf(CF_SCOPES)?;
        let prefix = scope_prefix(scope);
        let mut entries = Vec::new();

        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if key.len() != SCOPE_KEY_LEN || key[..SCOPE_PREFIX_LEN] != prefix[..] {
                break;
            }
            let id = ObjectId::from_slice(&key[SCOPE_PREFIX_LEN..])
                .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
            entries.push((id, value.first() == Some(&LIVE)));
        }

        Ok(entries)
    }

    fn tombstone_many(
        &self,
        scope: DesignScope,
        ids: &[ObjectId],
        at: u64,
    ) -> Result<usize, PersistenceError> {
        let _guard = self.lock();
        let mut batch = WriteBatch::default();
        let mut changed = 0;

        for id in ids {
            let Some(mut object) = self.read_object(id)? else {
                continue;
            };
            if object.scope() != scope || !object.is_live() {
                continue;
            }
            object.tombstone(at);
            self.stage(&mut batch, &object)?;
            changed += 1;
        }

        if changed > 0 {
            self.commit(batch)?;
        }
        Ok(changed)
    }

    fn upsert_one(
        &self,
        scope: DesignScope,
        local: &LocalObject,
        at: u64,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let _guard = self.lock();
        let (row, outcome) = match self.read_object(&local.object_id)? {
            Some(existing) if existing.scope() != scope => {
                return Err(PersistenceError::Rejected(format!(
                    "object {} belongs to another design",
                    local.object_id
                )));
            }
            Some(mut existing) => {
                existing.overwrite(local, at);
                (existing, UpsertOutcome::Updated)
            }
            None => (CanvasObject::create(scope, local, at), UpsertOutcome::Created),
        };

        let mut batch = WriteBatch::default();
        self.stage(&mut batch, &row)?;
        self.commit(batch)?;
        Ok(outcome)
    }

    fn purge_before(&self, older_than: u64) -> Result<usize, PersistenceError> {
        let _guard = self.lock();
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_scopes = self.cf(CF_SCOPES)?;
        let mut batch = WriteBatch::default();
        let mut purged = 0;

        for item in self.db.iterator_cf(cf_objects, IteratorMode::Start) {
            let (key, value) = item?;
            let object = decode_row(&value)?;
            if object.is_live() || object.updated_at >= older_than {
                continue;
            }
            batch.delete_cf(cf_objects, &key);
            batch.delete_cf(cf_scopes, scope_key(object.scope(), &object.object_id));
            purged += 1;
        }

        if purged > 0 {
            self.commit(batch)?;
            log::info!("Purged {purged} tombstones older than {older_than}");
        }
        Ok(purged)
    }

    fn load_rows(&self, scope: DesignScope) -> Result<Vec<CanvasObject>, PersistenceError> {
        let mut rows = Vec::new();
        for (id, _) in self.scan_scope(scope)? {
            match self.read_object(&id)? {
                Some(row) => rows.push(row),
                None => log::warn!("Scope index points at missing object {id}"),
            }
        }
        Ok(rows)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl ObjectStore for RocksObjectStore {
    async fn fetch_live_ids(&self, scope: DesignScope) -> Result<HashSet<ObjectId>, PersistenceError> {
        let entries = self.blocking(move |db| db.scan_scope(scope)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(id, live)| live.then_some(id))
            .collect())
    }

    async fn mark_deleted(
        &self,
        scope: DesignScope,
        ids: &[ObjectId],
        at: u64,
    ) -> Result<usize, PersistenceError> {
        let ids = ids.to_vec();
        self.blocking(move |db| db.tombstone_many(scope, &ids, at)).await
    }

    async fn upsert(
        &self,
        scope: DesignScope,
        object: &LocalObject,
        at: u64,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let object = object.clone();
        self.blocking(move |db| db.upsert_one(scope, &object, at)).await
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<CanvasObject>, PersistenceError> {
        let id = *id;
        self.blocking(move |db| db.read_object(&id)).await
    }

    async fn load_scope(&self, scope: DesignScope) -> Result<Vec<CanvasObject>, PersistenceError> {
        self.blocking(move |db| db.load_rows(scope)).await
    }

    async fn purge_tombstones(&self, older_than: u64) -> Result<usize, PersistenceError> {
        self.blocking(move |db| db.purge_before(older_than)).await
    }
}

fn encode_row(object: &CanvasObject) -> Result<Vec<u8>, PersistenceError> {
    let bytes = bincode::serde::encode_to_vec(object, bincode::config::standard())
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_row(bytes: &[u8]) -> Result<CanvasObject, PersistenceError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| PersistenceError::Compression(e.to_string()))?;
    let (object, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    Ok(object)
}

fn scope_prefix(scope: DesignScope) -> [u8; SCOPE_PREFIX_LEN] {
    let mut prefix = [0u8; SCOPE_PREFIX_LEN];
    prefix[..16].copy_from_slice(scope.user_id.as_bytes());
    prefix[16..].copy_from_slice(scope.design_id.as_bytes());
    prefix
}

fn scope_key(scope: DesignScope, id: &ObjectId) -> [u8; SCOPE_KEY_LEN] {
    let mut key = [0u8; SCOPE_KEY_LEN];
    key[..SCOPE_PREFIX_LEN].copy_from_slice(&scope_prefix(scope));
    key[SCOPE_PREFIX_LEN..].copy_from_slice(id.as_bytes());
    key
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
