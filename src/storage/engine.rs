use rocksdb::{DBRawIterator, Options, WriteOptions, DB};
use std::path::{Path, PathBuf};

use super::router::ShardRouter;
use crate::error::{DbError, DbResult};

/// Hash-sharded key-value store over a fixed set of RocksDB instances.
///
/// Shard `i` lives in `<data_dir>/shard-<i>`. The shard count is fixed at
/// open time; reopening with a different count would scatter existing keys,
/// so it is rejected via a small marker file.
pub struct ShardedStore {
    shards: Vec<DB>,
    path: PathBuf,
    sync_writes: bool,
}

const SHARD_COUNT_MARKER: &str = "SHARD_COUNT";

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("path", &self.path)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl ShardedStore {
    /// Open (creating if needed) all shards under `data_dir`.
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        shard_count: usize,
        sync_writes: bool,
    ) -> DbResult<Self> {
        if shard_count == 0 {
            return Err(DbError::ConfigError("shard_count must be >= 1".to_string()));
        }
        let path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Self::check_shard_count_marker(&path, shard_count)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        // Keep fewer LOG files (RocksDB info logs, not WALs)
        opts.set_keep_log_file_num(5);

        let mut shards = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            let shard_path = path.join(format!("shard-{}", i));
            let db = DB::open(&opts, &shard_path)
                .map_err(|e| DbError::StorageError(format!("open shard {}: {}", i, e)))?;
            shards.push(db);
        }

        Ok(Self {
            shards,
            path,
            sync_writes,
        })
    }

    fn check_shard_count_marker(path: &Path, shard_count: usize) -> DbResult<()> {
        let marker = path.join(SHARD_COUNT_MARKER);
        match std::fs::read_to_string(&marker) {
            Ok(text) => {
                let existing: usize = text
                    .trim()
                    .parse()
                    .map_err(|_| DbError::StorageError("unreadable shard marker".to_string()))?;
                if existing != shard_count {
                    return Err(DbError::ConfigError(format!(
                        "data dir was created with {} shards, refusing to open with {}",
                        existing, shard_count
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::write(&marker, format!("{}\n", shard_count))?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn data_dir(&self) -> &Path {
        &self.path
    }

    fn shard_for(&self, routing_key: &[u8]) -> &DB {
        &self.shards[ShardRouter::route(routing_key, self.shards.len())]
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    /// Store a value under `key`, routed by an explicit routing key.
    ///
    /// The routing key is normally [`ShardRouter::routing_key`] of `key`;
    /// the replication apply path passes it explicitly after extracting it
    /// the same way.
    pub fn put_routed(&self, routing_key: &[u8], key: &[u8], value: &[u8]) -> DbResult<()> {
        self.shard_for(routing_key)
            .put_opt(key, value, &self.write_opts())?;
        Ok(())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.put_routed(ShardRouter::routing_key(key), key, value)
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let db = self.shard_for(ShardRouter::routing_key(key));
        Ok(db.get(key)?)
    }

    pub fn delete_routed(&self, routing_key: &[u8], key: &[u8]) -> DbResult<()> {
        self.shard_for(routing_key)
            .delete_opt(key, &self.write_opts())?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> DbResult<()> {
        self.delete_routed(ShardRouter::routing_key(key), key)
    }

    /// Ordered iterator over one shard's keyspace.
    pub fn iter(&self, shard: usize) -> DbResult<StoreIterator<'_>> {
        let db = self
            .shards
            .get(shard)
            .ok_or_else(|| DbError::StorageError(format!("no such shard: {}", shard)))?;
        let mut inner = db.raw_iterator();
        inner.seek_to_first();
        Ok(StoreIterator { inner })
    }

    /// Flush all shards' memtables to disk.
    pub fn flush(&self) -> DbResult<()> {
        for db in &self.shards {
            db.flush()?;
        }
        Ok(())
    }
}

/// Ordered cursor over a single shard, in the RocksDB raw-iterator style.
pub struct StoreIterator<'a> {
    inner: DBRawIterator<'a>,
}

impl<'a> StoreIterator<'a> {
    pub fn seek(&mut self, key: &[u8]) {
        self.inner.seek(key);
    }

    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    pub fn next(&mut self) {
        self.inner.next();
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.inner.key()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.inner.value()
    }
}
