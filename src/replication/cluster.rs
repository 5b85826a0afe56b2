use parking_lot::Mutex;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::catalog::{SegmentCatalog, CATALOG_FILE_NAME};
use super::reader::SegmentReader;
use super::record::LogRecord;
use super::segment::SegmentWriter;
use crate::config::BinlogConfig;
use crate::error::{DbError, DbResult};
use crate::storage::{ShardRouter, ShardedStore};

/// Subdirectory of the work dir holding segments and the index.
pub const BINLOG_DIR: &str = "binlog";

/// Replicated write front for the sharded store.
///
/// Owns the binlog: the segment catalog, the currently-open segment writer
/// and the rotation policy, all guarded by one mutex so an append, the
/// rotation it triggers, and a concurrent snapshot of the live segment can
/// never interleave. Rotated-away segments are immutable and are read
/// without any locking.
///
/// Replication is best-effort at startup: if the binlog directory or the
/// last segment cannot be opened, the cluster comes up with the log
/// disabled and keeps serving reads and writes.
pub struct ReplicationCluster {
    store: Arc<ShardedStore>,
    binlog: Option<Mutex<BinlogState>>,
}

struct BinlogState {
    dir: PathBuf,
    index_path: PathBuf,
    max_segment_bytes: u64,
    catalog: SegmentCatalog,
    /// `None` once the log has been poisoned by a failed append or a
    /// failed rotation; mutations then skip logging until restart.
    current: Option<SegmentWriter>,
}

impl ReplicationCluster {
    /// Bring up the cluster over an already-open store.
    pub fn start(store: Arc<ShardedStore>, work_dir: &Path, cfg: &BinlogConfig) -> Self {
        let binlog = if cfg.enabled {
            match BinlogState::init(work_dir, cfg.max_segment_bytes) {
                Ok(state) => Some(Mutex::new(state)),
                Err(e) => {
                    tracing::error!("binlog unavailable, replication disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self { store, binlog }
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    pub fn binlog_enabled(&self) -> bool {
        self.binlog.is_some()
    }

    /// Write a key and record the mutation in the binlog.
    ///
    /// The storage write happens first; if the binlog append then fails the
    /// error is returned even though the store already changed. Callers see
    /// "mutation not durably logged", which is the honest outcome.
    pub fn set_value(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.store
            .put_routed(ShardRouter::routing_key(key), key, value)?;
        self.record_mutation(&LogRecord::set(key, value))
    }

    /// Delete a key and record the mutation in the binlog.
    pub fn remove(&self, key: &[u8]) -> DbResult<()> {
        self.store.delete_routed(ShardRouter::routing_key(key), key)?;
        self.record_mutation(&LogRecord::delete(key))
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.store.get(key)
    }

    fn record_mutation(&self, record: &LogRecord) -> DbResult<()> {
        let Some(binlog) = &self.binlog else {
            return Ok(());
        };
        let mut guard = binlog.lock();
        let state = &mut *guard;
        let Some(writer) = state.current.as_mut() else {
            // poisoned earlier; writes keep working without the log
            return Ok(());
        };

        if let Err(e) = writer.append(record) {
            tracing::error!("binlog append failed, log disabled until restart: {}", e);
            state.current = None;
            return Err(e);
        }

        if writer.bytes_written() >= state.max_segment_bytes {
            state.rotate();
        }
        Ok(())
    }

    /// Names of all segments, oldest first, as of now.
    pub fn catalog_snapshot(&self) -> Vec<String> {
        match &self.binlog {
            Some(binlog) => binlog.lock().catalog.names().to_vec(),
            None => Vec::new(),
        }
    }

    /// Full path of a segment base name, if the binlog is enabled.
    pub fn segment_path(&self, base: &str) -> Option<PathBuf> {
        self.binlog
            .as_ref()
            .map(|binlog| binlog.lock().dir.join(base))
    }

    /// Snapshot a segment for reading.
    ///
    /// If `base` names the segment currently being written, it is flushed
    /// and snapshotted under the binlog mutex so no rotation or append can
    /// tear the view. Any other segment is immutable and read lock-free.
    pub fn open_segment_for_read(&self, base: &str) -> DbResult<SegmentReader> {
        let Some(binlog) = &self.binlog else {
            return Err(DbError::InternalError("binlog disabled".to_string()));
        };

        let mut state = binlog.lock();
        let path = state.dir.join(base);
        let is_current = state
            .current
            .as_ref()
            .map(|w| w.path() == path)
            .unwrap_or(false);
        if is_current {
            state
                .current
                .as_mut()
                .expect("checked above")
                .sync()?;
            SegmentReader::open(&path)
        } else {
            drop(state);
            SegmentReader::open(&path)
        }
    }

    /// Flush and close the current segment. Used at shutdown; mutations
    /// after this are not logged.
    pub fn close(&self) {
        if let Some(binlog) = &self.binlog {
            let mut state = binlog.lock();
            if let Some(writer) = state.current.as_mut() {
                if let Err(e) = writer.sync() {
                    tracing::warn!("binlog sync on close failed: {}", e);
                }
                writer.close();
            }
            state.current = None;
        }
    }
}

impl BinlogState {
    fn init(work_dir: &Path, max_segment_bytes: u64) -> DbResult<BinlogState> {
        let dir = work_dir.join(BINLOG_DIR);
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join(CATALOG_FILE_NAME);
        let mut catalog = SegmentCatalog::load(&index_path)?;

        let (base, is_new) = match catalog.last() {
            Some(name) => (name.to_string(), false),
            None => (new_segment_base_name(), true),
        };
        let path = dir.join(&base);
        tracing::info!("Opening binlog segment '{}'", path.display());
        let writer = SegmentWriter::open(&path)?;

        if is_new {
            catalog.push(base);
            catalog.save(&index_path)?;
        }

        Ok(BinlogState {
            dir,
            index_path,
            max_segment_bytes,
            catalog,
            current: Some(writer),
        })
    }

    /// Close the full segment and switch to a freshly named one. Runs under
    /// the binlog mutex, inside the append that crossed the threshold.
    fn rotate(&mut self) {
        if let Some(mut writer) = self.current.take() {
            writer.close();
        }

        let base = new_segment_base_name();
        let path = self.dir.join(&base);
        match SegmentWriter::open(&path) {
            Ok(writer) => {
                tracing::info!("Rotated binlog to '{}'", path.display());
                self.current = Some(writer);
                self.catalog.push(base);
                if let Err(e) = self.catalog.save(&self.index_path) {
                    tracing::warn!("failed to persist binlog index: {}", e);
                }
            }
            Err(e) => {
                // keep serving; new mutations just go unlogged
                tracing::error!("rotation failed, binlog disabled: {}", e);
            }
        }
    }
}

/// Timestamp plus random suffix, so names stay unique across restarts and
/// across processes sharing a directory.
fn new_segment_base_name() -> String {
    let now = chrono::Local::now();
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("{}-{}-bin", now.format("%Y%m%d_%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::record::RECORD_HEADER_SIZE;
    use tempfile::TempDir;

    fn test_cluster(max_segment_bytes: u64) -> (ReplicationCluster, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ShardedStore::open(tmp.path().join("store"), 2, false).unwrap());
        let cfg = BinlogConfig {
            enabled: true,
            max_segment_bytes,
        };
        let cluster = ReplicationCluster::start(store, tmp.path(), &cfg);
        assert!(cluster.binlog_enabled());
        (cluster, tmp)
    }

    /// key + value sized so one record encodes to exactly `total` bytes.
    fn padded_value(key: &[u8], total: usize) -> Vec<u8> {
        vec![b'x'; total - RECORD_HEADER_SIZE - key.len()]
    }

    #[test]
    fn test_start_creates_dir_and_index() {
        let (cluster, tmp) = test_cluster(1024);
        let names = cluster.catalog_snapshot();
        assert_eq!(names.len(), 1);

        let index = tmp.path().join(BINLOG_DIR).join(CATALOG_FILE_NAME);
        let persisted = SegmentCatalog::load(&index).unwrap();
        assert_eq!(persisted.names(), &names[..]);
        assert!(cluster.segment_path(&names[0]).unwrap().exists());
    }

    #[test]
    fn test_set_value_hits_store_and_log() {
        let (cluster, _tmp) = test_cluster(1024 * 1024);

        cluster.set_value(b"k1", b"v1").unwrap();
        cluster.remove(b"k1").unwrap();
        assert_eq!(cluster.get(b"k1").unwrap(), None);

        let name = cluster.catalog_snapshot()[0].clone();
        let reader = cluster.open_segment_for_read(&name).unwrap();
        let records: Vec<LogRecord> = reader
            .records()
            .map(|raw| LogRecord::decode(raw).unwrap().0)
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], LogRecord::set(&b"k1"[..], &b"v1"[..]));
        assert_eq!(records[1], LogRecord::delete(&b"k1"[..]));
    }

    #[test]
    fn test_rotation_when_threshold_crossed() {
        // 101-byte records against a 200-byte cap: the second append
        // crosses the cap and rotates, the third lands in the new segment.
        let (cluster, _tmp) = test_cluster(200);

        for i in 0..3 {
            let key = format!("key-{:04}", i);
            let value = padded_value(key.as_bytes(), 101);
            cluster.set_value(key.as_bytes(), &value).unwrap();
        }

        let names = cluster.catalog_snapshot();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);

        let first = cluster.open_segment_for_read(&names[0]).unwrap();
        assert_eq!(first.records().count(), 2);
        let second = cluster.open_segment_for_read(&names[1]).unwrap();
        assert_eq!(second.records().count(), 1);
    }

    #[test]
    fn test_restart_resumes_last_segment() {
        let tmp = TempDir::new().unwrap();
        let cfg = BinlogConfig {
            enabled: true,
            max_segment_bytes: 1024 * 1024,
        };

        let name;
        {
            let store = Arc::new(ShardedStore::open(tmp.path().join("store"), 2, false).unwrap());
            let cluster = ReplicationCluster::start(store, tmp.path(), &cfg);
            cluster.set_value(b"persisted", b"1").unwrap();
            name = cluster.catalog_snapshot()[0].clone();
            cluster.close();
        }

        let store = Arc::new(ShardedStore::open(tmp.path().join("store"), 2, false).unwrap());
        let cluster = ReplicationCluster::start(store, tmp.path(), &cfg);
        let names = cluster.catalog_snapshot();
        assert_eq!(names, vec![name.clone()]);

        cluster.set_value(b"after-restart", b"2").unwrap();
        let reader = cluster.open_segment_for_read(&name).unwrap();
        assert_eq!(reader.records().count(), 2);
    }

    #[test]
    fn test_disabled_binlog_still_serves_writes() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ShardedStore::open(tmp.path().join("store"), 2, false).unwrap());
        let cfg = BinlogConfig {
            enabled: false,
            max_segment_bytes: 1024,
        };
        let cluster = ReplicationCluster::start(store, tmp.path(), &cfg);

        assert!(!cluster.binlog_enabled());
        cluster.set_value(b"k", b"v").unwrap();
        assert_eq!(cluster.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
        assert!(cluster.catalog_snapshot().is_empty());
        assert!(!tmp.path().join(BINLOG_DIR).exists());
    }
}
