use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::DbResult;
use crate::replication::{
    LogRecord, RecordCursor, RecordKind, StreamError, StreamTrailer, SyncRequest,
    STREAM_HEADER_SIZE,
};
use crate::replication::stream::{STREAM_TERMINATOR, UNSET_FILE_NAME};
use crate::storage::{ShardRouter, ShardedStore};

/// File the slave keeps its replication cursor in, inside its work dir.
pub const CURSOR_FILE_NAME: &str = "SYNC_CURSOR";

/// The slave's bookmark into the master's binlog: segment name plus the
/// ordinal of the last record applied from it (a record count, not a byte
/// offset). The master never sees this file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationCursor {
    pub file_name: String,
    pub offset: i32,
}

impl ReplicationCursor {
    /// "Nothing applied yet": replicate from the oldest known segment.
    pub fn unset() -> ReplicationCursor {
        ReplicationCursor {
            file_name: UNSET_FILE_NAME.to_string(),
            offset: -1,
        }
    }

    /// Load a persisted cursor; a missing or malformed file is the unset
    /// cursor, so a fresh slave bootstraps from the start.
    pub fn load<P: AsRef<Path>>(path: P) -> ReplicationCursor {
        let text = match std::fs::read_to_string(path.as_ref()) {
            Ok(t) => t,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot read sync cursor: {}", e);
                }
                return ReplicationCursor::unset();
            }
        };

        // two lines: name (not trimmed, the sentinel is a space), offset
        let mut lines = text.split('\n');
        let name = lines.next();
        let offset = lines.next().and_then(|s| s.trim().parse::<i32>().ok());
        match (name, offset) {
            (Some(name), Some(offset)) if !name.is_empty() => ReplicationCursor {
                file_name: name.to_string(),
                offset,
            },
            _ => {
                warn!("sync cursor file malformed, starting from scratch");
                ReplicationCursor::unset()
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> DbResult<()> {
        std::fs::write(path.as_ref(), format!("{}\n{}\n", self.file_name, self.offset))?;
        Ok(())
    }

    pub fn to_request(&self) -> SyncRequest {
        SyncRequest {
            file_name: self.file_name.clone(),
            last_offset: self.offset,
        }
    }
}

/// What to do when the master answers with a non-success trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorPolicy {
    /// Stop the slave thread permanently. An unknown cursor means this
    /// slave's view of the master's log is unrecoverable; refusing to
    /// guess is the safe default.
    Halt,
    /// Drop the cursor and re-replicate from the oldest segment.
    RestartFromOrigin,
}

enum RoundOutcome {
    Applied,
    Fatal,
}

/// The slave-side apply loop.
///
/// Runs on one dedicated thread: connect, request a batch from the current
/// cursor, read the bounded stream, persist the advanced cursor, replay the
/// records, sleep, repeat. Connection failures retry forever on a flat
/// interval. All I/O is blocking; a master that accepts and then hangs will
/// stall the loop, there is deliberately no request timeout here.
pub struct SyncSlave {
    store: Arc<ShardedStore>,
    master_addr: String,
    cursor_path: PathBuf,
    sync_interval: Duration,
    reconnect_interval: Duration,
    policy: StreamErrorPolicy,
}

impl SyncSlave {
    pub fn new(store: Arc<ShardedStore>, master_addr: String, work_dir: &Path) -> SyncSlave {
        SyncSlave {
            store,
            master_addr,
            cursor_path: work_dir.join(CURSOR_FILE_NAME),
            sync_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            policy: StreamErrorPolicy::Halt,
        }
    }

    pub fn with_intervals(mut self, sync: Duration, reconnect: Duration) -> SyncSlave {
        self.sync_interval = sync;
        if !reconnect.is_zero() {
            self.reconnect_interval = reconnect;
        }
        self
    }

    pub fn with_policy(mut self, policy: StreamErrorPolicy) -> SyncSlave {
        self.policy = policy;
        self
    }

    /// Spawn the apply loop. Restarting after a [`SlaveHandle::stop`] means
    /// building a new `SyncSlave`; the persisted cursor carries over.
    pub fn start(self) -> DbResult<SlaveHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("sync-slave".to_string())
            .spawn(move || self.run(&flag))?;
        Ok(SlaveHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn run(&self, stop: &AtomicBool) {
        let mut cursor = ReplicationCursor::load(&self.cursor_path);
        info!(
            "slave replicating from {} (cursor: '{}' @ {})",
            self.master_addr, cursor.file_name, cursor.offset
        );

        let mut conn: Option<TcpStream> = None;
        while !stop.load(Ordering::SeqCst) {
            if conn.is_none() {
                match TcpStream::connect(&self.master_addr) {
                    Ok(stream) => {
                        info!("connected to master {}", self.master_addr);
                        conn = Some(stream);
                    }
                    Err(e) => {
                        warn!("connect to master {} failed: {}", self.master_addr, e);
                        if !sleep_unless_stopped(stop, self.reconnect_interval) {
                            return;
                        }
                        continue;
                    }
                }
            }

            let stream = conn.as_mut().expect("connected above");
            match self.sync_round(stream, &mut cursor) {
                Ok(RoundOutcome::Applied) => {
                    if !sleep_unless_stopped(stop, self.sync_interval) {
                        return;
                    }
                }
                Ok(RoundOutcome::Fatal) => return,
                Err(e) => {
                    warn!("sync round failed: {}; reconnecting", e);
                    conn = None;
                    if !sleep_unless_stopped(stop, self.reconnect_interval) {
                        return;
                    }
                }
            }
        }
    }

    fn sync_round(
        &self,
        stream: &mut TcpStream,
        cursor: &mut ReplicationCursor,
    ) -> DbResult<RoundOutcome> {
        stream.write_all(&cursor.to_request().encode())?;

        // the fixed header first, in full; read_exact loops over short reads
        let mut header = [0u8; STREAM_HEADER_SIZE];
        stream.read_exact(&mut header)?;
        let trailer = StreamTrailer::decode(&header)?;

        let total = trailer.stream_size as usize;
        let mut payload = Vec::new();
        if total > STREAM_HEADER_SIZE {
            payload = vec![0u8; total - STREAM_HEADER_SIZE];
            stream.read_exact(&mut payload)?;
        }

        if trailer.error != StreamError::NoError {
            match self.policy {
                StreamErrorPolicy::Halt => {
                    error!(
                        "master reported sync error {:?} ({}); slave stopped",
                        trailer.error, trailer.error_msg
                    );
                    return Ok(RoundOutcome::Fatal);
                }
                StreamErrorPolicy::RestartFromOrigin => {
                    warn!(
                        "master reported sync error {:?} ({}); restarting from origin",
                        trailer.error, trailer.error_msg
                    );
                    *cursor = ReplicationCursor::unset();
                    if let Err(e) = cursor.save(&self.cursor_path) {
                        warn!("failed to persist sync cursor: {}", e);
                    }
                    return Ok(RoundOutcome::Applied);
                }
            }
        }

        // Persist the advanced cursor before applying. A crash mid-apply
        // re-requests this same batch, and replaying Set/Delete records is
        // idempotent, so nothing is ever skipped.
        *cursor = ReplicationCursor {
            file_name: trailer.src_file_name.clone(),
            offset: trailer.last_offset,
        };
        if let Err(e) = cursor.save(&self.cursor_path) {
            warn!("failed to persist sync cursor: {}", e);
        }

        let records_end = payload.len().saturating_sub(STREAM_TERMINATOR.len());
        let mut applied = 0u32;
        for raw in
            RecordCursor::new(&payload[..records_end]).take(trailer.record_count.max(0) as usize)
        {
            match LogRecord::decode(raw) {
                Ok((record, _)) => {
                    self.apply_record(&record);
                    applied += 1;
                }
                Err(e) => {
                    warn!("skipping undecodable record: {}", e);
                }
            }
        }
        if applied > 0 {
            debug!(
                "applied {} records, cursor now '{}' @ {}",
                applied, cursor.file_name, cursor.offset
            );
        }
        Ok(RoundOutcome::Applied)
    }

    /// Replay one record against the local store. The routing key is
    /// extracted exactly as the master's write path extracted it, so the
    /// record lands on the same shard. Per-record failures are logged and
    /// skipped; the batch keeps going.
    fn apply_record(&self, record: &LogRecord) {
        let routing = ShardRouter::routing_key(&record.key);
        let result = match record.kind {
            RecordKind::Set => self.store.put_routed(routing, &record.key, &record.value),
            RecordKind::Delete => self.store.delete_routed(routing, &record.key),
        };
        if let Err(e) = result {
            warn!(
                "apply failed for key '{}': {}",
                String::from_utf8_lossy(&record.key),
                e
            );
        }
    }
}

/// Owner handle for a running slave thread.
pub struct SlaveHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SlaveHandle {
    /// Blocking stop: raises the flag and waits for the loop to reach its
    /// next safe point (between rounds). Used by administrative operations
    /// that need the apply loop quiescent.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Whether the loop has exited on its own (e.g. a fatal trailer under
    /// the `Halt` policy).
    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true)
    }

    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Flat-interval sleep that still honors a stop request promptly.
/// Returns false when stopping.
fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) -> bool {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
    !stop.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cursor_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CURSOR_FILE_NAME);

        let cursor = ReplicationCursor {
            file_name: "20240501_080000-7-bin".to_string(),
            offset: 99,
        };
        cursor.save(&path).unwrap();
        assert_eq!(ReplicationCursor::load(&path), cursor);
    }

    #[test]
    fn test_sentinel_cursor_survives_persistence() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CURSOR_FILE_NAME);

        let cursor = ReplicationCursor::unset();
        cursor.save(&path).unwrap();

        let loaded = ReplicationCursor::load(&path);
        assert_eq!(loaded.file_name, " ");
        assert_eq!(loaded.offset, -1);
        assert!(loaded.to_request().is_unset());
    }

    #[test]
    fn test_missing_cursor_is_unset() {
        let tmp = TempDir::new().unwrap();
        let loaded = ReplicationCursor::load(tmp.path().join("nope"));
        assert_eq!(loaded, ReplicationCursor::unset());
    }

    #[test]
    fn test_malformed_cursor_is_unset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CURSOR_FILE_NAME);

        for contents in ["", "only-one-line\n", "name\nnot-a-number\n"] {
            std::fs::write(&path, contents).unwrap();
            assert_eq!(ReplicationCursor::load(&path), ReplicationCursor::unset());
        }
    }
}
