//! Master/slave replication over an append-only binary log.
//!
//! Every mutation the cluster accepts is recorded as a [`LogRecord`] in the
//! current binlog segment; segments rotate by size and are listed in a
//! persisted catalog. A slave catches up by repeatedly asking the master
//! for a bounded stream of records past its cursor (see [`stream`]) and
//! replaying them against its own store.

pub mod catalog;
pub mod cluster;
pub mod reader;
pub mod record;
pub mod segment;
pub mod stream;

pub use catalog::{SegmentCatalog, CATALOG_FILE_NAME};
pub use cluster::{ReplicationCluster, BINLOG_DIR};
pub use reader::{RecordCursor, SegmentReader};
pub use record::{LogRecord, RecordKind, RECORD_HEADER_SIZE};
pub use segment::{SegmentWriter, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC};
pub use stream::{
    build_sync_stream, StreamError, StreamTrailer, SyncRequest, MAX_STREAM_SIZE,
    STREAM_HEADER_SIZE,
};
