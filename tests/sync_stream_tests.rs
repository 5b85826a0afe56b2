//! Sync Stream Builder Tests
//!
//! Covers the master-side catch-up stream against a real binlog:
//! - empty catalog and unknown cursor handling
//! - full walk from the unset cursor across a rotation
//! - the size cap (whole records only, resumable trailer cursor)
//! - incremental requests skipping already-applied ordinals

use shardis::config::BinlogConfig;
use shardis::replication::stream::{STREAM_TERMINATOR, UNSET_FILE_NAME};
use shardis::replication::{
    build_sync_stream, LogRecord, RecordCursor, StreamError, StreamTrailer, SyncRequest,
    MAX_STREAM_SIZE, RECORD_HEADER_SIZE, STREAM_HEADER_SIZE,
};
use shardis::{ReplicationCluster, ShardedStore};
use std::sync::Arc;
use tempfile::TempDir;

fn test_cluster(max_segment_bytes: u64) -> (ReplicationCluster, TempDir) {
    let tmp = TempDir::new().expect("tempdir");
    let store =
        Arc::new(ShardedStore::open(tmp.path().join("store"), 2, false).expect("open store"));
    let cfg = BinlogConfig {
        enabled: true,
        max_segment_bytes,
    };
    let cluster = ReplicationCluster::start(store, tmp.path(), &cfg);
    assert!(cluster.binlog_enabled());
    (cluster, tmp)
}

/// Split a response into its trailer and the decoded records it carries.
fn parse_stream(raw: &[u8]) -> (StreamTrailer, Vec<LogRecord>) {
    let trailer = StreamTrailer::decode(raw).expect("trailer decodes");
    assert_eq!(raw.len(), trailer.stream_size as usize);
    assert_eq!(&raw[raw.len() - 2..], STREAM_TERMINATOR);

    let body = &raw[STREAM_HEADER_SIZE..raw.len() - 2];
    let records: Vec<LogRecord> = RecordCursor::new(body)
        .map(|frame| LogRecord::decode(frame).expect("record decodes").0)
        .collect();
    assert_eq!(records.len(), trailer.record_count as usize);
    (trailer, records)
}

/// A value padding one Set record to exactly `total` encoded bytes.
fn padded_value(key: &[u8], total: usize) -> Vec<u8> {
    vec![b'x'; total - RECORD_HEADER_SIZE - key.len()]
}

// ============================================================================
// Empty / Invalid Cursor Handling
// ============================================================================

#[test]
fn test_empty_catalog_yields_empty_stream() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(ShardedStore::open(tmp.path().join("store"), 1, false).unwrap());
    let cfg = BinlogConfig {
        enabled: false,
        max_segment_bytes: 1024,
    };
    let cluster = ReplicationCluster::start(store, tmp.path(), &cfg);

    let raw = build_sync_stream(&cluster, &SyncRequest::unset(), MAX_STREAM_SIZE);
    let (trailer, records) = parse_stream(&raw);

    assert_eq!(trailer.error, StreamError::NoError);
    assert_eq!(trailer.record_count, 0);
    assert!(records.is_empty());
    // the trailer echoes the requested cursor when there is nothing to walk
    assert_eq!(trailer.src_file_name, UNSET_FILE_NAME);
    assert_eq!(trailer.last_offset, -1);
}

#[test]
fn test_unknown_file_name_rejected() {
    let (cluster, _tmp) = test_cluster(1024 * 1024);
    cluster.set_value(b"k", b"v").unwrap();

    let req = SyncRequest {
        file_name: "19990101_000000-0-bin".to_string(),
        last_offset: 3,
    };
    let raw = build_sync_stream(&cluster, &req, MAX_STREAM_SIZE);
    let (trailer, records) = parse_stream(&raw);

    assert_eq!(trailer.error, StreamError::InvalidFileName);
    assert_eq!(trailer.record_count, 0);
    assert!(records.is_empty());
}

// ============================================================================
// Full Walk Across Rotation
// ============================================================================

#[test]
fn test_unset_cursor_streams_both_segments_in_order() {
    // Segment cap 200 with 101-byte records: the cap is crossed on the
    // second append, so the third lands in a fresh segment. Syncing from
    // the unset cursor must return all three in file-then-ordinal order.
    let (cluster, _tmp) = test_cluster(200);

    let mut expected = Vec::new();
    for i in 0..3 {
        let key = format!("key-{:04}", i).into_bytes();
        let value = padded_value(&key, 101);
        cluster.set_value(&key, &value).unwrap();
        expected.push(LogRecord::set(key, value));
    }

    let names = cluster.catalog_snapshot();
    assert_eq!(names.len(), 2, "rotation must have produced a second segment");

    let raw = build_sync_stream(&cluster, &SyncRequest::unset(), MAX_STREAM_SIZE);
    let (trailer, records) = parse_stream(&raw);

    assert_eq!(trailer.error, StreamError::NoError);
    assert_eq!(records, expected);
    // the walk ends in the second (current) segment, which holds one record
    assert_eq!(trailer.src_file_name, names[1]);
    assert_eq!(trailer.last_offset, 0);
    assert_eq!(trailer.record_count, 3);
}

#[test]
fn test_deletes_stream_as_delete_records() {
    let (cluster, _tmp) = test_cluster(1024 * 1024);

    cluster.set_value(b"gone", b"soon").unwrap();
    cluster.remove(b"gone").unwrap();

    let raw = build_sync_stream(&cluster, &SyncRequest::unset(), MAX_STREAM_SIZE);
    let (_, records) = parse_stream(&raw);

    assert_eq!(records.len(), 2);
    assert_eq!(records[1], LogRecord::delete(&b"gone"[..]));
}

// ============================================================================
// Size Cap
// ============================================================================

#[test]
fn test_cap_respected_with_whole_records() {
    let (cluster, _tmp) = test_cluster(1024 * 1024);

    // three records of exactly 30 encoded bytes each
    for i in 0..3 {
        let key = format!("k{:03}", i).into_bytes();
        let value = padded_value(&key, 30);
        cluster.set_value(&key, &value).unwrap();
    }

    // cap passes after one whole record, inside the second
    let cap = STREAM_HEADER_SIZE + 45;
    let raw = build_sync_stream(&cluster, &SyncRequest::unset(), cap);
    let (trailer, records) = parse_stream(&raw);

    assert_eq!(trailer.error, StreamError::NoError);
    // the record that crossed the cap is included in full, never split
    assert_eq!(records.len(), 2);
    assert_eq!(trailer.record_count, 2);
    assert!(trailer.record_count > 0);
    assert_eq!(trailer.last_offset, 1);

    // resuming from the trailer's cursor fetches exactly the remainder
    let resume = SyncRequest {
        file_name: trailer.src_file_name.clone(),
        last_offset: trailer.last_offset,
    };
    let raw = build_sync_stream(&cluster, &resume, MAX_STREAM_SIZE);
    let (trailer, records) = parse_stream(&raw);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, b"k002");
    assert_eq!(trailer.last_offset, 2);
}

// ============================================================================
// Incremental Requests
// ============================================================================

#[test]
fn test_offset_skips_already_applied_records() {
    let (cluster, _tmp) = test_cluster(1024 * 1024);

    for i in 0..5 {
        cluster
            .set_value(format!("key-{}", i).as_bytes(), b"v")
            .unwrap();
    }
    let name = cluster.catalog_snapshot()[0].clone();

    let req = SyncRequest {
        file_name: name.clone(),
        last_offset: 2,
    };
    let raw = build_sync_stream(&cluster, &req, MAX_STREAM_SIZE);
    let (trailer, records) = parse_stream(&raw);

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, b"key-3");
    assert_eq!(records[1].key, b"key-4");
    assert_eq!(trailer.src_file_name, name);
    assert_eq!(trailer.last_offset, 4);
}

#[test]
fn test_caught_up_cursor_gets_empty_stream() {
    let (cluster, _tmp) = test_cluster(1024 * 1024);

    cluster.set_value(b"only", b"one").unwrap();
    let name = cluster.catalog_snapshot()[0].clone();

    let req = SyncRequest {
        file_name: name.clone(),
        last_offset: 0,
    };
    let raw = build_sync_stream(&cluster, &req, MAX_STREAM_SIZE);
    let (trailer, records) = parse_stream(&raw);

    assert!(records.is_empty());
    assert_eq!(trailer.error, StreamError::NoError);
    assert_eq!(trailer.src_file_name, name);
    assert_eq!(trailer.last_offset, 0);

    // the cursor it reports can be sent right back, forever
    let again = build_sync_stream(
        &cluster,
        &SyncRequest {
            file_name: trailer.src_file_name,
            last_offset: trailer.last_offset,
        },
        MAX_STREAM_SIZE,
    );
    let (_, records) = parse_stream(&again);
    assert!(records.is_empty());
}

#[test]
fn test_writes_during_catchup_are_visible_next_round() {
    let (cluster, _tmp) = test_cluster(1024 * 1024);

    cluster.set_value(b"a", b"1").unwrap();
    let raw = build_sync_stream(&cluster, &SyncRequest::unset(), MAX_STREAM_SIZE);
    let (trailer, records) = parse_stream(&raw);
    assert_eq!(records.len(), 1);

    cluster.set_value(b"b", b"2").unwrap();
    let resume = SyncRequest {
        file_name: trailer.src_file_name,
        last_offset: trailer.last_offset,
    };
    let raw = build_sync_stream(&cluster, &resume, MAX_STREAM_SIZE);
    let (_, records) = parse_stream(&raw);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, b"b");
}
