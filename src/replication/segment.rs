use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::record::LogRecord;
use crate::error::{DbError, DbResult};

/// Magic bytes at the start of every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"SBL1";

/// Size of the fixed segment header.
pub const SEGMENT_HEADER_SIZE: u64 = 4;

/// Append-only writer over one binlog segment.
///
/// A segment is `[magic][record]*`; it is only ever extended, never
/// rewritten. One writer instance must not be shared between threads
/// without external locking (the cluster holds it under its binlog mutex).
pub struct SegmentWriter {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl SegmentWriter {
    /// Open `path` for appending, creating it if absent.
    ///
    /// A new (or shorter-than-header) file gets a fresh header; an existing
    /// file must start with the magic bytes or it is refused.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<SegmentWriter> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let bytes_written = if len < SEGMENT_HEADER_SIZE {
            // A partial header can only come from a crashed first write;
            // there is no record data yet, so start the file over.
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&SEGMENT_MAGIC)?;
            0
        } else {
            let mut magic = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if magic != SEGMENT_MAGIC {
                return Err(DbError::InvalidSegment(path.display().to_string()));
            }
            len - SEGMENT_HEADER_SIZE
        };

        file.seek(SeekFrom::End(0))?;
        Ok(SegmentWriter {
            path,
            file: Some(file),
            bytes_written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of record data appended so far (the header is not counted).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append one record; returns its encoded size.
    ///
    /// A failed or short write is an error and leaves the writer in an
    /// unknown position; the caller must stop using this segment.
    pub fn append(&mut self, record: &LogRecord) -> DbResult<u64> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| DbError::InternalError("segment already closed".to_string()))?;
        let buf = record.encode();
        file.write_all(&buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(buf.len() as u64)
    }

    pub fn append_set(&mut self, key: &[u8], value: &[u8]) -> DbResult<u64> {
        self.append(&LogRecord::set(key, value))
    }

    pub fn append_delete(&mut self, key: &[u8]) -> DbResult<u64> {
        self.append(&LogRecord::delete(key))
    }

    /// Flush appended records to the OS. Called before a reader snapshots
    /// the segment; append itself does not sync.
    pub fn sync(&mut self) -> DbResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Release the file handle. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
    }
}
