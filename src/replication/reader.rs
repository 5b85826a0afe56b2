use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::record::{frame_size, RECORD_HEADER_SIZE};
use super::segment::{SEGMENT_HEADER_SIZE, SEGMENT_MAGIC};
use crate::error::{DbError, DbResult};

/// Read-only snapshot of one segment's record region.
///
/// The file is validated and read into memory at open time; iteration then
/// works on the immutable buffer. For a rotated-away segment this is always
/// safe without locking; for the current segment the cluster flushes and
/// opens the reader under its binlog mutex, so the snapshot ends on a
/// record boundary.
pub struct SegmentReader {
    data: Vec<u8>,
}

impl SegmentReader {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<SegmentReader> {
        let mut file = File::open(path.as_ref())?;

        let mut magic = [0u8; 4];
        match file.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DbError::InvalidSegment(path.as_ref().display().to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        if magic != SEGMENT_MAGIC {
            return Err(DbError::InvalidSegment(path.as_ref().display().to_string()));
        }

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(SegmentReader { data })
    }

    /// The raw record region (everything past the header).
    pub fn record_region(&self) -> &[u8] {
        &self.data
    }

    /// Byte length of the record region.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total file size this snapshot corresponds to.
    pub fn file_size(&self) -> u64 {
        SEGMENT_HEADER_SIZE + self.data.len() as u64
    }

    /// Cursor over the records, starting at the first.
    pub fn records(&self) -> RecordCursor<'_> {
        RecordCursor::new(&self.data)
    }
}

/// Forward-only cursor over concatenated record encodings.
///
/// Yields each record's raw bytes. The only validation is that a frame fits
/// inside the region; a frame that would run past the end (a torn tail
/// write, or garbage sizes) ends iteration. Trusting `encoded_size` beyond
/// that is deliberate: segments are produced by this process's own writer.
pub struct RecordCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> RecordCursor<'a> {
    pub fn new(buf: &'a [u8]) -> RecordCursor<'a> {
        RecordCursor { buf, offset: 0 }
    }

    /// Restart from the first record.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }
}

impl<'a> Iterator for RecordCursor<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.buf.len() {
            return None;
        }
        let remaining = &self.buf[self.offset..];
        let size = frame_size(remaining)?;
        if size < RECORD_HEADER_SIZE || size > remaining.len() {
            return None;
        }
        self.offset += size;
        Some(&remaining[..size])
    }
}
