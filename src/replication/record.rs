use crate::error::{DbError, DbResult};

/// Fixed part of a record's on-disk encoding:
/// `[i32 encoded_size][i32 kind][i32 key_len][i32 value_len]`.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Kind of mutation a binlog record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Set = 0,
    Delete = 1,
}

impl RecordKind {
    pub fn from_i32(v: i32) -> Option<RecordKind> {
        match v {
            0 => Some(RecordKind::Set),
            1 => Some(RecordKind::Delete),
            _ => None,
        }
    }
}

/// One mutation event, as written to a binlog segment.
///
/// Records are self-describing: the leading `encoded_size` field lets a
/// reader step to the next record without a separate index. A `Delete`
/// record has an empty value and writes no value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: RecordKind::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: RecordKind::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// Total on-disk size of this record, header included.
    pub fn encoded_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len() + self.value.len()
    }

    /// Append the little-endian encoding of this record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_size());
        buf.extend_from_slice(&(self.encoded_size() as i32).to_le_bytes());
        buf.extend_from_slice(&(self.kind as i32).to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as i32).to_le_bytes());
        buf.extend_from_slice(&(self.value.len() as i32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one record from the front of `buf`.
    ///
    /// Returns the record and the number of bytes consumed. Every length is
    /// bounds-checked against the buffer before any payload is touched, so
    /// this is safe on untrusted input as well as on our own segments.
    pub fn decode(buf: &[u8]) -> DbResult<(LogRecord, usize)> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(DbError::TruncatedRecord(format!(
                "need {} header bytes, have {}",
                RECORD_HEADER_SIZE,
                buf.len()
            )));
        }

        let encoded_size = read_i32(buf, 0);
        let kind_raw = read_i32(buf, 4);
        let key_len = read_i32(buf, 8);
        let value_len = read_i32(buf, 12);

        if encoded_size < RECORD_HEADER_SIZE as i32 || key_len < 0 || value_len < 0 {
            return Err(DbError::CorruptRecord(format!(
                "negative or undersized fields: size={} key_len={} value_len={}",
                encoded_size, key_len, value_len
            )));
        }

        let kind = RecordKind::from_i32(kind_raw)
            .ok_or_else(|| DbError::CorruptRecord(format!("unknown record kind {}", kind_raw)))?;
        if kind == RecordKind::Delete && value_len != 0 {
            return Err(DbError::CorruptRecord(format!(
                "delete record with value_len={}",
                value_len
            )));
        }

        let expected = RECORD_HEADER_SIZE + key_len as usize + value_len as usize;
        if encoded_size as usize != expected {
            return Err(DbError::CorruptRecord(format!(
                "encoded_size {} does not match header+key+value = {}",
                encoded_size, expected
            )));
        }
        if buf.len() < expected {
            return Err(DbError::TruncatedRecord(format!(
                "record claims {} bytes, buffer has {}",
                expected,
                buf.len()
            )));
        }

        let key_end = RECORD_HEADER_SIZE + key_len as usize;
        let record = LogRecord {
            kind,
            key: buf[RECORD_HEADER_SIZE..key_end].to_vec(),
            value: buf[key_end..expected].to_vec(),
        };
        Ok((record, expected))
    }
}

/// Read the leading `encoded_size` of the record at the front of `buf`,
/// without decoding the rest. `None` if there are not even 4 bytes.
pub fn frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let size = read_i32(buf, 0);
    if size < RECORD_HEADER_SIZE as i32 {
        return None;
    }
    Some(size as usize)
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
