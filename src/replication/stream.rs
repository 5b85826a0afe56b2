use std::io::BufRead;

use super::cluster::ReplicationCluster;
use crate::error::{DbError, DbResult};

/// Hard cap on one sync response, header and terminator included. The last
/// record that crosses the cap is still sent whole; records are never split.
pub const MAX_STREAM_SIZE: usize = 32 * 1024 * 1024;

/// Packed trailer-header layout:
/// `[marker u8][stream_size i32][error i32][error_msg 128][src_file 128]`
/// `[last_offset i32][record_count i32]`, little-endian, no padding.
pub const STREAM_HEADER_SIZE: usize = 1 + 4 + 4 + NAME_FIELD_SIZE + NAME_FIELD_SIZE + 4 + 4;

/// Width of the fixed error-message and file-name fields.
pub const NAME_FIELD_SIZE: usize = 128;

pub const STREAM_MARKER: u8 = b'+';
pub const STREAM_TERMINATOR: &[u8; 2] = b"\r\n";

/// File-name sentinel a follower sends before it has any cursor.
pub const UNSET_FILE_NAME: &str = " ";

const SYNC_VERB: &str = "SYNC";

/// Largest bulk argument a sync request may carry.
const MAX_REQUEST_ARG: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    NoError = 0,
    InvalidFileName = 1,
}

impl StreamError {
    pub fn from_i32(v: i32) -> Option<StreamError> {
        match v {
            0 => Some(StreamError::NoError),
            1 => Some(StreamError::InvalidFileName),
            _ => None,
        }
    }
}

/// Decoded form of the fixed-size response header.
#[derive(Debug, Clone)]
pub struct StreamTrailer {
    pub stream_size: i32,
    pub error: StreamError,
    pub error_msg: String,
    pub src_file_name: String,
    pub last_offset: i32,
    pub record_count: i32,
}

impl StreamTrailer {
    pub fn encode(&self) -> [u8; STREAM_HEADER_SIZE] {
        let mut buf = [0u8; STREAM_HEADER_SIZE];
        buf[0] = STREAM_MARKER;
        buf[1..5].copy_from_slice(&self.stream_size.to_le_bytes());
        buf[5..9].copy_from_slice(&(self.error as i32).to_le_bytes());
        write_name_field(&mut buf[9..9 + NAME_FIELD_SIZE], &self.error_msg);
        let name_at = 9 + NAME_FIELD_SIZE;
        write_name_field(&mut buf[name_at..name_at + NAME_FIELD_SIZE], &self.src_file_name);
        let tail = name_at + NAME_FIELD_SIZE;
        buf[tail..tail + 4].copy_from_slice(&self.last_offset.to_le_bytes());
        buf[tail + 4..tail + 8].copy_from_slice(&self.record_count.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<StreamTrailer> {
        if buf.len() < STREAM_HEADER_SIZE {
            return Err(DbError::ProtocolError(format!(
                "stream header needs {} bytes, have {}",
                STREAM_HEADER_SIZE,
                buf.len()
            )));
        }
        if buf[0] != STREAM_MARKER {
            return Err(DbError::ProtocolError(format!(
                "bad stream marker 0x{:02x}",
                buf[0]
            )));
        }

        let stream_size = read_i32(buf, 1);
        let error_raw = read_i32(buf, 5);
        let error = StreamError::from_i32(error_raw)
            .ok_or_else(|| DbError::ProtocolError(format!("unknown error code {}", error_raw)))?;
        let error_msg = read_name_field(&buf[9..9 + NAME_FIELD_SIZE]);
        let name_at = 9 + NAME_FIELD_SIZE;
        let src_file_name = read_name_field(&buf[name_at..name_at + NAME_FIELD_SIZE]);
        let tail = name_at + NAME_FIELD_SIZE;
        let last_offset = read_i32(buf, tail);
        let record_count = read_i32(buf, tail + 4);

        if stream_size < STREAM_HEADER_SIZE as i32 || record_count < 0 {
            return Err(DbError::ProtocolError(format!(
                "implausible stream header: size={} count={}",
                stream_size, record_count
            )));
        }

        Ok(StreamTrailer {
            stream_size,
            error,
            error_msg,
            src_file_name,
            last_offset,
            record_count,
        })
    }
}

/// A follower's catch-up request: its current cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub file_name: String,
    pub last_offset: i32,
}

impl SyncRequest {
    /// The "no cursor yet" request: replicate from the oldest segment.
    pub fn unset() -> SyncRequest {
        SyncRequest {
            file_name: UNSET_FILE_NAME.to_string(),
            last_offset: -1,
        }
    }

    pub fn is_unset(&self) -> bool {
        self.file_name.is_empty() || self.file_name.starts_with(' ')
    }

    /// Three-part command framing:
    /// `*3\r\n$4\r\nSYNC\r\n$<n>\r\n<file>\r\n$<n>\r\n<offset>\r\n`.
    pub fn encode(&self) -> Vec<u8> {
        let offset = self.last_offset.to_string();
        format!(
            "*3\r\n${}\r\n{}\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
            SYNC_VERB.len(),
            SYNC_VERB,
            self.file_name.len(),
            self.file_name,
            offset.len(),
            offset
        )
        .into_bytes()
    }

    pub fn read_from<R: BufRead>(r: &mut R) -> DbResult<SyncRequest> {
        let header = read_line(r)?;
        if header != "*3" {
            return Err(DbError::ProtocolError(format!(
                "expected 3-part sync command, got '{}'",
                header
            )));
        }

        let verb = read_bulk(r)?;
        if verb != SYNC_VERB.as_bytes() {
            return Err(DbError::ProtocolError(format!(
                "unexpected verb '{}'",
                String::from_utf8_lossy(&verb)
            )));
        }

        let file_name = String::from_utf8(read_bulk(r)?)
            .map_err(|_| DbError::ProtocolError("file name is not UTF-8".to_string()))?;

        let offset_raw = read_bulk(r)?;
        let last_offset = std::str::from_utf8(&offset_raw)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .ok_or_else(|| DbError::ProtocolError("offset is not an integer".to_string()))?;

        Ok(SyncRequest {
            file_name,
            last_offset,
        })
    }
}

/// Build one bounded response for a follower's cursor.
///
/// Walks the catalog from the cursor's segment, skipping record ordinals
/// at or below the cursor offset in that first segment, then streaming
/// everything newer until all segments are exhausted or `max_stream_size`
/// is reached. A cursor naming a segment the catalog does not know yields
/// an `InvalidFileName` trailer with zero records.
pub fn build_sync_stream(
    cluster: &ReplicationCluster,
    req: &SyncRequest,
    max_stream_size: usize,
) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    let mut count: i32 = 0;
    let mut error = StreamError::NoError;
    let mut error_msg = String::new();
    let mut last_file = req.file_name.clone();
    let mut last_offset = req.last_offset;
    let mut skip_through = req.last_offset;

    let names = cluster.catalog_snapshot();
    if !names.is_empty() {
        if req.is_unset() {
            skip_through = -1;
            last_file = names[0].clone();
        }

        match names.iter().position(|n| *n == last_file) {
            None => {
                error = StreamError::InvalidFileName;
                error_msg = "invalid binlog file name".to_string();
            }
            Some(start) => {
                for name in &names[start..] {
                    let reader = match cluster.open_segment_for_read(name) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("sync: cannot read segment '{}': {}", name, e);
                            break;
                        }
                    };

                    let mut pos: i32 = -1;
                    let mut capped = false;
                    for raw in reader.records() {
                        pos += 1;
                        if pos > skip_through {
                            body.extend_from_slice(raw);
                            count += 1;
                        }
                        if STREAM_HEADER_SIZE + body.len() >= max_stream_size {
                            capped = true;
                            break;
                        }
                    }

                    // the skip offset only ever applies to the cursor's own
                    // segment; later segments stream from their start
                    skip_through = -1;
                    last_file = name.clone();
                    last_offset = pos;
                    if capped {
                        break;
                    }
                }
            }
        }
    }

    let trailer = StreamTrailer {
        stream_size: (STREAM_HEADER_SIZE + body.len() + STREAM_TERMINATOR.len()) as i32,
        error,
        error_msg,
        src_file_name: last_file,
        last_offset,
        record_count: count,
    };

    let mut out = Vec::with_capacity(trailer.stream_size as usize);
    out.extend_from_slice(&trailer.encode());
    out.extend_from_slice(&body);
    out.extend_from_slice(STREAM_TERMINATOR);
    out
}

fn write_name_field(field: &mut [u8], value: &str) {
    // NUL-padded, silently truncated; segment names and error strings are
    // far shorter than the field
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

fn read_name_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_line<R: BufRead>(r: &mut R) -> DbResult<String> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Err(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| DbError::ProtocolError("non-UTF-8 line".to_string()))
}

fn read_bulk<R: BufRead>(r: &mut R) -> DbResult<Vec<u8>> {
    let len_line = read_line(r)?;
    let len: usize = len_line
        .strip_prefix('$')
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DbError::ProtocolError(format!("expected bulk length, got '{}'", len_line)))?;
    if len > MAX_REQUEST_ARG {
        return Err(DbError::ProtocolError(format!(
            "bulk argument too large: {}",
            len
        )));
    }

    let mut buf = vec![0u8; len + 2];
    std::io::Read::read_exact(r, &mut buf)?;
    if &buf[len..] != b"\r\n" {
        return Err(DbError::ProtocolError(
            "bulk argument not CRLF-terminated".to_string(),
        ));
    }
    buf.truncate(len);
    Ok(buf)
}
