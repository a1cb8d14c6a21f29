//! Newline-delimited line codec.
//!
//! One JSON record per `\n`-terminated line. Reads may split a record at any
//! byte offset; the trailing partial line is retained until a later read
//! completes it.

use serde::Serialize;
use thiserror::Error;

/// Longest partial line the decoder buffers before giving up (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

const TERMINATOR: u8 = b'\n';

/// Codec error type.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A line grew past the configured limit without a terminator.
    #[error("Frame exceeds {limit} bytes without a terminator")]
    FrameTooLarge { limit: usize },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using CodecError.
pub type CodecResult<T> = Result<T, CodecError>;

/// Split `buf` into complete records and the unconsumed remainder.
///
/// Terminators are stripped, as is a trailing `\r`. Blank lines are skipped.
pub fn split_frames(buf: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut records = Vec::new();
    let mut start = 0;

    while let Some(pos) = buf[start..].iter().position(|b| *b == TERMINATOR) {
        let end = start + pos;
        let mut record = &buf[start..end];
        if let Some(stripped) = record.strip_suffix(b"\r") {
            record = stripped;
        }
        if !record.iter().all(u8::is_ascii_whitespace) {
            records.push(record);
        }
        start = end + 1;
    }

    (records, &buf[start..])
}

/// Serialize a frame to its wire record, terminator included.
pub fn encode_frame<T: Serialize>(frame: &T) -> CodecResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(TERMINATOR);
    Ok(bytes)
}

/// Stateful decoder over an append-only byte buffer.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl LineDecoder {
    /// Create a decoder that rejects partial lines longer than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Append `chunk` and return every record it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> CodecResult<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(chunk);

        let (records, consumed) = {
            let (records, rest) = split_frames(&self.buf);
            let owned: Vec<Vec<u8>> = records.into_iter().map(<[u8]>::to_vec).collect();
            (owned, self.buf.len() - rest.len())
        };
        self.buf.drain(..consumed);

        if self.buf.len() > self.max_frame_bytes {
            self.buf.clear();
            return Err(CodecError::FrameTooLarge {
                limit: self.max_frame_bytes,
            });
        }

        Ok(records)
    }

    /// Bytes of the partial line still waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}
