//! Newline-delimited record framing.
//!
//! The worker's stdout is an unstructured byte stream: one read may carry half
//! a record, several records, or the tail of one and the head of the next.
//! `LineFramer` buffers those chunks and hands back complete records only once
//! their delimiter has been seen.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Record delimiter on the wire.
pub const DELIMITER: u8 = b'\n';

/// Default cap for a single record (16 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Bytes of an offending line kept in `Frame::Malformed` for oversized lines.
const PREVIEW_BYTES: usize = 120;

/// Outcome of framing one delimited line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A line that parsed as JSON.
    Record(Value),
    /// A line that could not be turned into a record. The stream is still
    /// healthy; the caller reports it and keeps reading.
    Malformed { line: String, reason: String },
}

impl Frame {
    /// The parsed record, or [`Error::MalformedRecord`].
    pub fn into_record(self) -> Result<Value> {
        match self {
            Self::Record(record) => Ok(record),
            Self::Malformed { reason, .. } => Err(Error::MalformedRecord { reason }),
        }
    }
}

/// Incremental line framer for the worker's stdout.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Offset of the first unconsumed byte in `buf`.
    start: usize,
    max_line_bytes: usize,
    /// Set after an oversized fragment was dropped: bytes up to the next
    /// delimiter belong to that same line and are dropped too.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Append `chunk` and return the complete records it unlocks, in arrival
    /// order.
    ///
    /// The returned iterator is lazy. Lines it has not yet yielded stay
    /// buffered and come out of the next `feed` call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(chunk);
        Frames { framer: self }
    }

    /// Bytes buffered that do not yet form a complete line.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Serialize a record to its wire form: compact JSON plus one delimiter.
    pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(record)?;
        bytes.push(DELIMITER);
        Ok(bytes)
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let pending = &self.buf[self.start..];
            let Some(pos) = pending.iter().position(|b| *b == DELIMITER) else {
                return self.check_overflow();
            };

            let line_start = self.start;
            self.start += pos + 1;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let mut line = &self.buf[line_start..line_start + pos];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_line_bytes {
                return Some(oversized(line, self.max_line_bytes));
            }
            return Some(parse_line(line));
        }
    }

    fn check_overflow(&mut self) -> Option<Frame> {
        if self.discarding {
            self.start = self.buf.len();
            return None;
        }
        if self.pending_bytes() <= self.max_line_bytes {
            return None;
        }
        let frame = oversized(&self.buf[self.start..], self.max_line_bytes);
        self.start = self.buf.len();
        self.discarding = true;
        Some(frame)
    }
}

/// Lazy sequence of frames produced by [`LineFramer::feed`].
pub struct Frames<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.framer.next_frame()
    }
}

fn parse_line(line: &[u8]) -> Frame {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Frame::Malformed {
                line: String::from_utf8_lossy(line).into_owned(),
                reason: format!("invalid UTF-8: {e}"),
            };
        }
    };
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Frame::Record(value),
        Err(e) => Frame::Malformed {
            line: text.to_string(),
            reason: e.to_string(),
        },
    }
}

fn oversized(line: &[u8], max: usize) -> Frame {
    let preview = &line[..line.len().min(PREVIEW_BYTES)];
    Frame::Malformed {
        line: String::from_utf8_lossy(preview).into_owned(),
        reason: format!("record exceeds {max} bytes"),
    }
}
