//! Growable per-channel output buffers.
//!
//! Each channel owns one [`OutputBuffer`]. Native reads always land in the
//! spare region past the filled bytes; the buffer only grows (by doubling) or
//! compacts between reads, never while a read is pinned to its spare region.
//! Text decoding happens once, over the full accumulated bytes, so multi-byte
//! characters are never split across reads.

use crate::error::{ProcessError, Result};
use crate::process::OwnedStdio;
use serde::{Deserialize, Serialize};

const INITIAL_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: Vec<u8>,
    /// Bytes before `start` were consumed by a line reader
    start: usize,
    /// Bytes in `start..end` are filled
    end: usize,
    /// Line scanning resumes here instead of at `start`
    scan: usize,
    total: usize,
    pinned: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            ..Default::default()
        }
    }

    /// Unconsumed bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes ever committed to this buffer, including consumed ones
    pub fn total_read(&self) -> usize {
        self.total
    }

    /// Make room for at least one more byte past the filled region
    fn reserve_tail(&mut self) {
        debug_assert!(!self.pinned, "buffer resized while a read is pinned");
        if self.end < self.data.len() {
            return;
        }
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.scan -= self.start;
            self.end -= self.start;
            self.start = 0;
            if self.end < self.data.len() {
                return;
            }
        }
        let grown = (self.data.len() * 2).max(INITIAL_CAPACITY);
        self.data.resize(grown, 0);
    }

    /// Writable region for the next read; grows the buffer first when full
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.reserve_tail();
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes of the spare region as filled
    pub fn commit(&mut self, n: usize) {
        assert!(self.end + n <= self.data.len(), "commit past buffer end");
        self.end += n;
        self.total += n;
    }

    /// Pin the spare region for an outstanding native read.
    ///
    /// The region stays valid until [`finish_pinned_read`](Self::finish_pinned_read)
    /// is called: no growth or compaction happens in between.
    pub fn begin_pinned_read(&mut self) -> (*mut u8, usize) {
        let spare = self.spare_mut();
        let region = (spare.as_mut_ptr(), spare.len());
        self.pinned = true;
        region
    }

    pub fn finish_pinned_read(&mut self, n: usize) {
        debug_assert!(self.pinned, "no pinned read outstanding");
        self.pinned = false;
        self.commit(n);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Remove and return the next complete line, without its terminator
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let from = self.scan.max(self.start);
        match self.data[from..self.end].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let newline = from + offset;
                let mut line = self.data[self.start..newline].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.start = newline + 1;
                self.scan = self.start;
                Some(line)
            }
            None => {
                self.scan = self.end;
                None
            }
        }
    }

    /// Remove and return whatever is left after the last line terminator
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let rest = self.as_slice().to_vec();
        self.start = self.end;
        self.scan = self.end;
        Some(rest)
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.end);
        self.data.drain(..self.start);
        self.data
    }

    pub fn decode(self, encoding: TextEncoding) -> Result<String> {
        encoding.decode(&self.into_bytes())
    }
}

/// How captured bytes become text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    /// UTF-8, invalid sequences replaced with U+FFFD
    #[default]
    Utf8Lossy,
    /// UTF-8, invalid sequences are an error
    Utf8,
    Latin1,
}

impl TextEncoding {
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            TextEncoding::Utf8Lossy => Ok(String::from_utf8_lossy(bytes).into_owned()),
            TextEncoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| ProcessError::InvalidData(format!("output is not UTF-8: {e}"))),
            TextEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// Which child stream a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// stdout and stderr share one pipe
    Combined,
}

impl StreamKind {
    pub fn is_standard_error(self) -> bool {
        self == StreamKind::Stderr
    }
}

/// One readable channel being drained: its read end and its buffer
#[derive(Debug)]
pub struct StreamChannel {
    kind: StreamKind,
    source: Option<OwnedStdio>,
    buffer: OutputBuffer,
}

impl StreamChannel {
    pub fn new(kind: StreamKind, source: OwnedStdio) -> Self {
        Self {
            kind,
            source: Some(source),
            buffer: OutputBuffer::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The read end, `None` once the channel is closed
    pub fn source(&self) -> Option<&OwnedStdio> {
        self.source.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Stop reading and release the read end
    pub fn close(&mut self) {
        self.source = None;
    }

    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut OutputBuffer {
        &mut self.buffer
    }

    pub fn bytes_read(&self) -> usize {
        self.buffer.total_read()
    }

    pub fn into_buffer(self) -> OutputBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buffer: &mut OutputBuffer, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            let spare = buffer.spare_mut();
            let n = spare.len().min(rest.len());
            spare[..n].copy_from_slice(&rest[..n]);
            buffer.commit(n);
            rest = &rest[n..];
        }
    }

    #[test]
    fn test_buffer_grows_by_doubling() {
        let mut buffer = OutputBuffer::new();
        assert_eq!(buffer.capacity(), 0);

        fill(&mut buffer, &[b'a'; INITIAL_CAPACITY]);
        assert_eq!(buffer.capacity(), INITIAL_CAPACITY);

        fill(&mut buffer, b"b");
        assert_eq!(buffer.capacity(), INITIAL_CAPACITY * 2);
        assert_eq!(buffer.len(), INITIAL_CAPACITY + 1);
        assert_eq!(buffer.total_read(), INITIAL_CAPACITY + 1);
    }

    #[test]
    fn test_decoding_happens_over_full_length() {
        // "é" is two bytes; commit them in separate reads.
        let mut buffer = OutputBuffer::new();
        fill(&mut buffer, &[0xC3]);
        fill(&mut buffer, &[0xA9, b'!']);
        assert_eq!(buffer.decode(TextEncoding::Utf8).unwrap(), "é!");
    }

    #[test]
    fn test_strict_utf8_rejects_invalid_bytes() {
        let mut buffer = OutputBuffer::new();
        fill(&mut buffer, &[0xFF, 0xFE]);
        assert!(matches!(
            buffer.decode(TextEncoding::Utf8),
            Err(ProcessError::InvalidData(_))
        ));
        assert_eq!(TextEncoding::Utf8Lossy.decode(&[0xFF]).unwrap(), "\u{FFFD}");
        assert_eq!(TextEncoding::Latin1.decode(&[0xE9]).unwrap(), "é");
    }

    #[test]
    fn test_take_line_handles_partial_lines() {
        let mut buffer = OutputBuffer::new();
        fill(&mut buffer, b"first\r\nsec");
        assert_eq!(buffer.take_line().unwrap(), b"first");
        assert_eq!(buffer.take_line(), None);

        fill(&mut buffer, b"ond\nthird");
        assert_eq!(buffer.take_line().unwrap(), b"second");
        assert_eq!(buffer.take_line(), None);
        assert_eq!(buffer.take_remainder().unwrap(), b"third");
        assert_eq!(buffer.take_remainder(), None);
    }

    #[test]
    fn test_compaction_keeps_unconsumed_bytes() {
        let mut buffer = OutputBuffer::with_capacity(8);
        fill(&mut buffer, b"ab\ncdefg");
        assert_eq!(buffer.take_line().unwrap(), b"ab");

        // Full: the next reservation compacts instead of growing.
        fill(&mut buffer, b"h");
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.as_slice(), b"cdefgh");
        assert_eq!(buffer.into_bytes(), b"cdefgh");
    }

    #[test]
    fn test_pinned_read_commits_into_spare_region() {
        let mut buffer = OutputBuffer::new();
        fill(&mut buffer, b"xy");

        let (ptr, len) = buffer.begin_pinned_read();
        assert!(buffer.is_pinned());
        assert_eq!(len, INITIAL_CAPACITY - 2);
        unsafe { std::ptr::copy_nonoverlapping(b"z".as_ptr(), ptr, 1) };
        buffer.finish_pinned_read(1);

        assert!(!buffer.is_pinned());
        assert_eq!(buffer.as_slice(), b"xyz");
    }
}
