//! Receive buffer with line/block framing.
//!
//! [`ReadBuffer`] holds bytes that arrived from the transport but have not
//! been consumed by a read call yet. Every `take_*` method either consumes a
//! complete frame or leaves the buffer untouched, so a read that gives up
//! (timeout, cancellation) never loses data.

use bytes::{Bytes, BytesMut};

/// Growable buffer of received, unconsumed bytes.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    data: BytesMut,
}

impl ReadBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Position just past the first occurrence of `delimiter`, if any.
    pub fn find(&self, delimiter: &[u8]) -> Option<usize> {
        self.find_from(delimiter, 0)
    }

    fn find_from(&self, delimiter: &[u8], start: usize) -> Option<usize> {
        let haystack = self.data.get(start..)?;
        let found = match delimiter {
            [] => Some(0),
            [byte] => haystack.iter().position(|b| b == byte),
            _ => haystack
                .windows(delimiter.len())
                .position(|window| window == delimiter),
        };
        found.map(|i| start + i + delimiter.len())
    }

    /// Consume bytes up to and including `delimiter`.
    pub fn take_until(&mut self, delimiter: &[u8]) -> Option<Bytes> {
        let end = self.find(delimiter)?;
        Some(self.data.split_to(end).freeze())
    }

    /// Consume `count` delimiter-terminated lines, all or none.
    pub fn take_lines(&mut self, delimiter: &[u8], count: usize) -> Option<Vec<Bytes>> {
        let mut ends = Vec::with_capacity(count);
        let mut start = 0;
        for _ in 0..count {
            let end = self.find_from(delimiter, start)?;
            ends.push(end - start);
            start = end;
        }
        Some(
            ends.into_iter()
                .map(|len| self.data.split_to(len).freeze())
                .collect(),
        )
    }

    /// Consume exactly `n` bytes once that many are buffered.
    pub fn take_exact(&mut self, n: usize) -> Option<Bytes> {
        if self.data.len() < n {
            return None;
        }
        Some(self.data.split_to(n).freeze())
    }

    /// Consume up to `max` bytes if anything is buffered.
    pub fn take_some(&mut self, max: usize) -> Option<Bytes> {
        if self.data.is_empty() {
            return None;
        }
        let n = max.min(self.data.len());
        Some(self.data.split_to(n).freeze())
    }

    /// Consume everything buffered.
    pub fn take_all(&mut self) -> Bytes {
        self.data.split().freeze()
    }
}
