//! Reassembles lines from arbitrarily chunked byte reads.

use bytes::{Buf, BytesMut};

/// Accumulates bytes and yields complete lines.
///
/// Lines end at `\n`; a trailing `\r` is stripped. Bytes are decoded as UTF-8
/// only once a line is complete, so multi-byte characters may straddle chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(end);
            self.buf.advance(1);
            lines.push(decode(&line));
        }
        lines
    }

    /// Take whatever partial line is left, e.g. at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(decode(&rest))
    }

    /// Bytes waiting for a line terminator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
