// Line framer - splits the inbound byte stream into trimmed protocol lines
use bytes::{Buf, BytesMut};

#[derive(Debug, Default)]
pub struct LineFramer {
    pending: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every line it completes, in arrival order.
    ///
    /// Splitting happens on raw bytes so a UTF-8 sequence cut across two chunks
    /// still decodes once its line is complete. Blank lines are dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let segment = self.pending.split_to(pos);
            self.pending.advance(1);

            let text = String::from_utf8_lossy(&segment);
            let line = text.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Bytes held back waiting for a newline. Grows without bound if none arrives.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
