//! Byte-level line splitting for streamed HTTP bodies.
//!
//! Network chunks can end in the middle of a multi-byte character, so
//! bytes are buffered and only complete lines are decoded.

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line they complete, without the
    /// trailing `\n` or `\r\n`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// The unterminated tail, if any. Empties the buffer.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = decode(&self.buffer);
        self.buffer.clear();
        Some(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn decode(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines_and_keeps_the_rest() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"first\r\nsec"), vec!["first"]);
        assert!(!buf.is_empty());
        assert_eq!(buf.push(b"ond\n\nthird"), vec!["second", ""]);
        assert_eq!(buf.finish().as_deref(), Some("third"));
        assert!(buf.finish().is_none());
    }

    #[test]
    fn character_split_across_chunks_survives() {
        let line = "data: 今天北京天气怎么样\n".as_bytes();
        // Cut inside the first CJK character (3 bytes each)
        let cut = "data: ".len() + 1;

        let mut buf = LineBuffer::new();
        assert!(buf.push(&line[..cut]).is_empty());
        assert_eq!(buf.push(&line[cut..]), vec!["data: 今天北京天气怎么样"]);
    }

    #[test]
    fn byte_at_a_time() {
        let text = "événement: 北京\r\n".as_bytes();
        let mut buf = LineBuffer::new();
        let mut lines = Vec::new();
        for byte in text {
            lines.extend(buf.push(std::slice::from_ref(byte)));
        }
        assert_eq!(lines, vec!["événement: 北京"]);
        assert!(buf.is_empty());
    }
}
