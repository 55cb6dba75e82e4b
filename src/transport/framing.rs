//! Newline-delimited framing.

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
///
/// A trailing `\r` is trimmed and blank lines are skipped. Invalid UTF-8 is
/// replaced rather than rejected so the codec can answer with a parse error.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(text) = decode(&line[..pos]) {
                lines.push(text);
            }
        }
        lines
    }

    /// End of stream: whatever non-blank content is left becomes the last message.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        decode(&rest)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_suffix('\r').unwrap_or(&text);
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_pushes() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(br#"{"jsonrpc":"2.0","id":1,"#).is_empty());
        let lines = buffer.push(b"\"method\":\"x\"}\n");
        assert_eq!(lines, vec![r#"{"jsonrpc":"2.0","id":1,"method":"x"}"#]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_multiple_lines_and_blanks() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"a\r\n\n  \nb\nc");
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(buffer.finish().as_deref(), Some("c"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_finish_skips_whitespace() {
        let mut buffer = LineBuffer::new();
        buffer.push(b" \t ");
        assert_eq!(buffer.finish(), None);
    }
}
