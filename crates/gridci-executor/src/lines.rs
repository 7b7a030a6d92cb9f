//! Reassembly of raw log chunks into complete lines.

/// Accumulates byte chunks from a container log stream and yields
/// complete newline-delimited lines. Docker delivers frames at arbitrary
/// boundaries, so a line may span several chunks and a chunk may carry
/// several lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush a trailing unterminated line, if any.
    pub fn finish(mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_with_multiple_lines() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"one\ntwo\n"), vec!["one", "two"]);
    }

    #[test]
    fn line_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"hel").is_empty());
        assert_eq!(buffer.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(buffer.push(b"ld\n"), vec!["world"]);
    }

    #[test]
    fn crlf_is_stripped() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"dos line\r\n"), vec!["dos line"]);
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"complete\npartial");
        assert_eq!(buffer.finish(), Some("partial".to_string()));
    }

    #[test]
    fn finish_is_none_when_empty() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"all done\n");
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"ok \xff\xfe bytes\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].ends_with(" bytes"));
    }
}
