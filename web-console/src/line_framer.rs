/// Splits subprocess output into lines terminated by `\n`, `\r\n` or `\r`.
///
/// Works on bytes so a chunk boundary may fall anywhere, including inside a
/// multi-byte UTF-8 sequence. Empty lines are never yielded, which also makes
/// a `\r\n` pair split across two chunks indistinguishable from an unsplit
/// one.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every line it completes, in order.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.partial.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Bytes received after the last terminator.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.partial
    }
}
