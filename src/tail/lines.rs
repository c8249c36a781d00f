/// One newline-delimited line reconstructed from a chunk stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Content without the `\n` / `\r\n` terminator. For an oversized line,
    /// only its first `max_line_bytes` bytes.
    pub bytes: Vec<u8>,
    /// Bytes this line occupies in the file, terminator included
    pub len: u64,
    /// 1-based position within the current read
    pub number: u64,
    pub is_first_overall: bool,
    /// Set only on an unterminated fragment left over when the stream ended
    pub is_last_overall: bool,
    /// Longer than the reconstructor's limit; `bytes` is truncated
    pub oversized: bool,
}

impl Line {
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.bytes)
    }

    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(|b| b.is_ascii_whitespace())
    }

    /// Short lossy rendering for log messages
    pub fn preview(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        match text.char_indices().nth(max) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text.into_owned(),
        }
    }
}

/// Splits a sequence of chunks into lines, stitching lines that straddle chunk
/// boundaries through an internal carry buffer.
///
/// The carry buffer never holds more than `max_line_bytes`. Bytes of a longer
/// line are counted but dropped, and the line comes out flagged `oversized`.
#[derive(Debug)]
pub struct LineReconstructor {
    carry: Vec<u8>,
    /// Bytes of the current line dropped past the limit
    overflow: u64,
    max_line_bytes: usize,
    emitted: u64,
}

impl LineReconstructor {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            carry: Vec::new(),
            overflow: 0,
            max_line_bytes: max_line_bytes.max(1),
            emitted: 0,
        }
    }

    /// Feed the next chunk; returns every line it completes
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos + 1);
            self.hold(head);
            lines.push(self.take_line(false));
            rest = tail;
        }

        self.hold(rest);
        lines
    }

    /// End of stream: emits the unterminated trailing fragment, if any
    pub fn finish(&mut self) -> Option<Line> {
        if self.carry.is_empty() && self.overflow == 0 {
            return None;
        }
        Some(self.take_line(true))
    }

    /// Bytes held back waiting for a newline
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    fn hold(&mut self, bytes: &[u8]) {
        let room = self.max_line_bytes.saturating_sub(self.carry.len());
        let kept = room.min(bytes.len());
        self.carry.extend_from_slice(&bytes[..kept]);
        self.overflow += (bytes.len() - kept) as u64;
    }

    fn take_line(&mut self, is_last_overall: bool) -> Line {
        let mut raw = std::mem::take(&mut self.carry);
        let overflow = std::mem::take(&mut self.overflow);
        let len = raw.len() as u64 + overflow;
        let oversized = overflow > 0;

        if !oversized && raw.last() == Some(&b'\n') {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }

        let line = Line {
            bytes: raw,
            len,
            number: self.emitted + 1,
            is_first_overall: self.emitted == 0,
            is_last_overall,
            oversized,
        };
        self.emitted += 1;
        line
    }
}
