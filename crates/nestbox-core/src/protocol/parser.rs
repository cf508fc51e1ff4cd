//! Streaming extractor for delimited output blocks.
//!
//! Bytes may arrive in arbitrary chunks. The parser keeps only the partial
//! match progress against the two markers plus the text of the block being
//! collected, and emits a block the moment its end marker is complete.
//! Anything outside a block is diagnostic noise and is dropped.

use tracing::warn;

use super::types::{OUTPUT_END_MARKER, OUTPUT_START_MARKER};

/// Incremental substring matcher (Knuth-Morris-Pratt).
#[derive(Debug, Clone)]
struct Matcher {
    pattern: &'static [u8],
    failure: Vec<usize>,
    matched: usize,
}

impl Matcher {
    fn new(pattern: &'static str) -> Self {
        let pattern = pattern.as_bytes();
        let mut failure = vec![0; pattern.len()];
        let mut k = 0;
        for i in 1..pattern.len() {
            while k > 0 && pattern[i] != pattern[k] {
                k = failure[k - 1];
            }
            if pattern[i] == pattern[k] {
                k += 1;
            }
            failure[i] = k;
        }
        Self {
            pattern,
            failure,
            matched: 0,
        }
    }

    /// Feed one byte; returns `true` when the whole pattern has just matched.
    fn advance(&mut self, byte: u8) -> bool {
        while self.matched > 0 && self.pattern[self.matched] != byte {
            self.matched = self.failure[self.matched - 1];
        }
        if self.pattern[self.matched] == byte {
            self.matched += 1;
        }
        if self.matched == self.pattern.len() {
            self.matched = 0;
            return true;
        }
        false
    }

    const fn reset(&mut self) {
        self.matched = 0;
    }

    const fn len(&self) -> usize {
        self.pattern.len()
    }
}

/// Streaming parser for the agent's stdout.
#[derive(Debug, Clone)]
pub struct OutputParser {
    start: Matcher,
    end: Matcher,
    /// Bytes of the block currently open, if any.
    block: Option<Vec<u8>>,
    emitted: u64,
    discarded: u64,
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            start: Matcher::new(OUTPUT_START_MARKER),
            end: Matcher::new(OUTPUT_END_MARKER),
            block: None,
            emitted: 0,
            discarded: 0,
        }
    }

    /// Feed a chunk and collect every block it completes, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut blocks = Vec::new();
        self.feed_with(bytes, |block| blocks.push(block));
        blocks
    }

    /// Feed a chunk, invoking `on_block` as soon as each block completes.
    pub fn feed_with(&mut self, bytes: &[u8], mut on_block: impl FnMut(String)) {
        for &byte in bytes {
            match self.block.as_mut() {
                None => {
                    if self.start.advance(byte) {
                        self.block = Some(Vec::new());
                        self.end.reset();
                    }
                }
                Some(buf) => {
                    buf.push(byte);
                    if self.end.advance(byte) {
                        let keep = buf.len() - self.end.len();
                        buf.truncate(keep);
                        let text = decode(buf);
                        self.block = None;
                        self.start.reset();
                        self.emitted += 1;
                        on_block(text);
                    } else if self.start.advance(byte) {
                        // A new block opened before the previous one closed.
                        self.discarded += 1;
                        warn!(
                            discarded_bytes = buf.len().saturating_sub(self.start.len()),
                            "Unterminated output block superseded by a new start marker"
                        );
                        buf.clear();
                        self.end.reset();
                    }
                }
            }
        }
    }

    /// Whether a block is currently open.
    pub const fn in_block(&self) -> bool {
        self.block.is_some()
    }

    /// Number of blocks emitted so far.
    pub const fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Number of unterminated blocks dropped because a new one started.
    pub const fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Finish the stream, returning the text of a block left unterminated.
    ///
    /// The partial text is never a deliverable block; callers only log it.
    pub fn finish(self) -> Option<String> {
        self.block.map(|buf| decode(&buf))
    }
}

fn decode(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).trim().to_string()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stream(parts: &[&str]) -> String {
        parts.concat()
    }

    fn feed_bytewise(input: &str) -> Vec<String> {
        let mut parser = OutputParser::new();
        let mut out = Vec::new();
        for byte in input.as_bytes() {
            out.extend(parser.feed(std::slice::from_ref(byte)));
        }
        out
    }

    #[test]
    fn extracts_blocks_and_ignores_noise() {
        let input = stream(&[
            "noise\n",
            OUTPUT_START_MARKER,
            "\nA\n",
            OUTPUT_END_MARKER,
            "\nnoise\n",
            OUTPUT_START_MARKER,
            "\nB\n",
            OUTPUT_END_MARKER,
        ]);
        let mut parser = OutputParser::new();
        assert_eq!(parser.feed(input.as_bytes()), vec!["A", "B"]);
        assert_eq!(parser.emitted(), 2);
    }

    #[test]
    fn emits_without_waiting_for_end_of_stream() {
        let mut parser = OutputParser::new();
        let head = format!("{OUTPUT_START_MARKER}\nhello\n");
        assert!(parser.feed(head.as_bytes()).is_empty());
        assert!(parser.in_block());
        assert_eq!(parser.feed(OUTPUT_END_MARKER.as_bytes()), vec!["hello"]);
        assert!(!parser.in_block());
    }

    #[test]
    fn zero_blocks_is_fine() {
        let mut parser = OutputParser::new();
        assert!(parser.feed(b"just some logging\nand more\n").is_empty());
        assert!(parser.finish().is_none());
    }

    #[test]
    fn markers_split_across_single_bytes() {
        let input = stream(&[
            "x",
            OUTPUT_START_MARKER,
            "\nfirst\n",
            OUTPUT_END_MARKER,
            OUTPUT_START_MARKER,
            "second",
            OUTPUT_END_MARKER,
            "tail",
        ]);
        assert_eq!(feed_bytewise(&input), vec!["first", "second"]);
    }

    #[test]
    fn extra_leading_dashes_still_match() {
        let input = format!("-{OUTPUT_START_MARKER}\nbody\n-{OUTPUT_END_MARKER}");
        assert_eq!(feed_bytewise(&input), vec!["body\n-"]);
    }

    #[test]
    fn partial_end_marker_inside_block_is_content() {
        let input = format!("{OUTPUT_START_MARKER}\nuses ---NESTBOX inline\n{OUTPUT_END_MARKER}");
        let mut parser = OutputParser::new();
        assert_eq!(
            parser.feed(input.as_bytes()),
            vec!["uses ---NESTBOX inline"]
        );
    }

    #[test]
    fn nested_start_discards_unterminated_block() {
        let input = stream(&[
            OUTPUT_START_MARKER,
            "\nlost\n",
            OUTPUT_START_MARKER,
            "\nkept\n",
            OUTPUT_END_MARKER,
        ]);
        let mut parser = OutputParser::new();
        assert_eq!(parser.feed(input.as_bytes()), vec!["kept"]);
        assert_eq!(parser.discarded(), 1);
    }

    #[test]
    fn finish_reports_unterminated_block() {
        let mut parser = OutputParser::new();
        let input = format!("{OUTPUT_START_MARKER}\npartial reply");
        assert!(parser.feed(input.as_bytes()).is_empty());
        assert_eq!(parser.finish().as_deref(), Some("partial reply"));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut input = OUTPUT_START_MARKER.as_bytes().to_vec();
        input.extend_from_slice(b"\nok \xff\n");
        input.extend_from_slice(OUTPUT_END_MARKER.as_bytes());
        let mut parser = OutputParser::new();
        assert_eq!(parser.feed(&input), vec!["ok \u{fffd}"]);
    }
}
