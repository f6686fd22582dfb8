//! Reassembly of gdb's output stream.
//!
//! The transport delivers raw bytes at arbitrary boundaries, so a tagged
//! block or a diagnostic line can arrive split across any number of
//! deliveries. The framer buffers the unconsumed suffix between feeds and
//! only ever hands out complete chunks: either a tagged block, or one
//! reassembled untagged line. Feeding the same stream in any fragmentation
//! must produce the same chunk sequence.

use crate::command::{ResponseTag, BLOCK_START};
use crate::{GdbError, Result};

/// gdb prints this mid-stream without a terminating newline; a "Stopped
/// due to" line can run straight into it. It has to be recognised and
/// consumed as a unit.
const NO_SYMBOLS: &[u8] = b"(no debugging symbols found)...";

/// A fully reassembled piece of debugger output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// The payload of a tagged block, ready for the handler keyed by `tag`.
    Block { tag: ResponseTag, body: String },
    /// One untagged diagnostic line, continuation lines already joined.
    Line(String),
}

enum Scan {
    /// Bytes up to the new position are consumed; possibly with a chunk.
    Consumed(usize, Option<OutputChunk>),
    /// Nothing more can be parsed until the next delivery.
    Incomplete,
}

/// Buffering reassembler for the raw output of one gdb process.
#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    max_buffer: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new()
    }
}

impl Framer {
    /// Default cap on the retained buffer. A block that never finds its
    /// terminator within this many bytes means the protocol is
    /// desynchronized and the session cannot be trusted any further.
    pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

    pub fn new() -> Self {
        Framer {
            buf: Vec::new(),
            max_buffer: Self::DEFAULT_MAX_BUFFER,
        }
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Framer {
            buf: Vec::new(),
            max_buffer,
        }
    }

    /// Bytes retained from previous deliveries, awaiting completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append a raw delivery and return every chunk that is now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<OutputChunk>> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.max_buffer {
            return Err(GdbError::Desynchronized(format!(
                "output buffer exceeded {} bytes without a complete chunk",
                self.max_buffer
            )));
        }

        let mut chunks = Vec::new();
        let mut pos = 0;
        while pos < self.buf.len() {
            match self.scan(pos) {
                Scan::Consumed(next, chunk) => {
                    if let Some(chunk) = chunk {
                        chunks.push(chunk);
                    }
                    pos = next;
                }
                Scan::Incomplete => break,
            }
        }

        self.buf.drain(..pos);
        Ok(chunks)
    }

    fn scan(&mut self, pos: usize) -> Scan {
        if self.buf[pos] == BLOCK_START {
            self.scan_block(pos)
        } else {
            self.scan_line(pos)
        }
    }

    /// A tagged block: marker byte, tag byte, then tag-dependent framing.
    fn scan_block(&mut self, pos: usize) -> Scan {
        let Some(&tag_byte) = self.buf.get(pos + 1) else {
            return Scan::Incomplete;
        };

        let Some(tag) = ResponseTag::from_byte(tag_byte) else {
            // Prompt junk with a tag we never assigned. Scrub the pair.
            log::warn!("dropping unknown output tag byte 0x{tag_byte:02x}");
            return Scan::Consumed(pos + 2, None);
        };

        match tag {
            // The idle tag never has a body or a closing marker.
            ResponseTag::Idle => Scan::Consumed(pos + 2, None),

            // Source positions end at the newline; gdb does not echo the
            // tag pair again for these.
            ResponseTag::SourcePosition => {
                let body_start = pos + 2;
                match find(&self.buf, body_start, b"\n") {
                    Some(nl) => {
                        let body = lossy(&self.buf[body_start..nl]);
                        Scan::Consumed(nl + 1, Some(OutputChunk::Block { tag, body }))
                    }
                    None => Scan::Incomplete,
                }
            }

            // Everything else is terminated by a repeated marker+tag pair.
            _ => {
                let body_start = pos + 2;
                let terminator = [BLOCK_START, tag_byte];
                match find(&self.buf, body_start, &terminator) {
                    Some(end) => {
                        let body = lossy(&self.buf[body_start..end]);
                        Scan::Consumed(end + 2, Some(OutputChunk::Block { tag, body }))
                    }
                    None => Scan::Incomplete,
                }
            }
        }
    }

    /// Untagged text: wait for a line terminator, joining wrapped lines.
    fn scan_line(&mut self, pos: usize) -> Scan {
        let mut i = pos;
        while i < self.buf.len() {
            let byte = self.buf[i];

            if byte == b'(' && self.buf[i..].starts_with(NO_SYMBOLS) {
                // Consumed without dispatch; it carries no state change.
                return Scan::Consumed(i + NO_SYMBOLS.len(), None);
            }

            if byte == b'\n' {
                let comma_wrap =
                    i >= pos + 2 && self.buf[i - 1] == b' ' && self.buf[i - 2] == b',';
                let colon_wrap = i > pos && self.buf[i - 1] == b':';
                if comma_wrap || colon_wrap {
                    // gdb wrapped a logically single line; join and keep
                    // looking for the real terminator.
                    self.buf[i] = b' ';
                } else {
                    let line = lossy(&self.buf[pos..i]);
                    let chunk = if line.is_empty() {
                        None
                    } else {
                        Some(OutputChunk::Line(line))
                    };
                    return Scan::Consumed(i + 1, chunk);
                }
            }

            if byte == BLOCK_START {
                // Partial text running into a block marker is prompt junk.
                return Scan::Consumed(i, None);
            }

            i += 1;
        }

        Scan::Incomplete
    }
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..].starts_with(needle))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> OutputChunk {
        OutputChunk::Line(s.to_string())
    }

    fn block(tag: ResponseTag, body: &str) -> OutputChunk {
        OutputChunk::Block {
            tag,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_plain_line() {
        let mut framer = Framer::new();
        let chunks = framer.feed(b"Program exited normally\n").unwrap();
        assert_eq!(chunks, vec![line("Program exited normally")]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_partial_line_is_retained() {
        let mut framer = Framer::new();
        assert!(framer.feed(b"Program exi").unwrap().is_empty());
        let chunks = framer.feed(b"ted normally\n").unwrap();
        assert_eq!(chunks, vec![line("Program exited normally")]);
    }

    #[test]
    fn test_tagged_block() {
        let mut framer = Framer::new();
        let chunks = framer.feed(b"\x1at#0 main () at foo.c:3\n\x1at").unwrap();
        assert_eq!(
            chunks,
            vec![block(ResponseTag::Backtrace, "#0 main () at foo.c:3\n")]
        );
    }

    #[test]
    fn test_block_terminator_split_across_deliveries() {
        let mut framer = Framer::new();
        assert!(framer.feed(b"\x1aBNum Type\n1 breakpoint\n\x1a").unwrap().is_empty());
        let chunks = framer.feed(b"B").unwrap();
        assert_eq!(
            chunks,
            vec![block(ResponseTag::BreakpointList, "Num Type\n1 breakpoint\n")]
        );
    }

    #[test]
    fn test_idle_tag_is_consumed_alone() {
        let mut framer = Framer::new();
        let chunks = framer.feed(b"\x1aiBreakpoint 1, main ()\n").unwrap();
        assert_eq!(chunks, vec![line("Breakpoint 1, main ()")]);
    }

    #[test]
    fn test_source_position_ends_at_newline() {
        let mut framer = Framer::new();
        let chunks = framer
            .feed(b"\x1a\x1a/src/foo.cpp:42:7:beg:0x1000\n")
            .unwrap();
        assert_eq!(
            chunks,
            vec![block(ResponseTag::SourcePosition, "/src/foo.cpp:42:7:beg:0x1000")]
        );
    }

    #[test]
    fn test_continuation_lines_are_joined() {
        let mut framer = Framer::new();
        let chunks = framer
            .feed(b"Breakpoint 3, \nmain () at foo.c:7\n")
            .unwrap();
        assert_eq!(chunks, vec![line("Breakpoint 3,  main () at foo.c:7")]);

        let chunks = framer
            .feed(b"Temporarily disabling shared library breakpoints:\n2\n")
            .unwrap();
        assert_eq!(
            chunks,
            vec![line("Temporarily disabling shared library breakpoints: 2")]
        );
    }

    #[test]
    fn test_no_symbols_diagnostic_without_newline() {
        let mut framer = Framer::new();
        let chunks = framer
            .feed(b"(no debugging symbols found)...Program exited\n")
            .unwrap();
        assert_eq!(chunks, vec![line("Program exited")]);
    }

    #[test]
    fn test_text_running_into_marker_is_dropped() {
        let mut framer = Framer::new();
        let chunks = framer.feed(b"junk\x1ai\x1at#0 main\n\x1at").unwrap();
        assert_eq!(chunks, vec![block(ResponseTag::Backtrace, "#0 main\n")]);
    }

    #[test]
    fn test_buffer_overflow_is_desynchronization() {
        let mut framer = Framer::with_max_buffer(16);
        let err = framer.feed(b"\x1atnever terminated block").unwrap_err();
        assert!(matches!(err, GdbError::Desynchronized(_)));
    }

    #[test]
    fn test_fragmentation_invariance() {
        let stream: &[u8] = b"\x1ai\x1a\x1a/src/a.c:1:0:beg:0x1000\nBreakpoint 1, \nmain () at a.c:1\n\x1at#0 main () at a.c:1\n\x1at\x1aiProgram exited normally\n";

        let mut whole = Framer::new();
        let expected = whole.feed(stream).unwrap();
        assert!(!expected.is_empty());

        for split in 0..=stream.len() {
            let mut framer = Framer::new();
            let mut got = framer.feed(&stream[..split]).unwrap();
            got.extend(framer.feed(&stream[split..]).unwrap());
            assert_eq!(got, expected, "split at byte {split}");
            assert_eq!(framer.pending(), 0, "split at byte {split}");
        }
    }
}
