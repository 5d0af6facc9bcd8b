//! Stream Interpreter.
//!
//! Glues the incremental [`osc`] scanner to the [`capture`] state machine:
//! every chunk handed to [`Interpreter::feed`] is first scanned for
//! tabminal-private and standard OSC bodies, then the surviving cleaned text
//! is routed into the capture buffer (or discarded on a prompt marker, or
//! turned into an `ExecutionRecord` on an exit marker). This is the only
//! entry point `Session` needs: one chunk in, one cleaned-bytes-plus-events
//! result out.

pub mod capture;
pub mod osc;
mod utf8;

use std::time::SystemTime;

pub use capture::ExecutionRecord;

use capture::Capture;
use osc::{OscEvent, Scanner, Segment};
use utf8::Utf8Decoder;

/// Metadata this chunk changed, if any. Only the fields that actually
/// changed are `Some`; `Session` merges these into its own `title`/`cwd`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaDelta {
    pub title: Option<String>,
    pub cwd: Option<String>,
}

impl MetaDelta {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.cwd.is_none()
    }
}

/// Everything produced by feeding one PTY chunk through the interpreter.
#[derive(Debug, Default)]
pub struct InterpreterOutput {
    /// Cleaned text (tabminal-private markers stripped) for history and
    /// client broadcast, already reassembled across chunk boundaries by
    /// `Interpreter`'s `Utf8Decoder` — never the lossy-decoded half of a
    /// multi-byte character. Never non-empty unless the chunk contributed
    /// at least one complete decoded character.
    pub cleaned: String,
    /// Title/cwd changes observed in this chunk, if any.
    pub meta: Option<MetaDelta>,
    /// One entry per exit marker seen in this chunk, in emission order. A
    /// single PTY read can in principle carry more than one completed
    /// command (e.g. a fast `a; b` sequence flushed in one chunk); spec.md
    /// §8's "every exit marker yields exactly one ExecutionRecord" must hold
    /// even then, so this is a `Vec`, not an `Option` that would silently
    /// drop all but the last.
    pub executions: Vec<ExecutionRecord>,
}

/// Per-session stateful transducer: raw PTY bytes in, cleaned bytes plus
/// metadata/execution events out. Owns the OSC scanner, the capture buffer,
/// the last-observed title/cwd used to detect changes, and a `Utf8Decoder`
/// that carries an incomplete trailing multi-byte sequence across `feed`
/// calls — a PTY read chunk can split a character (an emoji, a CJK glyph,
/// the `❯` prompt glyph) right at its boundary, and `osc::Scanner` stays
/// byte-level, so this is the one place raw bytes become `String`.
pub struct Interpreter {
    scanner: Scanner,
    capture: Capture,
    decoder: Utf8Decoder,
    last_title: Option<String>,
    last_cwd: Option<String>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self {
            scanner: Scanner::new(),
            capture: Capture::new(),
            decoder: Utf8Decoder::new(),
            last_title: None,
            last_cwd: None,
        }
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of raw PTY output, returning the cleaned bytes plus
    /// any metadata change or completed execution record. `now` is injected
    /// by the caller (`Session`) so tests can control timestamps.
    pub fn feed(&mut self, chunk: &[u8], now: SystemTime) -> InterpreterOutput {
        let mut cleaned = String::with_capacity(chunk.len());
        let mut meta = MetaDelta::default();
        let mut executions = Vec::new();

        // Segments preserve the original interleaving of text and markers,
        // so a marker in the middle of a chunk only discards/captures the
        // text that actually preceded it, not the whole chunk. Each text
        // segment is run through the persistent `Utf8Decoder` so a
        // multi-byte character split across two `feed` calls (i.e. two PTY
        // reads) is reassembled instead of replaced with U+FFFD twice.
        for seg in self.scanner.feed_segments(chunk) {
            match seg {
                Segment::Text(bytes) => {
                    let text = self.decoder.decode(&bytes);
                    if !text.is_empty() {
                        cleaned.push_str(&text);
                        self.capture.append(&text, now);
                    }
                }
                Segment::Event(OscEvent::Prompt) => {
                    self.capture.on_prompt();
                }
                Segment::Event(OscEvent::Exit { exit_code, command_b64 }) => {
                    executions.push(self.capture.on_exit(exit_code, &command_b64, now));
                }
                Segment::Event(OscEvent::Title(title)) => {
                    if self.last_title.as_deref() != Some(title.as_str()) {
                        self.last_title = Some(title.clone());
                        meta.title = Some(title);
                    }
                }
                Segment::Event(OscEvent::Cwd(cwd)) => {
                    if self.last_cwd.as_deref() != Some(cwd.as_str()) {
                        self.last_cwd = Some(cwd.clone());
                        meta.cwd = Some(cwd);
                    }
                }
            }
        }

        InterpreterOutput {
            cleaned,
            meta: if meta.is_empty() { None } else { Some(meta) },
            executions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn basic_capture_end_to_end() {
        let mut interp = Interpreter::new();
        let now = SystemTime::now();

        let out = interp.feed(format!("prompt$ {}", crate::markers::prompt_marker()).as_bytes(), now);
        assert!(out.executions.is_empty());

        let out = interp.feed(b"ls\nfile.txt\n", now);
        assert!(out.executions.is_empty());
        assert_eq!(out.cleaned, "ls\nfile.txt\n");

        let out = interp.feed(crate::markers::exit_marker(0, &b64("ls")).as_bytes(), now);
        assert_eq!(out.executions.len(), 1);
        let rec = &out.executions[0];
        assert_eq!(rec.command.as_deref(), Some("ls"));
        assert_eq!(rec.output, "file.txt");
    }

    #[test]
    fn title_change_surfaces_once() {
        let mut interp = Interpreter::new();
        let now = SystemTime::now();

        let out = interp.feed(b"\x1b]0;first\x07", now);
        assert_eq!(out.meta.unwrap().title.as_deref(), Some("first"));

        // Same title again: no change, no meta event.
        let out = interp.feed(b"\x1b]0;first\x07", now);
        assert!(out.meta.is_none());

        let out = interp.feed(b"\x1b]0;second\x07", now);
        assert_eq!(out.meta.unwrap().title.as_deref(), Some("second"));
    }

    #[test]
    fn cwd_change_surfaces() {
        let mut interp = Interpreter::new();
        let now = SystemTime::now();
        let out = interp.feed(b"\x1b]7;file://host/home/a\x07", now);
        assert_eq!(out.meta.unwrap().cwd.as_deref(), Some("/home/a"));
    }

    #[test]
    fn markers_interleaved_with_text_in_one_chunk_preserve_ordering() {
        // Prompt marker, command echo+output, and exit marker all delivered
        // as a single PTY read — the prompt marker must only discard the
        // prompt decoration that precedes it, not the command output that
        // follows within the same chunk.
        let mut interp = Interpreter::new();
        let now = SystemTime::now();
        let chunk = format!(
            "junk{}ls\nfile.txt\n{}",
            crate::markers::prompt_marker(),
            crate::markers::exit_marker(0, &b64("ls"))
        );
        let out = interp.feed(chunk.as_bytes(), now);
        assert_eq!(out.executions.len(), 1);
        let rec = &out.executions[0];
        assert_eq!(rec.command.as_deref(), Some("ls"));
        assert_eq!(rec.output, "file.txt");
    }

    #[test]
    fn two_exit_markers_in_one_chunk_each_yield_a_record() {
        // A fast `a; b` sequence (or a chunk that happens to land on a prompt
        // boundary) can deliver two complete command cycles in a single PTY
        // read. spec.md §8: "every exit marker yields exactly one
        // ExecutionRecord" — neither may be dropped in favor of the other.
        let mut interp = Interpreter::new();
        let now = SystemTime::now();
        let chunk = format!(
            "a\nout-a\n{}pb$ {}b\nout-b\n{}",
            crate::markers::exit_marker(0, &b64("a")),
            crate::markers::prompt_marker(),
            crate::markers::exit_marker(1, &b64("b")),
        );
        let out = interp.feed(chunk.as_bytes(), now);
        assert_eq!(out.executions.len(), 2);
        assert_eq!(out.executions[0].command.as_deref(), Some("a"));
        assert_eq!(out.executions[0].output, "out-a");
        assert_eq!(out.executions[1].command.as_deref(), Some("b"));
        assert_eq!(out.executions[1].exit_code, Some(1));
        assert_eq!(out.executions[1].output, "out-b");
    }

    #[test]
    fn private_markers_never_leak_into_cleaned_stream() {
        let mut interp = Interpreter::new();
        let now = SystemTime::now();
        let out = interp.feed(crate::markers::prompt_marker().as_bytes(), now);
        assert!(out.cleaned.is_empty());
    }

    #[test]
    fn multi_byte_char_split_across_feed_calls_reassembles() {
        // A 4096-byte PTY read can end mid-character; the two halves arrive
        // in separate `feed` calls and must still decode to one glyph, not
        // two replacement characters.
        let mut interp = Interpreter::new();
        let now = SystemTime::now();
        let prompt = "❯ ".as_bytes(); // 3-byte char + ASCII space

        let out = interp.feed(&prompt[..2], now);
        assert!(out.cleaned.is_empty());

        let out = interp.feed(&prompt[2..], now);
        assert_eq!(out.cleaned, "❯ ");
    }
}
