//! Incremental OSC scanner.
//!
//! Locates `ESC ']' <body> (BEL | ESC '\\')` sequences in a byte stream that
//! may be delivered in arbitrarily small chunks, without regexing each
//! chunk and without re-scanning from the start of a chunk that continues a
//! sequence begun in a previous one. State persists across `feed()` calls
//! so a marker split across a chunk boundary is recognized exactly once.
//!
//! Classification of a completed OSC body happens once, in `dispatch`:
//! tabminal-private bodies (`TabminalPrompt`, `ExitCode=...;CommandB64=...`)
//! are stripped from the cleaned stream and surfaced as `OscEvent`s; every
//! other OSC body (including *other* `1337;...` bodies) is pushed back into
//! the cleaned stream verbatim, with `0;`/`2;`/`7;` bodies additionally
//! surfaced as title/cwd events.

use crate::markers;

/// A tabminal-private marker, or a standard OSC body worth surfacing as
/// metadata. Emitted alongside the cleaned byte stream from `Scanner::feed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscEvent {
    /// `TabminalPrompt` — end of a rendered prompt.
    Prompt,
    /// `ExitCode=<digits>;CommandB64=<base64>` — a command just completed.
    /// `exit_code` is `None` if the digits failed to parse.
    Exit {
        exit_code: Option<i32>,
        command_b64: String,
    },
    /// `0;<t>` or `2;<t>` — window/tab title.
    Title(String),
    /// `7;<url>` — current working directory, already extracted from the
    /// `file://host/path` form.
    Cwd(String),
}

#[derive(Debug)]
enum State {
    Text,
    /// Saw a lone ESC; next byte decides whether this is an OSC intro.
    Esc,
    /// Inside an OSC body. `raw` holds everything from the initial ESC
    /// onward (for verbatim passthrough); `body` holds just the bytes
    /// between `]` and the terminator (for classification).
    Osc { raw: Vec<u8>, body: Vec<u8> },
    /// Saw ESC while inside an OSC body; next byte decides whether this is
    /// a String Terminator (`ESC \`) or just a literal ESC in the body.
    OscEsc { raw: Vec<u8>, body: Vec<u8> },
}

/// Incremental scanner, one instance per session.
pub struct Scanner {
    state: State,
}

impl Default for Scanner {
    fn default() -> Self {
        Self { state: State::Text }
    }
}

/// One piece of a chunk's left-to-right decomposition: either surviving
/// cleaned bytes or a recognized OSC event, in the order they occurred.
/// Preserving this interleaving (rather than just aggregating cleaned bytes
/// and events separately) matters when a chunk contains marker *and* text
/// content together — the capture state machine needs to know which bytes
/// came before a prompt/exit marker and which came after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(Vec<u8>),
    Event(OscEvent),
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of raw PTY output. Returns the cleaned bytes (input
    /// minus stripped tabminal-private markers) and any OSC events found,
    /// in the order their sequences completed. Convenience wrapper over
    /// [`Scanner::feed_segments`] for callers that don't need interleaving.
    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<u8>, Vec<OscEvent>) {
        let mut cleaned = Vec::with_capacity(chunk.len());
        let mut events = Vec::new();
        for seg in self.feed_segments(chunk) {
            match seg {
                Segment::Text(bytes) => cleaned.extend_from_slice(&bytes),
                Segment::Event(ev) => events.push(ev),
            }
        }
        (cleaned, events)
    }

    /// Feeds one chunk, returning ordered segments of cleaned text and OSC
    /// events. A marker split across chunk boundaries is completed (and
    /// its event emitted) on the chunk that supplies its terminator; state
    /// persists across calls so it is recognized exactly once.
    pub fn feed_segments(&mut self, chunk: &[u8]) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut text_run: Vec<u8> = Vec::new();

        let mut i = 0;
        while i < chunk.len() {
            let b = chunk[i];
            let mut advance = true;
            self.state = match std::mem::replace(&mut self.state, State::Text) {
                State::Text => {
                    if b == 0x1B {
                        State::Esc
                    } else {
                        text_run.push(b);
                        State::Text
                    }
                }
                State::Esc => {
                    if b == b']' {
                        State::Osc {
                            raw: vec![0x1B, b']'],
                            body: Vec::new(),
                        }
                    } else {
                        text_run.push(0x1B);
                        text_run.push(b);
                        State::Text
                    }
                }
                State::Osc { mut raw, mut body } => {
                    if b == markers::BEL {
                        raw.push(b);
                        self.dispatch(raw, body, &mut text_run, &mut segments);
                        State::Text
                    } else if b == 0x1B {
                        raw.push(b);
                        State::OscEsc { raw, body }
                    } else {
                        raw.push(b);
                        body.push(b);
                        State::Osc { raw, body }
                    }
                }
                State::OscEsc { mut raw, body } => {
                    if b == b'\\' {
                        raw.push(b);
                        self.dispatch(raw, body, &mut text_run, &mut segments);
                        State::Text
                    } else {
                        // Not a String Terminator: the ESC we buffered was
                        // literal OSC body content. Re-process `b` as if we
                        // were still inside the OSC body.
                        let mut body = body;
                        body.push(0x1B);
                        advance = false;
                        State::Osc { raw, body }
                    }
                }
            };
            if advance {
                i += 1;
            }
        }

        if !text_run.is_empty() {
            segments.push(Segment::Text(text_run));
        }

        segments
    }

    /// Classifies a completed OSC body. Tabminal-private bodies are
    /// stripped (an event is pushed, nothing added to `text_run`); standard
    /// bodies are surfaced as events *and* passed through verbatim; any
    /// other body is passed through verbatim with no event. Text
    /// accumulated so far in `text_run` is flushed as a `Segment::Text`
    /// before any event, to preserve ordering.
    fn dispatch(
        &self,
        raw: Vec<u8>,
        body: Vec<u8>,
        text_run: &mut Vec<u8>,
        segments: &mut Vec<Segment>,
    ) {
        let body_str = String::from_utf8_lossy(&body);

        let flush_text = |text_run: &mut Vec<u8>, segments: &mut Vec<Segment>| {
            if !text_run.is_empty() {
                segments.push(Segment::Text(std::mem::take(text_run)));
            }
        };

        if let Some(rest) = body_str.strip_prefix("1337;") {
            if rest == markers::PROMPT_BODY {
                flush_text(text_run, segments);
                segments.push(Segment::Event(OscEvent::Prompt));
                return; // stripped, not pushed to cleaned
            }
            if let Some(exit_rest) = rest.strip_prefix(markers::EXIT_PREFIX) {
                if let Some((digits, b64)) = exit_rest.split_once(markers::COMMAND_B64_MARKER) {
                    let exit_code = digits.parse::<i32>().ok();
                    flush_text(text_run, segments);
                    segments.push(Segment::Event(OscEvent::Exit {
                        exit_code,
                        command_b64: b64.to_string(),
                    }));
                    return; // stripped, not pushed to cleaned
                }
            }
            // Any other 1337;... body: non-private, pass through unchanged.
            text_run.extend_from_slice(&raw);
            return;
        }

        if let Some(t) = body_str.strip_prefix("0;").or_else(|| body_str.strip_prefix("2;")) {
            flush_text(text_run, segments);
            segments.push(Segment::Event(OscEvent::Title(t.to_string())));
            text_run.extend_from_slice(&raw);
            return;
        } else if let Some(url) = body_str.strip_prefix("7;") {
            if let Some(path) = parse_file_url(url) {
                flush_text(text_run, segments);
                segments.push(Segment::Event(OscEvent::Cwd(path)));
                text_run.extend_from_slice(&raw);
                return;
            }
        }

        text_run.extend_from_slice(&raw);
    }
}

/// Extracts the filesystem path from a `file://host/path` URL, percent-
/// decoding it. Returns `None` if the URL doesn't look like `file://`.
fn parse_file_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("file://")?;
    let path_start = rest.find('/')?;
    let path = &rest[path_start..];
    Some(percent_decode(path))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let mut s = Scanner::new();
        let (cleaned, events) = s.feed(b"hello world\r\n");
        assert_eq!(cleaned, b"hello world\r\n");
        assert!(events.is_empty());
    }

    #[test]
    fn prompt_marker_is_stripped_and_recognized() {
        let mut s = Scanner::new();
        let input = format!("prompt$ {}", markers::prompt_marker());
        let (cleaned, events) = s.feed(input.as_bytes());
        assert_eq!(cleaned, b"prompt$ ");
        assert_eq!(events, vec![OscEvent::Prompt]);
    }

    #[test]
    fn exit_marker_is_stripped_and_decoded() {
        let mut s = Scanner::new();
        let input = markers::exit_marker(0, "bHM="); // "ls"
        let (cleaned, events) = s.feed(input.as_bytes());
        assert!(cleaned.is_empty());
        assert_eq!(
            events,
            vec![OscEvent::Exit {
                exit_code: Some(0),
                command_b64: "bHM=".to_string()
            }]
        );
    }

    #[test]
    fn marker_split_across_chunks_recognized_once() {
        let mut s = Scanner::new();
        let full = markers::prompt_marker();
        let mid = full.len() / 2;
        let (c1, e1) = s.feed(full[..mid].as_bytes());
        let (c2, e2) = s.feed(full[mid..].as_bytes());
        assert!(c1.is_empty() && c2.is_empty());
        assert!(e1.is_empty());
        assert_eq!(e2, vec![OscEvent::Prompt]);
    }

    #[test]
    fn non_private_1337_body_passes_through() {
        let mut s = Scanner::new();
        let input = "\x1b]1337;File=name=x.png\x07";
        let (cleaned, events) = s.feed(input.as_bytes());
        assert_eq!(cleaned, input.as_bytes());
        assert!(events.is_empty());
    }

    #[test]
    fn title_osc_passes_through_and_emits_event() {
        let mut s = Scanner::new();
        let input = "\x1b]0;my title\x07";
        let (cleaned, events) = s.feed(input.as_bytes());
        assert_eq!(cleaned, input.as_bytes());
        assert_eq!(events, vec![OscEvent::Title("my title".to_string())]);
    }

    #[test]
    fn cwd_osc_parses_file_url() {
        let mut s = Scanner::new();
        let input = "\x1b]7;file://host/home/user/proj\x07";
        let (cleaned, events) = s.feed(input.as_bytes());
        assert_eq!(cleaned, input.as_bytes());
        assert_eq!(events, vec![OscEvent::Cwd("/home/user/proj".to_string())]);
    }

    #[test]
    fn st_terminated_osc_is_recognized() {
        let mut s = Scanner::new();
        let input = "\x1b]0;t\x1b\\";
        let (cleaned, events) = s.feed(input.as_bytes());
        assert_eq!(cleaned, input.as_bytes());
        assert_eq!(events, vec![OscEvent::Title("t".to_string())]);
    }

    #[test]
    fn lone_esc_not_starting_osc_passes_through() {
        let mut s = Scanner::new();
        let input = b"a\x1b[31mb"; // CSI color sequence, not OSC
        let (cleaned, events) = s.feed(input);
        assert_eq!(cleaned, input);
        assert!(events.is_empty());
    }

    #[test]
    fn segments_preserve_interleaving_order() {
        let mut s = Scanner::new();
        let input = format!("before{}after", markers::prompt_marker());
        let segs = s.feed_segments(input.as_bytes());
        assert_eq!(
            segs,
            vec![
                Segment::Text(b"before".to_vec()),
                Segment::Event(OscEvent::Prompt),
                Segment::Text(b"after".to_vec()),
            ]
        );
    }
}
