//! Capture state machine and echo isolation.
//!
//! Operates on the *cleaned* text already produced by `osc::Scanner` (marker
//! bytes stripped) and already reassembled into valid `String` text by
//! `Interpreter`'s `Utf8Decoder` — a multi-byte character split across a PTY
//! read's chunk boundary is never handed to this module half-decoded, so
//! `append`'s caller always passes whole, valid text.

use std::time::SystemTime;

use base64::Engine;
use serde::Serialize;

/// A single completed shell command, reconstructed from an exit marker plus
/// the bytes captured since the prior prompt/exit marker.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub input: String,
    pub output: String,
    #[serde(skip)]
    pub started_at: SystemTime,
    #[serde(skip)]
    pub completed_at: SystemTime,
}

/// Per-session capture buffer, driven by `osc::OscEvent`s.
#[derive(Default)]
pub struct Capture {
    buffer: String,
    started_at: Option<SystemTime>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of cleaned text. Sets `started_at` on the first
    /// append since the last reset.
    pub fn append(&mut self, text: &str, now: SystemTime) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.buffer.push_str(text);
    }

    /// Prompt marker: prompt decoration is never part of a command, so the
    /// buffer is discarded wholesale.
    pub fn on_prompt(&mut self) {
        self.buffer.clear();
        self.started_at = None;
    }

    /// Exit marker: builds and returns the completed record, then resets.
    pub fn on_exit(
        &mut self,
        exit_code: Option<i32>,
        command_b64: &str,
        now: SystemTime,
    ) -> ExecutionRecord {
        let command = base64::engine::general_purpose::STANDARD
            .decode(command_b64)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let (input, output) = isolate_echo(&self.buffer, command.as_deref());

        let record = ExecutionRecord {
            command,
            exit_code,
            input,
            output,
            started_at: self.started_at.unwrap_or(now),
            completed_at: now,
        };

        self.buffer.clear();
        self.started_at = None;
        record
    }
}

/// Shell continuation-prompt tokens recognized after ANSI stripping.
const CONTINUATION_TOKENS: &[&str] = &[">", "+", "quote>", "heredoc>", "ps2>", "?"];

/// Characters that may plausibly precede an echoed command on a prompt line.
fn is_prompt_terminator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '$' | '>' | '❯' | ':' | '\u{1b}')
}

/// Splits `text` into physical lines, each paired with its original
/// terminator (`"\r\n"`, `"\n"`, or `""` for a final unterminated line) and
/// its start byte offset within `text`.
fn physical_lines(text: &str) -> Vec<(usize, &str, &str)> {
    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let (content_end, term_start) = if i > start && bytes[i - 1] == b'\r' {
                (i - 1, i - 1)
            } else {
                (i, i)
            };
            lines.push((start, &text[start..content_end], &text[term_start..=i]));
            start = i + 1;
        }
        i += 1;
    }
    if start < bytes.len() {
        lines.push((start, &text[start..], ""));
    }
    lines
}

/// Strips ANSI CSI/OSC/other escape sequences, collapses backspace/DEL,
/// and drops stray CR and other non-tab/LF C0 control chars.
fn normalize_plain(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\u{1b}' {
            i += 1;
            if i < chars.len() && chars[i] == '[' {
                i += 1;
                while i < chars.len() && !(chars[i].is_ascii_alphabetic() || chars[i] == '@') {
                    i += 1;
                }
                if i < chars.len() {
                    i += 1;
                }
            } else if i < chars.len() && chars[i] == ']' {
                i += 1;
                while i < chars.len() && chars[i] != '\u{7}' {
                    i += 1;
                }
                if i < chars.len() {
                    i += 1;
                }
            } else if i < chars.len() {
                i += 1;
            }
            continue;
        }
        if c == '\u{8}' || c == '\u{7f}' {
            out.pop();
            i += 1;
            continue;
        }
        if c == '\r' {
            i += 1;
            continue;
        }
        if (c as u32) < 0x20 && c != '\t' && c != '\n' {
            i += 1;
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

fn strip_leading_continuation(s: &str) -> &str {
    for tok in CONTINUATION_TOKENS {
        if let Some(rest) = s.strip_prefix(tok) {
            return rest.strip_prefix(' ').unwrap_or(rest);
        }
    }
    s
}

fn is_continuation_line(normalized: &str) -> bool {
    normalized.is_empty() || CONTINUATION_TOKENS.iter().any(|t| normalized.starts_with(t))
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strategy 1/2: search for `cmd` immediately followed by a line ending.
/// `require_terminator` gates the "preceded by a plausible prompt
/// terminator" constraint; the caller tries with it first, then without
/// (bounded to small buffers) per spec.md §4.3.
fn find_contiguous_echo(text: &str, cmd: &str, require_terminator: bool) -> Option<usize> {
    if cmd.is_empty() {
        return None;
    }
    let mut last = None;
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find(cmd) {
        let idx = search_from + rel;
        let after = &text[idx + cmd.len()..];
        let followed_by_eol = after.starts_with("\r\n") || after.starts_with('\n') || after.starts_with('\r');
        let preceding_ok = if !require_terminator {
            true
        } else if idx == 0 {
            true
        } else {
            text[..idx].chars().last().map(is_prompt_terminator).unwrap_or(false)
        };
        if followed_by_eol && preceding_ok {
            last = Some(idx);
        }
        search_from = idx + 1;
        if search_from > text.len() {
            break;
        }
    }
    last
}

/// Strategy 3 (fallback): simulated line reconstruction. Walks physical
/// lines, normalizing each (ANSI/backspace/CR) and joining lines that
/// continue a shell line (trailing backslash, or the next line opening with
/// a continuation token), checking after each join whether the
/// accumulated, whitespace-collapsed text matches `cmd`.
fn find_continuation_echo(text: &str, cmd: &str) -> Option<usize> {
    if cmd.is_empty() {
        return None;
    }
    let lines = physical_lines(text);
    let collapsed_cmd = collapse_ws(cmd);

    for start in 0..lines.len() {
        let mut joined = String::new();
        let mut idx = start;
        loop {
            let norm = normalize_plain(lines[idx].1);
            let piece = if idx == start {
                norm.as_str()
            } else {
                strip_leading_continuation(norm.trim_start())
            };
            let had_backslash = piece.trim_end().ends_with('\\');
            let piece = piece.trim_end().strip_suffix('\\').unwrap_or(piece.trim_end());

            if !joined.is_empty() {
                joined.push(' ');
            }
            joined.push_str(piece.trim());

            let collapsed = collapse_ws(&joined);
            if collapsed == collapsed_cmd || collapsed.ends_with(&collapsed_cmd) {
                return Some(lines[start].0);
            }

            let next_is_continuation = lines
                .get(idx + 1)
                .map(|l| is_continuation_line(normalize_plain(l.1).trim_start()))
                .unwrap_or(false);

            if (had_backslash || next_is_continuation) && idx + 1 < lines.len() {
                idx += 1;
            } else {
                break;
            }
        }
    }
    None
}

/// Isolates the shell's echo of `command` from `buffer`, returning
/// `(input, output)` per spec.md §4.3. If `command` is `None` or not found
/// anywhere in `buffer`, the whole buffer is treated as `output` with an
/// empty `input` — a conservative fallback that never discards bytes.
pub fn isolate_echo(buffer: &str, command: Option<&str>) -> (String, String) {
    let cmd = command.unwrap_or("").trim();
    if cmd.is_empty() {
        return (String::new(), sanitize_output(buffer));
    }

    let echo_start = find_contiguous_echo(buffer, cmd, true)
        .or_else(|| {
            if buffer.len() <= 4096 {
                find_contiguous_echo(buffer, cmd, false)
            } else {
                None
            }
        })
        .or_else(|| find_continuation_echo(buffer, cmd))
        .unwrap_or(0);

    let echoed = &buffer[echo_start..];
    let lines = physical_lines(echoed);
    if lines.is_empty() {
        return (String::new(), String::new());
    }

    let mut input = String::new();
    input.push_str(&normalize_plain(lines[0].1));
    input.push_str(lines[0].2);

    let mut consumed = 1;
    for line in &lines[1..] {
        let normalized = normalize_plain(line.1);
        if is_continuation_line(normalized.trim_start()) {
            input.push_str(&normalized);
            input.push_str(line.2);
            consumed += 1;
        } else {
            break;
        }
    }

    let output_start_byte = lines.get(consumed).map(|l| l.0).unwrap_or(echoed.len());
    let output = sanitize_output(&echoed[output_start_byte..]);

    (input, output)
}

/// "Output sanitization for record fields only" (spec.md §4.3): strip
/// escape sequences/control chars, normalize CRLF→LF (a side effect of
/// `normalize_plain` dropping bare CR while keeping LF), strip trailing
/// whitespace. Never applied to the broadcast stream, only to record
/// fields.
fn sanitize_output(s: &str) -> String {
    normalize_plain(s).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1)
    }

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn basic_capture() {
        let mut cap = Capture::new();
        cap.append("ls\nfile.txt\n", now());
        let rec = cap.on_exit(Some(0), &b64("ls"), now());
        assert_eq!(rec.command.as_deref(), Some("ls"));
        assert_eq!(rec.exit_code, Some(0));
        assert_eq!(rec.input, "ls\n");
        assert_eq!(rec.output, "file.txt");
    }

    #[test]
    fn consecutive_commands_each_isolated() {
        let mut cap = Capture::new();
        cap.append("ls\nfile.txt\n", now());
        let first = cap.on_exit(Some(0), &b64("ls"), now());
        assert_eq!(first.output, "file.txt");

        cap.on_prompt();
        cap.append("pwd\n/bar\n", now());
        let second = cap.on_exit(Some(0), &b64("pwd"), now());
        assert_eq!(second.command.as_deref(), Some("pwd"));
        assert_eq!(second.output, "/bar");
    }

    #[test]
    fn fancy_prompt_decoration_dropped_by_prompt_marker() {
        let mut cap = Capture::new();
        cap.append("\r\n\u{23a7} banner\r\n\u{23a8} /vols\r\n\u{23a9} \x1b[33m$ \u{276f}\x1b[0m ", now());
        cap.on_prompt(); // drops banner
        cap.append("ls\nclient\n", now());
        let rec = cap.on_exit(Some(0), &b64("ls"), now());
        assert_eq!(rec.command.as_deref(), Some("ls"));
        assert_eq!(rec.output, "client");
    }

    #[test]
    fn continuation_prompts_included_in_input() {
        let mut cap = Capture::new();
        cap.append("echo first \\\r\n> second \\\r\n> third\r\nfirst second third\n", now());
        let rec = cap.on_exit(Some(0), &b64("echo first second third"), now());
        assert!(rec.input.contains("echo first"));
        assert!(rec.input.contains("second"));
        assert!(rec.input.contains("third"));
        assert_eq!(rec.output, "first second third");
    }

    #[test]
    fn backspace_normalization_in_echo() {
        let mut cap = Capture::new();
        cap.append("ls -XXXX\u{8}\u{8}\u{8}\u{8}\x1b[KBB\r\nitem\n", now());
        let rec = cap.on_exit(Some(0), &b64("ls -BB"), now());
        assert_eq!(rec.command.as_deref(), Some("ls -BB"));
        assert_eq!(rec.input, "ls -BB\r\n");
        assert_eq!(rec.output, "item");
    }

    #[test]
    fn undecodable_base64_yields_null_command() {
        let mut cap = Capture::new();
        cap.append("whatever\n", now());
        let rec = cap.on_exit(Some(1), "not valid base64!!", now());
        assert!(rec.command.is_none());
    }

    #[test]
    fn normalize_twice_is_idempotent() {
        let once = normalize_plain("a\u{8}b\r\n\x1b[31mred\x1b[0m");
        let twice = normalize_plain(&once);
        assert_eq!(once, twice);
    }
}
