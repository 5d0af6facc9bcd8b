//! Stateful UTF-8 decoder that carries an incomplete trailing byte sequence
//! across calls.
//!
//! A PTY read lands in fixed-size chunks (`pty::READ_CHUNK`); a multi-byte
//! UTF-8 character (an emoji, a CJK glyph, the box-drawing/`❯` prompt glyphs
//! spec.md's own scenario 3 uses) can straddle that boundary. Decoding each
//! chunk independently with `String::from_utf8_lossy` would replace the
//! split sequence with `U+FFFD` on both sides of the cut. This decoder
//! buffers the incomplete tail instead and prepends it to the next chunk, so
//! a character is only ever decoded once it has fully arrived.

/// Owned by [`super::Interpreter`], one per session, so the buffered tail
/// persists across `feed` calls for the lifetime of that session's PTY.
pub struct Utf8Decoder {
    /// Incomplete trailing bytes from the previous `decode` call (at most 3,
    /// since a valid UTF-8 sequence is at most 4 bytes long).
    incomplete: Vec<u8>,
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self { incomplete: Vec::with_capacity(4) }
    }
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `input`, prepending any bytes buffered from the previous call.
    /// Returns only the valid, complete portion; an incomplete trailing
    /// sequence is buffered for the next call rather than lossily replaced.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let valid_up_to = Self::valid_boundary(&data);
        if valid_up_to < data.len() {
            self.incomplete = data[valid_up_to..].to_vec();
        }

        String::from_utf8(data[..valid_up_to].to_vec())
            .unwrap_or_else(|_| String::from_utf8_lossy(&data[..valid_up_to]).into_owned())
    }

    /// Byte index up to which `data` is valid UTF-8. An incomplete trailing
    /// sequence is excluded (left for the next `decode` call); a genuinely
    /// invalid byte is skipped so one bad byte doesn't stall the stream
    /// forever.
    fn valid_boundary(data: &[u8]) -> usize {
        match std::str::from_utf8(data) {
            Ok(_) => data.len(),
            Err(e) => match e.error_len() {
                None => e.valid_up_to(),
                Some(len) => e.valid_up_to() + len,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_chunk_decodes_immediately() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.decode("hello".as_bytes()), "hello");
    }

    #[test]
    fn multi_byte_char_split_across_two_chunks_reassembles() {
        let emoji = "❯".as_bytes(); // 3 bytes
        let mut d = Utf8Decoder::new();
        let first = d.decode(&emoji[..1]);
        assert!(first.is_empty());
        let second = d.decode(&emoji[1..]);
        assert_eq!(second, "❯");
    }

    #[test]
    fn byte_by_byte_feed_reassembles_whole_string() {
        let text = "ls ❯ 文件.txt\n";
        let mut d = Utf8Decoder::new();
        let mut out = String::new();
        for byte in text.as_bytes() {
            out.push_str(&d.decode(&[*byte]));
        }
        assert_eq!(out, text);
    }

    #[test]
    fn invalid_byte_is_replaced_without_stalling_what_follows() {
        let mut d = Utf8Decoder::new();
        let first = d.decode(&[b'a', 0xFF]);
        assert_eq!(first, "a\u{FFFD}");
        let second = d.decode(&[b'b']);
        assert_eq!(second, "b");
    }
}
