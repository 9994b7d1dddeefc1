//! Streaming text chunking.
//!
//! Turns a continuous stream of text into fragments suitable for incremental
//! delivery. Fragments end on a word or punctuation boundary where one is
//! available; text without boundaries (CJK scripts, long tokens) is cut into
//! fixed-size slices so latency stays bounded.
//!
//! Concatenating every fragment, in order, reproduces the input exactly.

/// Default number of characters buffered before a boundary-less slice is emitted.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 16;

/// Incremental, boundary-aware text chunker.
///
/// A chunker holds state for exactly one command invocation; create a fresh
/// one per stream.
#[derive(Debug)]
pub struct Chunker {
    buffer: String,
    buffered_chars: usize,
    max_chars: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_CHARS)
    }
}

impl Chunker {
    /// Create a chunker that emits a slice after `max_chars` characters
    /// without a boundary. A zero limit is treated as one.
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            buffered_chars: 0,
            max_chars: max_chars.max(1),
        }
    }

    /// Feed text into the chunker, returning every fragment that became ready.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut ready = Vec::new();
        for c in text.chars() {
            self.buffer.push(c);
            self.buffered_chars += 1;
            if is_boundary(c) || self.buffered_chars >= self.max_chars {
                ready.push(self.take());
            }
        }
        ready
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    /// Whether any text is waiting for a boundary.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn take(&mut self) -> String {
        self.buffered_chars = 0;
        std::mem::take(&mut self.buffer)
    }
}

/// Whitespace and common ASCII / full-width punctuation.
fn is_boundary(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            ',' | '.' | '!' | '?' | ';' | ':' | '，' | '。' | '！' | '？' | '；' | '：' | '、'
        )
}

/// Chunk a complete text in one call.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunker = Chunker::new(max_chars);
    let mut fragments = chunker.push(text);
    fragments.extend(chunker.finish());
    fragments
}

/// Incremental UTF-8 decoder for byte streams read from a pipe.
///
/// A read may end in the middle of a multi-byte character; the incomplete
/// tail is held back until the next read completes it. Invalid sequences
/// become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` (plus any held-back tail) as possible.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Flush a held-back incomplete sequence at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_world_boundaries() {
        let fragments = chunk_text("hello, world!", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(fragments, vec!["hello,", " ", "world!"]);
        assert_eq!(fragments.concat(), "hello, world!");
    }

    #[test]
    fn test_trailing_text_flushed() {
        let fragments = chunk_text("one two", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(fragments, vec!["one ", "two"]);
    }

    #[test]
    fn test_boundaryless_text_sliced() {
        let text = "这是一个没有任何标点符号的很长的句子用来测试";
        let fragments = chunk_text(text, 8);
        assert!(fragments.iter().all(|f| f.chars().count() <= 8));
        assert_eq!(fragments[0].chars().count(), 8);
        assert_eq!(fragments.concat(), text);
    }

    #[test]
    fn test_full_width_punctuation_is_boundary() {
        let fragments = chunk_text("你好，世界。", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(fragments, vec!["你好，", "世界。"]);
    }

    #[test]
    fn test_incremental_push_matches_whole() {
        let text = "The quick brown fox; jumps over the lazy dog. Done";
        let mut chunker = Chunker::default();
        let mut fragments = Vec::new();
        for piece in ["The qu", "ick bro", "wn fox; ju", "mps over the lazy dog. Do", "ne"] {
            fragments.extend(chunker.push(piece));
        }
        fragments.extend(chunker.finish());
        assert_eq!(fragments, chunk_text(text, DEFAULT_MAX_CHUNK_CHARS));
        assert_eq!(fragments.concat(), text);
    }

    #[test]
    fn test_finish_on_empty() {
        let mut chunker = Chunker::default();
        assert!(chunker.is_empty());
        assert_eq!(chunker.finish(), None);
        assert!(chunk_text("", 4).is_empty());
    }

    #[test]
    fn test_zero_limit_treated_as_one() {
        let fragments = chunk_text("abc", 0);
        assert_eq!(fragments, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_utf8_decoder_split_character() {
        let bytes = "héllo 世界".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        // Split inside the 'é' and inside '世'.
        out.push_str(&decoder.decode(&bytes[..2]));
        out.push_str(&decoder.decode(&bytes[2..8]));
        out.push_str(&decoder.decode(&bytes[8..]));
        out.push_str(&decoder.finish());
        assert_eq!(out, "héllo 世界");
    }

    #[test]
    fn test_utf8_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(b"ok\xffok");
        assert_eq!(out, "ok\u{FFFD}ok");
    }

    #[test]
    fn test_utf8_decoder_truncated_tail_flushed() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xe4, 0xb8]), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
