//! Terminal output sanitization.
//!
//! Interactive CLIs paint their output with colour escapes, cursor movement
//! and decorative banners. Everything here is a pure function over text: no
//! state, no I/O, and no failure modes.
//!
//! Two levels are provided:
//!
//! - [`sanitize`] strips control sequences only.
//! - [`sanitize_smart`] also drops UI decoration lines (box drawing, block
//!   art) and known banner boilerplate, then trims and compacts lines.
//!
//! Both are idempotent: removal is repeated until the text stops changing, so
//! an escape sequence revealed by removing an inner one is removed as well.

use std::sync::LazyLock;

use regex::Regex;

/// Escape sequence patterns, most specific first.
///
/// The trailing catch-all must stay last: run earlier it would swallow
/// ordinary characters up to the next `m`.
static ANSI_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // 24-bit colour, e.g. ESC[38;2;255;180;84m
        r"\x1b\[(?:38|48);2;[0-9;]*m",
        // 8-bit and basic colour / SGR
        r"\x1b\[[0-9;]*m",
        // Line clear, cursor up, column reset
        r"\x1b\[2K",
        r"\x1b\[1A",
        r"\x1b\[G",
        // Remaining CSI sequences (cursor movement, screen clear, modes)
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        // OSC sequences (window titles, hyperlinks), BEL or ST terminated
        r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        // Two-byte escapes
        r"\x1b[@-Z\\-_]",
        // Catch-all for truncated CSI sequences
        r"\x1b\[[^m]*m?",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static ANSI pattern"))
    .collect()
});

/// Stray control characters left after escape removal (keeps `\n` and `\t`).
static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0b-\x1f\x7f]").expect("static control pattern")
});

/// A complete escape sequence at the start of the text.
static COMPLETE_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\^_])")
        .expect("static escape pattern")
});

/// Longest escape sequence held back between stream fragments.
const MAX_ESCAPE_CARRY: usize = 64;

/// Banner and help text emitted by interactive CLIs, matched case-insensitively.
const BOILERPLATE: &[&str] = &[
    "tips for getting started",
    "ask questions, edit files",
    "be specific for the best",
    "retry backoff:",
    "/help for more information",
];

/// Strip terminal control sequences from `raw`.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(sanitize("\x1b[38;2;255;0;0mHello\x1b[39m"), "Hello");
/// ```
pub fn sanitize(raw: &str) -> String {
    let mut current = raw.to_string();
    loop {
        let next = strip_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn strip_once(text: &str) -> String {
    let mut cleaned = text.to_string();
    for pattern in ANSI_PATTERNS.iter() {
        if pattern.is_match(&cleaned) {
            cleaned = pattern.replace_all(&cleaned, "").into_owned();
        }
    }
    CONTROL_CHARS.replace_all(&cleaned, "").into_owned()
}

/// Strip control sequences and UI decoration, keeping only meaningful lines.
///
/// Lines are trimmed; empty lines, decoration lines and banner boilerplate
/// are dropped.
pub fn sanitize_smart(raw: &str) -> String {
    sanitize(raw)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !is_decoration(line))
        .filter(|line| !is_boilerplate(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sanitizer for text arriving in fragments.
///
/// An escape sequence split across two fragments would otherwise leak its
/// tail as visible text, so an unterminated sequence at the end of a
/// fragment is held back until the next one.
#[derive(Debug, Default)]
pub struct StreamSanitizer {
    carry: String,
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize the next fragment.
    pub fn push(&mut self, fragment: &str) -> String {
        self.carry.push_str(fragment);
        let split = incomplete_escape_start(&self.carry);
        let ready: String = self.carry.drain(..split).collect();
        sanitize(&ready)
    }

    /// Flush held-back text at end of stream.
    pub fn finish(&mut self) -> String {
        sanitize(&std::mem::take(&mut self.carry))
    }
}

/// Byte offset of a trailing unterminated escape sequence, or `text.len()`.
fn incomplete_escape_start(text: &str) -> usize {
    let Some(pos) = text.rfind('\x1b') else {
        return text.len();
    };
    let tail = &text[pos..];
    if tail.len() > MAX_ESCAPE_CARRY || COMPLETE_ESCAPE.is_match(tail) {
        text.len()
    } else {
        pos
    }
}

/// Whether a line contains box-drawing or block-element characters.
pub fn is_decoration(line: &str) -> bool {
    line.chars()
        .any(|c| matches!(c, '\u{2500}'..='\u{259F}'))
}

/// Whether a line contains one of the known banner phrases.
pub fn is_boilerplate(line: &str) -> bool {
    let lower = line.to_lowercase();
    BOILERPLATE.iter().any(|phrase| lower.contains(phrase))
}
