//! Delimiter framing for interactive CLI workers.
//!
//! The wrapped tool is a REPL with no framing of its own. Every command is
//! followed by a synthetic marker line; when the tool surfaces that line on
//! stdout, the command's output is complete.
//!
//! Markers look like `<<CLIRELAY:{token}:{seq}>>`. The token is unique per
//! process instance and the sequence number increases per command, so a
//! marker that shows up late (after its command timed out) is recognized as
//! stale and the output preceding it is thrown away rather than attributed
//! to the current command.

use uuid::Uuid;

/// Fixed opening of every marker.
pub const MARKER_OPEN: &str = "<<CLIRELAY:";

/// Fixed closing of every marker.
pub const MARKER_CLOSE: &str = ">>";

/// Output of one completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Raw stdout up to (not including) the marker.
    pub stdout: String,
    /// Stderr captured while the command ran.
    pub stderr: String,
}

/// One increment of a streamed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFragment {
    pub stdout: String,
    pub stderr: String,
}

impl OutputFragment {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Process-instance delimiter token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiter {
    /// `<<CLIRELAY:{token}:`, everything before the sequence number.
    prefix: String,
}

/// A marker located in a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MarkerMatch {
    /// Byte offset where the marker starts.
    start: usize,
    /// Byte offset just past the closing `>>`.
    end: usize,
    /// Parsed sequence number, `None` if the digits were malformed.
    seq: Option<u64>,
}

/// How a single stdout line relates to the command in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Ordinary output.
    Content,
    /// Carries the marker of an earlier command; output so far is stale.
    Stale,
    /// Carries the current marker; `before` is the text preceding it.
    End { before: String },
}

impl Delimiter {
    /// Generate a fresh delimiter for a new process instance.
    pub fn generate() -> Self {
        Self::with_token(&Uuid::new_v4().simple().to_string())
    }

    /// Build a delimiter from a known token.
    pub fn with_token(token: &str) -> Self {
        Self {
            prefix: format!("{}{}:", MARKER_OPEN, token),
        }
    }

    /// The marker line for command number `seq`.
    pub fn marker(&self, seq: u64) -> String {
        format!("{}{}{}", self.prefix, seq, MARKER_CLOSE)
    }

    /// Bytes written to stdin for a command: the command, then its marker.
    pub fn frame_command(&self, command: &str, seq: u64) -> String {
        format!("{}\n{}\n", command, self.marker(seq))
    }

    /// Classify one stdout line against command `seq`.
    pub fn scan_line(&self, line: &str, seq: u64) -> LineKind {
        let mut from = 0;
        while let Some(found) = self.find_marker(line, from) {
            match found {
                Some(m) => match m.seq {
                    Some(n) if n == seq => {
                        return LineKind::End {
                            before: line[..m.start].to_string(),
                        };
                    }
                    Some(_) => return LineKind::Stale,
                    None => from = m.end,
                },
                // Marker opened but never closed on this line.
                None => break,
            }
        }
        LineKind::Content
    }

    /// Find the next marker at or after `from`.
    ///
    /// Returns `None` when no marker prefix is present, `Some(None)` when a
    /// prefix is present but not yet closed.
    fn find_marker(&self, text: &str, from: usize) -> Option<Option<MarkerMatch>> {
        let start = from + text[from..].find(&self.prefix)?;
        let digits_start = start + self.prefix.len();
        let Some(close) = text[digits_start..].find(MARKER_CLOSE) else {
            return Some(None);
        };
        let digits_end = digits_start + close;
        Some(Some(MarkerMatch {
            start,
            end: digits_end + MARKER_CLOSE.len(),
            seq: text[digits_start..digits_end].parse().ok(),
        }))
    }

    /// Start a streaming framer for command `seq`.
    pub fn stream_framer(&self, seq: u64) -> StreamFramer {
        StreamFramer {
            delimiter: self.clone(),
            seq,
            pending: String::new(),
        }
    }
}

/// Result of feeding text to a [`StreamFramer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Framed {
    /// Text that is definitely command output.
    pub text: String,
    /// Whether the current marker was seen.
    pub finished: bool,
}

/// Incremental marker detection over arbitrary text chunks.
///
/// Text that might be the beginning of a marker is held back until enough
/// input arrives to decide.
#[derive(Debug)]
pub struct StreamFramer {
    delimiter: Delimiter,
    seq: u64,
    pending: String,
}

impl StreamFramer {
    /// Feed decoded stdout text.
    pub fn push(&mut self, text: &str) -> Framed {
        self.pending.push_str(text);
        let mut out = String::new();
        loop {
            match self.delimiter.find_marker(&self.pending, 0) {
                Some(Some(m)) => match m.seq {
                    Some(n) if n == self.seq => {
                        out.push_str(&self.pending[..m.start]);
                        self.pending.clear();
                        return Framed {
                            text: out,
                            finished: true,
                        };
                    }
                    Some(_) => {
                        // Output of an earlier command: drop it with its marker.
                        let mut cut = m.end;
                        if self.pending[cut..].starts_with('\n') {
                            cut += 1;
                        }
                        self.pending.drain(..cut);
                        out.clear();
                    }
                    None => {
                        out.push_str(&self.pending[..m.end]);
                        self.pending.drain(..m.end);
                    }
                },
                Some(None) => {
                    // Unclosed marker: release what precedes it and wait.
                    let start = self
                        .pending
                        .find(&self.delimiter.prefix)
                        .unwrap_or(self.pending.len());
                    out.push_str(&self.pending[..start]);
                    self.pending.drain(..start);
                    return Framed {
                        text: out,
                        finished: false,
                    };
                }
                None => {
                    let keep = partial_prefix_len(&self.pending, &self.delimiter.prefix);
                    let cut = self.pending.len() - keep;
                    out.push_str(&self.pending[..cut]);
                    self.pending.drain(..cut);
                    return Framed {
                        text: out,
                        finished: false,
                    };
                }
            }
        }
    }

    /// Text held back waiting for a possible marker.
    pub fn pending(&self) -> &str {
        &self.pending
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `prefix`.
///
/// `prefix` is ASCII, so any matching suffix starts on a char boundary.
fn partial_prefix_len(text: &str, prefix: &str) -> usize {
    let max = prefix.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| text.as_bytes().ends_with(&prefix.as_bytes()[..k]))
        .unwrap_or(0)
}
