//! Token usage accounting.
//!
//! Interactive CLIs report usage in free text (a stats command printing a
//! table, or JSON in newer versions). When nothing usable is reported the
//! counts are estimated from text length.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::sanitize::sanitize;

/// Characters per token used for estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Token counts for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Rough usage derived from text length.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        Self::new(estimate_tokens(prompt), estimate_tokens(completion))
    }

    /// All counts zero.
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }

    /// Use `reported` when it carries counts, otherwise estimate.
    ///
    /// Returns the usage and whether it was estimated.
    pub fn resolve(reported: Option<Self>, prompt: &str, completion: &str) -> (Self, bool) {
        match reported {
            Some(usage) if !usage.is_empty() => (usage, false),
            _ => (Self::estimate(prompt, completion), true),
        }
    }
}

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / CHARS_PER_TOKEN) as u64
}

/// JSON usage shapes seen in CLI stats output.
#[derive(Debug, Default, Deserialize)]
struct ReportedUsage {
    #[serde(
        default,
        alias = "input_tokens",
        alias = "promptTokens",
        alias = "inputTokens",
        alias = "prompt"
    )]
    prompt_tokens: u64,
    #[serde(
        default,
        alias = "output_tokens",
        alias = "completionTokens",
        alias = "outputTokens",
        alias = "candidates_tokens",
        alias = "candidatesTokens",
        alias = "completion"
    )]
    completion_tokens: u64,
    #[serde(default, alias = "totalTokens", alias = "total")]
    total_tokens: u64,
}

impl ReportedUsage {
    fn into_usage(self) -> TokenUsage {
        combine(self.prompt_tokens, self.completion_tokens, self.total_tokens)
    }
}

fn combine(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> TokenUsage {
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: if total_tokens == 0 {
            prompt_tokens.saturating_add(completion_tokens)
        } else {
            total_tokens
        },
    }
}

/// `Input Tokens: 1,234`, `total tokens = 9`, `Output tokens  56`.
static USAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(input|prompt|output|completion|candidates?|total)\b[^:=\d\n]*?tokens?\s*[:=]?\s*(\d[\d,]*)")
        .expect("static usage pattern")
});

/// Parse usage from the output of a stats command.
///
/// Accepts a JSON object with OpenAI- or Gemini-style field names, or
/// `label tokens: number` lines.
pub fn parse_usage(raw: &str) -> Result<TokenUsage> {
    let text = sanitize(raw);

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}'))
        && start < end
        && let Ok(reported) = serde_json::from_str::<ReportedUsage>(&text[start..=end])
    {
        let usage = reported.into_usage();
        if !usage.is_empty() {
            return Ok(usage);
        }
    }

    let mut found = false;
    let (mut prompt, mut completion, mut total) = (0u64, 0u64, 0u64);
    for caps in USAGE_LINE.captures_iter(&text) {
        let Ok(value) = caps[2].replace(',', "").parse::<u64>() else {
            continue;
        };
        match caps[1].to_lowercase().as_str() {
            "input" | "prompt" => prompt = prompt.saturating_add(value),
            "output" | "completion" | "candidate" | "candidates" => {
                completion = completion.saturating_add(value)
            }
            "total" => total = total.saturating_add(value),
            _ => continue,
        }
        found = true;
    }

    if !found {
        return Err(RelayError::OutputParse(
            "no token counts in stats output".to_string(),
        ));
    }
    Ok(combine(prompt, completion, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        // Counted in characters, not bytes.
        assert_eq!(estimate_tokens("你好你好"), 1);
        let usage = TokenUsage::estimate("What is 5 + 3?", "The answer is 8.");
        assert_eq!(usage, TokenUsage::new(3, 4));
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn test_resolve_prefers_reported() {
        let reported = TokenUsage::new(10, 20);
        assert_eq!(
            TokenUsage::resolve(Some(reported), "p", "c"),
            (reported, false)
        );
        let (usage, estimated) = TokenUsage::resolve(Some(TokenUsage::default()), "abcd", "abcdabcd");
        assert!(estimated);
        assert_eq!(usage, TokenUsage::new(1, 2));
        assert!(TokenUsage::resolve(None, "", "").1);
    }

    #[test]
    fn test_parse_json_openai_names() {
        let usage =
            parse_usage(r#"{"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}"#)
                .unwrap();
        assert_eq!(usage, TokenUsage::new(12, 30));
    }

    #[test]
    fn test_parse_json_embedded_with_aliases() {
        let raw = "stats:\n{\"inputTokens\": 5, \"candidatesTokens\": 7}\n";
        let usage = parse_usage(raw).unwrap();
        assert_eq!(usage, TokenUsage::new(5, 7));
    }

    #[test]
    fn test_parse_text_table() {
        let raw = "\x1b[1mSession Stats\x1b[0m\n\
                   Input Tokens      1,234\n\
                   Output Tokens:    56\n\
                   Total tokens = 1290\n";
        let usage = parse_usage(raw).unwrap();
        assert_eq!(usage.prompt_tokens, 1234);
        assert_eq!(usage.completion_tokens, 56);
        assert_eq!(usage.total_tokens, 1290);
    }

    #[test]
    fn test_parse_text_total_derived() {
        let usage = parse_usage("Input tokens: 3\nOutput tokens: 5\n").unwrap();
        assert_eq!(usage, TokenUsage::new(3, 5));
    }

    #[test]
    fn test_parse_failure() {
        let err = parse_usage("Unknown command: /stats").unwrap_err();
        assert!(matches!(err, RelayError::OutputParse(_)));
        assert!(parse_usage("").is_err());
    }

    #[test]
    fn test_huge_counts_saturate() {
        let max = u64::MAX;
        let usage = parse_usage(&format!(
            "Input tokens: {max}\nInput tokens: {max}\nOutput tokens: {max}\n"
        ))
        .unwrap();
        assert_eq!(usage.prompt_tokens, max);
        assert_eq!(usage.completion_tokens, max);
        assert_eq!(usage.total_tokens, max);
    }

    #[test]
    fn test_zero_json_falls_through_to_error() {
        assert!(parse_usage(r#"{"prompt_tokens": 0}"#).is_err());
    }
}
