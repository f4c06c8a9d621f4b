use serde_json::Value;
use thiserror::Error;

use super::normalize;

/// Upper bound on single-character repairs attempted after cleanup.
pub const MAX_REPAIR_PASSES: usize = 50;

const SAMPLE_CHARS: usize = 500;

/// Terminal failure: no amount of automated repair made the text
/// parseable. Carries enough of the cleaned text to diagnose what the
/// model actually produced without logging the full response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "model output is not recoverable JSON (original {original_len} chars, cleaned {cleaned_len} chars)"
)]
pub struct ParseFailure {
    pub original_len: usize,
    pub cleaned_len: usize,
    pub head_sample: String,
    pub tail_sample: String,
}

impl ParseFailure {
    fn new(original: &str, cleaned: &str) -> Self {
        let chars: Vec<char> = cleaned.chars().collect();
        let head_sample: String = chars.iter().take(SAMPLE_CHARS).collect();
        let tail_start = chars.len().saturating_sub(SAMPLE_CHARS);
        let tail_sample: String = chars[tail_start..].iter().collect();
        Self {
            original_len: original.chars().count(),
            cleaned_len: chars.len(),
            head_sample,
            tail_sample,
        }
    }
}

/// Parse raw model output, repairing it as needed.
///
/// The cleaned text is first handed to a relaxed parser that tolerates
/// trailing commas, comments, and single quotes. If that fails, a bounded
/// loop re-runs the strict parser and uses its reported error position to
/// escape one stray quote per pass: either the quote sitting at the error
/// position itself, or the nearest preceding quote when the parser choked
/// on content after a string that closed too early.
pub fn parse_with_repair(raw: &str) -> Result<Value, ParseFailure> {
    let cleaned = normalize(raw);
    if let Ok(value) = serde_json_lenient::from_str::<Value>(&cleaned) {
        return Ok(value);
    }

    let mut work = cleaned.clone();
    for _ in 0..MAX_REPAIR_PASSES {
        let err = match serde_json::from_str::<Value>(&work) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.line() == 0 || err.column() == 0 {
            break;
        }
        let offset = byte_offset(&work, err.line(), err.column());
        match escape_quote_near(&work, offset) {
            Some(repaired) => work = repaired,
            None => break,
        }
    }

    serde_json::from_str::<Value>(&work).map_err(|_| ParseFailure::new(raw, &cleaned))
}

/// Convert serde_json's one-based line/column into a byte offset,
/// clamped to the text and rounded down to a char boundary.
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let mut remaining = line.saturating_sub(1);
    let mut line_start = 0;
    if remaining > 0 {
        for (idx, ch) in text.char_indices() {
            if ch == '\n' {
                line_start = idx + 1;
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
    }
    let mut offset = (line_start + column.saturating_sub(1)).min(text.len());
    while offset > 0 && !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Escape the quote implicated by a parse error at `offset`. Returns the
/// repaired text, or `None` when no unescaped quote is in reach.
fn escape_quote_near(text: &str, offset: usize) -> Option<String> {
    let bytes = text.as_bytes();
    let target = if bytes.get(offset) == Some(&b'"') && !is_escaped(bytes, offset) {
        Some(offset)
    } else {
        nearest_quote_before(bytes, offset)
    };
    let idx = target?;

    let mut repaired = String::with_capacity(text.len() + 1);
    repaired.push_str(&text[..idx]);
    repaired.push('\\');
    repaired.push_str(&text[idx..]);
    Some(repaired)
}

fn nearest_quote_before(bytes: &[u8], offset: usize) -> Option<usize> {
    let mut idx = offset.min(bytes.len());
    while idx > 0 {
        idx -= 1;
        if bytes[idx] == b'"' && !is_escaped(bytes, idx) {
            return Some(idx);
        }
    }
    None
}

fn is_escaped(bytes: &[u8], idx: usize) -> bool {
    let mut backslashes = 0;
    let mut cursor = idx;
    while cursor > 0 && bytes[cursor - 1] == b'\\' {
        backslashes += 1;
        cursor -= 1;
    }
    backslashes % 2 == 1
}
