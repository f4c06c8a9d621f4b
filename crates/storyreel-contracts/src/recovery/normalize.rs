/// Best-effort cleanup of raw model output into parseable JSON text.
///
/// Model responses routinely arrive wrapped in prose or markdown fences,
/// cut off mid-structure by token limits, or carrying small syntax
/// violations (unescaped quotes inside string values, trailing commas,
/// comments). Each stage below repairs one class of damage and feeds the
/// next; the function never fails, and a strict parse downstream decides
/// whether the result is usable.
pub fn normalize(raw: &str) -> String {
    let text = strip_fences(raw);
    let text = escape_stray_quotes(&text);
    let text = slice_outer_object(&text);
    let text = strip_trailing_commas(&text);
    let text = strip_comments(&text);
    let text = close_open_scopes(&text);
    let text = strip_trailing_commas(&text);
    tidy(&text)
}

/// Extract the body of the first fenced code block, language-tagged or
/// bare. Without a fence the input is only trimmed.
fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after = &trimmed[start + 3..];
    let body = match after.find('\n') {
        Some(idx) => &after[idx + 1..],
        // fence and content on one line: drop the language tag, if any
        None => after.trim_start_matches(|ch: char| ch.is_ascii_alphanumeric()),
    };
    match body.find("```") {
        Some(end) => body[..end].trim().to_string(),
        None => body.trim().to_string(),
    }
}

/// Escape quotes that appear inside string values without escaping.
///
/// A `"` met while inside a string only terminates it when the next
/// non-whitespace character is structural (`:`, `,`, `}`, `]`) or the
/// input ends. Anything else means the model emitted dialogue-style
/// quotes as literal content, which would otherwise end the string early
/// and corrupt everything after it.
fn escape_stray_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_str = false;
    let mut escaped = false;

    for (idx, &ch) in chars.iter().enumerate() {
        if in_str && escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        if in_str && ch == '\\' {
            escaped = true;
            out.push(ch);
            continue;
        }
        if ch == '"' {
            if !in_str {
                in_str = true;
                out.push(ch);
            } else if closes_string(&chars, idx + 1) {
                in_str = false;
                out.push(ch);
            } else {
                out.push('\\');
                out.push('"');
            }
            continue;
        }
        out.push(ch);
    }
    out
}

fn closes_string(chars: &[char], from: usize) -> bool {
    let mut idx = from;
    while idx < chars.len() && chars[idx].is_whitespace() {
        idx += 1;
    }
    match chars.get(idx) {
        None => true,
        Some(ch) => matches!(ch, ':' | ',' | '}' | ']'),
    }
}

/// Slice to the span between the first `{` and the last `}` that sit
/// outside string literals, dropping surrounding prose. A missing closer
/// keeps everything from the first `{` onward for the completion stage.
fn slice_outer_object(text: &str) -> String {
    let mut in_str = false;
    let mut escaped = false;
    let mut first: Option<usize> = None;
    let mut last: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' if first.is_none() => first = Some(idx),
            '}' => last = Some(idx),
            _ => {}
        }
    }

    match (first, last) {
        (Some(start), Some(end)) if end > start => text[start..=end].to_string(),
        (Some(start), _) => text[start..].to_string(),
        _ => text.trim().to_string(),
    }
}

/// Drop commas whose next non-whitespace character is `}` or `]`,
/// repeating until stable so stacked commas collapse too.
fn strip_trailing_commas(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = strip_trailing_commas_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_trailing_commas_once(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_str = false;
    let mut escaped = false;

    for (idx, &ch) in chars.iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_str = true;
            out.push(ch);
            continue;
        }
        if ch == ',' && next_is_closer(&chars, idx + 1) {
            continue;
        }
        out.push(ch);
    }
    out
}

fn next_is_closer(chars: &[char], from: usize) -> bool {
    let mut idx = from;
    while idx < chars.len() && chars[idx].is_whitespace() {
        idx += 1;
    }
    matches!(chars.get(idx), Some('}') | Some(']'))
}

/// Remove `//` line comments and `/* */` block comments outside strings.
fn strip_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_str = false;
    let mut escaped = false;
    let mut idx = 0;

    while idx < chars.len() {
        let ch = chars[idx];
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            out.push(ch);
            idx += 1;
            continue;
        }
        if ch == '"' {
            in_str = true;
            out.push(ch);
            idx += 1;
            continue;
        }
        if ch == '/' && chars.get(idx + 1) == Some(&'/') {
            while idx < chars.len() && chars[idx] != '\n' {
                idx += 1;
            }
            continue;
        }
        if ch == '/' && chars.get(idx + 1) == Some(&'*') {
            idx += 2;
            while idx + 1 < chars.len() && !(chars[idx] == '*' && chars[idx + 1] == '/') {
                idx += 1;
            }
            idx = (idx + 2).min(chars.len());
            continue;
        }
        out.push(ch);
        idx += 1;
    }
    out
}

/// Append the closers a truncated response is missing.
///
/// Tracks the stack of open `{`/`[` scopes outside strings and closes
/// them in reverse-open order. An unterminated string is left alone: the
/// appended closers will land inside it and the strict parse will fail,
/// which is the intended outcome for mid-value truncation.
fn close_open_scopes(text: &str) -> String {
    let mut in_str = false;
    let mut escaped = false;
    let mut stack: Vec<char> = Vec::new();

    for ch in text.chars() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                // stray closers are ignored rather than matched loosely
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() {
        return text.to_string();
    }
    let mut out = text.to_string();
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

fn tidy(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{0}', "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::normalize;

    fn parsed(text: &str) -> Value {
        serde_json::from_str(&normalize(text)).expect("normalized text should parse")
    }

    #[test]
    fn valid_json_passes_through() {
        let text = r#"{"a": 1, "b": [true, null], "c": "x"}"#;
        assert_eq!(normalize(text), text);
    }

    #[test]
    fn normalize_is_idempotent_on_valid_json() {
        let inputs = [
            r#"{"a": 1}"#,
            r#"{"quote": "she said \"go\""}"#,
            r#"{"nested": {"rows": [1, 2, {"x": "y, }"}]}}"#,
            r#"{"brace_in_string": "{not structure}"}"#,
        ];
        for text in inputs {
            let once = normalize(text);
            assert_eq!(normalize(&once), once, "not idempotent for {text}");
        }
    }

    #[test]
    fn escapes_unescaped_quotes_inside_values() {
        let value = parsed(r#"{"a": "He said "hello" to her"}"#);
        assert_eq!(value, json!({"a": "He said \"hello\" to her"}));
    }

    #[test]
    fn completes_truncated_array_and_object() {
        let value = parsed(r#"{"a": [1, 2, 3"#);
        assert_eq!(value, json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn truncation_closers_follow_open_order() {
        let value = parsed(r#"{"scenes": [{"idx": 1}, {"idx": 2"#);
        assert_eq!(value, json!({"scenes": [{"idx": 1}, {"idx": 2}]}));
    }

    #[test]
    fn removes_trailing_commas() {
        let value = parsed(r#"{"a": 1, "b": 2,}"#);
        assert_eq!(value, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn removes_stacked_trailing_commas() {
        let value = parsed(r#"{"rows": [1, 2,,],}"#);
        assert_eq!(value, json!({"rows": [1, 2]}));
    }

    #[test]
    fn keeps_commas_inside_strings() {
        let value = parsed(r#"{"a": "one, }", "b": 2}"#);
        assert_eq!(value, json!({"a": "one, }", "b": 2}));
    }

    #[test]
    fn strips_line_comments() {
        let value = parsed("{\"a\": 1 // comment\n}");
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn strips_block_comments() {
        let value = parsed(r#"{"a": /* count */ 1}"#);
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn keeps_slashes_inside_strings() {
        let value = parsed(r#"{"url": "https://example.com/a"}"#);
        assert_eq!(value, json!({"url": "https://example.com/a"}));
    }

    #[test]
    fn extracts_object_from_fenced_prose() {
        let text = "Here is your JSON:\n```json\n{\"a\":1}\n```\nHope that helps!";
        assert_eq!(normalize(text), "{\"a\":1}");
    }

    #[test]
    fn extracts_object_from_bare_fence() {
        let text = "```\n{\"a\": 2}\n```";
        assert_eq!(parsed(text), json!({"a": 2}));
    }

    #[test]
    fn extracts_object_from_unfenced_prose() {
        let text = "Sure! The breakdown is {\"a\": 3} as requested.";
        assert_eq!(parsed(text), json!({"a": 3}));
    }

    #[test]
    fn truncated_fence_still_recovers() {
        let text = "```json\n{\"a\": [1, 2";
        assert_eq!(parsed(text), json!({"a": [1, 2]}));
    }

    #[test]
    fn trailing_comma_left_by_truncation_is_removed() {
        let value = parsed(r#"{"a": [1,"#);
        assert_eq!(value, json!({"a": [1]}));
    }

    #[test]
    fn normalizes_line_endings_and_null_bytes() {
        let value = parsed("{\"a\":\r\n 1,\u{0} \"b\": 2}");
        assert_eq!(value, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \n  "), "");
    }
}
