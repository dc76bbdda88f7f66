//! Helpers for pulling structured content out of free-form model output.

use regex::Regex;
use std::sync::OnceLock;

/// Extract a JSON object from a model response.
///
/// Looks for a ```json fenced block first, then any fenced block containing a
/// brace, then the outermost raw `{...}` object found by brace counting.
pub fn extract_json(response: &str) -> Option<String> {
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    if let Some(start) = response.find("```") {
        let after_marker = &response[start + 3..];
        if let Some(end) = after_marker.find("```")
            && let Some(json_start) = after_marker[..end].find('{')
        {
            return Some(after_marker[json_start..end].trim().to_string());
        }
    }

    extract_json_object(response)
}

/// Brace-counting scan for the outermost JSON object in `text`.
///
/// Braces inside string literals are skipped so prose such as `"use {x}"`
/// inside a value does not end the object early.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

fn code_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?P<lang>[A-Za-z0-9_+-]*)[^\n]*\n(?P<body>.*?)```")
            .expect("code block pattern is a valid static regex")
    })
}

/// Extract the first fenced code block from a writer response.
///
/// Prefers a block tagged `python`/`py`; falls back to the first block of any
/// language, then to the whole trimmed response when there are no fences.
pub fn extract_code_block(response: &str) -> String {
    let mut first: Option<&str> = None;
    for caps in code_block_regex().captures_iter(response) {
        let lang = caps.name("lang").map(|m| m.as_str()).unwrap_or_default();
        let body = caps.name("body").map(|m| m.as_str()).unwrap_or_default();
        if matches!(lang.to_lowercase().as_str(), "python" | "py") {
            return body.trim_end().to_string();
        }
        first.get_or_insert(body);
    }
    first
        .map(|b| b.trim_end().to_string())
        .unwrap_or_else(|| response.trim().to_string())
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the ruling: {"key": "value"} thanks"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_braces_in_strings() {
        let text = r#"{"body": "use {x} and \"}\" here", "n": 1} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"body": "use {x} and \"}\" here", "n": 1}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unbalanced() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn test_extract_json_prefers_fenced_block() {
        let text = "Sure.\n```json\n{\"a\": 1}\n```\nAlso {\"b\": 2}";
        assert_eq!(extract_json(text), Some("{\"a\": 1}".to_string()));
    }

    #[test]
    fn test_extract_json_generic_fence() {
        let text = "```\n{\"a\": 2}\n```";
        assert_eq!(extract_json(text), Some("{\"a\": 2}".to_string()));
    }

    #[test]
    fn test_extract_code_block_prefers_python() {
        let text = "Plan:\n```sh\npip install x\n```\nThen:\n```python\nprint('hi')\n```\n";
        assert_eq!(extract_code_block(text), "print('hi')");
    }

    #[test]
    fn test_extract_code_block_falls_back_to_text() {
        assert_eq!(extract_code_block("  print(1)\n"), "print(1)");
    }

    #[test]
    fn test_extract_code_block_untagged() {
        let text = "```\nimport matplotlib\n```";
        assert_eq!(extract_code_block(text), "import matplotlib");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
