//! Recovery of JSON payloads from free-form model output.
//!
//! Models wrap JSON in code fences, surround it with prose or leave
//! trailing commas behind. These helpers peel that away before parsing.

use crate::{EngineError, Result};
use serde_json::Value;

/// Strip a surrounding ``` or ```json fence
fn strip_code_fence(payload: &str) -> String {
    let trimmed = payload.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines = trimmed.lines();
    let _ = lines.next(); // drop ``` or ```json
    let mut content = lines.collect::<Vec<_>>().join("\n");
    if let Some(end) = content.rfind("```") {
        content.truncate(end);
    }
    content.trim().to_string()
}

/// First balanced `open`..`close` span, ignoring brackets inside strings
fn extract_balanced(payload: &str, open: char, close: char) -> Option<&str> {
    let start = payload.find(open)?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (offset, ch) in payload[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                let end = start + offset + ch.len_utf8();
                return Some(&payload[start..end]);
            }
        }
    }

    None
}

/// Drop commas that directly precede `]` or `}`
fn remove_trailing_commas(payload: &str) -> String {
    let chars: Vec<char> = payload.chars().collect();
    let mut out = String::with_capacity(payload.len());
    let mut in_string = false;
    let mut escape = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }

        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(ch);
    }

    out
}

fn parse_lenient(candidate: &str) -> Option<Value> {
    serde_json::from_str(candidate)
        .or_else(|_| serde_json::from_str(&remove_trailing_commas(candidate)))
        .ok()
}

/// Parse a JSON array out of model output.
///
/// A top-level object holding a single array (`{"entities": [...]}`) is
/// accepted as that array.
pub fn parse_json_array(raw: &str) -> Result<Vec<Value>> {
    let cleaned = strip_code_fence(raw);

    let value = parse_lenient(&cleaned).or_else(|| {
        let array = extract_balanced(&cleaned, '[', ']')?;
        parse_lenient(array)
    });

    match value {
        Some(Value::Array(items)) => Ok(items),
        Some(Value::Object(obj)) => obj
            .into_iter()
            .find_map(|(_, v)| match v {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .ok_or_else(|| EngineError::Parse("expected a JSON array, got an object".into())),
        Some(other) => Err(EngineError::Parse(format!(
            "expected a JSON array, got {}",
            other
        ))),
        None => Err(EngineError::Parse(format!(
            "no JSON array found in: {}",
            truncate(raw, 200)
        ))),
    }
}

/// Parse a JSON object out of model output
pub fn parse_json_object(raw: &str) -> Result<Value> {
    let cleaned = strip_code_fence(raw);

    let value = parse_lenient(&cleaned).or_else(|| {
        let object = extract_balanced(&cleaned, '{', '}')?;
        parse_lenient(object)
    });

    match value {
        Some(value @ Value::Object(_)) => Ok(value),
        Some(Value::Array(items)) => items
            .into_iter()
            .find(Value::is_object)
            .ok_or_else(|| EngineError::Parse("expected a JSON object".into())),
        _ => Err(EngineError::Parse(format!(
            "no JSON object found in: {}",
            truncate(raw, 200)
        ))),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_array() {
        let items = parse_json_array(r#"[{"name": "Alice"}]"#).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_fenced_array() {
        let raw = "```json\n[{\"name\": \"Alice\"}, {\"name\": \"Bob\"}]\n```";
        assert_eq!(parse_json_array(raw).unwrap().len(), 2);
    }

    #[test]
    fn test_array_inside_prose() {
        let raw = "Sure! Here are the entities:\n[{\"name\": \"a [b]\"}]\nLet me know if you need more.";
        let items = parse_json_array(raw).unwrap();
        assert_eq!(items[0]["name"], "a [b]");
    }

    #[test]
    fn test_trailing_commas() {
        let raw = r#"[{"name": "Alice", "note": "x, ]"},]"#;
        let items = parse_json_array(raw).unwrap();
        assert_eq!(items[0]["note"], "x, ]");
    }

    #[test]
    fn test_wrapped_array() {
        let items = parse_json_array(r#"{"entities": [{"name": "Alice"}]}"#).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = parse_json_array("I could not find any entities.").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
        assert!(parse_json_array("[{\"name\": ").is_err());
    }

    #[test]
    fn test_object_in_prose() {
        let raw = "Here you go: {\"title\": \"AI labs\", \"summary\": \"Groups {labs}.\"} Thanks";
        let value = parse_json_object(raw).unwrap();
        assert_eq!(value["title"], "AI labs");
        assert_eq!(value["summary"], "Groups {labs}.");
    }
}
