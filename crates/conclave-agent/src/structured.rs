use conclave_core::{ConclaveError, ConclaveResult};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").unwrap_or_else(|_| unreachable!())
    })
}

/// Finds the span of the first balanced `{...}` or `[...]` in `text`,
/// ignoring brackets inside string literals.
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
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
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extracts the JSON document from a model reply.
///
/// Accepts a bare JSON reply, a fenced ```json block, or JSON embedded in
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed);
    }
    if let Some(caps) = fence_re().captures(text) {
        if let Some(body) = caps.get(1) {
            let body = body.as_str().trim();
            if serde_json::from_str::<serde_json::Value>(body).is_ok() {
                return Some(body);
            }
        }
    }
    balanced_span(text)
}

/// Extracts and deserializes the JSON document in a model reply.
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> ConclaveResult<T> {
    let json = extract_json(text)
        .ok_or_else(|| ConclaveError::Agent("reply contains no JSON document".into()))?;
    serde_json::from_str(json)
        .map_err(|e| ConclaveError::Agent(format!("reply JSON does not match the schema: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Step {
        step: u32,
    }

    #[test]
    fn test_bare_json() {
        assert_eq!(extract_json("  {\"step\": 1} "), Some("{\"step\": 1}"));
    }

    #[test]
    fn test_fenced_json() {
        let reply = "Here you go:\n```json\n[{\"step\": 1}, {\"step\": 2}]\n```\nGood luck.";
        let steps: Vec<Step> = parse_structured(reply).unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_embedded_json_with_braces_in_strings() {
        let reply = r#"Sure! {"step": 3, "note": "use } carefully"} hope that helps"#;
        assert_eq!(
            extract_json(reply),
            Some(r#"{"step": 3, "note": "use } carefully"}"#)
        );
        let step: Step = parse_structured(reply).unwrap();
        assert_eq!(step, Step { step: 3 });
    }

    #[test]
    fn test_no_json() {
        let err = parse_structured::<Step>("no structure here").unwrap_err();
        assert!(err.to_string().contains("no JSON document"));
    }

    #[test]
    fn test_schema_mismatch() {
        let err = parse_structured::<Step>("{\"steps\": 1}").unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
