//! Best-effort parsing of JSON produced by language models.
//!
//! Models wrap JSON in markdown fences, prepend prose, or emit trailing
//! commentary. `loads` digs the object out instead of failing.

/// Try to parse `text` as JSON, tolerating fences and surrounding prose.
pub fn loads(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    let unfenced = strip_code_fence(trimmed);
    if let Ok(v) = serde_json::from_str(unfenced) {
        return Some(v);
    }

    // Slice the outermost object or array out of surrounding prose.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(candidate) = outermost(unfenced, open, close) {
            if let Ok(v) = serde_json::from_str(candidate) {
                return Some(v);
            }
        }
    }

    None
}

fn strip_code_fence(text: &str) -> &str {
    let t = text.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    // Skip an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

fn outermost(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_parses() {
        let v = loads(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn fenced_json_parses() {
        let v = loads("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn json_with_surrounding_prose_parses() {
        let v = loads("Here is the plan:\n{\"search_queries\": [\"x\"]}\nGood luck!").unwrap();
        assert_eq!(v["search_queries"][0], "x");
    }

    #[test]
    fn arrays_are_sliced_too() {
        let v = loads("result: [1, 2, 3] done").unwrap();
        assert_eq!(v.as_array().unwrap().len(), 3);
    }

    #[test]
    fn hopeless_text_returns_none() {
        assert!(loads("no structure here at all").is_none());
        assert!(loads("").is_none());
    }
}
