//! Tolerant parsing for near-JSON model output.
//!
//! Generative backends wrap arrays in markdown fences, leave trailing commas,
//! and emit raw newlines inside string values. Repair proceeds through an
//! ordered cascade of pure text stages, each followed by a parse attempt;
//! stages that do not apply leave the text unchanged.

use serde_json::Value;

/// Run the full cascade. Returns the first stage's output that parses as
/// JSON, or None when every stage fails (callers then fall back from batch
/// to single-item calls).
pub fn parse_lenient(raw: &str) -> Option<Value> {
    let defenced = strip_fences(raw);
    let decommaed = strip_trailing_commas(&defenced);

    if let Ok(v) = serde_json::from_str(&decommaed) {
        return Some(v);
    }

    // The model often prefixes prose; pull out the outermost array.
    if let Some(extracted) = extract_array(&decommaed) {
        if let Ok(v) = serde_json::from_str(&extracted) {
            return Some(v);
        }

        // Raw control characters inside quoted spans break the parse even
        // when the structure is fine. Re-escape them string-aware.
        let escaped = escape_control_chars_in_strings(&extracted);
        if let Ok(v) = serde_json::from_str(&escaped) {
            return Some(v);
        }

        // Last resort: drop every remaining control character.
        let stripped: String = escaped.chars().filter(|c| !c.is_control()).collect();
        if let Ok(v) = serde_json::from_str(&stripped) {
            return Some(v);
        }
    } else {
        let escaped = escape_control_chars_in_strings(&decommaed);
        if let Ok(v) = serde_json::from_str(&escaped) {
            return Some(v);
        }
        let stripped: String = escaped.chars().filter(|c| !c.is_control()).collect();
        if let Ok(v) = serde_json::from_str(&stripped) {
            return Some(v);
        }
    }

    None
}

/// Parse a lenient value that must be an array; single objects are wrapped so
/// a one-item batch still comes back as a batch.
pub fn parse_lenient_array(raw: &str) -> Option<Vec<Value>> {
    match parse_lenient(raw)? {
        Value::Array(items) => Some(items),
        obj @ Value::Object(_) => Some(vec![obj]),
        _ => None,
    }
}

/// Strip markdown code fences (```json ... ``` or bare ```), keeping the
/// inner text. Unfenced input is returned unchanged.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.contains("```") {
        return trimmed.to_string();
    }
    let mut out = Vec::new();
    let mut in_fence = false;
    for line in trimmed.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push(line);
        }
    }
    if out.is_empty() {
        // Fence markers present but nothing captured (e.g. inline fences):
        // fall back to removing the markers in place.
        trimmed.replace("```json", "").replace("```", "")
    } else {
        out.join("\n")
    }
}

/// Remove commas that directly precede a closing bracket/brace, outside of
/// string values.
pub fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                // Lookahead past whitespace: drop the comma when the next
                // significant char closes a container.
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, Some(']') | Some('}')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Extract the outermost JSON array via bracket matching, ignoring brackets
/// inside string values. Handles leading prose before the array.
pub fn extract_array(text: &str) -> Option<String> {
    let bytes: Vec<char> = text.chars().collect();
    let start = bytes.iter().position(|&c| c == '[')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(bytes[start..=i].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

/// Walk the text and re-escape raw control characters found *inside* quoted
/// spans only. A string-aware scanner, not a blind regex: control characters
/// between values (pretty-printing newlines) are legal JSON and left alone.
pub fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    out.push(c);
                    escaped = true;
                }
                '"' => {
                    out.push(c);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_passes_through() {
        let v = parse_lenient(r#"[{"type": "skill"}]"#).unwrap();
        assert_eq!(v[0]["type"], "skill");
    }

    #[test]
    fn test_markdown_fenced() {
        let raw = "```json\n[{\"type\": \"mcp-server\"}]\n```";
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["type"], "mcp-server");
    }

    #[test]
    fn test_bare_fence() {
        let raw = "```\n[{\"type\": \"skill\"}]\n```";
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["type"], "skill");
    }

    #[test]
    fn test_trailing_commas() {
        let raw = r#"[{"type": "skill", "tags": ["a", "b",],},]"#;
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["tags"][1], "b");
    }

    #[test]
    fn test_trailing_comma_not_removed_inside_string() {
        let raw = r#"[{"install": "npm i x, then run,"}]"#;
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["install"], "npm i x, then run,");
    }

    #[test]
    fn test_leading_prose_before_array() {
        let raw = "Here are the classifications you asked for:\n[{\"type\": \"rule-set\"}]";
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["type"], "rule-set");
    }

    #[test]
    fn test_raw_newline_inside_string_value() {
        let raw = "[{\"type\": \"skill\", \"summary\": \"line one\nline two\"}]";
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["summary"], "line one\nline two");
    }

    #[test]
    fn test_raw_tab_inside_string_value() {
        let raw = "[{\"type\": \"skill\", \"install\": \"step1\tstep2\"}]";
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["install"], "step1\tstep2");
    }

    #[test]
    fn test_pretty_printed_newlines_untouched() {
        // Newlines between values are legal; the scanner must not escape them.
        let raw = "[\n  {\n    \"type\": \"skill\"\n  }\n]";
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["type"], "skill");
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let raw = r#"[{"summary": "a \"quoted\" word"}]"#;
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["summary"], "a \"quoted\" word");
    }

    #[test]
    fn test_brackets_inside_strings_ignored_by_extractor() {
        let raw = r#"noise [{"summary": "uses [0] indexing"}] trailing"#;
        let extracted = extract_array(raw).unwrap();
        let v: Vec<Value> = serde_json::from_str(&extracted).unwrap();
        assert_eq!(v[0]["summary"], "uses [0] indexing");
    }

    #[test]
    fn test_combined_fence_prose_commas_and_newlines() {
        let raw = "Sure! Here's the JSON:\n```json\n[{\"type\": \"workflow-node\", \"summary\": \"does\nthings\", \"tags\": [\"x\",],}]\n```";
        let v = parse_lenient_array(raw).unwrap();
        assert_eq!(v[0]["type"], "workflow-node");
        assert_eq!(v[0]["summary"], "does\nthings");
    }

    #[test]
    fn test_hopeless_input_returns_none() {
        assert!(parse_lenient("I could not classify these repositories.").is_none());
        assert!(parse_lenient("").is_none());
    }

    #[test]
    fn test_single_object_wrapped_as_array() {
        let v = parse_lenient_array(r#"{"type": "skill"}"#).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0]["type"], "skill");
    }

    #[test]
    fn test_repair_corpus_first_element_has_type() {
        // Representative malformed corpus per the pipeline's contract: every
        // entry must yield a well-formed array whose first element carries
        // the classification field.
        let corpus = [
            "```json\n[{\"type\":\"skill\"}]\n```",
            "[{\"type\":\"skill\",},]",
            "[{\"type\":\"skill\",\"summary\":\"a\nb\tc\"}]",
            "The results:\n\n[{\"type\":\"skill\"}]",
        ];
        for raw in corpus {
            let v = parse_lenient_array(raw).unwrap_or_else(|| panic!("failed on {:?}", raw));
            assert_eq!(v[0]["type"], "skill", "corpus entry {:?}", raw);
        }
    }
}
