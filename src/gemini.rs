//! Gemini generateContent client.
//!
//! Two output modes: free-form text (batch classification, repaired
//! downstream) and schema-constrained JSON (single-item calls, where the
//! schema eliminates most parsing failures).

use serde_json::{json, Value};

use crate::fetcher::{FetchError, FetchResult, HttpFetcher};

const MODEL: &str = "gemini-2.0-flash";

pub struct GeminiClient {
    fetcher: HttpFetcher,
    api_key: String,
}

impl GeminiClient {
    pub fn new(fetcher: HttpFetcher, api_key: &str) -> Self {
        Self {
            fetcher,
            api_key: api_key.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            MODEL, self.api_key
        )
    }

    /// Free-form generation. The returned text is near-JSON at best; callers
    /// run it through the repair cascade.
    pub async fn generate(&self, prompt: &str) -> FetchResult<String> {
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": 0.1}
        });
        let response = self.fetcher.post_json(&self.endpoint(), &[], &body).await?;
        extract_text(&response)
    }

    /// Schema-constrained generation: the model is forced to emit JSON
    /// matching `schema`, so the result usually parses directly.
    pub async fn generate_json(&self, prompt: &str, schema: &Value) -> FetchResult<String> {
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json",
                "responseSchema": schema
            }
        });
        let response = self.fetcher.post_json(&self.endpoint(), &[], &body).await?;
        extract_text(&response)
    }
}

/// Response shape: candidates[0].content.parts[*].text, concatenated. A
/// response with no candidates (safety block, empty generation) is retryable.
fn extract_text(response: &Value) -> FetchResult<String> {
    let parts = response
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());
    let Some(parts) = parts else {
        return Err(FetchError::Retryable(format!(
            "generation returned no candidates: {}",
            truncate_for_log(response)
        )));
    };
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.trim().is_empty() {
        return Err(FetchError::Retryable("generation returned empty text".into()));
    }
    Ok(text)
}

fn truncate_for_log(v: &Value) -> String {
    let mut s = v.to_string();
    if s.len() > 200 {
        s.truncate(200);
        s.push_str("...");
    }
    s
}

/// Response schema for a single classification result.
pub fn classification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "type": {"type": "string"},
            "category": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "install": {"type": "string"},
            "platforms": {"type": "array", "items": {"type": "string"}},
            "summary": {"type": "string"}
        },
        "required": ["type", "category", "tags", "install", "platforms", "summary"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_concatenates_parts() {
        let response = json!({
            "candidates": [{"content": {"parts": [
                {"text": "[{\"type\":"},
                {"text": "\"skill\"}]"}
            ]}}]
        });
        assert_eq!(extract_text(&response).unwrap(), "[{\"type\":\"skill\"}]");
    }

    #[test]
    fn test_extract_text_empty_is_retryable() {
        let err = extract_text(&json!({"candidates": []})).unwrap_err();
        assert!(matches!(err, FetchError::Retryable(_)));
        let err = extract_text(&json!({
            "candidates": [{"content": {"parts": [{"text": "  "}]}}]
        }))
        .unwrap_err();
        assert!(matches!(err, FetchError::Retryable(_)));
    }

    #[test]
    fn test_classification_schema_fields() {
        let schema = classification_schema();
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 6);
    }
}
