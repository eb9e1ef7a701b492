//! Enrichment engine: classifies staged candidates through the generative
//! backend, in batches first, falling back to per-item schema-constrained
//! calls when a batch cannot be parsed.

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::gemini::{classification_schema, GeminiClient};
use crate::github::GitHubClient;
use crate::repair::{parse_lenient, parse_lenient_array};
use crate::types::{ArtifactType, Candidate, Category, EnrichedFields, MAX_TAGS};

/// Candidates packed into one free-form batch call.
pub const BATCH_SIZE: usize = 12;

/// Concurrent single-item fallback calls. Each worker's retry/backoff runs
/// independently inside the fetcher.
pub const WORKERS: usize = 5;

/// README text included in a single-item prompt is capped at this many chars.
const README_EXCERPT_CHARS: usize = 4000;

/// One candidate's classification outcome. Err carries a short reason for
/// the staging store's last_error column.
pub struct EnrichOutcome {
    pub candidate: Candidate,
    pub result: Result<EnrichedFields, String>,
}

pub struct Enricher<'a> {
    gemini: &'a GeminiClient,
    github: &'a GitHubClient,
}

impl<'a> Enricher<'a> {
    pub fn new(gemini: &'a GeminiClient, github: &'a GitHubClient) -> Self {
        Self { gemini, github }
    }

    /// Classify a wave of candidates. Every input candidate appears in the
    /// output exactly once, enriched or failed; nothing is silently dropped.
    pub async fn enrich_wave(&self, candidates: Vec<Candidate>) -> Vec<EnrichOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        let chunks: Vec<Vec<Candidate>> = candidates
            .chunks(BATCH_SIZE)
            .map(|c| c.to_vec())
            .collect();

        for chunk in chunks {
            match self.classify_batch(&chunk).await {
                Some(fields) => {
                    for (candidate, f) in chunk.into_iter().zip(fields) {
                        outcomes.push(EnrichOutcome {
                            candidate,
                            result: Ok(f),
                        });
                    }
                }
                None => {
                    eprintln!(
                        "  \x1b[33m..\x1b[0m batch of {} unparseable, falling back to single calls",
                        chunk.len()
                    );
                    let singles = stream::iter(chunk)
                        .map(|candidate| async move {
                            let result = self.classify_single(&candidate).await;
                            EnrichOutcome { candidate, result }
                        })
                        .buffer_unordered(WORKERS)
                        .collect::<Vec<_>>()
                        .await;
                    outcomes.extend(singles);
                }
            }
        }
        outcomes
    }

    /// One free-form call for a whole chunk. Any parse or shape failure
    /// fails the batch as a unit; the caller falls back to single calls.
    async fn classify_batch(&self, chunk: &[Candidate]) -> Option<Vec<EnrichedFields>> {
        let prompt = batch_prompt(chunk);
        let text = match self.gemini.generate(&prompt).await {
            Ok(t) => t,
            Err(e) => {
                eprintln!("  \x1b[33m..\x1b[0m batch call failed: {}", e);
                return None;
            }
        };
        parse_batch(&text, chunk)
    }

    /// Single-item fallback: schema-constrained output, with the README
    /// fetched lazily to give the model more to work with.
    async fn classify_single(&self, candidate: &Candidate) -> Result<EnrichedFields, String> {
        let readme = match &candidate.readme {
            Some(r) => Some(r.clone()),
            None => self
                .github
                .get_readme(&candidate.repo_id)
                .await
                .unwrap_or(None),
        };
        let prompt = single_prompt(candidate, readme.as_deref());
        let text = self
            .gemini
            .generate_json(&prompt, &classification_schema())
            .await
            .map_err(|e| format!("generation failed: {}", e))?;
        let value =
            parse_lenient(&text).ok_or_else(|| "unparseable model output".to_string())?;
        validate_fields(&value, candidate.hint)
            .ok_or_else(|| "model output missing required fields".to_string())
    }
}

fn candidate_block(index: usize, c: &Candidate) -> String {
    format!(
        "{}. repo: {}\n   description: {}\n   language: {}\n   topics: {}\n   stars: {}\n",
        index + 1,
        c.repo_id,
        c.description.as_deref().unwrap_or("(none)"),
        c.language.as_deref().unwrap_or("(unknown)"),
        c.topics.join(", "),
        c.stars
    )
}

fn taxonomy_instructions() -> String {
    format!(
        "For each repository return an object with:\n\
         - \"type\": one of {}\n\
         - \"category\": one of coding, data, devops, productivity, research, content, automation, security, other\n\
         - \"tags\": up to {} short lowercase tags\n\
         - \"install\": a one-line install command or instruction\n\
         - \"platforms\": subset of {}\n\
         - \"summary\": one sentence, plain text\n",
        ArtifactType::ALL
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        MAX_TAGS,
        crate::types::PLATFORMS.join(", ")
    )
}

fn batch_prompt(chunk: &[Candidate]) -> String {
    let mut prompt = String::from(
        "Classify these repositories from the AI-tooling ecosystem.\n\
         Respond with ONLY a JSON array, one object per repository, in the same order.\n\n",
    );
    prompt.push_str(&taxonomy_instructions());
    prompt.push_str("\nRepositories:\n");
    for (i, c) in chunk.iter().enumerate() {
        prompt.push_str(&candidate_block(i, c));
    }
    prompt
}

fn single_prompt(candidate: &Candidate, readme: Option<&str>) -> String {
    let mut prompt = String::from(
        "Classify this repository from the AI-tooling ecosystem.\n\n",
    );
    prompt.push_str(&taxonomy_instructions());
    prompt.push_str("\nRepository:\n");
    prompt.push_str(&candidate_block(0, candidate));
    if let Some(readme) = readme {
        prompt.push_str("\nREADME:\n");
        prompt.push_str(&truncate_chars(readme, README_EXCERPT_CHARS));
    }
    prompt
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Parse a batch response: a same-order array with exactly one object per
/// candidate, each validating against the taxonomy. Anything else is a batch
/// failure.
fn parse_batch(text: &str, chunk: &[Candidate]) -> Option<Vec<EnrichedFields>> {
    let items = parse_lenient_array(text)?;
    if items.len() != chunk.len() {
        return None;
    }
    items
        .iter()
        .zip(chunk)
        .map(|(item, c)| validate_fields(item, c.hint))
        .collect()
}

/// Coerce one model object into the closed taxonomy. Out-of-vocabulary
/// values degrade field-by-field rather than rejecting the record; only a
/// non-object yields None.
fn validate_fields(value: &Value, hint: ArtifactType) -> Option<EnrichedFields> {
    if !value.is_object() {
        return None;
    }
    let kind = value["type"]
        .as_str()
        .and_then(ArtifactType::parse)
        .unwrap_or(hint);
    let category = value["category"]
        .as_str()
        .map(Category::coerce)
        .unwrap_or(Category::Other);
    let mut tags: Vec<String> = value["tags"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    tags.truncate(MAX_TAGS);
    let platforms: Vec<String> = value["platforms"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|p| p.as_str())
                .filter_map(crate::types::coerce_platform)
                .collect()
        })
        .unwrap_or_default();
    Some(EnrichedFields {
        kind,
        category,
        tags,
        install: value["install"].as_str().unwrap_or("").trim().to_string(),
        platforms,
        summary: value["summary"].as_str().unwrap_or("").trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(id: &str) -> Candidate {
        Candidate::new(id, ArtifactType::McpServer)
    }

    #[test]
    fn test_validate_fields_happy_path() {
        let value = json!({
            "type": "skill",
            "category": "coding",
            "tags": ["Git", "automation"],
            "install": " npx foo ",
            "platforms": ["Claude Code", "emacs", "cursor"],
            "summary": "Does things."
        });
        let f = validate_fields(&value, ArtifactType::McpServer).unwrap();
        assert_eq!(f.kind, ArtifactType::Skill);
        assert_eq!(f.category, Category::Coding);
        assert_eq!(f.tags, vec!["git", "automation"]);
        assert_eq!(f.install, "npx foo");
        // Unknown platform dropped, known ones normalized
        assert_eq!(f.platforms, vec!["claude-code", "cursor"]);
    }

    #[test]
    fn test_validate_fields_coerces_out_of_taxonomy() {
        let value = json!({
            "type": "quantum-agent",
            "category": "gardening",
            "tags": [],
            "install": "",
            "platforms": [],
            "summary": "x"
        });
        let f = validate_fields(&value, ArtifactType::RuleSet).unwrap();
        assert_eq!(f.kind, ArtifactType::RuleSet); // falls back to the hint
        assert_eq!(f.category, Category::Other);
    }

    #[test]
    fn test_validate_fields_truncates_tags() {
        let tags: Vec<String> = (0..20).map(|i| format!("t{}", i)).collect();
        let value = json!({"type": "skill", "category": "coding", "tags": tags});
        let f = validate_fields(&value, ArtifactType::Skill).unwrap();
        assert_eq!(f.tags.len(), MAX_TAGS);
    }

    #[test]
    fn test_validate_fields_rejects_non_object() {
        assert!(validate_fields(&json!("nope"), ArtifactType::Skill).is_none());
        assert!(validate_fields(&json!(null), ArtifactType::Skill).is_none());
    }

    #[test]
    fn test_parse_batch_same_order() {
        let chunk = vec![candidate("a/one"), candidate("b/two")];
        let text = r#"```json
        [
            {"type": "mcp-server", "category": "coding", "summary": "first",},
            {"type": "skill", "category": "data", "summary": "second"}
        ]
        ```"#;
        let fields = parse_batch(text, &chunk).unwrap();
        assert_eq!(fields[0].summary, "first");
        assert_eq!(fields[1].kind, ArtifactType::Skill);
    }

    #[test]
    fn test_parse_batch_length_mismatch_fails() {
        let chunk = vec![candidate("a/one"), candidate("b/two")];
        let text = r#"[{"type": "skill", "category": "coding"}]"#;
        assert!(parse_batch(text, &chunk).is_none());
    }

    #[test]
    fn test_batch_prompt_lists_all_repos() {
        let chunk = vec![candidate("a/one"), candidate("b/two")];
        let prompt = batch_prompt(&chunk);
        assert!(prompt.contains("a/one"));
        assert!(prompt.contains("b/two"));
        assert!(prompt.contains("same order"));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
