//! Bulk-dataset discoverer over the public GitHub corpus in BigQuery.
//!
//! Finds repos by marker file paths (SKILL.md at the root, .cursorrules,
//! mcp.json) in the `github_repos.files` table. Every query dry-runs first;
//! anything above the byte ceiling is skipped with a warning rather than
//! billed.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde_json::json;

use crate::fetcher::HttpFetcher;
use crate::types::{ArtifactType, Candidate};

/// Processed-bytes ceiling per query. `github_repos.files` is multi-TB if
/// scanned naively.
const MAX_QUERY_BYTES: u64 = 20 * 1024 * 1024 * 1024;

const QUERY_TIMEOUT_MS: u64 = 60_000;
const MAX_ROWS: u64 = 1000;

/// (SQL, type label) pairs run in discover mode.
pub fn default_dataset_queries() -> Vec<(String, ArtifactType)> {
    vec![
        (
            marker_query("SKILL.md"),
            ArtifactType::Skill,
        ),
        (
            marker_query(".cursorrules"),
            ArtifactType::RuleSet,
        ),
        (
            marker_query("mcp.json"),
            ArtifactType::McpServer,
        ),
    ]
}

fn marker_query(filename: &str) -> String {
    format!(
        "SELECT DISTINCT repo_name FROM `bigquery-public-data.github_repos.files` \
         WHERE path = '{}' LIMIT {}",
        filename, MAX_ROWS
    )
}

pub struct DatasetClient {
    fetcher: HttpFetcher,
    project: String,
    access_token: String,
}

impl DatasetClient {
    pub fn new(fetcher: HttpFetcher, project: &str, access_token: &str) -> Self {
        Self {
            fetcher,
            project: project.to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/queries",
            self.project
        )
    }

    async fn run(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let auth = format!("Bearer {}", self.access_token);
        let headers: Vec<(&str, &str)> = vec![("Authorization", auth.as_str())];
        self.fetcher
            .post_json(&self.endpoint(), &headers, body)
            .await
            .context("dataset query failed")
    }

    /// Dry-run cost estimate in bytes processed.
    pub async fn estimate_bytes(&self, sql: &str) -> Result<u64> {
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "dryRun": true,
        });
        let value = self.run(&body).await?;
        let bytes = value
            .get("totalBytesProcessed")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(bytes)
    }

    /// Run one marker query; skips (empty result, warning) when the dry-run
    /// estimate is over the ceiling.
    pub async fn search(
        &self,
        sql: &str,
        hint: ArtifactType,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Candidate>> {
        let bytes = self.estimate_bytes(sql).await?;
        if bytes > MAX_QUERY_BYTES {
            eprintln!(
                "  \x1b[33m..\x1b[0m dataset query would scan {:.1} GB (ceiling {:.0} GB), skipping",
                bytes as f64 / 1e9,
                MAX_QUERY_BYTES as f64 / 1e9
            );
            return Ok(Vec::new());
        }

        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_TIMEOUT_MS,
            "maxResults": MAX_ROWS,
        });
        let value = self.run(&body).await?;
        Ok(rows_to_candidates(&value, hint, seen))
    }
}

/// BigQuery rows come back as `{rows: [{f: [{v: "..."}]}]}`; the first field
/// of each row is the repo name.
fn rows_to_candidates(
    value: &serde_json::Value,
    hint: ArtifactType,
    seen: &mut HashSet<String>,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    let Some(rows) = value.get("rows").and_then(|r| r.as_array()) else {
        return out;
    };
    for row in rows {
        let Some(name) = row
            .get("f")
            .and_then(|f| f.as_array())
            .and_then(|f| f.first())
            .and_then(|cell| cell.get("v"))
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        if !name.contains('/') {
            continue;
        }
        if seen.insert(crate::types::canonical_repo_id(name)) {
            out.push(Candidate::new(name, hint));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_to_candidates() {
        let value = serde_json::json!({
            "rows": [
                {"f": [{"v": "owner/repo-a"}]},
                {"f": [{"v": "owner/repo-a"}]},
                {"f": [{"v": "not-a-repo"}]},
                {"f": [{"v": "Other/Repo-B"}]},
            ]
        });
        let mut seen = HashSet::new();
        let out = rows_to_candidates(&value, ArtifactType::Skill, &mut seen);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].repo_id, "owner/repo-a");
        assert_eq!(out[1].canonical_id(), "other/repo-b");
    }

    #[test]
    fn test_rows_missing_is_empty() {
        let mut seen = HashSet::new();
        let out = rows_to_candidates(&serde_json::json!({}), ArtifactType::Skill, &mut seen);
        assert!(out.is_empty());
    }

    #[test]
    fn test_marker_queries_are_bounded() {
        for (sql, _) in default_dataset_queries() {
            assert!(sql.contains("LIMIT"));
            assert!(sql.contains("github_repos.files"));
        }
    }
}
