//! Staging table adapter: discovered-but-not-yet-classified candidates,
//! keyed by canonical repo id.
//!
//! Rediscovery refreshes metadata but must never regress a settled status or
//! reset the attempt counter, so upserts here are read-merge-write at the
//! adapter level. Batched writes degrade to per-record writes when a batch
//! fails, isolating the bad record.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::types::{ArtifactType, Candidate, EnrichStatus};
use crate::store::{Filter, SelectQuery, Store};

pub const TABLE: &str = "candidates";

/// Cumulative enrichment failures before a candidate is parked for good.
pub const MAX_ENRICH_ATTEMPTS: u32 = 3;

const WRITE_BATCH: usize = 50;

pub struct StagingStore<'a> {
    store: &'a dyn Store,
}

impl<'a> StagingStore<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Upsert a wave of discovered candidates. Returns the number written.
    pub async fn upsert(&self, candidates: &[Candidate]) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }

        // Fetch the existing rows for these ids so status/attempts survive
        // rediscovery untouched. The select-to-write window is not atomic:
        // a candidate settled by a concurrent run in between is written back
        // as pending, re-enters the pending pool, and re-settles on the next
        // enrich pass. Every write converges, none is lost.
        let ids: Vec<String> = candidates.iter().map(|c| c.canonical_id()).collect();
        let existing = self
            .store
            .select(
                TABLE,
                &SelectQuery::default().filter(Filter::In("repo_id".into(), ids)),
            )
            .await?;
        let existing: HashMap<String, &Value> = existing
            .iter()
            .filter_map(|row| row["repo_id"].as_str().map(|id| (id.to_string(), row)))
            .collect();

        let rows: Vec<Value> = candidates
            .iter()
            .map(|c| self.merge_row(c, existing.get(c.canonical_id().as_str()).copied()))
            .collect();

        let mut written = 0;
        for chunk in rows.chunks(WRITE_BATCH) {
            match self.store.upsert(TABLE, chunk.to_vec(), "repo_id").await {
                Ok(rows) => written += rows.len(),
                Err(e) => {
                    // One malformed record must not block the batch.
                    eprintln!(
                        "\x1b[33m..\x1b[0m staging batch failed ({}), retrying per-record",
                        e
                    );
                    for row in chunk {
                        match self.store.upsert(TABLE, vec![row.clone()], "repo_id").await {
                            Ok(_) => written += 1,
                            Err(e) => {
                                let id = row["repo_id"].as_str().unwrap_or("?");
                                eprintln!("  \x1b[31mx\x1b[0m {} not staged: {}", id, e);
                            }
                        }
                    }
                }
            }
        }
        Ok(written)
    }

    /// Metadata fields refresh on rediscovery; status/attempt fields are
    /// append-only and carried over from the existing row.
    fn merge_row(&self, c: &Candidate, existing: Option<&Value>) -> Value {
        let mut row = json!({
            "repo_id": c.canonical_id(),
            "display_name": c.repo_id,
            "hint": c.hint.as_str(),
            "description": c.description,
            "language": c.language,
            "stars": c.stars,
            "forks": c.forks,
            "topics": c.topics,
            "pushed_at": c.pushed_at.map(|t| t.to_rfc3339()),
            "created_at": c.created_at.map(|t| t.to_rfc3339()),
            "status": EnrichStatus::Pending.as_str(),
            "attempts": 0,
        });
        if let Some(prev) = existing {
            let settled = prev["status"]
                .as_str()
                .and_then(EnrichStatus::parse)
                .map(|s| s.is_settled() || s == EnrichStatus::Failed)
                .unwrap_or(false);
            if settled {
                row["status"] = prev["status"].clone();
            }
            row["attempts"] = prev["attempts"].clone();
            if !prev["artifact_id"].is_null() {
                row["artifact_id"] = prev["artifact_id"].clone();
            }
            if !prev["last_error"].is_null() {
                row["last_error"] = prev["last_error"].clone();
            }
        }
        row
    }

    /// Candidates still eligible for enrichment: pending, plus failed ones
    /// with attempts below the cap. Skipped is terminal and never selected.
    pub async fn list_pending(
        &self,
        type_filter: Option<ArtifactType>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let mut query = SelectQuery::default()
            .filter(Filter::In(
                "status".into(),
                vec!["pending".into(), "failed".into()],
            ))
            .filter(Filter::Lt("attempts".into(), MAX_ENRICH_ATTEMPTS as i64))
            .order_by("stars", true)
            .limit(limit);
        if let Some(kind) = type_filter {
            query = query.filter(Filter::Eq("hint".into(), kind.as_str().into()));
        }
        let rows = self.store.select(TABLE, &query).await?;
        Ok(rows.iter().filter_map(row_to_candidate).collect())
    }

    /// Record one candidate's enrichment outcome. Failures increment the
    /// attempt counter; hitting the cap parks the candidate as skipped.
    /// Returns the status actually written.
    pub async fn mark_result(
        &self,
        repo_id: &str,
        status: EnrichStatus,
        error: Option<&str>,
    ) -> Result<EnrichStatus> {
        let (final_status, patch) = match status {
            EnrichStatus::Failed => {
                let attempts = self.current_attempts(repo_id).await? + 1;
                let final_status = if attempts >= MAX_ENRICH_ATTEMPTS {
                    EnrichStatus::Skipped
                } else {
                    EnrichStatus::Failed
                };
                (
                    final_status,
                    json!({
                        "status": final_status.as_str(),
                        "attempts": attempts,
                        "last_error": error,
                    }),
                )
            }
            other => (
                other,
                json!({
                    "status": other.as_str(),
                    "last_error": error,
                }),
            ),
        };
        self.store
            .patch(TABLE, &[Filter::Eq("repo_id".into(), repo_id.into())], patch)
            .await
            .with_context(|| format!("failed to mark {} as {}", repo_id, status.as_str()))?;
        Ok(final_status)
    }

    /// Link a candidate to its canonical artifact and settle it.
    pub async fn link_artifact(&self, repo_id: &str, artifact_id: i64) -> Result<()> {
        self.store
            .patch(
                TABLE,
                &[Filter::Eq("repo_id".into(), repo_id.into())],
                json!({
                    "status": EnrichStatus::Enriched.as_str(),
                    "artifact_id": artifact_id,
                    "last_error": Value::Null,
                }),
            )
            .await?;
        Ok(())
    }

    async fn current_attempts(&self, repo_id: &str) -> Result<u32> {
        let rows = self
            .store
            .select(
                TABLE,
                &SelectQuery::default()
                    .filter(Filter::Eq("repo_id".into(), repo_id.into()))
                    .limit(1),
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r["attempts"].as_u64())
            .unwrap_or(0) as u32)
    }
}

fn row_to_candidate(row: &Value) -> Option<Candidate> {
    let repo_id = row["display_name"]
        .as_str()
        .or_else(|| row["repo_id"].as_str())?
        .to_string();
    let hint = row["hint"]
        .as_str()
        .and_then(ArtifactType::parse)
        .unwrap_or(ArtifactType::FrameworkTool);
    let mut c = Candidate::new(repo_id, hint);
    c.description = row["description"].as_str().map(String::from);
    c.language = row["language"].as_str().map(String::from);
    c.stars = row["stars"].as_u64().unwrap_or(0);
    c.forks = row["forks"].as_u64().unwrap_or(0);
    c.topics = row["topics"]
        .as_array()
        .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
        .unwrap_or_default();
    c.pushed_at = row["pushed_at"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc));
    c.created_at = row["created_at"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc));
    c.status = row["status"]
        .as_str()
        .and_then(EnrichStatus::parse)
        .unwrap_or(EnrichStatus::Pending);
    c.attempts = row["attempts"].as_u64().unwrap_or(0) as u32;
    c.last_error = row["last_error"].as_str().map(String::from);
    c.artifact_id = row["artifact_id"].as_i64();
    Some(c)
}
