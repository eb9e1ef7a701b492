//! Persistence upserter: canonical artifact writes, candidate linking,
//! platform junction rows, and opportunistic contributor records.
//!
//! Artifact writes batch and degrade to per-record on failure, like staging.
//! Junction and contributor writes are independent of the artifact write:
//! their failure is logged, never propagated, and never rolls anything back.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::score::{vibe_score, VibeBreakdown, VibeInputs};
use crate::staging::StagingStore;
use crate::store::{Filter, SelectQuery, Store};
use crate::types::{Artifact, Candidate, EnrichedFields};

pub const TABLE: &str = "artifacts";
pub const PLATFORM_TABLE: &str = "artifact_platforms";
pub const CONTRIBUTOR_TABLE: &str = "contributors";
pub const MENTION_TABLE: &str = "mentions";

const WRITE_BATCH: usize = 25;

/// Assemble the canonical record from a staged candidate and its enrichment,
/// computing the trending score now and leaving vibe components for the
/// scoring pass.
pub fn build_artifact(c: &Candidate, f: &EnrichedFields, now: DateTime<Utc>) -> Artifact {
    Artifact {
        repo_id: c.canonical_id(),
        kind: f.kind,
        category: f.category,
        tags: f.tags.clone(),
        install: f.install.clone(),
        platforms: f.platforms.clone(),
        summary: f.summary.clone(),
        description: c.description.clone(),
        language: c.language.clone(),
        stars: c.stars,
        forks: c.forks,
        topics: c.topics.clone(),
        pushed_at: c.pushed_at,
        trending_score: crate::score::trending_score(c.stars, c.forks, c.pushed_at, now),
        vibe_score: 0,
        vibe_downloads: 0,
        vibe_mentions: 0,
        vibe_quality: 0,
        vibe_sentiment: 0,
        vibe_recency: 0,
        status: "active".into(),
    }
}

fn artifact_row(a: &Artifact) -> Value {
    json!({
        "repo_id": a.repo_id,
        "kind": a.kind.as_str(),
        "category": a.category.as_str(),
        "tags": a.tags,
        "install": a.install,
        "platforms": a.platforms,
        "summary": a.summary,
        "description": a.description,
        "language": a.language,
        "stars": a.stars,
        "forks": a.forks,
        "topics": a.topics,
        "pushed_at": a.pushed_at.map(|t| t.to_rfc3339()),
        "trending_score": a.trending_score,
        "vibe_score": a.vibe_score,
        "vibe_downloads": a.vibe_downloads,
        "vibe_mentions": a.vibe_mentions,
        "vibe_quality": a.vibe_quality,
        "vibe_sentiment": a.vibe_sentiment,
        "vibe_recency": a.vibe_recency,
        "status": a.status,
    })
}

/// A stored artifact picked up by the scoring pass.
#[derive(Debug, Clone)]
pub struct ScoreTarget {
    pub repo_id: String,
    pub name: String,
    pub stars: u64,
    pub forks: u64,
    pub pushed_at: Option<DateTime<Utc>>,
}

pub struct Persister<'a> {
    store: &'a dyn Store,
    /// Run-scoped memo so each owner is upserted at most once per run.
    contributors_seen: HashSet<String>,
}

impl<'a> Persister<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            contributors_seen: HashSet::new(),
        }
    }

    /// Upsert enriched artifacts, then per successful row: link the staged
    /// candidate to the artifact id, write platform junctions, and record the
    /// owner as a contributor. Returns the number of artifacts written.
    pub async fn upsert_artifacts(
        &mut self,
        staging: &StagingStore<'_>,
        artifacts: &[Artifact],
    ) -> Result<usize> {
        let mut written: Vec<Value> = Vec::new();
        for chunk in artifacts.chunks(WRITE_BATCH) {
            let rows: Vec<Value> = chunk.iter().map(artifact_row).collect();
            match self.store.upsert(TABLE, rows.clone(), "repo_id").await {
                Ok(returned) => written.extend(returned),
                Err(e) => {
                    eprintln!(
                        "\x1b[33m..\x1b[0m artifact batch failed ({}), retrying per-record",
                        e
                    );
                    for row in rows {
                        let id = row["repo_id"].as_str().unwrap_or("?").to_string();
                        match self.store.upsert(TABLE, vec![row], "repo_id").await {
                            Ok(returned) => written.extend(returned),
                            Err(e) => eprintln!("  \x1b[31mx\x1b[0m {} not saved: {}", id, e),
                        }
                    }
                }
            }
        }

        for row in &written {
            let (Some(repo_id), Some(artifact_id)) =
                (row["repo_id"].as_str(), row["id"].as_i64())
            else {
                continue;
            };
            if let Err(e) = staging.link_artifact(repo_id, artifact_id).await {
                eprintln!("  \x1b[33m..\x1b[0m {} not linked: {}", repo_id, e);
            }
            let platforms: Vec<String> = row["platforms"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|p| p.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            self.write_platforms(artifact_id, &platforms).await;
            if let Some(owner) = repo_id.split('/').next() {
                self.ensure_contributor(owner).await;
            }
        }

        Ok(written.len())
    }

    /// Junction rows carry a single synthetic key column since the store's
    /// conflict resolution is single-column.
    async fn write_platforms(&self, artifact_id: i64, platforms: &[String]) {
        if platforms.is_empty() {
            return;
        }
        let rows: Vec<Value> = platforms
            .iter()
            .map(|p| {
                json!({
                    "key": format!("{}:{}", artifact_id, p),
                    "artifact_id": artifact_id,
                    "platform": p,
                })
            })
            .collect();
        if let Err(e) = self.store.upsert(PLATFORM_TABLE, rows, "key").await {
            eprintln!(
                "  \x1b[33m..\x1b[0m platform rows for artifact {} not saved: {}",
                artifact_id, e
            );
        }
    }

    async fn ensure_contributor(&mut self, owner: &str) {
        let owner = owner.to_lowercase();
        if owner.is_empty() || !self.contributors_seen.insert(owner.clone()) {
            return;
        }
        let row = json!({
            "username": owner,
            "profile_url": format!("https://github.com/{}", owner),
        });
        if let Err(e) = self.store.upsert(CONTRIBUTOR_TABLE, vec![row], "username").await {
            eprintln!("  \x1b[33m..\x1b[0m contributor {} not saved: {}", owner, e);
        }
    }

    /// Record collected mentions, keyed on (source, external_id) folded into
    /// one column like the platform junctions. A mention is immutable once
    /// stored: re-collecting one patches only its sentiment (the analysis
    /// backfill can land after the first write), never score or title.
    pub async fn upsert_mentions(&self, mentions: &[crate::types::Mention]) -> Result<usize> {
        if mentions.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = mentions
            .iter()
            .map(|m| format!("{}:{}", m.source, m.external_id))
            .collect();
        let existing: HashSet<String> = self
            .store
            .select(
                MENTION_TABLE,
                &SelectQuery::default().filter(Filter::In("key".into(), keys.clone())),
            )
            .await?
            .iter()
            .filter_map(|row| row["key"].as_str().map(String::from))
            .collect();

        let mut fresh: Vec<Value> = Vec::new();
        let mut written = 0;
        for (m, key) in mentions.iter().zip(&keys) {
            if existing.contains(key) {
                if let Some(s) = m.sentiment {
                    self.store
                        .patch(
                            MENTION_TABLE,
                            &[Filter::Eq("key".into(), key.clone())],
                            json!({ "sentiment": s }),
                        )
                        .await?;
                }
                continue;
            }
            fresh.push(json!({
                "key": key,
                "source": m.source,
                "external_id": m.external_id,
                "repo_id": m.repo_id,
                "title": m.title,
                "url": m.url,
                "score": m.score,
                "comments": m.comments,
                "sentiment": m.sentiment,
                "posted_at": m.posted_at.to_rfc3339(),
            }));
        }
        if !fresh.is_empty() {
            written = self.store.upsert(MENTION_TABLE, fresh, "key").await?.len();
        }
        Ok(written)
    }

    /// Artifacts due for a scoring pass, most-starred first.
    pub async fn list_for_scoring(&self, limit: usize) -> Result<Vec<ScoreTarget>> {
        let rows = self
            .store
            .select(
                TABLE,
                &SelectQuery::default().order_by("stars", true).limit(limit),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let repo_id = row["repo_id"].as_str()?.to_string();
                let name = repo_id.split('/').nth(1).unwrap_or("").to_string();
                Some(ScoreTarget {
                    name,
                    stars: row["stars"].as_u64().unwrap_or(0),
                    forks: row["forks"].as_u64().unwrap_or(0),
                    pushed_at: row["pushed_at"]
                        .as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    repo_id,
                })
            })
            .collect())
    }

    /// Partial update of one artifact's scores from fresh signals.
    pub async fn update_scores(
        &self,
        target: &ScoreTarget,
        inputs: &VibeInputs,
        now: DateTime<Utc>,
    ) -> Result<VibeBreakdown> {
        let trending =
            crate::score::trending_score(target.stars, target.forks, target.pushed_at, now);
        let vibe = vibe_score(inputs);
        self.store
            .patch(
                TABLE,
                &[Filter::Eq("repo_id".into(), target.repo_id.clone())],
                json!({
                    "trending_score": trending,
                    "vibe_score": vibe.total,
                    "vibe_downloads": vibe.downloads,
                    "vibe_mentions": vibe.mentions,
                    "vibe_quality": vibe.quality,
                    "vibe_sentiment": vibe.sentiment,
                    "vibe_recency": vibe.recency,
                }),
            )
            .await?;
        Ok(vibe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::{ArtifactType, Category};

    fn enriched() -> EnrichedFields {
        EnrichedFields {
            kind: ArtifactType::McpServer,
            category: Category::Coding,
            tags: vec!["git".into()],
            install: "npx x".into(),
            platforms: vec!["claude-code".into(), "cursor".into()],
            summary: "s".into(),
        }
    }

    fn candidate(id: &str, stars: u64) -> Candidate {
        let mut c = Candidate::new(id, ArtifactType::McpServer);
        c.stars = stars;
        c
    }

    #[tokio::test]
    async fn test_upsert_links_and_writes_junctions() {
        let store = MemoryStore::new();
        let staging = StagingStore::new(&store);
        staging.upsert(&[candidate("A/One", 10)]).await.unwrap();

        let now = Utc::now();
        let artifact = build_artifact(&candidate("A/One", 10), &enriched(), now);
        let mut persister = Persister::new(&store);
        let n = persister
            .upsert_artifacts(&staging, &[artifact])
            .await
            .unwrap();
        assert_eq!(n, 1);

        // Candidate settled and linked
        let staged = store.rows(crate::staging::TABLE).pop().unwrap();
        assert_eq!(staged["status"], "enriched");
        assert!(staged["artifact_id"].is_i64());

        // One junction row per platform
        assert_eq!(store.rows(PLATFORM_TABLE).len(), 2);

        // Owner recorded once, lowercased
        let contributors = store.rows(CONTRIBUTOR_TABLE);
        assert_eq!(contributors.len(), 1);
        assert_eq!(contributors[0]["username"], "a");
    }

    #[tokio::test]
    async fn test_repeated_upsert_does_not_duplicate() {
        let store = MemoryStore::new();
        let staging = StagingStore::new(&store);
        staging.upsert(&[candidate("a/one", 10)]).await.unwrap();

        let now = Utc::now();
        let artifact = build_artifact(&candidate("a/one", 10), &enriched(), now);
        let mut persister = Persister::new(&store);
        persister.upsert_artifacts(&staging, &[artifact.clone()]).await.unwrap();
        persister.upsert_artifacts(&staging, &[artifact]).await.unwrap();

        assert_eq!(store.rows(TABLE).len(), 1);
        assert_eq!(store.rows(PLATFORM_TABLE).len(), 2);
    }

    #[tokio::test]
    async fn test_batch_degrades_per_record() {
        let store = MemoryStore::new();
        let staging = StagingStore::new(&store);
        let now = Utc::now();
        let good = build_artifact(&candidate("a/good", 1), &enriched(), now);
        let bad = build_artifact(&candidate("b/bad", 2), &enriched(), now);
        store.poison("b/bad");

        let mut persister = Persister::new(&store);
        let n = persister
            .upsert_artifacts(&staging, &[good, bad])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.rows(TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_update_scores_patches_breakdown() {
        let store = MemoryStore::new();
        let staging = StagingStore::new(&store);
        staging.upsert(&[candidate("a/one", 450)]).await.unwrap();
        let now = Utc::now();
        let mut c = candidate("a/one", 450);
        c.forks = 89;
        c.pushed_at = Some(now - chrono::Duration::days(2));
        let artifact = build_artifact(&c, &enriched(), now);
        let mut persister = Persister::new(&store);
        persister.upsert_artifacts(&staging, &[artifact]).await.unwrap();

        let targets = persister.list_for_scoring(10).await.unwrap();
        assert_eq!(targets.len(), 1);
        let inputs = VibeInputs {
            downloads: 1000,
            mentions_7d: 2,
            mentions_30d: 5,
            avg_score: 50.0,
            avg_sentiment: Some(0.4),
        };
        let vibe = persister
            .update_scores(&targets[0], &inputs, now)
            .await
            .unwrap();
        assert_eq!(vibe.total, 73);

        let row = store.rows(TABLE).pop().unwrap();
        assert_eq!(row["vibe_score"], 73);
        assert_eq!(row["trending_score"], 74);
    }

    #[tokio::test]
    async fn test_upsert_mentions_dedups_on_key() {
        let store = MemoryStore::new();
        let persister = Persister::new(&store);
        let m = crate::types::Mention {
            source: "reddit".into(),
            external_id: "abc".into(),
            repo_id: "a/one".into(),
            title: "t".into(),
            url: "u".into(),
            score: 5,
            comments: 1,
            sentiment: Some(0.2),
            posted_at: Utc::now(),
        };
        persister.upsert_mentions(&[m.clone()]).await.unwrap();
        persister.upsert_mentions(&[m]).await.unwrap();
        assert_eq!(store.rows(MENTION_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_recollected_mention_keeps_original_fields() {
        // Reddit edits (title changes, vote swings) must not rewrite a stored
        // mention; only the sentiment backfill may land after the first write.
        let store = MemoryStore::new();
        let persister = Persister::new(&store);
        let original = crate::types::Mention {
            source: "reddit".into(),
            external_id: "abc".into(),
            repo_id: "a/one".into(),
            title: "original title".into(),
            url: "u".into(),
            score: 5,
            comments: 1,
            sentiment: None,
            posted_at: Utc::now(),
        };
        persister.upsert_mentions(&[original.clone()]).await.unwrap();

        let mut recollected = original;
        recollected.title = "edited title".into();
        recollected.score = 999;
        recollected.sentiment = Some(0.8);
        persister.upsert_mentions(&[recollected]).await.unwrap();

        let rows = store.rows(MENTION_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "original title");
        assert_eq!(rows[0]["score"], 5);
        assert_eq!(rows[0]["sentiment"], 0.8);
    }
}
