//! Run orchestration for the discover / enrich / vibe-score modes.
//!
//! Discovery is sequential per source (rate limits dominate); enrichment
//! fans out inside the engine. Every mode honors an optional wall-clock
//! budget checked between coarse units of work, flushing buffered candidates
//! before returning. Per-run dedup state lives here and dies with the run.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;

use crate::bigquery::{default_dataset_queries, DatasetClient};
use crate::config::Config;
use crate::curated::{default_lists, CuratedClient};
use crate::enrich::{Enricher, BATCH_SIZE};
use crate::fetcher::{Deadline, HttpFetcher};
use crate::gemini::GeminiClient;
use crate::github::{default_code_queries, default_repo_queries, GitHubClient};
use crate::mentions::{aggregate, MentionClient};
use crate::persist::Persister;
use crate::registries::{default_npm_queries, default_pypi_queries, RegistryClient};
use crate::staging::StagingStore;
use crate::store::Store;
use crate::types::{ArtifactType, Candidate, EnrichStatus};

/// Which discoverers a discover run drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Source {
    Github,
    Code,
    Npm,
    Pypi,
    Bigquery,
    Curated,
    All,
}

impl Source {
    fn includes(&self, other: Source) -> bool {
        *self == Source::All || *self == other
    }
}

/// Per-run counters printed at the end of every mode.
#[derive(Debug, Default)]
pub struct RunReport {
    pub discovered: usize,
    pub saved: usize,
    pub enriched: usize,
    pub scored: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn print(&self) {
        eprintln!(
            "\x1b[32mok\x1b[0m discovered {} | saved {} | enriched {} | scored {} | failed {} | skipped {} ({:.1}s)",
            self.discovered,
            self.saved,
            self.enriched,
            self.scored,
            self.failed,
            self.skipped,
            self.elapsed_secs
        );
    }

    fn absorb(&mut self, other: RunReport) {
        self.discovered += other.discovered;
        self.saved += other.saved;
        self.enriched += other.enriched;
        self.scored += other.scored;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.elapsed_secs += other.elapsed_secs;
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    fetcher: HttpFetcher,
    store: &'a dyn Store,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, store: &'a dyn Store) -> Self {
        Self {
            config,
            fetcher: HttpFetcher::new(),
            store,
        }
    }

    /// Discover mode: drive the selected sources, stage everything found.
    pub async fn discover(
        &self,
        source: Source,
        kind: Option<ArtifactType>,
        limit: usize,
        budget_secs: Option<u64>,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let deadline = Deadline::from_budget(budget_secs);
        let staging = StagingStore::new(self.store);
        let mut seen: HashSet<String> = HashSet::new();
        let mut report = RunReport::default();

        let github = GitHubClient::new(self.fetcher.clone(), self.config.github_token.clone());
        let registries = RegistryClient::new(self.fetcher.clone());
        let curated = CuratedClient::new(self.fetcher.clone());

        if source.includes(Source::Github) {
            for spec in default_repo_queries() {
                if deadline.expired() || report.discovered >= limit {
                    break;
                }
                if kind.is_some_and(|k| k != spec.hint) {
                    continue;
                }
                eprintln!("\x1b[36m..\x1b[0m repo search: {}", spec.query);
                let wave = github
                    .search_repos(&spec, limit - report.discovered, deadline, &mut seen)
                    .await?;
                self.flush(&staging, wave, limit, &mut report).await;
            }
        }

        if source.includes(Source::Code) && !deadline.expired() {
            for (query, hint) in default_code_queries() {
                if deadline.expired() || report.discovered >= limit {
                    break;
                }
                if kind.is_some_and(|k| k != hint) {
                    continue;
                }
                eprintln!("\x1b[36m..\x1b[0m code search: {}", query);
                let wave = github
                    .search_code(&query, hint, limit - report.discovered, deadline, &mut seen)
                    .await?;
                self.flush(&staging, wave, limit, &mut report).await;
            }
        }

        if source.includes(Source::Npm) && !deadline.expired() {
            for (term, hint) in default_npm_queries() {
                if deadline.expired() || report.discovered >= limit {
                    break;
                }
                if kind.is_some_and(|k| k != hint) {
                    continue;
                }
                eprintln!("\x1b[36m..\x1b[0m npm search: {}", term);
                let wave = registries
                    .search_npm(&term, hint, limit - report.discovered, deadline, &mut seen)
                    .await?;
                self.flush(&staging, wave, limit, &mut report).await;
            }
        }

        if source.includes(Source::Pypi) && !deadline.expired() {
            for (term, hint) in default_pypi_queries() {
                if deadline.expired() || report.discovered >= limit {
                    break;
                }
                if kind.is_some_and(|k| k != hint) {
                    continue;
                }
                eprintln!("\x1b[36m..\x1b[0m pypi search: {}", term);
                let wave = registries
                    .search_pypi(&term, hint, limit - report.discovered, deadline, &mut seen)
                    .await?;
                self.flush(&staging, wave, limit, &mut report).await;
            }
        }

        if source.includes(Source::Bigquery) && !deadline.expired() {
            match self.config.require_bigquery() {
                Ok((project, token)) => {
                    let dataset = DatasetClient::new(self.fetcher.clone(), project, token);
                    for (sql, hint) in default_dataset_queries() {
                        if deadline.expired() || report.discovered >= limit {
                            break;
                        }
                        if kind.is_some_and(|k| k != hint) {
                            continue;
                        }
                        eprintln!("\x1b[36m..\x1b[0m dataset search for {}", hint);
                        match dataset.search(&sql, hint, &mut seen).await {
                            Ok(wave) => self.flush(&staging, wave, limit, &mut report).await,
                            Err(e) => eprintln!("  \x1b[31mx\x1b[0m dataset search failed: {}", e),
                        }
                    }
                }
                Err(e) if source == Source::Bigquery => return Err(e),
                Err(_) => {
                    eprintln!("\x1b[33m..\x1b[0m dataset credentials missing, skipping source");
                }
            }
        }

        if source.includes(Source::Curated) && !deadline.expired() {
            for (list, hint) in default_lists() {
                if deadline.expired() || report.discovered >= limit {
                    break;
                }
                if kind.is_some_and(|k| k != hint) {
                    continue;
                }
                eprintln!("\x1b[36m..\x1b[0m curated list: {}", list);
                let wave = curated
                    .discover(&list, hint, limit - report.discovered, &mut seen)
                    .await?;
                self.flush(&staging, wave, limit, &mut report).await;
            }
        }

        report.elapsed_secs = start.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Stage a discovery wave, clamping it so the run never exceeds `limit`
    /// even when a source hands back more than the remaining headroom.
    async fn flush(
        &self,
        staging: &StagingStore<'_>,
        mut wave: Vec<Candidate>,
        limit: usize,
        report: &mut RunReport,
    ) {
        wave.truncate(limit.saturating_sub(report.discovered));
        if wave.is_empty() {
            return;
        }
        report.discovered += wave.len();
        match staging.upsert(&wave).await {
            Ok(n) => report.saved += n,
            Err(e) => eprintln!("  \x1b[31mx\x1b[0m staging write failed: {}", e),
        }
    }

    /// Enrich mode: classify pending candidates wave by wave, persist
    /// artifacts, and record per-candidate outcomes in the staging store.
    pub async fn enrich(
        &self,
        kind: Option<ArtifactType>,
        limit: usize,
        budget_secs: Option<u64>,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let deadline = Deadline::from_budget(budget_secs);
        let staging = StagingStore::new(self.store);
        let mut report = RunReport::default();

        let api_key = self.config.require_gemini()?;
        let gemini = GeminiClient::new(self.fetcher.clone(), api_key);
        let github = GitHubClient::new(self.fetcher.clone(), self.config.github_token.clone());
        let enricher = Enricher::new(&gemini, &github);
        let mut persister = Persister::new(self.store);

        let pending = staging.list_pending(kind, limit).await?;
        eprintln!("\x1b[36m..\x1b[0m {} candidates pending enrichment", pending.len());

        for wave in pending.chunks(BATCH_SIZE) {
            if deadline.expired() {
                eprintln!("\x1b[33m..\x1b[0m time budget reached, stopping between waves");
                break;
            }
            let outcomes = enricher.enrich_wave(wave.to_vec()).await;

            let now = Utc::now();
            let mut artifacts = Vec::new();
            for outcome in outcomes {
                match outcome.result {
                    Ok(fields) => {
                        artifacts.push(crate::persist::build_artifact(
                            &outcome.candidate,
                            &fields,
                            now,
                        ));
                    }
                    Err(reason) => {
                        let id = outcome.candidate.canonical_id();
                        eprintln!("  \x1b[31mx\x1b[0m {} - {}", id, reason);
                        match staging
                            .mark_result(&id, EnrichStatus::Failed, Some(&reason))
                            .await
                        {
                            Ok(EnrichStatus::Skipped) => report.skipped += 1,
                            Ok(_) => report.failed += 1,
                            Err(e) => {
                                eprintln!("  \x1b[31mx\x1b[0m {} outcome not recorded: {}", id, e);
                                report.failed += 1;
                            }
                        }
                    }
                }
            }
            report.enriched += persister.upsert_artifacts(&staging, &artifacts).await?;
        }

        report.elapsed_secs = start.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Vibe-score mode: refresh mention signals and recompute scores for
    /// stored artifacts.
    pub async fn vibe_score(&self, limit: usize, budget_secs: Option<u64>) -> Result<RunReport> {
        let start = Instant::now();
        let deadline = Deadline::from_budget(budget_secs);
        let mut report = RunReport::default();

        let persister = Persister::new(self.store);
        let mentions = MentionClient::new(self.fetcher.clone());
        let registries = RegistryClient::new(self.fetcher.clone());

        let targets = persister.list_for_scoring(limit).await?;
        eprintln!("\x1b[36m..\x1b[0m scoring {} artifacts", targets.len());

        for target in targets {
            if deadline.expired() {
                eprintln!("\x1b[33m..\x1b[0m time budget reached, stopping between artifacts");
                break;
            }
            let collected = mentions.collect(&target.repo_id).await;
            if let Err(e) = persister.upsert_mentions(&collected).await {
                eprintln!("  \x1b[33m..\x1b[0m mentions for {} not saved: {}", target.repo_id, e);
            }
            let downloads = registries.weekly_downloads_for_repo(&target.name).await;
            let inputs = aggregate(&collected, downloads, Utc::now());
            match persister.update_scores(&target, &inputs, Utc::now()).await {
                Ok(vibe) => {
                    eprintln!("  {} vibe {}", target.repo_id, vibe.total);
                    report.scored += 1;
                }
                Err(e) => {
                    eprintln!("  \x1b[31mx\x1b[0m {} not scored: {}", target.repo_id, e);
                    report.failed += 1;
                }
            }
        }

        report.elapsed_secs = start.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Combined mode: discover, enrich, then score, under one shared budget.
    /// Each phase gets whatever the previous phases left of it.
    pub async fn run(&self, limit: usize, budget_secs: Option<u64>) -> Result<RunReport> {
        let deadline = Deadline::from_budget(budget_secs);
        let mut report = self
            .discover(Source::All, None, limit, deadline.remaining_secs())
            .await?;
        if !deadline.expired() {
            report.absorb(self.enrich(None, limit, deadline.remaining_secs()).await?);
        }
        if !deadline.expired() {
            report.absorb(self.vibe_score(limit, deadline.remaining_secs()).await?);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn empty_config() -> Config {
        Config {
            github_token: None,
            gemini_api_key: None,
            catalog_url: None,
            catalog_key: None,
            gcp_project: None,
            gcp_access_token: None,
        }
    }

    #[tokio::test]
    async fn test_flush_clamps_wave_to_run_limit() {
        // A source can hand back a whole page past the remaining headroom;
        // only the headroom's worth may be counted and staged.
        let config = empty_config();
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(&config, &store);
        let staging = StagingStore::new(&store);
        let mut report = RunReport {
            discovered: 8,
            ..Default::default()
        };
        let wave: Vec<Candidate> = (0..5)
            .map(|i| Candidate::new(&format!("a/repo{}", i), ArtifactType::Skill))
            .collect();
        pipeline.flush(&staging, wave, 10, &mut report).await;
        assert_eq!(report.discovered, 10);
        assert_eq!(report.saved, 2);
        assert_eq!(store.rows(crate::staging::TABLE).len(), 2);
    }

    #[test]
    fn test_source_includes() {
        assert!(Source::All.includes(Source::Npm));
        assert!(Source::Npm.includes(Source::Npm));
        assert!(!Source::Npm.includes(Source::Pypi));
    }

    #[test]
    fn test_report_absorb() {
        let mut a = RunReport {
            discovered: 1,
            saved: 1,
            ..Default::default()
        };
        a.absorb(RunReport {
            discovered: 2,
            enriched: 3,
            ..Default::default()
        });
        assert_eq!(a.discovered, 3);
        assert_eq!(a.saved, 1);
        assert_eq!(a.enriched, 3);
    }
}
