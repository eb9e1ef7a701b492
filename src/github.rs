//! GitHub discoverers: repository search with star-range partitioning, code
//! search for marker filenames, and lazy README retrieval.
//!
//! The search API caps any single query at 1,000 results no matter how many
//! repos actually match, so broad queries are partitioned by star-count
//! ranges; each partition stays under the cap and the union approximates the
//! true match set.

use std::collections::HashSet;
use std::future::Future;

use anyhow::{Context, Result};
use base64::Engine;
use futures::stream::{self, StreamExt};
use serde::Deserialize;

use crate::fetcher::{Deadline, FetchError, FetchResult, HttpFetcher};
use crate::types::{ArtifactType, Candidate};

const PER_PAGE: usize = 100;

/// Pages per partition before moving on; the API refuses to page past the
/// result cap anyway.
const MAX_PAGES_PER_PARTITION: usize = 10;

/// Star ranges, roughly log-distributed so each partition's match count
/// stays under the 1,000-result window.
pub const STAR_RANGES: [&str; 12] = [
    "stars:>50000",
    "stars:20000..50000",
    "stars:10000..20000",
    "stars:5000..10000",
    "stars:2000..5000",
    "stars:1000..2000",
    "stars:500..1000",
    "stars:200..500",
    "stars:100..200",
    "stars:50..100",
    "stars:20..50",
    "stars:5..20",
];

/// One discovery query: search string, provisional type label, and whether
/// the query is broad enough to need star partitioning.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub query: String,
    pub hint: ArtifactType,
    pub partitioned: bool,
}

/// The fixed query set, one or two per artifact type. Source types are known
/// in advance; this is not a plugin surface.
pub fn default_repo_queries() -> Vec<SearchSpec> {
    vec![
        SearchSpec {
            query: "claude skill in:name,description,readme".into(),
            hint: ArtifactType::Skill,
            partitioned: true,
        },
        SearchSpec {
            query: "topic:mcp-server".into(),
            hint: ArtifactType::McpServer,
            partitioned: true,
        },
        SearchSpec {
            query: "mcp server in:name,description".into(),
            hint: ArtifactType::McpServer,
            partitioned: true,
        },
        SearchSpec {
            query: "cursor rules in:name,description".into(),
            hint: ArtifactType::RuleSet,
            partitioned: false,
        },
        SearchSpec {
            query: "n8n-nodes in:name".into(),
            hint: ArtifactType::WorkflowNode,
            partitioned: false,
        },
        SearchSpec {
            query: "topic:langchain topic:tool".into(),
            hint: ArtifactType::FrameworkTool,
            partitioned: false,
        },
    ]
}

/// Marker filenames for code search, each implying a type label.
pub fn default_code_queries() -> Vec<(String, ArtifactType)> {
    vec![
        ("filename:SKILL.md path:/".into(), ArtifactType::Skill),
        ("filename:.cursorrules path:/".into(), ArtifactType::RuleSet),
        ("filename:mcp.json path:/".into(), ArtifactType::McpServer),
    ]
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRepoItem {
    full_name: String,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    #[serde(default)]
    topics: Vec<String>,
    pushed_at: Option<String>,
    created_at: Option<String>,
    #[serde(default)]
    fork: bool,
}

#[derive(Debug, Deserialize)]
struct SearchRepoResponse {
    #[serde(default)]
    items: Vec<SearchRepoItem>,
}

#[derive(Debug, Deserialize)]
struct CodeSearchItem {
    repository: CodeSearchRepo,
}

#[derive(Debug, Deserialize)]
struct CodeSearchRepo {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct CodeSearchResponse {
    #[serde(default)]
    items: Vec<CodeSearchItem>,
}

#[derive(Debug, Deserialize)]
struct ReadmeResponse {
    content: String,
    encoding: String,
}

pub struct GitHubClient {
    fetcher: HttpFetcher,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(fetcher: HttpFetcher, token: Option<String>) -> Self {
        Self { fetcher, token }
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![
            ("Accept".to_string(), "application/vnd.github+json".to_string()),
            ("X-GitHub-Api-Version".to_string(), "2022-11-28".to_string()),
        ];
        if let Some(token) = &self.token {
            h.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        h
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let headers = self.headers();
        let refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.fetcher.get_json(url, &refs).await
    }

    /// Run one repo-search spec, partitioned when requested. `seen` is the
    /// run-scoped dedup set shared across all discoverers.
    pub async fn search_repos(
        &self,
        spec: &SearchSpec,
        limit: usize,
        deadline: Deadline,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Candidate>> {
        let partitions: Vec<String> = if spec.partitioned {
            STAR_RANGES
                .iter()
                .map(|range| format!("{} {}", spec.query, range))
                .collect()
        } else {
            vec![spec.query.clone()]
        };

        let out = collect_partitions(&partitions, spec.hint, limit, deadline, seen, |query, page| {
            let url = format!(
                "https://api.github.com/search/repositories?q={}&sort=stars&order=desc&per_page={}&page={}",
                urlencode(&query),
                PER_PAGE,
                page
            );
            async move {
                let v = self.get_json(&url).await?;
                let parsed: SearchRepoResponse =
                    serde_json::from_value(v).unwrap_or(SearchRepoResponse { items: vec![] });
                Ok(parsed.items)
            }
        })
        .await;
        Ok(out)
    }

    /// Code search for marker filenames. Hits only carry the owning repo;
    /// unique repos are hydrated concurrently afterwards.
    pub async fn search_code(
        &self,
        query: &str,
        hint: ArtifactType,
        limit: usize,
        deadline: Deadline,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Candidate>> {
        let mut repo_names: Vec<String> = Vec::new();
        let mut empty_pages = 0;

        for page in 1..=MAX_PAGES_PER_PARTITION {
            if deadline.expired() || repo_names.len() >= limit {
                break;
            }
            let url = format!(
                "https://api.github.com/search/code?q={}&per_page={}&page={}",
                urlencode(query),
                PER_PAGE,
                page
            );
            let items = match self.get_json(&url).await {
                Ok(v) => {
                    let parsed: CodeSearchResponse =
                        serde_json::from_value(v).unwrap_or(CodeSearchResponse { items: vec![] });
                    parsed.items
                }
                Err(FetchError::Fatal(msg)) => {
                    eprintln!("  \x1b[31mx\x1b[0m code search {} - {}", query, msg);
                    break;
                }
                Err(FetchError::Retryable(msg)) => {
                    eprintln!("  \x1b[33m..\x1b[0m code search page {} skipped: {}", page, msg);
                    break;
                }
            };
            if items.is_empty() {
                empty_pages += 1;
                if empty_pages >= 2 {
                    break;
                }
                continue;
            }
            empty_pages = 0;
            let short_page = items.len() < PER_PAGE;
            for item in items {
                let canonical = crate::types::canonical_repo_id(&item.repository.full_name);
                if seen.insert(canonical) {
                    repo_names.push(item.repository.full_name);
                }
            }
            if short_page {
                break;
            }
        }

        if deadline.expired() {
            repo_names.clear();
        }
        repo_names.truncate(limit);
        let out = hydrate_repos(repo_names, limit, |name| async move {
            self.get_repo(&name, hint).await
        })
        .await;
        Ok(out)
    }

    /// Single-repo metadata; None for deleted/renamed repos and forks.
    pub async fn get_repo(&self, full_name: &str, hint: ArtifactType) -> Result<Option<Candidate>> {
        let url = format!("https://api.github.com/repos/{}", full_name);
        match self.get_json(&url).await {
            Ok(v) => {
                let item: SearchRepoItem =
                    serde_json::from_value(v).context("failed to parse repo metadata")?;
                if item.fork {
                    return Ok(None);
                }
                Ok(Some(item_to_candidate(item, hint)))
            }
            Err(FetchError::Fatal(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// README content, decoded from the base64 payload the content endpoint
    /// returns. None means no README, which is fine.
    pub async fn get_readme(&self, full_name: &str) -> Result<Option<String>> {
        let url = format!("https://api.github.com/repos/{}/readme", full_name);
        let value = match self.get_json(&url).await {
            Ok(v) => v,
            Err(FetchError::Fatal(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if value.is_null() {
            return Ok(None);
        }
        let readme: ReadmeResponse =
            serde_json::from_value(value).context("failed to parse README response")?;
        if readme.encoding != "base64" {
            return Ok(None);
        }
        let cleaned = readme.content.replace('\n', "");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&cleaned)
            .context("base64 decode error")?;
        Ok(Some(String::from_utf8_lossy(&decoded).into_owned()))
    }
}

/// Partition/paging loop shared by the repo discoverer and its tests: pages
/// each partition until a short page or two consecutive empty pages, dedups
/// across partitions through `seen`, and stops item-precisely at `limit` so
/// a run never overshoots its cap mid-page. Page retrieval is injected so
/// the loop is testable without a network.
async fn collect_partitions<F, Fut>(
    partitions: &[String],
    hint: ArtifactType,
    limit: usize,
    deadline: Deadline,
    seen: &mut HashSet<String>,
    mut fetch_page: F,
) -> Vec<Candidate>
where
    F: FnMut(String, usize) -> Fut,
    Fut: Future<Output = FetchResult<Vec<SearchRepoItem>>>,
{
    let mut out = Vec::new();
    'partitions: for partition in partitions {
        if deadline.expired() {
            eprintln!("\x1b[33m..\x1b[0m time budget reached, stopping between partitions");
            break;
        }
        if out.len() >= limit {
            break;
        }
        let mut empty_pages = 0;
        for page in 1..=MAX_PAGES_PER_PARTITION {
            if deadline.expired() || out.len() >= limit {
                break 'partitions;
            }
            let items = match fetch_page(partition.clone(), page).await {
                Ok(items) => items,
                Err(FetchError::Fatal(msg)) => {
                    // Malformed query: give up on this partition only.
                    eprintln!("  \x1b[31mx\x1b[0m {} - {}", partition, msg);
                    continue 'partitions;
                }
                Err(FetchError::Retryable(msg)) => {
                    eprintln!("  \x1b[33m..\x1b[0m {} page {} skipped: {}", partition, page, msg);
                    continue 'partitions;
                }
            };

            // Exhaustion: a short page, or two consecutive empty pages.
            if items.is_empty() {
                empty_pages += 1;
                if empty_pages >= 2 {
                    continue 'partitions;
                }
                continue;
            }
            empty_pages = 0;
            let short_page = items.len() < PER_PAGE;

            let mut page_new = 0;
            for item in items {
                if out.len() >= limit {
                    break;
                }
                if item.fork {
                    continue;
                }
                let candidate = item_to_candidate(item, hint);
                if seen.insert(candidate.canonical_id()) {
                    out.push(candidate);
                    page_new += 1;
                }
            }
            if page_new > 0 {
                eprintln!("  {} +{} new", partition, page_new);
            }
            if short_page {
                continue 'partitions;
            }
        }
    }
    out
}

/// Concurrent metadata hydration workers per code-search wave.
const HYDRATE_WORKERS: usize = 5;

/// Hydrate code-search hits in a bounded concurrent batch. Missing repos and
/// individual failures are skipped, not errors.
async fn hydrate_repos<F, Fut>(names: Vec<String>, limit: usize, fetch: F) -> Vec<Candidate>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Option<Candidate>>>,
{
    let mut out: Vec<Candidate> = stream::iter(names)
        .map(|name| {
            let fetched = fetch(name.clone());
            async move {
                match fetched.await {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("  \x1b[33m..\x1b[0m {} hydration skipped: {}", name, e);
                        None
                    }
                }
            }
        })
        .buffer_unordered(HYDRATE_WORKERS)
        .filter_map(|c| async move { c })
        .collect()
        .await;
    out.truncate(limit);
    out
}

fn item_to_candidate(item: SearchRepoItem, hint: ArtifactType) -> Candidate {
    let mut c = Candidate::new(item.full_name, hint);
    c.description = item.description;
    c.language = item.language;
    c.stars = item.stargazers_count;
    c.forks = item.forks_count;
    c.topics = item.topics;
    c.pushed_at = parse_ts(item.pushed_at.as_deref());
    c.created_at = parse_ts(item.created_at.as_deref());
    c
}

fn parse_ts(s: Option<&str>) -> Option<chrono::DateTime<chrono::Utc>> {
    s.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push('+'),
            ':' | '/' | '.' | '-' | '_' | ',' => out.push(c),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    out
}
