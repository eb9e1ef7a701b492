//! Curated-list discoverer: fetches well-known "awesome" list READMEs and
//! extracts the GitHub repositories they link to.

use std::collections::HashSet;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::fetcher::HttpFetcher;
use crate::types::{ArtifactType, Candidate};

/// Lists crawled in discover mode, each labelling its links with one type.
pub fn default_lists() -> Vec<(String, ArtifactType)> {
    vec![
        ("punkpeye/awesome-mcp-servers".into(), ArtifactType::McpServer),
        ("anthropics/skills".into(), ArtifactType::Skill),
        ("PatrickJS/awesome-cursorrules".into(), ArtifactType::RuleSet),
        ("restyler/awesome-n8n".into(), ArtifactType::WorkflowNode),
        ("kyrolabs/awesome-langchain".into(), ArtifactType::FrameworkTool),
    ]
}

/// Raw-content URL candidates tried in order; lists disagree on default
/// branch and README casing.
const RAW_PATHS: [(&str, &str); 4] = [
    ("main", "README.md"),
    ("master", "README.md"),
    ("main", "readme.md"),
    ("master", "readme.md"),
];

static GITHUB_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://github\.com/([a-zA-Z0-9_.-]+/[a-zA-Z0-9_.-]+)").unwrap()
});

/// Link targets under github.com that are pages, not repositories.
const NON_REPO_PATHS: &[&str] = &[
    "issues",
    "pull",
    "blob",
    "tree",
    "wiki",
    "releases",
    "actions",
    "discussions",
    "sponsors",
    "topics",
];

pub struct CuratedClient {
    fetcher: HttpFetcher,
}

impl CuratedClient {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    /// Fetch one list's README, trying branch/filename combinations in order.
    async fn fetch_readme(&self, list_repo: &str) -> Option<String> {
        for (branch, filename) in RAW_PATHS {
            let url = format!(
                "https://raw.githubusercontent.com/{}/{}/{}",
                list_repo, branch, filename
            );
            match self.fetcher.get_text(&url, &[]).await {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                _ => continue,
            }
        }
        None
    }

    /// Discover candidates from one curated list. The list repo itself is
    /// excluded from its own results.
    pub async fn discover(
        &self,
        list_repo: &str,
        hint: ArtifactType,
        limit: usize,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Candidate>> {
        let Some(markdown) = self.fetch_readme(list_repo).await else {
            eprintln!("  \x1b[33m..\x1b[0m no readable README for {}", list_repo);
            return Ok(Vec::new());
        };
        let list_canonical = crate::types::canonical_repo_id(list_repo);
        let mut out = Vec::new();
        for repo in extract_repo_links(&markdown) {
            if out.len() >= limit {
                break;
            }
            let canonical = crate::types::canonical_repo_id(&repo);
            if canonical == list_canonical {
                continue;
            }
            if seen.insert(canonical) {
                out.push(Candidate::new(repo, hint));
            }
        }
        Ok(out)
    }
}

/// Extract "owner/repo" targets from markdown. Deep links (issues, blobs)
/// and profile-page paths are filtered out.
pub fn extract_repo_links(markdown: &str) -> Vec<String> {
    let mut repos = Vec::new();
    let mut seen = HashSet::new();

    for cap in GITHUB_LINK_RE.captures_iter(markdown) {
        let Some(m) = cap.get(1) else { continue };
        let repo = m.as_str().trim_end_matches(".git");
        let parts: Vec<&str> = repo.split('/').take(2).collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            continue;
        }
        let name = parts[1];
        if NON_REPO_PATHS.contains(&name) || name.contains('#') || name.contains('?') {
            continue;
        }
        let full_name = format!("{}/{}", parts[0], name);
        if seen.insert(full_name.to_lowercase()) {
            repos.push(full_name);
        }
    }

    repos
}
