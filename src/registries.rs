//! Package-registry discoverers and download counters.
//!
//! npm exposes a JSON keyword-search endpoint with offset pagination; PyPI
//! only has an HTML search page, so hits are scraped and then hydrated with
//! one JSON package-detail call each. Both map packages back to GitHub repos
//! through their declared repository URL; packages without one are dropped.

use std::collections::HashSet;

use anyhow::Result;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::fetcher::{Deadline, HttpFetcher};
use crate::types::{ArtifactType, Candidate};

const NPM_PAGE_SIZE: usize = 50;
const MAX_SEARCH_PAGES: usize = 5;

pub fn default_npm_queries() -> Vec<(String, ArtifactType)> {
    vec![
        ("mcp server".into(), ArtifactType::McpServer),
        ("claude skill".into(), ArtifactType::Skill),
        ("n8n-nodes".into(), ArtifactType::WorkflowNode),
        ("langchain tool".into(), ArtifactType::FrameworkTool),
    ]
}

pub fn default_pypi_queries() -> Vec<(String, ArtifactType)> {
    vec![
        ("mcp server".into(), ArtifactType::McpServer),
        ("langchain tool".into(), ArtifactType::FrameworkTool),
    ]
}

#[derive(Debug, Deserialize)]
struct NpmSearchResponse {
    #[serde(default)]
    objects: Vec<NpmSearchObject>,
}

#[derive(Debug, Deserialize)]
struct NpmSearchObject {
    package: NpmPackage,
}

#[derive(Debug, Deserialize)]
struct NpmPackage {
    name: String,
    description: Option<String>,
    #[serde(default)]
    links: NpmLinks,
}

#[derive(Debug, Default, Deserialize)]
struct NpmLinks {
    repository: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NpmDownloads {
    downloads: u64,
}

#[derive(Debug, Deserialize)]
struct PypiDetail {
    info: PypiInfo,
}

#[derive(Debug, Deserialize)]
struct PypiInfo {
    summary: Option<String>,
    home_page: Option<String>,
    #[serde(default)]
    project_urls: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct PypiStats {
    data: PypiStatsData,
}

#[derive(Debug, Deserialize)]
struct PypiStatsData {
    #[serde(default)]
    last_week: u64,
}

pub struct RegistryClient {
    fetcher: HttpFetcher,
}

impl RegistryClient {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    /// npm keyword search, paged by offset until a short page.
    pub async fn search_npm(
        &self,
        term: &str,
        hint: ArtifactType,
        limit: usize,
        deadline: Deadline,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for page in 0..MAX_SEARCH_PAGES {
            if deadline.expired() || out.len() >= limit {
                break;
            }
            let url = format!(
                "https://registry.npmjs.org/-/v1/search?text={}&size={}&from={}",
                term.replace(' ', "+"),
                NPM_PAGE_SIZE,
                page * NPM_PAGE_SIZE
            );
            let value = match self.fetcher.get_json(&url, &[]).await {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("  \x1b[33m..\x1b[0m npm search \"{}\" stopped: {}", term, e);
                    break;
                }
            };
            let parsed: NpmSearchResponse =
                serde_json::from_value(value).unwrap_or(NpmSearchResponse { objects: vec![] });
            if parsed.objects.is_empty() {
                break;
            }
            let short_page = parsed.objects.len() < NPM_PAGE_SIZE;
            for obj in parsed.objects {
                let Some(repo_id) = obj
                    .package
                    .links
                    .repository
                    .as_deref()
                    .and_then(github_repo_from_url)
                else {
                    continue;
                };
                if seen.insert(crate::types::canonical_repo_id(&repo_id)) {
                    let mut c = Candidate::new(repo_id, hint);
                    c.description = obj.package.description;
                    out.push(c);
                }
            }
            if short_page {
                break;
            }
        }
        Ok(out)
    }

    /// PyPI search: scrape the HTML listing for package names, then follow up
    /// with one JSON detail call per hit to find the repository URL.
    pub async fn search_pypi(
        &self,
        term: &str,
        hint: ArtifactType,
        limit: usize,
        deadline: Deadline,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Candidate>> {
        let url = format!("https://pypi.org/search/?q={}", term.replace(' ', "+"));
        let html = match self.fetcher.get_text(&url, &[]).await {
            Ok(t) => t,
            Err(e) => {
                eprintln!("  \x1b[33m..\x1b[0m pypi search \"{}\" skipped: {}", term, e);
                return Ok(Vec::new());
            }
        };
        let names = scrape_pypi_names(&html);

        let mut out = Vec::new();
        for name in names {
            if deadline.expired() || out.len() >= limit {
                break;
            }
            let detail_url = format!("https://pypi.org/pypi/{}/json", name);
            let value = match self.fetcher.get_json(&detail_url, &[]).await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let Ok(detail) = serde_json::from_value::<PypiDetail>(value) else {
                continue;
            };
            let Some(repo_id) = repo_from_pypi_info(&detail.info) else {
                continue;
            };
            if seen.insert(crate::types::canonical_repo_id(&repo_id)) {
                let mut c = Candidate::new(repo_id, hint);
                c.description = detail.info.summary.clone();
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Weekly npm downloads for a package name. Best-effort: a missing
    /// package is 0, not an error.
    pub async fn npm_weekly_downloads(&self, package: &str) -> u64 {
        let url = format!("https://api.npmjs.org/downloads/point/last-week/{}", package);
        match self.fetcher.get_json(&url, &[]).await {
            Ok(v) => serde_json::from_value::<NpmDownloads>(v)
                .map(|d| d.downloads)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Weekly PyPI downloads via pypistats. Same best-effort contract.
    pub async fn pypi_weekly_downloads(&self, package: &str) -> u64 {
        let url = format!("https://pypistats.org/api/packages/{}/recent", package);
        match self.fetcher.get_json(&url, &[]).await {
            Ok(v) => serde_json::from_value::<PypiStats>(v)
                .map(|s| s.data.last_week)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Combined weekly downloads, guessing the package name from the repo
    /// name on both registries. The guess is unverified by design; a wrong
    /// guess just means 0.
    pub async fn weekly_downloads_for_repo(&self, repo_name: &str) -> u64 {
        if repo_name.is_empty() {
            return 0;
        }
        let npm = self.npm_weekly_downloads(repo_name).await;
        let pypi = self.pypi_weekly_downloads(repo_name).await;
        npm + pypi
    }
}

/// Pulls package names out of the PyPI search listing. Kept synchronous so
/// the parsed document never lives across an await.
fn scrape_pypi_names(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let snippet = Selector::parse("a.package-snippet").expect("static selector");
    let name = Selector::parse("span.package-snippet__name").expect("static selector");
    let mut out = Vec::new();
    for link in doc.select(&snippet) {
        if let Some(n) = link.select(&name).next() {
            let text = n.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                out.push(text);
            }
        }
    }
    out
}

/// Extracts "owner/name" from a GitHub URL in any of the forms registries
/// carry: https, git+https, ssh, trailing .git, deep paths.
pub fn github_repo_from_url(url: &str) -> Option<String> {
    let idx = url.find("github.com")?;
    let rest = &url[idx + "github.com".len()..];
    let rest = rest.trim_start_matches([':', '/']);
    let mut parts = rest.split('/');
    let owner = parts.next()?.trim();
    let name = parts.next()?.trim().trim_end_matches(".git");
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    // Strip URL fragments/queries clinging to the name segment.
    let name = name
        .split(['#', '?'])
        .next()
        .unwrap_or(name);
    Some(format!("{}/{}", owner, name))
}

fn repo_from_pypi_info(info: &PypiInfo) -> Option<String> {
    if let Some(urls) = &info.project_urls {
        for value in urls.values() {
            if let Some(repo) = github_repo_from_url(value) {
                return Some(repo);
            }
        }
    }
    info.home_page.as_deref().and_then(github_repo_from_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_repo_from_url_forms() {
        assert_eq!(
            github_repo_from_url("https://github.com/foo/bar"),
            Some("foo/bar".into())
        );
        assert_eq!(
            github_repo_from_url("git+https://github.com/foo/bar.git"),
            Some("foo/bar".into())
        );
        assert_eq!(
            github_repo_from_url("https://github.com/foo/bar/tree/main/packages/x"),
            Some("foo/bar".into())
        );
        assert_eq!(
            github_repo_from_url("git@github.com:foo/bar.git"),
            Some("foo/bar".into())
        );
        assert_eq!(github_repo_from_url("https://gitlab.com/foo/bar"), None);
        assert_eq!(github_repo_from_url("https://github.com/"), None);
    }

    #[test]
    fn test_scrape_pypi_names() {
        let html = r#"
            <ul>
              <li><a class="package-snippet" href="/project/mcp-server-x/">
                <span class="package-snippet__name">mcp-server-x</span>
                <span class="package-snippet__version">0.3.1</span>
              </a></li>
              <li><a class="package-snippet" href="/project/other/">
                <span class="package-snippet__name"> other </span>
              </a></li>
            </ul>"#;
        let names = scrape_pypi_names(html);
        assert_eq!(names, vec!["mcp-server-x".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_repo_from_pypi_info_prefers_project_urls() {
        let mut urls = std::collections::HashMap::new();
        urls.insert("Source".to_string(), "https://github.com/a/b".to_string());
        let info = PypiInfo {
            summary: None,
            home_page: Some("https://example.com".into()),
            project_urls: Some(urls),
        };
        assert_eq!(repo_from_pypi_info(&info), Some("a/b".into()));
    }
}
