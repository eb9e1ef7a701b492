use anyhow::{bail, Result};

/// Environment-driven configuration. Every token is read once at startup;
/// missing *required* values for the selected mode fail before any side
/// effects (the only condition under which a run exits non-zero).
#[derive(Debug, Clone)]
pub struct Config {
    pub github_token: Option<String>,
    pub gemini_api_key: Option<String>,
    pub catalog_url: Option<String>,
    pub catalog_key: Option<String>,
    pub gcp_project: Option<String>,
    pub gcp_access_token: Option<String>,
}

fn env_non_empty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            github_token: Self::github_token(),
            gemini_api_key: env_non_empty("GEMINI_API_KEY"),
            catalog_url: env_non_empty("CATALOG_URL"),
            catalog_key: env_non_empty("CATALOG_KEY"),
            gcp_project: env_non_empty("GCP_PROJECT"),
            gcp_access_token: env_non_empty("GCP_ACCESS_TOKEN"),
        }
    }

    /// GitHub token from environment or the gh CLI.
    pub fn github_token() -> Option<String> {
        if let Some(token) = env_non_empty("GITHUB_TOKEN") {
            return Some(token);
        }
        if let Some(token) = env_non_empty("GH_TOKEN") {
            return Some(token);
        }
        if let Ok(output) = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
        {
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }
        None
    }

    /// Catalog store credentials are required by every mode.
    pub fn require_catalog(&self) -> Result<(&str, &str)> {
        match (&self.catalog_url, &self.catalog_key) {
            (Some(url), Some(key)) => Ok((url.as_str(), key.as_str())),
            _ => bail!("CATALOG_URL and CATALOG_KEY must be set"),
        }
    }

    /// Enrichment cannot run without a classification backend.
    pub fn require_gemini(&self) -> Result<&str> {
        self.gemini_api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY must be set for enrichment"))
    }

    /// Bulk-dataset discovery needs a project and an access token.
    pub fn require_bigquery(&self) -> Result<(&str, &str)> {
        match (&self.gcp_project, &self.gcp_access_token) {
            (Some(p), Some(t)) => Ok((p.as_str(), t.as_str())),
            _ => bail!("GCP_PROJECT and GCP_ACCESS_TOKEN must be set for bulk-dataset discovery"),
        }
    }
}
