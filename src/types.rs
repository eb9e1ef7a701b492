//! Core records flowing through the pipeline: staged candidates, canonical
//! artifacts, social mentions, and the closed classification taxonomies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Artifact type taxonomy (closed). Every discoverer assigns one of these as
/// a provisional hint; enrichment may overwrite it with a validated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactType {
    Skill,
    McpServer,
    RuleSet,
    WorkflowNode,
    FrameworkTool,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 5] = [
        ArtifactType::Skill,
        ArtifactType::McpServer,
        ArtifactType::RuleSet,
        ArtifactType::WorkflowNode,
        ArtifactType::FrameworkTool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Skill => "skill",
            ArtifactType::McpServer => "mcp-server",
            ArtifactType::RuleSet => "rule-set",
            ArtifactType::WorkflowNode => "workflow-node",
            ArtifactType::FrameworkTool => "framework-tool",
        }
    }

    /// Parse a model- or user-supplied label. Tolerates a few common
    /// synonyms; anything else is None so the caller can fall back to the hint.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "skill" | "agent-skill" => Some(ArtifactType::Skill),
            "mcp-server" | "mcp" | "protocol-server" => Some(ArtifactType::McpServer),
            "rule-set" | "ruleset" | "rules" | "ide-rules" => Some(ArtifactType::RuleSet),
            "workflow-node" | "workflow" | "node" => Some(ArtifactType::WorkflowNode),
            "framework-tool" | "tool" | "framework" => Some(ArtifactType::FrameworkTool),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category taxonomy (closed). Unknown values coerce to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Coding,
    Data,
    Devops,
    Productivity,
    Research,
    Content,
    Automation,
    Security,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Coding => "coding",
            Category::Data => "data",
            Category::Devops => "devops",
            Category::Productivity => "productivity",
            Category::Research => "research",
            Category::Content => "content",
            Category::Automation => "automation",
            Category::Security => "security",
            Category::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "coding" | "code" | "development" => Some(Category::Coding),
            "data" | "database" | "analytics" => Some(Category::Data),
            "devops" | "infrastructure" | "cloud" => Some(Category::Devops),
            "productivity" => Some(Category::Productivity),
            "research" | "science" => Some(Category::Research),
            "content" | "writing" | "docs" | "documentation" => Some(Category::Content),
            "automation" | "workflow" => Some(Category::Automation),
            "security" => Some(Category::Security),
            "other" | "misc" => Some(Category::Other),
            _ => None,
        }
    }

    /// Coerce a free-form label into the taxonomy, defaulting to `Other`.
    pub fn coerce(s: &str) -> Self {
        Self::parse(s).unwrap_or(Category::Other)
    }
}

/// Platform compatibility vocabulary (closed). Labels outside this list are
/// dropped during enrichment validation rather than failing the record.
pub const PLATFORMS: [&str; 10] = [
    "claude-code",
    "cursor",
    "windsurf",
    "vscode",
    "codex-cli",
    "gemini-cli",
    "n8n",
    "langchain",
    "copilot",
    "zed",
];

pub fn is_known_platform(label: &str) -> bool {
    PLATFORMS.contains(&label)
}

/// Normalize a platform label and keep it only if it is in the vocabulary.
pub fn coerce_platform(label: &str) -> Option<String> {
    let norm = label.trim().to_lowercase().replace([' ', '_'], "-");
    if is_known_platform(norm.as_str()) {
        Some(norm)
    } else {
        None
    }
}

/// Enrichment lifecycle of a staged candidate. `Skipped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichStatus {
    Pending,
    Enriched,
    Failed,
    Skipped,
}

impl EnrichStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichStatus::Pending => "pending",
            EnrichStatus::Enriched => "enriched",
            EnrichStatus::Failed => "failed",
            EnrichStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EnrichStatus::Pending),
            "enriched" => Some(EnrichStatus::Enriched),
            "failed" => Some(EnrichStatus::Failed),
            "skipped" => Some(EnrichStatus::Skipped),
            _ => None,
        }
    }

    /// Terminal statuses must never be regressed to pending by rediscovery.
    pub fn is_settled(&self) -> bool {
        matches!(self, EnrichStatus::Enriched | EnrichStatus::Skipped)
    }
}

/// A discovered-but-unclassified repository, staged for enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Canonical identifier "owner/name". Identity comparisons use the
    /// lowercase form; display keeps the original casing.
    pub repo_id: String,
    pub hint: ArtifactType,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub topics: Vec<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    /// Fetched lazily before a single-item enrichment call.
    pub readme: Option<String>,
    pub status: EnrichStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub artifact_id: Option<i64>,
}

impl Candidate {
    pub fn new(repo_id: impl Into<String>, hint: ArtifactType) -> Self {
        Self {
            repo_id: repo_id.into(),
            hint,
            description: None,
            language: None,
            stars: 0,
            forks: 0,
            topics: Vec::new(),
            pushed_at: None,
            created_at: None,
            readme: None,
            status: EnrichStatus::Pending,
            attempts: 0,
            last_error: None,
            artifact_id: None,
        }
    }

    /// Canonical lowercase key used for dedup and store conflict resolution.
    pub fn canonical_id(&self) -> String {
        canonical_repo_id(&self.repo_id)
    }

    pub fn owner(&self) -> &str {
        self.repo_id.split('/').next().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.repo_id.split('/').nth(1).unwrap_or("")
    }
}

pub fn canonical_repo_id(repo_id: &str) -> String {
    repo_id.trim().trim_end_matches(".git").to_lowercase()
}

/// Taxonomy fields produced by the classification backend for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedFields {
    pub kind: ArtifactType,
    pub category: Category,
    pub tags: Vec<String>,
    pub install: String,
    pub platforms: Vec<String>,
    pub summary: String,
}

/// Maximum tags kept per artifact.
pub const MAX_TAGS: usize = 8;

/// A canonical, enriched, scored record ready for presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub repo_id: String,
    pub kind: ArtifactType,
    pub category: Category,
    pub tags: Vec<String>,
    pub install: String,
    pub platforms: Vec<String>,
    pub summary: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub topics: Vec<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub trending_score: u32,
    pub vibe_score: u32,
    pub vibe_downloads: u32,
    pub vibe_mentions: u32,
    pub vibe_quality: u32,
    pub vibe_sentiment: u32,
    pub vibe_recency: u32,
    pub status: String,
}

/// One social-platform post/article referencing an artifact.
/// Unique on (source, external_id); immutable after creation except for
/// sentiment backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub source: String,
    pub external_id: String,
    pub repo_id: String,
    pub title: String,
    pub url: String,
    pub score: i64,
    pub comments: i64,
    pub sentiment: Option<f64>,
    pub posted_at: DateTime<Utc>,
}

/// One source-platform account, upserted opportunistically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub username: String,
    pub profile_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_type_parse_synonyms() {
        assert_eq!(ArtifactType::parse("MCP"), Some(ArtifactType::McpServer));
        assert_eq!(ArtifactType::parse("ruleset"), Some(ArtifactType::RuleSet));
        assert_eq!(ArtifactType::parse("agent_skill"), Some(ArtifactType::Skill));
        assert_eq!(ArtifactType::parse("banana"), None);
    }

    #[test]
    fn test_artifact_type_roundtrip() {
        for kind in ArtifactType::ALL {
            assert_eq!(ArtifactType::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_category_coerce_defaults_to_other() {
        assert_eq!(Category::coerce("devops"), Category::Devops);
        assert_eq!(Category::coerce("quantum-gardening"), Category::Other);
    }

    #[test]
    fn test_platform_coercion() {
        assert_eq!(coerce_platform("Claude Code"), Some("claude-code".into()));
        assert_eq!(coerce_platform("n8n"), Some("n8n".into()));
        assert_eq!(coerce_platform("emacs"), None);
    }

    #[test]
    fn test_canonical_repo_id() {
        assert_eq!(canonical_repo_id("Foo/Bar.git"), "foo/bar");
        assert_eq!(canonical_repo_id("  Owner/Name "), "owner/name");
    }

    #[test]
    fn test_settled_statuses() {
        assert!(EnrichStatus::Enriched.is_settled());
        assert!(EnrichStatus::Skipped.is_settled());
        assert!(!EnrichStatus::Pending.is_settled());
        assert!(!EnrichStatus::Failed.is_settled());
    }
}
