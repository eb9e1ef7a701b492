mod bigquery;
mod config;
mod curated;
mod enrich;
mod fetcher;
mod gemini;
mod github;
mod mentions;
mod persist;
mod pipeline;
mod registries;
mod repair;
mod score;
mod staging;
mod store;
mod types;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::Config;
use pipeline::{Pipeline, Source};
use store::RestStore;
use types::ArtifactType;

#[derive(Parser)]
#[command(name = "vibedex")]
#[command(about = "Discovers, classifies and scores AI-tooling artifacts across registries")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  vibedex discover --source github --limit 500
  vibedex enrich --kind mcp-server --budget 600
  vibedex run --budget 3600        # full pipeline under one budget")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the configured sources and stage new candidates
    Discover {
        /// Source to crawl
        #[arg(short, long, value_enum, default_value = "all")]
        source: Source,

        /// Only stage candidates of this type (e.g. "mcp-server")
        #[arg(short, long)]
        kind: Option<String>,

        /// Maximum candidates per run
        #[arg(short, long, default_value = "1000")]
        limit: usize,

        /// Wall-clock budget in seconds; stops cleanly between pages
        #[arg(short, long)]
        budget: Option<u64>,
    },

    /// Classify pending candidates and persist canonical artifacts
    Enrich {
        /// Only enrich candidates of this type
        #[arg(short, long)]
        kind: Option<String>,

        /// Maximum candidates per run
        #[arg(short, long, default_value = "200")]
        limit: usize,

        /// Wall-clock budget in seconds; stops cleanly between waves
        #[arg(short, long)]
        budget: Option<u64>,
    },

    /// Refresh mention signals and recompute scores for stored artifacts
    VibeScore {
        /// Maximum artifacts per run
        #[arg(short, long, default_value = "200")]
        limit: usize,

        /// Wall-clock budget in seconds
        #[arg(short, long)]
        budget: Option<u64>,
    },

    /// Discover, enrich, then score under one shared budget
    Run {
        /// Maximum items per phase
        #[arg(short, long, default_value = "500")]
        limit: usize,

        /// Wall-clock budget in seconds, shared across phases
        #[arg(short, long)]
        budget: Option<u64>,
    },
}

fn parse_kind(kind: Option<&str>) -> Result<Option<ArtifactType>> {
    match kind {
        None => Ok(None),
        Some(s) => ArtifactType::parse(s)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("unknown artifact type: {}", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    // The only non-zero exits: bad flags and missing startup configuration.
    // Per-item failures downstream are recorded and reported, not fatal.
    let (url, key) = config.require_catalog()?;
    let store = RestStore::new(url, key);
    let pipeline = Pipeline::new(&config, &store);

    let report = match cli.command {
        Commands::Discover {
            source,
            kind,
            limit,
            budget,
        } => {
            let kind = parse_kind(kind.as_deref())?;
            pipeline.discover(source, kind, limit, budget).await?
        }
        Commands::Enrich { kind, limit, budget } => {
            let kind = parse_kind(kind.as_deref())?;
            config.require_gemini()?;
            pipeline.enrich(kind, limit, budget).await?
        }
        Commands::VibeScore { limit, budget } => pipeline.vibe_score(limit, budget).await?,
        Commands::Run { limit, budget } => {
            config.require_gemini()?;
            pipeline.run(limit, budget).await?
        }
    };

    report.print();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind(None).unwrap(), None);
        assert_eq!(
            parse_kind(Some("mcp-server")).unwrap(),
            Some(ArtifactType::McpServer)
        );
        assert!(parse_kind(Some("banana")).is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
