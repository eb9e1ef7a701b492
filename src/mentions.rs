//! Social-mention collectors (Reddit, Hacker News) and the aggregation that
//! turns raw mentions into vibe-score inputs.
//!
//! Both collectors are best-effort: a failed or rate-limited search yields an
//! empty set, never an error, since mentions only modulate a score.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::fetcher::HttpFetcher;
use crate::score::VibeInputs;
use crate::types::Mention;

#[derive(Debug, Deserialize)]
struct RedditListing {
    data: RedditListingData,
}

#[derive(Debug, Deserialize)]
struct RedditListingData {
    #[serde(default)]
    children: Vec<RedditChild>,
}

#[derive(Debug, Deserialize)]
struct RedditChild {
    data: RedditPost,
}

#[derive(Debug, Deserialize)]
struct RedditPost {
    id: String,
    title: String,
    permalink: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    created_utc: f64,
}

#[derive(Debug, Deserialize)]
struct HnSearchResponse {
    #[serde(default)]
    hits: Vec<HnHit>,
}

#[derive(Debug, Deserialize)]
struct HnHit {
    #[serde(rename = "objectID")]
    object_id: String,
    title: Option<String>,
    url: Option<String>,
    #[serde(default)]
    points: i64,
    #[serde(default)]
    num_comments: i64,
    created_at: Option<String>,
}

pub struct MentionClient {
    fetcher: HttpFetcher,
}

impl MentionClient {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    /// Collect mentions of one repo across all sources, deduplicated on
    /// (source, external_id).
    pub async fn collect(&self, repo_id: &str) -> Vec<Mention> {
        let mut out = Vec::new();
        out.extend(self.search_reddit(repo_id).await);
        out.extend(self.search_hn(repo_id).await);

        let mut seen = HashSet::new();
        out.retain(|m| seen.insert((m.source.clone(), m.external_id.clone())));
        out
    }

    async fn search_reddit(&self, repo_id: &str) -> Vec<Mention> {
        let url = format!(
            "https://www.reddit.com/search.json?q=%22{}%22&sort=new&limit=50",
            repo_id.replace('/', "%2F")
        );
        let value = match self.fetcher.get_json(&url, &[]).await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("  \x1b[33m..\x1b[0m reddit search for {} skipped: {}", repo_id, e);
                return Vec::new();
            }
        };
        let Ok(listing) = serde_json::from_value::<RedditListing>(value) else {
            return Vec::new();
        };
        listing
            .data
            .children
            .into_iter()
            .filter_map(|c| {
                let p = c.data;
                let posted_at = Utc.timestamp_opt(p.created_utc as i64, 0).single()?;
                Some(Mention {
                    source: "reddit".into(),
                    external_id: p.id,
                    repo_id: crate::types::canonical_repo_id(repo_id),
                    sentiment: Some(sentiment(&p.title)),
                    title: p.title,
                    url: format!("https://www.reddit.com{}", p.permalink),
                    score: p.score,
                    comments: p.num_comments,
                    posted_at,
                })
            })
            .collect()
    }

    async fn search_hn(&self, repo_id: &str) -> Vec<Mention> {
        let name = repo_id.split('/').nth(1).unwrap_or(repo_id);
        let url = format!(
            "https://hn.algolia.com/api/v1/search?query=%22{}%22&tags=story",
            name
        );
        let value = match self.fetcher.get_json(&url, &[]).await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("  \x1b[33m..\x1b[0m hn search for {} skipped: {}", repo_id, e);
                return Vec::new();
            }
        };
        let Ok(response) = serde_json::from_value::<HnSearchResponse>(value) else {
            return Vec::new();
        };
        let needle = name.to_lowercase();
        response
            .hits
            .into_iter()
            .filter_map(|hit| {
                let title = hit.title.unwrap_or_default();
                let url = hit.url.unwrap_or_default();
                // Algolia matches loosely; keep only hits that actually name
                // the repo.
                if !title.to_lowercase().contains(&needle)
                    && !url.to_lowercase().contains(&needle)
                {
                    return None;
                }
                let posted_at = hit
                    .created_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))?;
                Some(Mention {
                    source: "hackernews".into(),
                    external_id: hit.object_id,
                    repo_id: crate::types::canonical_repo_id(repo_id),
                    sentiment: Some(sentiment(&title)),
                    title,
                    url,
                    score: hit.points,
                    comments: hit.num_comments,
                    posted_at,
                })
            })
            .collect()
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "great", "awesome", "amazing", "excellent", "love", "best", "fantastic",
    "useful", "solid", "impressive", "recommend", "powerful", "fast", "clean",
    "favorite", "brilliant",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "broken", "awful", "terrible", "worst", "hate", "slow", "buggy",
    "useless", "disappointing", "avoid", "scam", "bloated", "abandoned",
    "insecure", "unmaintained",
];

/// Lexicon sentiment in [-1, 1]: (positive - negative) hits over total hits.
/// No hits at all is neutral.
pub fn sentiment(text: &str) -> f64 {
    let mut pos = 0i32;
    let mut neg = 0i32;
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let w = word.to_lowercase();
        if POSITIVE_WORDS.contains(&w.as_str()) {
            pos += 1;
        } else if NEGATIVE_WORDS.contains(&w.as_str()) {
            neg += 1;
        }
    }
    if pos + neg == 0 {
        return 0.0;
    }
    f64::from(pos - neg) / f64::from(pos + neg)
}

/// Fold a repo's mentions plus its registry downloads into scoring inputs.
pub fn aggregate(mentions: &[Mention], downloads: u64, now: DateTime<Utc>) -> VibeInputs {
    let mut m7 = 0u64;
    let mut m30 = 0u64;
    let mut score_sum = 0i64;
    let mut sent_sum = 0.0;
    let mut sent_n = 0u64;

    for m in mentions {
        let age_days = (now - m.posted_at).num_days();
        if age_days <= 7 {
            m7 += 1;
        }
        if age_days <= 30 {
            m30 += 1;
        }
        score_sum += m.score.max(0);
        if let Some(s) = m.sentiment {
            sent_sum += s;
            sent_n += 1;
        }
    }

    let avg_score = if mentions.is_empty() {
        0.0
    } else {
        score_sum as f64 / mentions.len() as f64
    };
    let avg_sentiment = if sent_n > 0 {
        Some(sent_sum / sent_n as f64)
    } else {
        None
    };

    VibeInputs {
        downloads,
        mentions_7d: m7,
        mentions_30d: m30,
        avg_score,
        avg_sentiment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn mention(id: &str, days_ago: i64, score: i64, sentiment: Option<f64>) -> Mention {
        Mention {
            source: "reddit".into(),
            external_id: id.into(),
            repo_id: "a/b".into(),
            title: "t".into(),
            url: "u".into(),
            score,
            comments: 0,
            sentiment,
            posted_at: Utc::now() - Duration::days(days_ago),
        }
    }

    #[test]
    fn test_sentiment_lexicon() {
        assert!(sentiment("this tool is awesome and fast") > 0.9);
        assert!(sentiment("broken, buggy and abandoned") < -0.9);
        assert_eq!(sentiment("a neutral announcement"), 0.0);
        // Mixed signals cancel
        assert_eq!(sentiment("great but buggy"), 0.0);
    }

    #[test]
    fn test_aggregate_windows() {
        let now = Utc::now();
        let mentions = vec![
            mention("a", 2, 100, Some(0.5)),
            mention("b", 20, 50, Some(0.3)),
            mention("c", 60, 30, None),
        ];
        let inputs = aggregate(&mentions, 500, now);
        assert_eq!(inputs.mentions_7d, 1);
        assert_eq!(inputs.mentions_30d, 2);
        assert_eq!(inputs.downloads, 500);
        assert!((inputs.avg_score - 60.0).abs() < 1e-9);
        assert!((inputs.avg_sentiment.unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_empty() {
        let inputs = aggregate(&[], 0, Utc::now());
        assert_eq!(inputs.mentions_7d, 0);
        assert_eq!(inputs.avg_score, 0.0);
        assert!(inputs.avg_sentiment.is_none());
    }
}
