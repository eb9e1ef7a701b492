//! Deterministic scoring: trending (repo metadata only) and vibe
//! (downloads + mentions + quality + sentiment + recency).
//!
//! Both are pure functions of already-fetched inputs so a caller can audit
//! every component from stored fields.

use chrono::{DateTime, Utc};

/// Caps for the trending components.
const STAR_CAP: f64 = 40.0;
const FORK_CAP: f64 = 15.0;

/// Trending score in [0, 100]: log-scaled stars (cap 40) + log-scaled forks
/// (cap 15) + a step function of push recency (20/15/8/0 at 14/30/90 days).
pub fn trending_score(stars: u64, forks: u64, pushed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u32 {
    let star_term = (log10_at_least_one(stars) * 15.0).floor().min(STAR_CAP);
    let fork_term = (log10_at_least_one(forks) * 8.0).floor().min(FORK_CAP);
    let recency_term = match pushed_at {
        Some(t) => {
            let days = (now - t).num_days();
            if days <= 14 {
                20.0
            } else if days <= 30 {
                15.0
            } else if days <= 90 {
                8.0
            } else {
                0.0
            }
        }
        None => 0.0,
    };
    ((star_term + fork_term + recency_term) as u32).min(100)
}

fn log10_at_least_one(n: u64) -> f64 {
    (n.max(1) as f64).log10()
}

/// Inputs for the vibe score, all derivable from stored rows.
#[derive(Debug, Clone, Default)]
pub struct VibeInputs {
    /// Combined weekly downloads across package registries.
    pub downloads: u64,
    /// Mentions posted within the last 7 days.
    pub mentions_7d: u64,
    /// Mentions posted within the last 30 days (inclusive of the last 7).
    pub mentions_30d: u64,
    /// Average per-mention upvote/score.
    pub avg_score: f64,
    /// Average sentiment in [-1, 1], if any mention carries one.
    pub avg_sentiment: Option<f64>,
}

/// The five capped components plus the clamped total. Each component is
/// independently reproducible so the breakdown can be stored and audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VibeBreakdown {
    pub downloads: u32,
    pub mentions: u32,
    pub quality: u32,
    pub sentiment: u32,
    pub recency: u32,
    pub total: u32,
}

pub fn vibe_score(inputs: &VibeInputs) -> VibeBreakdown {
    let downloads = downloads_signal(inputs.downloads);
    let mentions = mentions_signal(inputs.mentions_7d, inputs.mentions_30d);
    let quality = quality_signal(inputs.avg_score);
    let sentiment = sentiment_signal(inputs.avg_sentiment);
    let recency = recency_signal(inputs.mentions_7d, inputs.mentions_30d);
    let total = (downloads + mentions + quality + sentiment + recency).min(100);
    VibeBreakdown {
        downloads,
        mentions,
        quality,
        sentiment,
        recency,
        total,
    }
}

/// min(30, floor(log10(downloads) * 8))
pub fn downloads_signal(downloads: u64) -> u32 {
    ((log10_at_least_one(downloads) * 8.0).floor() as u32).min(30)
}

/// min(30, 5 * mentions_7d + 1 * mentions_30d)
pub fn mentions_signal(mentions_7d: u64, mentions_30d: u64) -> u32 {
    ((mentions_7d * 5 + mentions_30d) as u32).min(30)
}

/// min(20, round(log10(avg_score) * 10)); avg 50 scores 17.
pub fn quality_signal(avg_score: f64) -> u32 {
    ((avg_score.max(1.0).log10() * 10.0).round() as u32).min(20)
}

/// round((avg + 1) * 5), mapping [-1, 1] to [0, 10]. No sentiment data
/// lands on the neutral midpoint.
pub fn sentiment_signal(avg_sentiment: Option<f64>) -> u32 {
    let avg = avg_sentiment.unwrap_or(0.0).clamp(-1.0, 1.0);
    ((avg + 1.0) * 5.0).round() as u32
}

/// 10 with any mention in 7 days, 5 within 30, else 0.
pub fn recency_signal(mentions_7d: u64, mentions_30d: u64) -> u32 {
    if mentions_7d > 0 {
        10
    } else if mentions_30d > 0 {
        5
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_trending_worked_example() {
        // stars 450, forks 89, pushed 2 days ago:
        // floor(log10(450)*15)=39 + floor(log10(89)*8)=15 + 20 = 74
        let now = Utc::now();
        let pushed = now - Duration::days(2);
        assert_eq!(trending_score(450, 89, Some(pushed), now), 74);
    }

    #[test]
    fn test_trending_monotone_in_stars_and_forks() {
        let now = Utc::now();
        let pushed = Some(now - Duration::days(2));
        let mut prev = 0;
        for stars in [0u64, 1, 10, 100, 1_000, 10_000, 1_000_000] {
            let s = trending_score(stars, 50, pushed, now);
            assert!(s >= prev, "stars {} regressed", stars);
            prev = s;
        }
        let mut prev = 0;
        for forks in [0u64, 1, 10, 100, 1_000, 100_000] {
            let s = trending_score(500, forks, pushed, now);
            assert!(s >= prev, "forks {} regressed", forks);
            prev = s;
        }
    }

    #[test]
    fn test_trending_bounded() {
        let now = Utc::now();
        assert_eq!(trending_score(0, 0, None, now), 0);
        let huge = trending_score(u64::MAX / 2, u64::MAX / 2, Some(now), now);
        assert!(huge <= 100);
        // Caps: star term 40, fork term 15, recency 20
        assert_eq!(huge, 40 + 15 + 20);
    }

    #[test]
    fn test_trending_recency_steps() {
        let now = Utc::now();
        let score_at = |days| trending_score(100, 10, Some(now - Duration::days(days)), now);
        assert_eq!(score_at(2) - score_at(400), 20);
        assert_eq!(score_at(20) - score_at(400), 15);
        assert_eq!(score_at(60) - score_at(400), 8);
    }

    #[test]
    fn test_vibe_worked_example() {
        // downloads 1000, m7 2, m30 5, avg score 50, sentiment 0.4:
        // 24 + 15 + 17 + 7 + 10 = 73
        let b = vibe_score(&VibeInputs {
            downloads: 1000,
            mentions_7d: 2,
            mentions_30d: 5,
            avg_score: 50.0,
            avg_sentiment: Some(0.4),
        });
        assert_eq!(b.downloads, 24);
        assert_eq!(b.mentions, 15);
        assert_eq!(b.quality, 17);
        assert_eq!(b.sentiment, 7);
        assert_eq!(b.recency, 10);
        assert_eq!(b.total, 73);
    }

    #[test]
    fn test_vibe_total_is_sum_of_components() {
        let cases = [
            VibeInputs::default(),
            VibeInputs {
                downloads: 123_456,
                mentions_7d: 1,
                mentions_30d: 4,
                avg_score: 12.0,
                avg_sentiment: Some(-0.6),
            },
            VibeInputs {
                downloads: 10_000_000,
                mentions_7d: 50,
                mentions_30d: 200,
                avg_score: 9_000.0,
                avg_sentiment: Some(1.0),
            },
        ];
        for inputs in cases {
            let b = vibe_score(&inputs);
            let sum = b.downloads + b.mentions + b.quality + b.sentiment + b.recency;
            assert_eq!(b.total, sum.min(100));
        }
    }

    #[test]
    fn test_vibe_component_caps() {
        assert_eq!(downloads_signal(u64::MAX), 30);
        assert_eq!(mentions_signal(100, 1000), 30);
        assert_eq!(quality_signal(1e12), 20);
        assert_eq!(sentiment_signal(Some(1.0)), 10);
        assert_eq!(sentiment_signal(Some(-1.0)), 0);
        assert_eq!(recency_signal(0, 3), 5);
        assert_eq!(recency_signal(0, 0), 0);
    }

    #[test]
    fn test_vibe_zero_inputs() {
        let b = vibe_score(&VibeInputs::default());
        assert_eq!(b.total, 5); // just the neutral sentiment midpoint
        assert_eq!(b.sentiment, 5);
    }

    #[test]
    fn test_vibe_total_clamped_to_100() {
        let b = vibe_score(&VibeInputs {
            downloads: u64::MAX,
            mentions_7d: 100,
            mentions_30d: 500,
            avg_score: 1e9,
            avg_sentiment: Some(1.0),
        });
        assert_eq!(b.total, 100);
    }
}
