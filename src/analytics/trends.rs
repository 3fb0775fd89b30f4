//! Posting and engagement trend summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::models::Post;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Flat,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendSummary {
    pub analyzed: usize,
    pub window_days: i64,
    /// Posts per calendar day, ascending by date.
    pub daily_counts: BTreeMap<String, u64>,
    pub avg_score: f64,
    pub avg_comments: f64,
    pub peak_hours: Vec<(u32, u64)>,
    pub direction: TrendDirection,
}

/// Summarize posting volume and engagement over the trailing window.
pub fn summarize_trends(posts: &[Post], days_back: i64, now: DateTime<Utc>) -> TrendSummary {
    let cutoff = now.timestamp() - days_back * 86_400;
    let recent: Vec<&Post> = posts.iter().filter(|p| p.created_utc >= cutoff).collect();

    let mut daily_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut hourly: BTreeMap<u32, u64> = BTreeMap::new();
    for post in &recent {
        if let Some(dt) = Utc.timestamp_opt(post.created_utc, 0).single() {
            *daily_counts.entry(dt.format("%Y-%m-%d").to_string()).or_default() += 1;
            *hourly.entry(dt.format("%H").to_string().parse().unwrap_or(0)).or_default() += 1;
        }
    }

    let avg_score = if recent.is_empty() {
        0.0
    } else {
        recent.iter().map(|p| p.score as f64).sum::<f64>() / recent.len() as f64
    };
    let avg_comments = if recent.is_empty() {
        0.0
    } else {
        recent.iter().map(|p| p.num_comments as f64).sum::<f64>() / recent.len() as f64
    };

    let mut peak_hours: Vec<(u32, u64)> = hourly.into_iter().collect();
    peak_hours.sort_by(|a, b| b.1.cmp(&a.1));
    peak_hours.truncate(3);

    TrendSummary {
        analyzed: recent.len(),
        window_days: days_back,
        direction: direction(&daily_counts),
        daily_counts,
        avg_score,
        avg_comments,
        peak_hours,
    }
}

/// Compare the mean of the first and last halves of the daily series.
fn direction(daily: &BTreeMap<String, u64>) -> TrendDirection {
    if daily.len() < 3 {
        return TrendDirection::Flat;
    }
    let values: Vec<f64> = daily.values().map(|v| *v as f64).collect();
    let mid = values.len() / 2;
    let first = values[..mid].iter().sum::<f64>() / mid as f64;
    let second = values[mid..].iter().sum::<f64>() / (values.len() - mid) as f64;
    if second > first * 1.2 {
        TrendDirection::Rising
    } else if second < first * 0.8 {
        TrendDirection::Falling
    } else {
        TrendDirection::Flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentType;

    fn post_at(days_ago: i64, score: i64, now: DateTime<Utc>) -> Post {
        Post {
            id: format!("p{days_ago}-{score}"),
            title: "t".into(),
            author: None,
            subreddit: "rust".into(),
            score,
            upvote_ratio: 0.9,
            num_comments: 4,
            created_utc: now.timestamp() - days_ago * 86_400,
            url: String::new(),
            permalink: String::new(),
            selftext: String::new(),
            link_url: None,
            flair: None,
            is_nsfw: false,
            is_spoiler: false,
            is_self: true,
            domain: String::new(),
            content_type: ContentType::Text,
            category: "text".into(),
            engagement_ratio: 0.0,
            sentiment_score: None,
            viral_potential: None,
            enriched: None,
            scraped_at: now,
        }
    }

    #[test]
    fn window_excludes_old_posts() {
        let now = Utc::now();
        let posts = vec![post_at(1, 10, now), post_at(2, 20, now), post_at(40, 99, now)];
        let summary = summarize_trends(&posts, 7, now);
        assert_eq!(summary.analyzed, 2);
        assert!((summary.avg_score - 15.0).abs() < 1e-9);
    }

    #[test]
    fn rising_volume_detected() {
        let now = Utc::now();
        let mut posts = Vec::new();
        // One post/day early in the window, four/day late.
        for day in (4..8).rev() {
            posts.push(post_at(day, 1, now));
        }
        for day in 0..4 {
            for _ in 0..4 {
                posts.push(post_at(day, 1, now));
            }
        }
        let summary = summarize_trends(&posts, 10, now);
        assert_eq!(summary.direction, TrendDirection::Rising);
    }

    #[test]
    fn empty_set_is_flat() {
        let summary = summarize_trends(&[], 7, Utc::now());
        assert_eq!(summary.analyzed, 0);
        assert_eq!(summary.direction, TrendDirection::Flat);
    }
}
