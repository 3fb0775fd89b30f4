//! Lexicon-based sentiment scoring.
//!
//! Counts weighted hits from positive/negative word lists tuned to forum
//! vernacular and squashes the balance into a compound score in [-1, 1].

use serde::Serialize;

use crate::models::Post;

const POSITIVE: &[&str] = &[
    "amazing", "awesome", "great", "excellent", "fantastic", "wonderful", "love", "best",
    "upvote", "upvoted", "thanks", "thank you", "this is gold", "lol", "haha", "lmao",
];

const NEGATIVE: &[&str] = &[
    "terrible", "awful", "horrible", "worst", "hate", "sucks", "stupid", "dumb",
    "downvote", "downvoted", "cringe", "wtf", "broken", "garbage",
];

/// Compound sentiment score for a text, in [-1, 1].
pub fn score_text(text: &str) -> f64 {
    if text.trim().is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let positives = POSITIVE.iter().filter(|w| lower.contains(**w)).count() as f64;
    let negatives = NEGATIVE.iter().filter(|w| lower.contains(**w)).count() as f64;
    let balance = positives - negatives;
    // tanh keeps pile-ons from saturating a single post at ±1 instantly.
    (balance / 2.0).tanh()
}

/// Discrete label for a compound score.
pub fn sentiment_label(score: f64) -> &'static str {
    if score > 0.05 {
        "positive"
    } else if score < -0.05 {
        "negative"
    } else {
        "neutral"
    }
}

/// Aggregate sentiment over a post set.
#[derive(Debug, Clone, Serialize)]
pub struct SentimentSummary {
    pub analyzed: usize,
    pub mean_score: f64,
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

pub(super) fn summarize(posts: &[Post]) -> SentimentSummary {
    let scores: Vec<f64> = posts
        .iter()
        .map(|p| {
            p.sentiment_score
                .unwrap_or_else(|| score_text(&format!("{} {}", p.title, p.selftext)))
        })
        .collect();
    let mut summary = SentimentSummary {
        analyzed: scores.len(),
        mean_score: 0.0,
        positive: 0,
        neutral: 0,
        negative: 0,
    };
    if scores.is_empty() {
        return summary;
    }
    summary.mean_score = scores.iter().sum::<f64>() / scores.len() as f64;
    for score in scores {
        match sentiment_label(score) {
            "positive" => summary.positive += 1,
            "negative" => summary.negative += 1,
            _ => summary.neutral += 1,
        }
    }
    summary
}
