//! Pure analytics adapters.
//!
//! Each adapter is a function over post data with no scheduler or store
//! coupling, so implementations can be swapped, mocked, or parallelized
//! without touching session semantics.

mod sentiment;
mod trends;
mod viral;

pub use sentiment::{score_text, sentiment_label, SentimentSummary};
pub use trends::{summarize_trends, TrendDirection, TrendSummary};
pub use viral::viral_potential;

use crate::models::Post;

/// Sentiment is scored only for post sets up to this size; larger sets
/// keep their scores unset (annotation) or are sampled down (queries).
pub const SENTIMENT_BATCH_LIMIT: usize = 500;

/// Annotate a batch with sentiment and viral-potential scores, in place.
/// Glue only; the scorers themselves stay pure. Batches over
/// [`SENTIMENT_BATCH_LIMIT`] skip sentiment and keep viral scoring.
pub fn annotate_batch(posts: &mut [Post], now: chrono::DateTime<chrono::Utc>) {
    let with_sentiment = posts.len() <= SENTIMENT_BATCH_LIMIT;
    for post in posts.iter_mut() {
        if with_sentiment {
            let text = format!("{} {}", post.title, post.selftext);
            post.sentiment_score = Some(score_text(&text));
        }
        post.viral_potential = Some(viral_potential(post, now));
    }
}

/// Aggregate sentiment over a post set.
pub fn summarize_sentiment(posts: &[Post]) -> SentimentSummary {
    sentiment::summarize(posts)
}
