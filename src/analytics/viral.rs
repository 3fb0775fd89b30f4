//! Viral-potential scoring.

use chrono::{DateTime, Utc};

use crate::models::Post;

/// Estimate how likely a post is to keep climbing, in [0, 100].
///
/// Blends score velocity (points per hour since creation), comment
/// engagement, and upvote ratio. Young high-velocity posts dominate.
pub fn viral_potential(post: &Post, now: DateTime<Utc>) -> f64 {
    let age_hours = ((now.timestamp() - post.created_utc) as f64 / 3600.0).max(0.25);
    let velocity = post.score.max(0) as f64 / age_hours;
    // 50 points/hour saturates the velocity component.
    let velocity_component = (velocity / 50.0).min(1.0);
    let engagement_component = (post.engagement_ratio / 2.0).min(1.0);
    let ratio_component = post.upvote_ratio.clamp(0.0, 1.0);

    (velocity_component * 0.5 + engagement_component * 0.3 + ratio_component * 0.2) * 100.0
}
