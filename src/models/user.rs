//! User profile model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScrapeError;

/// A scraped user profile, keyed by username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub id: String,
    pub created_utc: i64,
    pub comment_karma: i64,
    pub link_karma: i64,
    pub is_verified: bool,
    pub has_premium: bool,
    pub profile_description: String,
    pub scraped_at: DateTime<Utc>,
}

/// Raw profile record from the forum's user endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawUser {
    pub name: Option<String>,
    pub id: Option<String>,
    pub created_utc: Option<f64>,
    #[serde(default)]
    pub comment_karma: i64,
    #[serde(default)]
    pub link_karma: i64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub is_gold: bool,
    pub subreddit: Option<RawUserSubreddit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUserSubreddit {
    #[serde(default)]
    pub public_description: String,
}

impl User {
    pub fn from_raw(raw: RawUser, now: DateTime<Utc>) -> Result<Self, ScrapeError> {
        let username = raw
            .name
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScrapeError::Skipped("user record missing name".into()))?;
        Ok(User {
            username,
            id: raw.id.unwrap_or_default(),
            created_utc: raw.created_utc.map(|t| t as i64).unwrap_or(0),
            comment_karma: raw.comment_karma,
            link_karma: raw.link_karma,
            is_verified: raw.verified,
            has_premium: raw.is_gold,
            profile_description: raw
                .subreddit
                .map(|s| s.public_description)
                .unwrap_or_default(),
            scraped_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_profile() {
        let raw = RawUser {
            name: Some("bob".into()),
            id: Some("u_1".into()),
            created_utc: Some(1_600_000_000.0),
            comment_karma: 10,
            link_karma: 20,
            verified: true,
            is_gold: false,
            subreddit: Some(RawUserSubreddit {
                public_description: "hi".into(),
            }),
        };
        let user = User::from_raw(raw, Utc::now()).unwrap();
        assert_eq!(user.username, "bob");
        assert_eq!(user.comment_karma, 10);
        assert!(user.is_verified);
        assert_eq!(user.profile_description, "hi");
    }

    #[test]
    fn missing_name_is_skipped() {
        let raw = RawUser {
            name: None,
            id: None,
            created_utc: None,
            comment_karma: 0,
            link_karma: 0,
            verified: false,
            is_gold: false,
            subreddit: None,
        };
        assert!(matches!(
            User::from_raw(raw, Utc::now()),
            Err(ScrapeError::Skipped(_))
        ));
    }
}
