//! Post model and canonicalization from raw forum records.
//!
//! Raw listing items arrive as loosely-typed JSON; canonicalization maps
//! them onto the fixed schema, decides the content type from media hints,
//! and computes the derived category and engagement fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScrapeError;

/// Kind of content a post links to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Link,
    Image,
    Video,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Link => "link",
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "link" => Some(Self::Link),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// Metadata pulled from an external link target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichedContent {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub snippet: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A canonical forum post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub subreddit: String,
    pub score: i64,
    pub upvote_ratio: f64,
    pub num_comments: i64,
    pub created_utc: i64,
    pub url: String,
    pub permalink: String,
    pub selftext: String,
    pub link_url: Option<String>,
    pub flair: Option<String>,
    pub is_nsfw: bool,
    pub is_spoiler: bool,
    pub is_self: bool,
    pub domain: String,
    pub content_type: ContentType,
    pub scraped_at: DateTime<Utc>,
    /// Derived: coarse category from title/flair heuristics.
    pub category: String,
    /// Derived: comments per point of score.
    pub engagement_ratio: f64,
    pub sentiment_score: Option<f64>,
    pub viral_potential: Option<f64>,
    pub enriched: Option<EnrichedContent>,
}

/// Raw listing item as returned by the forum API.
///
/// Only the fields the canonical schema needs; everything else in the
/// record is ignored by serde.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPost {
    pub id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subreddit: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub upvote_ratio: f64,
    #[serde(default)]
    pub num_comments: i64,
    pub created_utc: Option<f64>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub selftext: String,
    pub link_flair_text: Option<String>,
    #[serde(default)]
    pub over_18: bool,
    #[serde(default)]
    pub spoiler: bool,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub is_video: bool,
    pub post_hint: Option<String>,
}

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];
const VIDEO_DOMAINS: &[&str] = &["youtube.com", "youtu.be", "vimeo.com", "v.redd.it"];

impl Post {
    /// Canonicalize a raw listing item.
    ///
    /// Returns `Skipped` when identity fields are missing so the batch
    /// can continue past the one bad record.
    pub fn from_raw(raw: RawPost, now: DateTime<Utc>) -> Result<Self, ScrapeError> {
        let content_type = decide_content_type(&raw);
        let id = raw
            .id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScrapeError::Skipped("post record missing id".into()))?;
        let title = raw
            .title
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScrapeError::Skipped(format!("post {id} missing title")))?;
        let subreddit = raw
            .subreddit
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScrapeError::Skipped(format!("post {id} missing subreddit")))?;
        let created_utc = raw
            .created_utc
            .map(|t| t as i64)
            .ok_or_else(|| ScrapeError::Skipped(format!("post {id} missing created_utc")))?;

        let author = raw.author.filter(|a| !a.is_empty() && a != "[deleted]");
        let link_url = if raw.is_self || raw.url.is_empty() {
            None
        } else {
            Some(raw.url.clone())
        };
        let permalink = if raw.permalink.starts_with("http") {
            raw.permalink.clone()
        } else {
            format!("https://reddit.com{}", raw.permalink)
        };

        let mut post = Post {
            category: String::new(),
            engagement_ratio: 0.0,
            id,
            title,
            author,
            subreddit,
            score: raw.score,
            upvote_ratio: raw.upvote_ratio,
            num_comments: raw.num_comments,
            created_utc,
            url: raw.url,
            permalink,
            selftext: raw.selftext,
            link_url,
            flair: raw.link_flair_text,
            is_nsfw: raw.over_18,
            is_spoiler: raw.spoiler,
            is_self: raw.is_self,
            domain: raw.domain,
            content_type,
            scraped_at: now,
            sentiment_score: None,
            viral_potential: None,
            enriched: None,
        };
        post.category = categorize(&post);
        post.engagement_ratio = post.num_comments as f64 / post.score.max(1) as f64;
        Ok(post)
    }

    /// Whether the author or body indicate a deleted/removed post.
    pub fn is_deleted(&self) -> bool {
        self.author.is_none() || self.selftext == "[deleted]" || self.selftext == "[removed]"
    }

    /// Age of the post relative to `now`, in whole days.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now.timestamp() - self.created_utc) / 86_400
    }

    /// Whether the post carries an external link worth enriching.
    pub fn has_extractable_link(&self) -> bool {
        let Some(url) = &self.link_url else {
            return false;
        };
        if url.contains("reddit.com") || url.contains("redd.it") {
            return false;
        }
        !matches!(self.content_type, ContentType::Image | ContentType::Video)
    }
}

fn decide_content_type(raw: &RawPost) -> ContentType {
    if raw.is_self {
        return ContentType::Text;
    }
    let url = raw.url.to_lowercase();
    if raw.post_hint.as_deref() == Some("image")
        || IMAGE_EXTENSIONS.iter().any(|ext| url.ends_with(ext))
    {
        return ContentType::Image;
    }
    let domain = raw.domain.to_lowercase();
    if raw.is_video || VIDEO_DOMAINS.iter().any(|d| domain.contains(d)) {
        return ContentType::Video;
    }
    ContentType::Link
}

/// Coarse content category from title/flair/domain heuristics. Keywords
/// match as substrings anywhere in the lowercased title, and the rules
/// apply in priority order (question wins over everything else).
fn categorize(post: &Post) -> String {
    let title = post.title.to_lowercase();
    let flair = post
        .flair
        .as_deref()
        .map(|f| f.to_lowercase())
        .unwrap_or_default();

    if ["how", "what", "why", "when", "where", "?"]
        .iter()
        .any(|w| title.contains(w))
    {
        return "question".into();
    }
    if ["discussion", "thoughts", "opinion", "what do you think"]
        .iter()
        .any(|w| title.contains(w))
    {
        return "discussion".into();
    }
    if !post.is_self
        && ["news", "article", "blog", "medium", "reuters", "bbc"]
            .iter()
            .any(|d| post.domain.contains(d))
    {
        return "news".into();
    }
    if ["tutorial", "guide", "how to", "step by step"]
        .iter()
        .any(|w| title.contains(w))
    {
        return "tutorial".into();
    }
    if ["show", "made", "built", "created", "my project"]
        .iter()
        .any(|w| title.contains(w))
    {
        return "showcase".into();
    }
    if ["meme", "humor", "funny", "joke"]
        .iter()
        .any(|w| flair.contains(w))
    {
        return "meme".into();
    }
    if post.is_self {
        "text".into()
    } else {
        "link".into()
    }
}
