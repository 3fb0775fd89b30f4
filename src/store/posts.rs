//! Post persistence: batched upserts and the query surface.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{Store, DEFAULT_BATCH_SIZE};
use crate::error::Result;
use crate::models::{ContentType, EnrichedContent, Post};

/// Query filter for stored posts.
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub subreddit: Option<String>,
    pub min_score: Option<i64>,
    pub days_back: Option<i64>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub total: u64,
}

impl Store {
    /// Upsert a batch of posts inside one transaction, associating them
    /// with `session_id` and bumping the session's `posts_scraped` by
    /// the number of posts newly attributed to it.
    ///
    /// Re-fetched posts keep their earliest `scraped_at`; scalar fields
    /// are overwritten. Returns the newly-attributed count, which makes
    /// restarted sessions idempotent: replayed posts add zero.
    pub async fn upsert_posts(&self, posts: &[Post], session_id: Uuid) -> Result<u64> {
        if posts.is_empty() {
            return Ok(0);
        }
        let posts = posts.to_vec();
        let session_key = session_id.to_string();
        self.with_retry(move |conn| {
            let tx = conn.transaction()?;
            let mut newly_attributed = 0u64;
            for chunk in posts.chunks(DEFAULT_BATCH_SIZE) {
                for post in chunk {
                    tx.execute(
                        "INSERT INTO posts (
                            id, title, author, subreddit, score, upvote_ratio,
                            num_comments, created_utc, url, permalink, selftext,
                            link_url, flair, is_nsfw, is_spoiler, is_self, domain,
                            content_type, category, engagement_ratio,
                            sentiment_score, viral_potential, enriched, scraped_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                                  ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
                        ON CONFLICT(id) DO UPDATE SET
                            title = excluded.title,
                            author = excluded.author,
                            subreddit = excluded.subreddit,
                            score = excluded.score,
                            upvote_ratio = excluded.upvote_ratio,
                            num_comments = excluded.num_comments,
                            created_utc = excluded.created_utc,
                            url = excluded.url,
                            permalink = excluded.permalink,
                            selftext = excluded.selftext,
                            link_url = excluded.link_url,
                            flair = excluded.flair,
                            is_nsfw = excluded.is_nsfw,
                            is_spoiler = excluded.is_spoiler,
                            is_self = excluded.is_self,
                            domain = excluded.domain,
                            content_type = excluded.content_type,
                            category = excluded.category,
                            engagement_ratio = excluded.engagement_ratio,
                            sentiment_score = COALESCE(excluded.sentiment_score, posts.sentiment_score),
                            viral_potential = COALESCE(excluded.viral_potential, posts.viral_potential),
                            enriched = COALESCE(excluded.enriched, posts.enriched),
                            scraped_at = MIN(posts.scraped_at, excluded.scraped_at)",
                        params![
                            post.id,
                            post.title,
                            post.author,
                            post.subreddit,
                            post.score,
                            post.upvote_ratio,
                            post.num_comments,
                            post.created_utc,
                            post.url,
                            post.permalink,
                            post.selftext,
                            post.link_url,
                            post.flair,
                            post.is_nsfw,
                            post.is_spoiler,
                            post.is_self,
                            post.domain,
                            post.content_type.as_str(),
                            post.category,
                            post.engagement_ratio,
                            post.sentiment_score,
                            post.viral_potential,
                            post.enriched
                                .as_ref()
                                .map(|e| serde_json::to_string(e).unwrap_or_default()),
                            post.scraped_at.to_rfc3339(),
                        ],
                    )?;
                    newly_attributed += tx.execute(
                        "INSERT OR IGNORE INTO post_by_session (session_id, post_id)
                         VALUES (?1, ?2)",
                        params![session_key, post.id],
                    )? as u64;
                }
            }
            tx.execute(
                "UPDATE sessions SET posts_scraped = posts_scraped + ?1
                 WHERE session_id = ?2",
                params![newly_attributed, session_key],
            )?;
            tx.commit()?;
            Ok(newly_attributed)
        })
        .await
    }

    /// Paged query over stored posts with stable ordering
    /// (`created_utc` desc, `id` desc).
    pub async fn query_posts(&self, filter: &PostFilter) -> Result<PostPage> {
        let filter = filter.clone();
        self.with_retry(move |conn| {
            let mut where_clauses: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(subreddit) = &filter.subreddit {
                where_clauses.push(format!("subreddit = ?{}", args.len() + 1));
                args.push(Box::new(subreddit.clone()));
            }
            if let Some(min_score) = filter.min_score {
                where_clauses.push(format!("score >= ?{}", args.len() + 1));
                args.push(Box::new(min_score));
            }
            if let Some(days) = filter.days_back {
                let cutoff = (Utc::now() - ChronoDuration::days(days)).timestamp();
                where_clauses.push(format!("created_utc >= ?{}", args.len() + 1));
                args.push(Box::new(cutoff));
            }
            if let Some(search) = &filter.search {
                where_clauses.push(format!("title LIKE ?{}", args.len() + 1));
                args.push(Box::new(format!("%{search}%")));
            }

            let where_sql = if where_clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", where_clauses.join(" AND "))
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM posts {where_sql}"),
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| row.get(0),
            )?;

            let limit = if filter.limit == 0 { 50 } else { filter.limit };
            let sql = format!(
                "SELECT * FROM posts {where_sql}
                 ORDER BY created_utc DESC, id DESC
                 LIMIT {limit} OFFSET {offset}",
                offset = filter.offset
            );
            let mut stmt = conn.prepare(&sql)?;
            let posts = stmt
                .query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    row_to_post,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(PostPage {
                posts,
                total: total as u64,
            })
        })
        .await
    }

    /// All posts from a subreddit within the window, newest first.
    /// Feeds the analytics adapters.
    pub async fn posts_for_analytics(
        &self,
        subreddit: Option<&str>,
        days_back: i64,
    ) -> Result<Vec<Post>> {
        let page = self
            .query_posts(&PostFilter {
                subreddit: subreddit.map(|s| s.to_string()),
                days_back: Some(days_back),
                limit: 10_000,
                ..Default::default()
            })
            .await?;
        Ok(page.posts)
    }
}

fn row_to_post(row: &Row<'_>) -> rusqlite::Result<Post> {
    let content_type: String = row.get("content_type")?;
    let scraped_at: String = row.get("scraped_at")?;
    let enriched: Option<String> = row.get("enriched")?;
    Ok(Post {
        id: row.get("id")?,
        title: row.get("title")?,
        author: row.get("author")?,
        subreddit: row.get("subreddit")?,
        score: row.get("score")?,
        upvote_ratio: row.get("upvote_ratio")?,
        num_comments: row.get("num_comments")?,
        created_utc: row.get("created_utc")?,
        url: row.get("url")?,
        permalink: row.get("permalink")?,
        selftext: row.get("selftext")?,
        link_url: row.get("link_url")?,
        flair: row.get("flair")?,
        is_nsfw: row.get("is_nsfw")?,
        is_spoiler: row.get("is_spoiler")?,
        is_self: row.get("is_self")?,
        domain: row.get("domain")?,
        content_type: ContentType::parse(&content_type).unwrap_or(ContentType::Link),
        category: row.get("category")?,
        engagement_ratio: row.get("engagement_ratio")?,
        sentiment_score: row.get("sentiment_score")?,
        viral_potential: row.get("viral_potential")?,
        enriched: enriched.and_then(|s| serde_json::from_str::<EnrichedContent>(&s).ok()),
        scraped_at: DateTime::parse_from_rfc3339(&scraped_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_util::scratch_store;
    use super::*;
    use crate::models::{Session, SessionOptions};

    fn sample_post(id: &str, subreddit: &str, score: i64) -> Post {
        Post {
            id: id.to_string(),
            title: format!("post {id}"),
            author: Some("alice".into()),
            subreddit: subreddit.to_string(),
            score,
            upvote_ratio: 0.9,
            num_comments: 5,
            created_utc: 1_700_000_000 + score,
            url: "https://example.com".into(),
            permalink: format!("https://reddit.com/r/{subreddit}/{id}"),
            selftext: String::new(),
            link_url: None,
            flair: None,
            is_nsfw: false,
            is_spoiler: false,
            is_self: true,
            domain: format!("self.{subreddit}"),
            content_type: ContentType::Text,
            category: "text".into(),
            engagement_ratio: 0.1,
            sentiment_score: None,
            viral_potential: None,
            enriched: None,
            scraped_at: Utc::now(),
        }
    }

    async fn seeded_session(store: &Store) -> Uuid {
        let session = Session::new(vec!["rust".into()], 10, SessionOptions::default());
        let id = session.session_id;
        store.create_session(&session).await.unwrap();
        id
    }

    #[tokio::test]
    async fn upsert_counts_only_new_attributions() {
        let (store, _dir) = scratch_store().await;
        let sid = seeded_session(&store).await;

        let batch = vec![sample_post("a", "rust", 1), sample_post("b", "rust", 2)];
        assert_eq!(store.upsert_posts(&batch, sid).await.unwrap(), 2);
        // Replaying the same batch attributes nothing new.
        assert_eq!(store.upsert_posts(&batch, sid).await.unwrap(), 0);

        let session = store.get_session(sid).await.unwrap().unwrap();
        assert_eq!(session.posts_scraped, 2);
    }

    #[tokio::test]
    async fn upsert_preserves_earliest_scraped_at() {
        let (store, _dir) = scratch_store().await;
        let sid = seeded_session(&store).await;

        let mut first = sample_post("a", "rust", 1);
        first.scraped_at = Utc::now() - ChronoDuration::hours(2);
        let early = first.scraped_at;
        store.upsert_posts(&[first], sid).await.unwrap();

        let mut second = sample_post("a", "rust", 99);
        second.scraped_at = Utc::now();
        store.upsert_posts(&[second], sid).await.unwrap();

        let page = store.query_posts(&PostFilter::default()).await.unwrap();
        let post = &page.posts[0];
        assert_eq!(post.score, 99, "scalar fields overwritten");
        assert!((post.scraped_at - early).num_seconds().abs() < 2);
    }

    #[tokio::test]
    async fn query_filters_compose() {
        let (store, _dir) = scratch_store().await;
        let sid = seeded_session(&store).await;
        let batch = vec![
            sample_post("a", "rust", 10),
            sample_post("b", "rust", 50),
            sample_post("c", "python", 50),
        ];
        store.upsert_posts(&batch, sid).await.unwrap();

        let page = store
            .query_posts(&PostFilter {
                subreddit: Some("rust".into()),
                min_score: Some(20),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.posts[0].id, "b");
    }

    #[tokio::test]
    async fn min_score_returns_exactly_matching_set() {
        let (store, _dir) = scratch_store().await;
        let sid = seeded_session(&store).await;
        let batch: Vec<Post> = (0..10)
            .map(|i| sample_post(&format!("p{i}"), "rust", i))
            .collect();
        store.upsert_posts(&batch, sid).await.unwrap();

        let page = store
            .query_posts(&PostFilter {
                min_score: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert!(page.posts.iter().all(|p| p.score >= 5));
        // Stable ordering: newest first, no duplicates.
        let mut ids: Vec<_> = page.posts.iter().map(|p| p.id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn search_matches_title_substring() {
        let (store, _dir) = scratch_store().await;
        let sid = seeded_session(&store).await;
        let mut post = sample_post("a", "rust", 1);
        post.title = "Announcing tokio 2.0".into();
        store.upsert_posts(&[post], sid).await.unwrap();

        let page = store
            .query_posts(&PostFilter {
                search: Some("tokio".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }
}
