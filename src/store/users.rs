//! User persistence.

use rusqlite::params;
use uuid::Uuid;

use super::{Store, DEFAULT_BATCH_SIZE};
use crate::error::Result;
use crate::models::User;

impl Store {
    /// Upsert a batch of users in one transaction, bumping the owning
    /// session's `users_scraped` by the number of newly inserted rows.
    pub async fn upsert_users(&self, users: &[User], session_id: Uuid) -> Result<u64> {
        if users.is_empty() {
            return Ok(0);
        }
        let users = users.to_vec();
        let session_key = session_id.to_string();
        self.with_retry(move |conn| {
            let tx = conn.transaction()?;
            let before: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            for chunk in users.chunks(DEFAULT_BATCH_SIZE) {
                for user in chunk {
                    tx.execute(
                        "INSERT INTO users (
                            username, id, created_utc, comment_karma, link_karma,
                            is_verified, has_premium, profile_description, scraped_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                        ON CONFLICT(username) DO UPDATE SET
                            id = excluded.id,
                            created_utc = excluded.created_utc,
                            comment_karma = excluded.comment_karma,
                            link_karma = excluded.link_karma,
                            is_verified = excluded.is_verified,
                            has_premium = excluded.has_premium,
                            profile_description = excluded.profile_description,
                            scraped_at = MIN(users.scraped_at, excluded.scraped_at)",
                        params![
                            user.username,
                            user.id,
                            user.created_utc,
                            user.comment_karma,
                            user.link_karma,
                            user.is_verified,
                            user.has_premium,
                            user.profile_description,
                            user.scraped_at.to_rfc3339(),
                        ],
                    )?;
                }
            }
            let after: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            let inserted = (after - before).max(0) as u64;
            tx.execute(
                "UPDATE sessions SET users_scraped = users_scraped + ?1
                 WHERE session_id = ?2",
                params![inserted as i64, session_key],
            )?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_string();
        self.with_retry(move |conn| {
            use rusqlite::OptionalExtension;
            let user = conn
                .query_row(
                    "SELECT * FROM users WHERE username = ?1",
                    params![username],
                    |row| {
                        let scraped_at: String = row.get("scraped_at")?;
                        Ok(User {
                            username: row.get("username")?,
                            id: row.get("id")?,
                            created_utc: row.get("created_utc")?,
                            comment_karma: row.get("comment_karma")?,
                            link_karma: row.get("link_karma")?,
                            is_verified: row.get("is_verified")?,
                            has_premium: row.get("has_premium")?,
                            profile_description: row.get("profile_description")?,
                            scraped_at: chrono::DateTime::parse_from_rfc3339(&scraped_at)
                                .map(|dt| dt.with_timezone(&chrono::Utc))
                                .unwrap_or_else(|_| chrono::Utc::now()),
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
        .await
    }
}
