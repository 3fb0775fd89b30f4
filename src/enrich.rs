//! Content enrichment for posts that link out of the forum.
//!
//! The external web is a separate failure domain, so the enricher runs
//! its own admission controller and circuit breaker. Fan-out is bounded
//! by a semaphore, each URL is attempted at most once per session, and
//! failures leave the post unenriched rather than failing anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::admission::{AdmissionController, Outcome};
use crate::circuit::CircuitBreaker;
use crate::error::{Result, ScrapeError};
use crate::models::{EnrichedContent, Post};

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Concurrent in-flight page fetches.
    pub max_in_flight: usize,
    /// Largest body worth parsing; bigger pages are truncated.
    pub max_body_bytes: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: "snooscrape/0.3 (research)".to_string(),
            max_in_flight: 5,
            max_body_bytes: 512 * 1024,
        }
    }
}

pub struct ContentEnricher {
    http: reqwest::Client,
    admission: Arc<AdmissionController>,
    circuit: Arc<CircuitBreaker>,
    in_flight: Arc<Semaphore>,
    max_body_bytes: usize,
}

impl ContentEnricher {
    pub fn new(
        config: EnrichConfig,
        admission: Arc<AdmissionController>,
        circuit: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .build()
            .map_err(|e| ScrapeError::Fatal(format!("enrich client init: {e}")))?;
        Ok(Self {
            http,
            admission,
            circuit,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Enrich every extractable post in the batch, in place. Best-effort:
    /// the batch always comes back, enriched where the web cooperated.
    ///
    /// `seen` is the session-scoped set of already-attempted URLs; each
    /// URL gets one attempt per session, success or not.
    pub async fn enrich_batch(
        &self,
        posts: &mut [Post],
        seen: &mut std::collections::HashSet<String>,
    ) {
        let mut handles = Vec::new();
        for (idx, post) in posts.iter().enumerate() {
            if !post.has_extractable_link() {
                continue;
            }
            let Some(url) = post.link_url.clone() else {
                continue;
            };
            // Only well-formed web URLs are worth a fetch.
            match Url::parse(&url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                _ => continue,
            }
            if !seen.insert(url.clone()) {
                continue;
            }
            handles.push((idx, tokio::spawn(self.clone_task(url))));
        }
        for (idx, handle) in handles {
            if let Ok(Some(content)) = handle.await {
                posts[idx].enriched = Some(content);
            }
        }
    }

    fn clone_task(
        &self,
        url: String,
    ) -> impl std::future::Future<Output = Option<EnrichedContent>> + Send + 'static {
        let http = self.http.clone();
        let admission = self.admission.clone();
        let circuit = self.circuit.clone();
        let in_flight = self.in_flight.clone();
        let max_body = self.max_body_bytes;
        async move {
            let _permit = in_flight.acquire().await.ok()?;
            if circuit.check().is_err() {
                return None;
            }
            if admission.acquire().await.is_err() {
                return None;
            }
            match fetch_page(&http, &url, max_body).await {
                Ok(body) => {
                    admission.record_outcome(Outcome::Ok);
                    circuit.record_success();
                    Some(extract_metadata(&body))
                }
                Err(outcome) => {
                    admission.record_outcome(outcome);
                    circuit.record_failure();
                    debug!(url = %url, "content extraction failed");
                    None
                }
            }
        }
    }
}

async fn fetch_page(
    http: &reqwest::Client,
    url: &str,
    max_body: usize,
) -> std::result::Result<String, Outcome> {
    let response = http.get(url).send().await.map_err(|_| Outcome::Error)?;
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(Outcome::RateLimited);
    }
    if !status.is_success() {
        return Err(Outcome::Error);
    }
    let mut body = response.text().await.map_err(|_| Outcome::Error)?;
    if body.len() > max_body {
        let mut cut = max_body;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Ok(body)
}

/// Pull title/description/author/snippet/published_at from page HTML.
pub fn extract_metadata(html: &str) -> EnrichedContent {
    let doc = Html::parse_document(html);

    let title = select_text(&doc, "title")
        .or_else(|| select_meta(&doc, "meta[property=\"og:title\"]"));
    let description = select_meta(&doc, "meta[name=\"description\"]")
        .or_else(|| select_meta(&doc, "meta[property=\"og:description\"]"));
    let author = select_meta(&doc, "meta[name=\"author\"]")
        .or_else(|| select_meta(&doc, "meta[property=\"article:author\"]"));
    let published_at = select_meta(&doc, "meta[property=\"article:published_time\"]")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let snippet = first_paragraph(&doc);

    EnrichedContent {
        title,
        description,
        author,
        snippet,
        published_at,
    }
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let el = doc.select(&sel).next()?;
    let text: String = el.text().collect::<Vec<_>>().join(" ");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn select_meta(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let el = doc.select(&sel).next()?;
    let content = el.value().attr("content")?.trim();
    (!content.is_empty()).then(|| content.to_string())
}

fn first_paragraph(doc: &Html) -> Option<String> {
    let sel = Selector::parse("p").ok()?;
    let whitespace = Regex::new(r"\s+").expect("static regex");
    for el in doc.select(&sel) {
        let text: String = el.text().collect::<Vec<_>>().join(" ");
        let text = whitespace.replace_all(text.trim(), " ").to_string();
        if text.len() >= 40 {
            let mut snippet = text;
            if snippet.len() > 300 {
                let mut cut = 300;
                while !snippet.is_char_boundary(cut) {
                    cut -= 1;
                }
                snippet.truncate(cut);
            }
            return Some(snippet);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <title>Example Article</title>
        <meta name="description" content="A worked example.">
        <meta name="author" content="Jane Doe">
        <meta property="article:published_time" content="2024-03-01T12:00:00+00:00">
        </head><body>
        <p>tiny</p>
        <p>This paragraph is comfortably long enough to serve as the page snippet.</p>
        </body></html>"#;

    #[test]
    fn extracts_all_fields() {
        let meta = extract_metadata(PAGE);
        assert_eq!(meta.title.as_deref(), Some("Example Article"));
        assert_eq!(meta.description.as_deref(), Some("A worked example."));
        assert_eq!(meta.author.as_deref(), Some("Jane Doe"));
        assert!(meta.published_at.is_some());
        assert!(meta.snippet.unwrap().starts_with("This paragraph"));
    }

    #[test]
    fn empty_page_yields_empty_metadata() {
        let meta = extract_metadata("<html><body></body></html>");
        assert!(meta.title.is_none());
        assert!(meta.description.is_none());
        assert!(meta.snippet.is_none());
    }

    #[test]
    fn snippet_is_bounded() {
        let long = format!(
            "<html><body><p>{}</p></body></html>",
            "word ".repeat(200)
        );
        let meta = extract_metadata(&long);
        assert!(meta.snippet.unwrap().len() <= 300);
    }
}
