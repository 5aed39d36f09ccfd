//! News source fetching.
//!
//! The pipeline only depends on [`SourceFetcher`]: given a source URL it
//! returns the articles found there, or a [`FetchError`] for that one source.
//! [`HttpSourceFetcher`] is the production implementation and follows a
//! two-phase pattern:
//!
//! 1. **Indexing**: download the source URL. An RSS 2.0 feed lists its items
//!    directly ([`feed`]); an HTML front page is scanned for same-site links
//!    that look like articles ([`html::index_links`]).
//! 2. **Fetching**: download each article page concurrently and extract title,
//!    body and publish date ([`html::extract_article`]).
//!
//! Failed article fetches are logged and skipped. A source that yields no
//! usable articles at all is reported as [`FetchError::NoArticles`].

pub mod feed;
pub mod html;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::models::RawArticle;
use crate::utils::normalize_source_url;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, instrument, warn};

/// Minimum body length for an article to be kept.
pub const MIN_BODY_CHARS: usize = 100;

/// Produces the articles published by one source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<Vec<RawArticle>, FetchError>;
}

/// Whether an article is recent enough. Undated articles are kept.
pub fn within_age(article: &RawArticle, max_age_days: i64) -> bool {
    match article.published_at {
        Some(published) => Utc::now() - published <= TimeDelta::days(max_age_days),
        None => true,
    }
}

/// Fetches HTML front pages and RSS feeds over HTTP.
pub struct HttpSourceFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpSourceFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn map_err(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                after: self.config.timeout(),
            }
        } else {
            e.into()
        }
    }

    /// GET `url`, returning its content type and body text.
    async fn get_text(&self, url: &str) -> Result<(Option<String>, String), FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| self.map_err(e))?;
        Ok((content_type, body))
    }

    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn fetch_article(&self, url: &str, source: &str) -> Option<RawArticle> {
        match self.get_text(url).await {
            Ok((_, body)) => {
                let article = html::extract_article(&body, url, source);
                if article.is_none() {
                    debug!("Article page produced no usable content");
                }
                article
            }
            Err(e) => {
                warn!(error = %e, "Article fetch failed");
                None
            }
        }
    }

    /// Fetch article pages concurrently, keeping link order.
    async fn fetch_articles(&self, urls: Vec<String>, source: &str) -> Vec<RawArticle> {
        stream::iter(urls)
            .map(|url| async move { self.fetch_article(&url, source).await })
            .buffered(self.config.concurrency.max(1))
            .filter_map(|opt| std::future::ready(opt))
            .collect()
            .await
    }

    /// Turn feed entries into articles, fetching the linked page when the
    /// feed's own description is too short to work with.
    async fn complete_feed_entries(
        &self,
        entries: Vec<feed::FeedEntry>,
        source: &str,
    ) -> Vec<RawArticle> {
        stream::iter(entries)
            .map(|entry| async move {
                if entry.description.chars().count() >= MIN_BODY_CHARS {
                    return Some(entry.into_article(source));
                }
                let mut article = self.fetch_article(&entry.link, source).await?;
                if article.title.is_empty() {
                    article.title = entry.title;
                }
                if article.published_at.is_none() {
                    article.published_at = entry.published_at;
                }
                Some(article)
            })
            .buffered(self.config.concurrency.max(1))
            .filter_map(|opt| std::future::ready(opt))
            .collect()
            .await
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    #[instrument(level = "info", skip_all, fields(%source))]
    async fn fetch(&self, source: &str) -> Result<Vec<RawArticle>, FetchError> {
        let url = normalize_source_url(source).ok_or_else(|| FetchError::InvalidUrl {
            url: source.to_string(),
        })?;
        let limit = self.config.max_articles_per_source;

        let (content_type, body) = self.get_text(url.as_str()).await?;
        let mut articles = if feed::looks_like_feed(content_type.as_deref(), &body) {
            let mut entries = feed::parse_feed(&body)?;
            entries.truncate(limit);
            info!(count = entries.len(), "Indexed feed entries");
            self.complete_feed_entries(entries, source).await
        } else {
            let links = html::index_links(&body, &url, limit);
            info!(count = links.len(), "Indexed article URLs");
            self.fetch_articles(links, source).await
        };

        let before = articles.len();
        articles.retain(|a| within_age(a, self.config.max_age_days));
        if articles.len() < before {
            debug!(dropped = before - articles.len(), "Dropped stale articles");
        }

        if articles.is_empty() {
            return Err(FetchError::NoArticles);
        }
        info!(count = articles.len(), "Fetched source articles");
        Ok(articles)
    }
}
