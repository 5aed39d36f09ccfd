//! Data models for articles as they move through the analysis pipeline.
//!
//! Articles are refined stage by stage, each stage wrapping the previous one:
//! - [`RawArticle`]: what a source fetcher scraped
//! - [`ClassifiedArticle`]: a raw article plus a relevance verdict
//! - [`SummarizedArticle`]: a relevant article plus its summary
//!
//! Because each stage embeds the one before it, every classified or summarized
//! article traces back to exactly one raw article.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A news article as scraped from a source.
///
/// Immutable once created. The `url` is the identity of the article and is
/// used to de-duplicate articles within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawArticle {
    /// Canonical article URL.
    pub url: String,
    /// Headline, or an empty string when none could be extracted.
    pub title: String,
    /// Plain-text article body.
    pub body_text: String,
    /// The source URL the article was discovered from.
    pub source: String,
    /// Publication time, when the page declared one.
    pub published_at: Option<DateTime<Utc>>,
}

impl RawArticle {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        body_text: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            body_text: body_text.into(),
            source: source.into(),
            published_at: None,
        }
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }
}

/// Free-text description of what the caller cares about.
///
/// Opaque to the pipeline except as a prompt parameter and a fingerprint input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessInterest(String);

impl BusinessInterest {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BusinessInterest {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BusinessInterest {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kind of inference performed on an article.
///
/// Part of every cache fingerprint so that filtering and summarizing the same
/// article never share a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Filter,
    Summarize,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Filter => "filter",
            Operation::Summarize => "summarize",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a relevance verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Fresh inference call.
    Inference,
    /// Served from the response cache.
    Cache,
    /// Rejected by the keyword pre-filter without inference.
    Prefilter,
    /// The model answered but the answer could not be parsed (fail-closed).
    Unparseable,
    /// Inference failed after retries (fail-closed).
    Failed,
    /// The run was cancelled before this article was classified.
    Cancelled,
}

/// A raw article with a relevance verdict attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedArticle {
    #[serde(flatten)]
    pub article: RawArticle,
    pub is_relevant: bool,
    /// Model confidence in `[0, 1]`, when the model reported one.
    pub relevance_score: Option<f32>,
    pub verdict_source: VerdictSource,
}

impl ClassifiedArticle {
    pub fn new(article: RawArticle, is_relevant: bool, verdict_source: VerdictSource) -> Self {
        Self {
            article,
            is_relevant,
            relevance_score: None,
            verdict_source,
        }
    }

    /// Fail-closed classification used whenever no usable verdict exists.
    pub fn rejected(article: RawArticle, verdict_source: VerdictSource) -> Self {
        Self::new(article, false, verdict_source)
    }

    pub fn with_score(mut self, score: Option<f32>) -> Self {
        self.relevance_score = score;
        self
    }
}

/// Where a summary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    Inference,
    Cache,
    /// Deterministic excerpt of the article body, used when inference failed
    /// or returned nothing usable.
    Excerpt,
}

/// A relevant article with its summary. Terminal entity returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizedArticle {
    #[serde(flatten)]
    pub classified: ClassifiedArticle,
    pub summary: String,
    pub summary_source: SummarySource,
}

impl SummarizedArticle {
    pub fn article(&self) -> &RawArticle {
        &self.classified.article
    }
}

/// Outcome of parsing model text into a structured value.
///
/// Parsers never fail: text that does not have the expected shape comes back
/// as `Unparseable` with the raw text, and callers decide the fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Parsed(T),
    Unparseable(String),
}

impl<T> Parsed<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Parsed::Parsed(v) => Some(v),
            Parsed::Unparseable(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawArticle {
        RawArticle::new(
            "https://example.com/a",
            "Title",
            "Body text",
            "https://example.com",
        )
    }

    #[test]
    fn test_rejected_is_never_relevant() {
        let c = ClassifiedArticle::rejected(sample(), VerdictSource::Unparseable);
        assert!(!c.is_relevant);
        assert_eq!(c.relevance_score, None);
        assert_eq!(c.article.url, "https://example.com/a");
    }

    #[test]
    fn test_operation_names_are_distinct() {
        assert_eq!(Operation::Filter.as_str(), "filter");
        assert_eq!(Operation::Summarize.as_str(), "summarize");
        assert_ne!(Operation::Filter, Operation::Summarize);
    }

    #[test]
    fn test_summarized_article_serialization_is_flat() {
        let summarized = SummarizedArticle {
            classified: ClassifiedArticle::new(sample(), true, VerdictSource::Inference)
                .with_score(Some(0.9)),
            summary: "Short summary".to_string(),
            summary_source: SummarySource::Inference,
        };

        let json = serde_json::to_value(&summarized).unwrap();
        assert_eq!(json["url"], "https://example.com/a");
        assert_eq!(json["is_relevant"], true);
        assert_eq!(json["summary"], "Short summary");
        assert_eq!(json["summary_source"], "inference");
        assert_eq!(json["verdict_source"], "inference");
    }

    #[test]
    fn test_business_interest_is_transparent() {
        let interest = BusinessInterest::from("electric vehicles");
        assert_eq!(serde_json::to_string(&interest).unwrap(), "\"electric vehicles\"");
        assert_eq!(interest.to_string(), "electric vehicles");
    }
}
