//! HTML front-page indexing and article extraction.
//!
//! Everything here is synchronous: `scraper::Html` is not `Send`, so a parsed
//! document never lives across an `.await`.

use super::MIN_BODY_CHARS;
use crate::models::RawArticle;
use crate::utils::collapse_whitespace;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

static SKIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(/login|/signup|/subscribe|/advertise|/contact|/about|/privacy|/terms|/cookie|/sitemap|/search|/tag/|/category/|/author/|/user/|\.pdf$|\.jpg$|\.png$|\.gif$|\.mp4$|\.mp3$|/video/|/gallery/|/slideshow/|/interactive/|/newsletter|/rss|/feed|/api/|/ajax/|#|\?utm_|\?fbclid|\?ref=|\?source=)",
    )
    .unwrap()
});

static ARTICLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(/article/|/story/|/news/|/business/|/finance/|/markets/|/economy/|/technology/|/earnings/|/analysis/|/commentary/|/opinion/|/report/|\d{4}/\d{2}/\d{2}|\d{4}-\d{2}-\d{2}|[a-z-]+-\d+)",
    )
    .unwrap()
});

fn selectors(list: &[&str]) -> Vec<Selector> {
    list.iter().filter_map(|s| Selector::parse(s).ok()).collect()
}

static LINK: Lazy<Vec<Selector>> = Lazy::new(|| selectors(&["a[href]"]));
static PARAGRAPH: Lazy<Vec<Selector>> = Lazy::new(|| selectors(&["p"]));

static BODY: Lazy<Vec<Selector>> = Lazy::new(|| {
    selectors(&[
        "article",
        ".article-content",
        ".story-content",
        ".post-content",
        ".entry-content",
        ".content-body",
        ".article-body",
        ".story-body",
        "[data-testid=\"article-content\"]",
        ".article__content",
        ".story__content",
        ".post__content",
        ".main-content",
        ".text-content",
    ])
});

static TITLE: Lazy<Vec<Selector>> = Lazy::new(|| {
    selectors(&[
        "h1",
        ".article-title",
        ".story-title",
        ".entry-title",
        "[data-testid=\"article-title\"]",
        ".headline",
    ])
});

static META_TITLE: Lazy<Vec<Selector>> =
    Lazy::new(|| selectors(&["meta[property=\"og:title\"]", "meta[name=\"twitter:title\"]"]));
static DOC_TITLE: Lazy<Vec<Selector>> = Lazy::new(|| selectors(&["title"]));

static META_DATE: Lazy<Vec<Selector>> = Lazy::new(|| {
    selectors(&[
        "meta[property=\"article:published_time\"]",
        "meta[name=\"publish_date\"]",
        "meta[name=\"pubdate\"]",
        "meta[itemprop=\"datePublished\"]",
    ])
});
static TIME: Lazy<Vec<Selector>> = Lazy::new(|| selectors(&["time[datetime]"]));

/// Whether a URL looks like an article rather than navigation or media.
pub fn is_article_url(url: &str) -> bool {
    if SKIP_RE.is_match(url) {
        return false;
    }
    ARTICLE_RE.is_match(url) || url.len() > 50
}

fn same_site(a: &Url, b: &Url) -> bool {
    let strip = |u: &Url| {
        u.host_str()
            .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
    };
    strip(a).is_some() && strip(a) == strip(b)
}

/// Collect up to `limit` distinct same-site article links from a front page,
/// in document order.
pub fn index_links(html: &str, base: &Url, limit: usize) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in LINK.iter().flat_map(|s| document.select(s)) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href.trim()) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") || !same_site(base, &resolved) {
            continue;
        }
        let url = resolved.to_string();
        if resolved.path() == base.path() || !is_article_url(&url) {
            continue;
        }
        if seen.insert(url.clone()) {
            links.push(url);
            if links.len() >= limit {
                break;
            }
        }
    }

    debug!(count = links.len(), base = %base, "Indexed links");
    links
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

fn paragraphs_text(scope: ElementRef<'_>) -> String {
    let text = PARAGRAPH
        .iter()
        .flat_map(|s| scope.select(s))
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if text.is_empty() {
        element_text(scope)
    } else {
        text
    }
}

fn first_text(document: &Html, list: &[Selector]) -> Option<String> {
    list.iter()
        .flat_map(|s| document.select(s))
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn first_attr(document: &Html, list: &[Selector], attr: &str) -> Option<String> {
    list.iter()
        .flat_map(|s| document.select(s))
        .filter_map(|e| e.value().attr(attr))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Parse the date formats commonly found in publish-date metadata.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Extract an article from a page. Returns `None` when the body is shorter
/// than [`MIN_BODY_CHARS`].
pub fn extract_article(html: &str, url: &str, source: &str) -> Option<RawArticle> {
    let document = Html::parse_document(html);

    let title = first_text(&document, &TITLE)
        .or_else(|| first_attr(&document, &META_TITLE, "content"))
        .or_else(|| first_text(&document, &DOC_TITLE))
        .unwrap_or_default();

    let body = BODY
        .iter()
        .flat_map(|s| document.select(s))
        .map(paragraphs_text)
        .find(|t| t.chars().count() >= MIN_BODY_CHARS)
        .unwrap_or_else(|| paragraphs_text(document.root_element()));

    if body.chars().count() < MIN_BODY_CHARS {
        debug!(%url, chars = body.chars().count(), "Body below minimum length");
        return None;
    }

    let published_at = first_attr(&document, &META_DATE, "content")
        .or_else(|| first_attr(&document, &TIME, "datetime"))
        .and_then(|d| parse_date(&d));

    let mut article = RawArticle::new(url, title, body, source);
    article.published_at = published_at;
    Some(article)
}
