//! RSS 2.0 feed parsing.

use super::html::parse_date;
use crate::error::FetchError;
use crate::models::RawArticle;
use crate::utils::collapse_whitespace;
use chrono::{DateTime, Utc};
use scraper::Html;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

/// One usable `<item>` of a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub link: String,
    pub title: String,
    /// Plain text with markup removed.
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
}

impl FeedEntry {
    pub fn into_article(self, source: &str) -> RawArticle {
        let mut article = RawArticle::new(self.link, self.title, self.description, source);
        article.published_at = self.published_at;
        article
    }
}

/// Whether a response is an RSS feed rather than an HTML page.
pub fn looks_like_feed(content_type: Option<&str>, body: &str) -> bool {
    let ct = content_type.unwrap_or_default().to_ascii_lowercase();
    if ct.contains("rss") || (ct.contains("xml") && !ct.contains("html")) {
        return true;
    }
    let head = body.trim_start();
    let head = head.get(..512).unwrap_or(head);
    head.contains("<rss")
}

fn strip_markup(text: &str) -> String {
    let fragment = Html::parse_fragment(text);
    collapse_whitespace(&fragment.root_element().text().collect::<Vec<_>>().join(" "))
}

/// Parse an RSS 2.0 document. Items without a link are skipped.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, FetchError> {
    let rss: Rss = quick_xml::de::from_str(xml).map_err(|e| FetchError::Feed(e.to_string()))?;
    Ok(rss
        .channel
        .items
        .into_iter()
        .filter_map(|item| {
            let link = item.link?.trim().to_string();
            if link.is_empty() {
                return None;
            }
            Some(FeedEntry {
                link,
                title: collapse_whitespace(item.title.as_deref().unwrap_or_default()),
                description: item
                    .description
                    .as_deref()
                    .map(strip_markup)
                    .unwrap_or_default(),
                published_at: item.pub_date.as_deref().and_then(parse_date),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example News</title>
    <link>https://example.com/</link>
    <item>
      <title>EV sales surge</title>
      <link>https://example.com/news/ev-sales-surge</link>
      <description><![CDATA[<p>Automakers report <b>record</b> EV deliveries.</p>]]></description>
      <pubDate>Tue, 06 May 2025 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>No link here</title>
    </item>
    <item>
      <title>Grid upgrades</title>
      <link> https://example.com/news/grid </link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_feed_items() {
        let entries = parse_feed(FEED).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "EV sales surge");
        assert_eq!(entries[0].link, "https://example.com/news/ev-sales-surge");
        assert_eq!(entries[0].description, "Automakers report record EV deliveries.");
        assert!(entries[0].published_at.is_some());
        assert_eq!(entries[1].link, "https://example.com/news/grid");
        assert_eq!(entries[1].description, "");
        assert_eq!(entries[1].published_at, None);
    }

    #[test]
    fn test_empty_channel() {
        let entries =
            parse_feed(r#"<rss version="2.0"><channel><title>t</title></channel></rss>"#).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_malformed_feed_is_a_feed_error() {
        assert!(matches!(
            parse_feed("<rss><channel><item>"),
            Err(FetchError::Feed(_))
        ));
    }

    #[test]
    fn test_looks_like_feed() {
        assert!(looks_like_feed(Some("application/rss+xml"), ""));
        assert!(looks_like_feed(Some("text/xml; charset=utf-8"), ""));
        assert!(!looks_like_feed(Some("text/html"), "<html></html>"));
        assert!(looks_like_feed(None, "<?xml version=\"1.0\"?><rss version=\"2.0\">"));
        assert!(!looks_like_feed(Some("application/xhtml+xml"), "<html>"));
    }

    #[test]
    fn test_entry_into_article() {
        let entry = FeedEntry {
            link: "https://example.com/a".into(),
            title: "A".into(),
            description: "Body".into(),
            published_at: None,
        };
        let article = entry.into_article("https://example.com/rss");
        assert_eq!(article.url, "https://example.com/a");
        assert_eq!(article.body_text, "Body");
        assert_eq!(article.source, "https://example.com/rss");
    }
}
