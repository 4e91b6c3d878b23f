use super::{RawRecord, SinceMarker, SourceClient, SourceError, retry_after};
use crate::parser::date;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;

/// One `<item>` of an announcement feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: Option<String>,
    pub published: Option<String>,
    /// Release date announced in the item, when the feed carries one
    /// separately from the publication date.
    pub release_date: Option<String>,
    pub categories: Vec<String>,
}

struct FeedRegex {
    item: Regex,
    title: Regex,
    link: Regex,
    pub_date: Regex,
    release_date: Regex,
    category: Regex,
}

impl FeedRegex {
    fn get() -> Option<&'static Self> {
        static INSTANCE: OnceLock<Option<FeedRegex>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| {
                Some(Self {
                    item: Regex::new(r"(?s)<item(?:\s[^>]*)?>(.*?)</item>").ok()?,
                    title: Regex::new(r"(?s)<title>(.*?)</title>").ok()?,
                    link: Regex::new(r"(?s)<link>(.*?)</link>").ok()?,
                    pub_date: Regex::new(r"(?s)<pubDate>(.*?)</pubDate>").ok()?,
                    release_date: Regex::new(
                        r"(?s)<(?:releaseDate|[a-z]+:releaseDate|dc:date)>(.*?)</(?:releaseDate|[a-z]+:releaseDate|dc:date)>",
                    )
                    .ok()?,
                    category: Regex::new(r"(?s)<category(?:\s[^>]*)?>(.*?)</category>").ok()?,
                })
            })
            .as_ref()
    }
}

fn text(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw
        .strip_prefix("<![CDATA[")
        .and_then(|r| r.strip_suffix("]]>"))
        .unwrap_or(raw);
    html_escape::decode_html_entities(raw.trim()).to_string()
}

fn extract_tag(xml: &str, re: &Regex) -> Option<String> {
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| text(m.as_str()))
        .filter(|s| !s.is_empty())
}

fn parse_item(item_xml: &str) -> Option<FeedItem> {
    let re = FeedRegex::get()?;
    let title = extract_tag(item_xml, &re.title)?;

    Some(FeedItem {
        title,
        link: extract_tag(item_xml, &re.link),
        published: extract_tag(item_xml, &re.pub_date),
        release_date: extract_tag(item_xml, &re.release_date),
        categories: re
            .category
            .captures_iter(item_xml)
            .filter_map(|c| c.get(1))
            .map(|m| text(m.as_str()))
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

fn parse_feed(xml: &str) -> Result<Vec<FeedItem>, SourceError> {
    let re = FeedRegex::get()
        .ok_or_else(|| SourceError::MalformedResponse("feed patterns unavailable".to_string()))?;

    if !xml.contains("<rss") && !xml.contains("<channel") {
        return Err(SourceError::MalformedResponse(
            "response is not an RSS document".to_string(),
        ));
    }

    Ok(re
        .item
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .filter_map(|m| parse_item(m.as_str()))
        .collect())
}

/// Generic RSS announcement feed. Items published before the marker are skipped;
/// items without a parseable publication date are always kept.
#[derive(Clone)]
pub struct FeedClient {
    client: Client,
    url: String,
}

impl FeedClient {
    pub fn new(url: &str, user_agent: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .user_agent(user_agent)
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl SourceClient for FeedClient {
    async fn fetch(&self, since: Option<&SinceMarker>) -> Result<Vec<RawRecord>, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(
                status,
                retry_after(response.headers()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::from_reqwest(&e))?;

        let cutoff = since
            .and_then(SinceMarker::as_datetime)
            .map(|dt| dt.date_naive());

        Ok(parse_feed(&body)?
            .into_iter()
            .filter(|item| {
                let published = item.published.as_deref().and_then(date::parse_date);
                match (cutoff, published) {
                    (Some(cutoff), Some(published)) => published >= cutoff,
                    _ => true,
                }
            })
            .map(RawRecord::Feed)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
<channel>
<title>Print Announcements</title>
<item>
    <title><![CDATA[Demon Tale Vol. 5]]></title>
    <link>https://example.com/demon-tale-5</link>
    <pubDate>Mon, 01 Dec 2025 09:00:00 +0000</pubDate>
    <dc:date>2025-12-10</dc:date>
    <category>Manga</category>
    <category>Shonen</category>
</item>
<item>
    <title>Tom &amp; Jerry Digest #3</title>
    <pubDate>Tue, 02 Dec 2025 09:00:00 +0000</pubDate>
</item>
<item>
    <link>https://example.com/no-title</link>
</item>
</channel>
</rss>"#;

    #[test]
    fn test_parse_feed_items() {
        let items = parse_feed(FEED).unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].title, "Demon Tale Vol. 5");
        assert_eq!(items[0].link.as_deref(), Some("https://example.com/demon-tale-5"));
        assert_eq!(items[0].release_date.as_deref(), Some("2025-12-10"));
        assert_eq!(items[0].categories, vec!["Manga", "Shonen"]);

        assert_eq!(items[1].title, "Tom & Jerry Digest #3");
        assert!(items[1].categories.is_empty());
    }

    #[test]
    fn test_non_rss_is_malformed() {
        assert!(matches!(
            parse_feed("{\"json\": true}"),
            Err(SourceError::MalformedResponse(_))
        ));
    }
}
