use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use briefwire_common::Provider;

use super::{SearchItem, SearchProvider};

/// Google News RSS connector. Keyless; parses the search feed with feed-rs.
pub struct GoogleNewsProvider {
    client: reqwest::Client,
    base_url: String,
}

impl Default for GoogleNewsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GoogleNewsProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: "https://news.google.com/rss/search".to_string(),
        }
    }
}

/// Google News supports a `when:Nh` window inside the query string.
fn feed_query(query: &str, recency_hours: u32) -> String {
    format!("{query} when:{recency_hours}h")
}

#[async_trait]
impl SearchProvider for GoogleNewsProvider {
    fn provider(&self) -> Provider {
        Provider::GoogleNews
    }

    async fn search(
        &self,
        query: &str,
        recency_hours: u32,
        limit: usize,
    ) -> Result<Vec<SearchItem>> {
        info!(query, limit, "Google News RSS search");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", feed_query(query, recency_hours).as_str()),
                ("hl", "en-US"),
                ("gl", "US"),
                ("ceid", "US:en"),
            ])
            .header("User-Agent", "briefwire/0.1")
            .send()
            .await
            .context("Google News feed fetch failed")?;

        let bytes = response
            .bytes()
            .await
            .context("Failed to read Google News feed body")?;
        let feed =
            feed_rs::parser::parse(&bytes[..]).context("Failed to parse Google News feed")?;

        let items: Vec<SearchItem> = feed
            .entries
            .into_iter()
            .filter_map(|entry| {
                let url = entry.links.first().map(|l| l.href.clone())?;
                let published_at = entry
                    .published
                    .or(entry.updated)
                    .map(|dt| dt.with_timezone(&chrono::Utc));
                let title = entry.title.map(|t| t.content).unwrap_or_default();
                // Google News titles come as "Headline - Source".
                let source_name = title
                    .rsplit_once(" - ")
                    .map(|(_, source)| source.trim().to_string());
                Some(SearchItem {
                    title,
                    url,
                    source_name,
                    published_at,
                    snippet: entry.summary.map(|s| s.content),
                    provider_data: None,
                })
            })
            .take(limit)
            .collect();

        info!(query, count = items.len(), "Google News search complete");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_includes_recency_window() {
        assert_eq!(feed_query("ai regulation", 168), "ai regulation when:168h");
    }

    #[test]
    fn feed_entries_parse_to_items() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
              <title>Search results</title>
              <item>
                <title>Headline one - The Example</title>
                <link>https://news.example.com/one</link>
                <pubDate>Tue, 28 Jul 2026 10:00:00 GMT</pubDate>
              </item>
            </channel></rss>"#;
        let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
        assert_eq!(feed.entries.len(), 1);
        let title = feed.entries[0].title.as_ref().unwrap();
        assert!(title.content.contains("Headline one"));
    }
}
