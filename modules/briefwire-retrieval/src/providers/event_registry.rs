use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use briefwire_common::Provider;

use super::{SearchItem, SearchProvider};

/// Event Registry `article/getArticles` connector.
pub struct EventRegistryProvider {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct ErResponse {
    #[serde(default)]
    articles: Option<ErArticles>,
}

#[derive(Debug, serde::Deserialize)]
struct ErArticles {
    #[serde(default)]
    results: Vec<ErArticle>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErArticle {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    source: Option<ErSource>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ErSource {
    #[serde(default)]
    title: Option<String>,
}

impl EventRegistryProvider {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: "https://eventregistry.org/api/v1/article/getArticles".to_string(),
        }
    }
}

#[async_trait]
impl SearchProvider for EventRegistryProvider {
    fn provider(&self) -> Provider {
        Provider::EventRegistry
    }

    async fn search(
        &self,
        query: &str,
        recency_hours: u32,
        limit: usize,
    ) -> Result<Vec<SearchItem>> {
        info!(query, limit, "Event Registry search");

        let date_start = (Utc::now() - chrono::Duration::hours(recency_hours as i64))
            .format("%Y-%m-%d")
            .to_string();

        let body = serde_json::json!({
            "action": "getArticles",
            "keyword": query,
            "articlesCount": limit.min(100),
            "articlesSortBy": "date",
            "dateStart": date_start,
            "lang": "eng",
            "apiKey": self.api_key,
        });

        let response = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .context("Event Registry request failed")?
            .error_for_status()
            .context("Event Registry returned an error status")?;

        let data: ErResponse = response
            .json()
            .await
            .context("Failed to parse Event Registry response")?;

        let items: Vec<SearchItem> = data
            .articles
            .map(|a| a.results)
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !a.url.is_empty())
            .map(|a| {
                let provider_data = a
                    .body
                    .as_ref()
                    .map(|body| serde_json::json!({ "body": body }));
                SearchItem {
                    title: a.title.unwrap_or_default(),
                    url: a.url,
                    source_name: a.source.and_then(|s| s.title),
                    published_at: a.date_time,
                    snippet: None,
                    provider_data,
                }
            })
            .collect();

        info!(query, count = items.len(), "Event Registry search complete");
        Ok(items)
    }
}
