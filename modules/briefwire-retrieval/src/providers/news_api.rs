use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use briefwire_common::Provider;

use super::{SearchItem, SearchProvider};

/// NewsAPI `/v2/everything` connector.
pub struct NewsApiProvider {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct NewsApiResponse {
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsApiArticle {
    #[serde(default)]
    source: NewsApiSource,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct NewsApiSource {
    #[serde(default)]
    name: Option<String>,
}

impl NewsApiProvider {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: "https://newsapi.org/v2/everything".to_string(),
        }
    }
}

#[async_trait]
impl SearchProvider for NewsApiProvider {
    fn provider(&self) -> Provider {
        Provider::NewsApi
    }

    async fn search(
        &self,
        query: &str,
        recency_hours: u32,
        limit: usize,
    ) -> Result<Vec<SearchItem>> {
        info!(query, limit, "NewsAPI search");

        let from = Utc::now() - chrono::Duration::hours(recency_hours as i64);

        let response = self
            .client
            .get(&self.base_url)
            .header("X-Api-Key", &self.api_key)
            .query(&[
                ("q", query),
                ("from", &from.to_rfc3339()),
                ("language", "en"),
                ("sortBy", "publishedAt"),
                ("pageSize", &limit.min(100).to_string()),
            ])
            .send()
            .await
            .context("NewsAPI request failed")?
            .error_for_status()
            .context("NewsAPI returned an error status")?;

        let data: NewsApiResponse = response
            .json()
            .await
            .context("Failed to parse NewsAPI response")?;

        let items: Vec<SearchItem> = data
            .articles
            .into_iter()
            .filter(|a| !a.url.is_empty())
            .map(|a| {
                let provider_data = a
                    .content
                    .as_ref()
                    .map(|content| serde_json::json!({ "content": content }));
                SearchItem {
                    title: a.title.unwrap_or_default(),
                    url: a.url,
                    source_name: a.source.name,
                    published_at: a.published_at,
                    snippet: a.description,
                    provider_data,
                }
            })
            .collect();

        info!(query, count = items.len(), "NewsAPI search complete");
        Ok(items)
    }
}
