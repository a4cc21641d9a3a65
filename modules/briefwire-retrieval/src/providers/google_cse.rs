use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use briefwire_common::Provider;

use super::{SearchItem, SearchProvider};

/// Google Custom Search connector. CSE results rarely carry a published
/// date; the filter stage exempts Google connectors from the recency check
/// for that reason.
pub struct GoogleCseProvider {
    api_key: String,
    cx: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct CseResponse {
    #[serde(default)]
    items: Vec<CseItem>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CseItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    display_link: Option<String>,
    #[serde(default)]
    pagemap: Option<serde_json::Value>,
}

impl GoogleCseProvider {
    pub fn new(api_key: &str, cx: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            cx: cx.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: "https://www.googleapis.com/customsearch/v1".to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }
}

/// CSE `dateRestrict` takes whole days.
fn date_restrict(recency_hours: u32) -> String {
    format!("d{}", recency_hours.div_ceil(24).max(1))
}

#[async_trait]
impl SearchProvider for GoogleCseProvider {
    fn provider(&self) -> Provider {
        Provider::GoogleCse
    }

    async fn search(
        &self,
        query: &str,
        recency_hours: u32,
        limit: usize,
    ) -> Result<Vec<SearchItem>> {
        info!(query, limit, "Google CSE search");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cx.as_str()),
                ("q", query),
                ("num", &limit.min(10).to_string()),
                ("dateRestrict", &date_restrict(recency_hours)),
            ])
            .send()
            .await
            .context("Google CSE request failed")?
            .error_for_status()
            .context("Google CSE returned an error status")?;

        let data: CseResponse = response
            .json()
            .await
            .context("Failed to parse Google CSE response")?;

        let items: Vec<SearchItem> = data
            .items
            .into_iter()
            .filter(|i| !i.link.is_empty())
            .map(|i| SearchItem {
                title: i.title,
                url: i.link,
                source_name: i.display_link,
                published_at: None,
                snippet: i.snippet,
                provider_data: i.pagemap,
            })
            .collect();

        info!(query, count = items.len(), "Google CSE search complete");
        Ok(items)
    }
}
