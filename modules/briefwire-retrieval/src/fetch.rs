use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};
use tracing::{info, warn};

/// Downloads a candidate URL and returns clean article text. Behind a trait
/// so the extraction stage can be exercised with canned pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

/// reqwest + Readability extraction. News articles are server-rendered; a
/// plain GET is enough, no headless browser involved.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .redirect(reqwest::redirect::Policy::limited(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url).context("Invalid URL")?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("Only http/https URLs are allowed, got: {}", parsed.scheme());
        }

        info!(url, "Fetching article");

        let response = self
            .client
            .get(url)
            .header("User-Agent", "briefwire/0.1 (+news digest)")
            .send()
            .await
            .context("Article fetch failed")?
            .error_for_status()
            .context("Article returned an error status")?;

        let html = response
            .text()
            .await
            .context("Failed to read article body")?;
        if html.is_empty() {
            warn!(url, "Empty HTML response");
            return Ok(String::new());
        }

        let config = TransformConfig {
            readability: true,
            main_content: true,
            return_format: ReturnFormat::Markdown,
            filter_images: true,
            filter_svg: true,
            clean_html: true,
        };
        let input = TransformInput {
            url: Some(&parsed),
            content: html.as_bytes(),
            screenshot_bytes: None,
            encoding: None,
            selector_config: None,
            ignore_tags: None,
        };

        let text = transform_content_input(input, &config);

        if text.trim().is_empty() {
            warn!(url, "Empty content after Readability extraction");
            return Ok(String::new());
        }

        info!(url, bytes = text.len(), "Extracted article text");
        Ok(text)
    }
}
