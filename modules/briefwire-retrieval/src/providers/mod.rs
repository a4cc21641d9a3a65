mod event_registry;
mod google_cse;
mod google_news;
mod news_api;

pub use event_registry::EventRegistryProvider;
pub use google_cse::GoogleCseProvider;
pub use google_news::GoogleNewsProvider;
pub use news_api::NewsApiProvider;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use briefwire_common::config::ProviderKeys;
use briefwire_common::Provider;

/// One search hit before canonicalization and dedup.
#[derive(Debug, Clone)]
pub struct SearchItem {
    pub title: String,
    pub url: String,
    pub source_name: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub provider_data: Option<serde_json::Value>,
}

/// A news-candidate search backend. Connector failures are isolated by the
/// retriever; implementations just return errors.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider(&self) -> Provider;
    async fn search(
        &self,
        query: &str,
        recency_hours: u32,
        limit: usize,
    ) -> Result<Vec<SearchItem>>;
}

/// Build the enabled provider set from configured keys. Google News RSS needs
/// no key and is always on.
pub fn enabled_providers(keys: &ProviderKeys) -> Vec<Box<dyn SearchProvider>> {
    let mut providers: Vec<Box<dyn SearchProvider>> = Vec::new();
    if !keys.google_cse_api_key.is_empty() && !keys.google_cse_cx.is_empty() {
        providers.push(Box::new(GoogleCseProvider::new(
            &keys.google_cse_api_key,
            &keys.google_cse_cx,
        )));
    }
    if !keys.news_api_key.is_empty() {
        providers.push(Box::new(NewsApiProvider::new(&keys.news_api_key)));
    }
    if !keys.event_registry_api_key.is_empty() {
        providers.push(Box::new(EventRegistryProvider::new(
            &keys.event_registry_api_key,
        )));
    }
    providers.push(Box::new(GoogleNewsProvider::new()));
    providers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_news_is_always_enabled() {
        let providers = enabled_providers(&ProviderKeys::default());
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].provider(), Provider::GoogleNews);
    }

    #[test]
    fn keys_enable_their_connectors() {
        let keys = ProviderKeys {
            google_cse_api_key: "k".into(),
            google_cse_cx: "cx".into(),
            news_api_key: "n".into(),
            event_registry_api_key: "e".into(),
        };
        let providers = enabled_providers(&keys);
        let names: Vec<Provider> = providers.iter().map(|p| p.provider()).collect();
        assert_eq!(
            names,
            vec![
                Provider::GoogleCse,
                Provider::NewsApi,
                Provider::EventRegistry,
                Provider::GoogleNews,
            ]
        );
    }

    #[test]
    fn cse_without_cx_stays_disabled() {
        let keys = ProviderKeys {
            google_cse_api_key: "k".into(),
            ..Default::default()
        };
        let providers = enabled_providers(&keys);
        assert!(providers.iter().all(|p| p.provider() != Provider::GoogleCse));
    }
}
