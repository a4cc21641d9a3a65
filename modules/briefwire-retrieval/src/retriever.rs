//! Candidate retrieval: fan a query out to every enabled provider, union the
//! results, and dedup by canonical URL.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use briefwire_common::config::RetrievalConfig;
use briefwire_common::ids::{candidate_id, canonical_url};
use briefwire_common::util::truncate_to_char_boundary;
use briefwire_common::{BriefError, Candidate, Provider, RetrievalMetrics};

use crate::providers::SearchProvider;

/// Upper bound on the body/content field carried inside `providerData`.
const PROVIDER_DATA_MAX_CHARS: usize = 5_000;
/// How many results one provider is asked for.
const PER_PROVIDER_LIMIT: usize = 25;

/// Retrieval budget knobs. The targeted-research stage tightens these.
#[derive(Debug, Clone)]
pub struct RetrievalKnobs {
    pub min_accepted: usize,
    pub max_attempts: usize,
    pub max_candidates: usize,
}

impl RetrievalKnobs {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            min_accepted: config.min_accepted,
            max_attempts: config.max_attempts,
            max_candidates: config.max_candidates,
        }
    }

    /// Tightened budgets for targeted-research mini-retrievals.
    pub fn tightened(config: &RetrievalConfig) -> Self {
        Self {
            min_accepted: config.min_accepted.min(6),
            max_attempts: config.max_attempts.min(18),
            max_candidates: 36,
        }
    }
}

/// The query each provider should run. Topic analysis may produce
/// provider-specific phrasings; absent that, everyone gets the main query.
#[derive(Debug, Clone)]
pub struct ProviderQueries {
    pub main_query: String,
    pub per_provider: HashMap<Provider, String>,
}

impl ProviderQueries {
    pub fn uniform(query: impl Into<String>) -> Self {
        Self {
            main_query: query.into(),
            per_provider: HashMap::new(),
        }
    }

    pub fn query_for(&self, provider: Provider) -> &str {
        self.per_provider
            .get(&provider)
            .map(String::as_str)
            .unwrap_or(&self.main_query)
    }
}

pub struct RetrievedBatch {
    pub main_query: String,
    pub candidates: Vec<Candidate>,
    pub metrics: RetrievalMetrics,
}

/// Keep `providerData` bounded: only the body/content field matters and it
/// gets truncated in place.
fn shrink_provider_data(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut map) => {
            for key in ["body", "content"] {
                if let Some(serde_json::Value::String(text)) = map.get(key) {
                    if text.chars().count() > PROVIDER_DATA_MAX_CHARS {
                        let shrunk: String = text.chars().take(PROVIDER_DATA_MAX_CHARS).collect();
                        map.insert(key.to_string(), serde_json::Value::String(shrunk));
                    }
                }
            }
            serde_json::Value::Object(map)
        }
        other => other,
    }
}

/// Fan out to all providers concurrently and dedup the union. A connector
/// failure is recorded in that provider's metrics and never aborts the stage.
pub async fn retrieve_candidates(
    queries: &ProviderQueries,
    providers: &[Box<dyn SearchProvider>],
    recency_hours: u32,
    knobs: &RetrievalKnobs,
    cancel: &CancellationToken,
) -> Result<RetrievedBatch> {
    if cancel.is_cancelled() {
        return Err(BriefError::Aborted.into());
    }

    let per_provider_limit = PER_PROVIDER_LIMIT.min(knobs.max_candidates.max(1));
    let fanout = join_all(providers.iter().map(|provider| async move {
        let name = provider.provider();
        let query = queries.query_for(name);
        let result = provider.search(query, recency_hours, per_provider_limit).await;
        (name, result)
    }));

    let results = tokio::select! {
        results = fanout => results,
        _ = cancel.cancelled() => return Err(BriefError::Aborted.into()),
    };

    let mut metrics = RetrievalMetrics::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for (provider, result) in results {
        let entry = metrics.provider_mut(provider);
        let items = match result {
            Ok(items) => items,
            Err(err) => {
                warn!(provider = %provider, error = %err, "Connector failed");
                entry.failed = true;
                entry.errors.push(format!("{err:#}"));
                continue;
            }
        };
        entry.returned = items.len();

        for item in items {
            let canonical = canonical_url(&item.url);
            if canonical.is_empty() {
                continue;
            }
            if !seen.insert(canonical.clone()) {
                entry.deduped += 1;
                continue;
            }
            entry.unique += 1;
            candidates.push(Candidate {
                id: candidate_id(&canonical),
                provider,
                title: item.title,
                url: item.url,
                source_name: item.source_name,
                published_at: item.published_at,
                snippet: item
                    .snippet
                    .map(|s| truncate_to_char_boundary(&s, 600).to_string()),
                provider_data: item.provider_data.map(shrink_provider_data),
            });
        }
    }

    candidates.truncate(knobs.max_candidates);

    info!(
        query = %queries.main_query,
        candidates = candidates.len(),
        providers = providers.len(),
        "Candidate retrieval complete"
    );

    Ok(RetrievedBatch {
        main_query: queries.main_query.clone(),
        candidates,
        metrics,
    })
}
