use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Search providers that contribute candidates to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Provider {
    GoogleCse,
    NewsApi,
    EventRegistry,
    GoogleNews,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GoogleCse => "googleCse",
            Provider::NewsApi => "newsApi",
            Provider::EventRegistry => "eventRegistry",
            Provider::GoogleNews => "googleNews",
        }
    }

    /// Google connectors may contribute items without a published date;
    /// every other provider counts a missing date as a rejection.
    pub fn allows_undated(&self) -> bool {
        matches!(self, Provider::GoogleCse | Provider::GoogleNews)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pre-extraction record describing a URL selected by one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub provider: Provider,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub provider: Provider,
    pub fetched_at: DateTime<Utc>,
}

/// A post-extraction article with clean text and canonical identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedArticle {
    pub id: String,
    pub title: String,
    pub canonical_url: String,
    pub source_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub excerpt: String,
    pub body: String,
    pub word_count: usize,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCitation {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// A set of articles judged to cover the same story.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryCluster {
    pub cluster_id: String,
    pub representative: NormalizedArticle,
    pub members: Vec<NormalizedArticle>,
    pub citations: Vec<ClusterCitation>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlinePoint {
    pub point: String,
    pub summary: String,
    #[serde(default)]
    pub supports: Vec<String>,
    #[serde(default)]
    pub dates: Vec<String>,
}

/// A thesis plus N points, each supported by cluster ids and ISO dates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlinePayload {
    pub thesis: String,
    pub outline: Vec<OutlinePoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub id: u32,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub source: String,
}

/// Evidence digest for one outline point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    pub outline_index: usize,
    pub point: String,
    pub digest: String,
    pub citations: Vec<Citation>,
}

/// One entry of the run-unique citation-id → source mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCatalogEntry {
    pub id: u32,
    pub title: String,
    pub url: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSource {
    pub id: u32,
    pub title: String,
    pub url: String,
}

/// The final synthesized article plus supporting metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleResult {
    pub title: String,
    pub article: String,
    pub sources: Vec<ArticleSource>,
    pub word_count: usize,
    pub raw_response: String,
    pub attempts: u32,
    pub novelty_score: f64,
    pub source_catalog: Vec<SourceCatalogEntry>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Retrieval,
    Ranking,
    Outline,
    TargetedResearch,
    Synthesis,
    ImagePrompt,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Retrieval => "retrieval",
            Stage::Ranking => "ranking",
            Stage::Outline => "outline",
            Stage::TargetedResearch => "targetedResearch",
            Stage::Synthesis => "synthesis",
            Stage::ImagePrompt => "imagePrompt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    Start,
    Progress,
    Success,
    Failure,
}

/// A typed progress event streamed to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub run_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

/// Per-provider counters accumulated across retrieval and extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderMetrics {
    pub returned: usize,
    pub deduped: usize,
    pub unique: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<String, usize>,
    pub errors: Vec<String>,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalMetrics {
    #[serde(default)]
    pub per_provider: BTreeMap<Provider, ProviderMetrics>,
}

impl RetrievalMetrics {
    pub fn provider_mut(&mut self, provider: Provider) -> &mut ProviderMetrics {
        self.per_provider.entry(provider).or_default()
    }

    pub fn merge(&mut self, other: &RetrievalMetrics) {
        for (provider, m) in &other.per_provider {
            let entry = self.provider_mut(*provider);
            entry.returned += m.returned;
            entry.deduped += m.deduped;
            entry.unique += m.unique;
            entry.accepted += m.accepted;
            for (reason, count) in &m.rejected {
                *entry.rejected.entry(reason.clone()).or_default() += count;
            }
            entry.errors.extend(m.errors.iter().cloned());
            entry.failed = entry.failed || m.failed;
        }
    }
}

/// Per-run execution context. Owns the cancellation token; every suspension
/// point in the pipeline races against it.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub topic: String,
    pub recency_hours: u32,
    pub config: Arc<Config>,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(run_id: String, topic: String, recency_hours: u32, config: Arc<Config>) -> Self {
        let cancel = CancellationToken::new();
        let ctx = Self {
            run_id,
            topic,
            recency_hours,
            config,
            cancel,
            started_at: Utc::now(),
        };
        ctx.spawn_deadline();
        ctx
    }

    /// Cancel the run when the total retrieval budget elapses.
    fn spawn_deadline(&self) {
        let budget = Duration::from_millis(self.config.retrieval.total_budget_ms);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Raise `Aborted` if the run has been cancelled.
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            Err(crate::error::BriefError::Aborted.into())
        } else {
            Ok(())
        }
    }
}
