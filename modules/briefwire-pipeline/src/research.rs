//! Targeted research: each outline point fans out into at most two focused
//! sub-queries, each of which runs a tightened mini-retrieval. A process-wide
//! LRU rewrite cache plus an in-flight map keep concurrent research tasks
//! from repeating the same query-expansion LLM call.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use briefwire_common::config::RetrievalConfig;
use briefwire_common::util::truncate_to_char_boundary;
use briefwire_common::{Citation, EvidenceItem, OutlinePayload, StoryCluster};
use briefwire_retrieval::extract::extract_and_filter;
use briefwire_retrieval::fetch::PageFetcher;
use briefwire_retrieval::limits::{run_indexed, HostLimits};
use briefwire_retrieval::providers::SearchProvider;
use briefwire_retrieval::retriever::{retrieve_candidates, ProviderQueries, RetrievalKnobs};
use gemini_client::{Aborted, GenerateOptions, ParseOutcome};

use crate::prompts;
use crate::Llm;

const REWRITE_CACHE_CAPACITY: usize = 32;
/// At most this many sub-queries per outline point (baseline included).
const MAX_QUERIES_PER_POINT: usize = 2;
/// Clusters kept after merging across sub-queries.
const MAX_MERGED_CLUSTERS: usize = 8;
/// Citation lines per evidence digest.
const MAX_DIGEST_CITATIONS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetedResearchResult {
    pub outline_index: usize,
    pub point: String,
    pub queries: Vec<String>,
    pub clusters: Vec<StoryCluster>,
    pub evidence: EvidenceItem,
}

#[derive(Debug, Default, Deserialize)]
struct RawQueries {
    #[serde(default)]
    queries: Vec<String>,
}

/// Query-expansion cache shared across concurrent research tasks. The
/// in-flight map collapses simultaneous requests for one key into a single
/// LLM call; entries are removed on every exit path so a failed rewrite
/// never pins a key.
pub struct QueryRewriter {
    cache: StdMutex<LruCache<String, Vec<String>>>,
    in_flight: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Vec<String>>>>>>,
}

impl Default for QueryRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRewriter {
    pub fn new() -> Self {
        Self {
            cache: StdMutex::new(LruCache::new(
                NonZeroUsize::new(REWRITE_CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    /// Final query list for one outline point: baseline first, then the LLM
    /// expansion, order-preserving, capped at `MAX_QUERIES_PER_POINT`.
    /// Expansion failure falls back to the baseline alone.
    pub async fn queries_for_point(
        &self,
        llm: &Llm,
        topic: &str,
        point: &str,
        summary: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let baseline = format!("{topic} {point}").trim().to_string();

        // Eviction tracks insertion order only: `peek` must not promote the
        // entry the way `get` would.
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peek(&baseline)
        {
            return Ok(hit.clone());
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight
                .entry(baseline.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };

        let result = {
            let mut slot = cell.lock().await;
            match slot.as_ref() {
                Some(queries) => Ok(queries.clone()),
                None => match self.expand(llm, topic, point, summary, &baseline, cancel).await {
                    Ok(queries) => {
                        *slot = Some(queries.clone());
                        self.cache
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .put(baseline.clone(), queries.clone());
                        Ok(queries)
                    }
                    Err(err) => Err(err),
                },
            }
        };

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&baseline);

        result
    }

    async fn expand(
        &self,
        llm: &Llm,
        topic: &str,
        point: &str,
        summary: &str,
        baseline: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let prompt = prompts::query_expansion(topic, point, summary);
        let opts = GenerateOptions {
            fallback_to_text: true,
            ..Default::default()
        };

        let expansion = match llm.generate_and_parse::<RawQueries>(&prompt, &opts, cancel).await {
            Ok(ParseOutcome::Parsed { value, .. }) => value.queries,
            Ok(ParseOutcome::Fallback { .. }) => Vec::new(),
            Err(err) if err.downcast_ref::<Aborted>().is_some() => return Err(err),
            Err(err) => {
                warn!(point, error = %err, "Query expansion failed, using baseline");
                Vec::new()
            }
        };

        let mut queries = vec![baseline.to_string()];
        for candidate in expansion {
            let candidate = candidate.trim().to_string();
            if candidate.is_empty() || queries.contains(&candidate) {
                continue;
            }
            if queries.len() >= MAX_QUERIES_PER_POINT {
                break;
            }
            queries.push(candidate);
        }
        Ok(queries)
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

/// Everything a research task needs from the surrounding run.
pub struct ResearchContext<'a> {
    pub llm: &'a Llm,
    pub providers: &'a [Box<dyn SearchProvider>],
    pub fetcher: &'a dyn PageFetcher,
    pub limits: &'a HostLimits,
    pub config: &'a RetrievalConfig,
    pub rewriter: &'a QueryRewriter,
}

/// Format the evidence digest for one outline point from its top clusters.
pub fn format_evidence(
    outline_index: usize,
    point: &str,
    clusters: &[StoryCluster],
) -> EvidenceItem {
    let mut lines = Vec::new();
    let mut citations = Vec::new();

    for (i, cluster) in clusters.iter().take(MAX_DIGEST_CITATIONS).enumerate() {
        let n = (i + 1) as u32;
        let rep = &cluster.representative;
        let date = rep
            .published_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "Undated".to_string());
        let source = rep
            .source_name
            .clone()
            .unwrap_or_else(|| rep.source_host.clone());
        lines.push(format!(
            "[{n}] {date} - {source}: {}. Key points: {}",
            rep.title,
            truncate_to_char_boundary(&rep.excerpt, 200),
        ));
        citations.push(Citation {
            id: n,
            title: rep.title.clone(),
            url: rep.canonical_url.clone(),
            published_at: rep.published_at,
            source,
        });
    }

    EvidenceItem {
        outline_index,
        point: point.to_string(),
        digest: lines.join("\n"),
        citations,
    }
}

/// Serverless replacement for the whole research stage: project the global
/// top clusters into one digest and reuse it for every outline point.
pub fn build_evidence_from_clusters(
    outline: &OutlinePayload,
    clusters: &[StoryCluster],
) -> Vec<EvidenceItem> {
    let mut ranked: Vec<&StoryCluster> = clusters.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    let top: Vec<StoryCluster> = ranked
        .into_iter()
        .take(MAX_DIGEST_CITATIONS)
        .cloned()
        .collect();

    outline
        .outline
        .iter()
        .enumerate()
        .map(|(i, point)| format_evidence(i, &point.point, &top))
        .collect()
}

fn merge_clusters(per_query: Vec<Vec<StoryCluster>>) -> Vec<StoryCluster> {
    let mut seen_ids = std::collections::HashSet::new();
    let mut seen_urls = std::collections::HashSet::new();
    let mut merged: Vec<StoryCluster> = Vec::new();
    for clusters in per_query {
        for cluster in clusters {
            if !seen_ids.insert(cluster.cluster_id.clone()) {
                continue;
            }
            if !seen_urls.insert(cluster.representative.canonical_url.clone()) {
                continue;
            }
            merged.push(cluster);
        }
    }
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(MAX_MERGED_CLUSTERS);
    merged
}

/// Research one outline point: expand queries, run a tightened mini-retrieval
/// per query, merge clusters, and emit the evidence digest.
pub async fn research_point(
    ctx: &ResearchContext<'_>,
    topic: &str,
    outline_index: usize,
    point: &str,
    summary: &str,
    recency_hours: u32,
    cancel: &CancellationToken,
) -> Result<TargetedResearchResult> {
    let queries = ctx
        .rewriter
        .queries_for_point(ctx.llm, topic, point, summary, cancel)
        .await?;

    let knobs = RetrievalKnobs::tightened(ctx.config);
    let mut per_query = Vec::new();

    for query in &queries {
        let batch = retrieve_candidates(
            &ProviderQueries::uniform(query.clone()),
            ctx.providers,
            recency_hours,
            &knobs,
            cancel,
        )
        .await?;

        let budget = batch.candidates.len().min(knobs.max_attempts);
        let outcome = extract_and_filter(
            query,
            recency_hours,
            &batch.candidates[..budget],
            ctx.fetcher,
            ctx.limits,
            ctx.config,
            cancel,
        )
        .await?;

        per_query.push(briefwire_retrieval::cluster_articles(
            &outcome.accepted,
            ctx.config,
        ));
    }

    let clusters = merge_clusters(per_query);
    let evidence = format_evidence(outline_index, point, &clusters);

    info!(
        outline_index,
        queries = queries.len(),
        clusters = clusters.len(),
        "Targeted research point complete"
    );

    Ok(TargetedResearchResult {
        outline_index,
        point: point.to_string(),
        queries,
        clusters,
        evidence,
    })
}

/// Research every outline point through the indexed pool; results come back
/// in outline order regardless of completion order.
pub async fn research_all_points(
    ctx: &ResearchContext<'_>,
    topic: &str,
    outline: &OutlinePayload,
    recency_hours: u32,
    cancel: &CancellationToken,
) -> Result<Vec<TargetedResearchResult>> {
    let parallelism = ctx.config.global_concurrency.min(2).max(1);
    run_indexed(outline.outline.len(), parallelism, |i| {
        let point = &outline.outline[i];
        async move {
            research_point(
                ctx,
                topic,
                i,
                &point.point,
                &point.summary,
                recency_hours,
                cancel,
            )
            .await
        }
    })
    .await
}
