//! Run orchestration: wire retrieval → clustering → outline → research →
//! synthesis behind one deps bundle, emit stage events, and persist
//! artifacts best-effort along the way.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use briefwire_common::config::Config;
use briefwire_common::{
    ArticleResult, BriefError, EvidenceItem, NormalizedArticle, OutlinePayload, Provider,
    RetrievalMetrics, RunContext, SourceCatalogEntry, Stage, StoryCluster,
};
use briefwire_retrieval::cluster_articles;
use briefwire_retrieval::extract::extract_and_filter;
use briefwire_retrieval::fetch::PageFetcher;
use briefwire_retrieval::limits::HostLimits;
use briefwire_retrieval::providers::SearchProvider;
use briefwire_retrieval::retriever::{retrieve_candidates, ProviderQueries, RetrievalKnobs};
use gemini_client::{Aborted, GenerateOptions, ParseOutcome};

use crate::article::{synthesize_article, SynthesisInput};
use crate::artifacts::ArtifactStore;
use crate::events::StageEmitter;
use crate::image_prompt::{generate_image_prompt, ImagePromptPayload};
use crate::outline::{generate_outline, OutlineOutcome};
use crate::prompts;
use crate::research::{
    build_evidence_from_clusters, research_all_points, QueryRewriter, ResearchContext,
    TargetedResearchResult,
};
use crate::Llm;

/// True when `err` is (or wraps) a cancellation, from either the pipeline's
/// own token checks or the LLM gate.
pub fn is_abort(err: &anyhow::Error) -> bool {
    BriefError::is_aborted(err)
        || err
            .chain()
            .any(|cause| cause.downcast_ref::<Aborted>().is_some())
}

/// Everything one request needs to drive the pipeline. The host limits and
/// the query rewriter are shared across runs; the LLM and provider set are
/// per-request (header overrides).
pub struct PipelineDeps {
    pub config: Arc<Config>,
    pub llm: Arc<Llm>,
    pub providers: Vec<Box<dyn SearchProvider>>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub limits: Arc<HostLimits>,
    pub rewriter: Arc<QueryRewriter>,
    pub store: Arc<ArtifactStore>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTopicQueries {
    #[serde(default, rename = "googleCse")]
    google_cse: Option<String>,
    #[serde(default, rename = "newsApi")]
    news_api: Option<String>,
    #[serde(default, rename = "eventRegistry")]
    event_registry: Option<String>,
    #[serde(default, rename = "googleNews")]
    google_news: Option<String>,
}

/// Optional LLM topic analysis: provider-specific query phrasings. Skipped
/// in the serverless profile; any failure falls back to the raw topic.
pub async fn analyze_topic(
    deps: &PipelineDeps,
    ctx: &RunContext,
) -> Result<ProviderQueries> {
    if deps.config.is_serverless() {
        return Ok(ProviderQueries::uniform(ctx.topic.clone()));
    }

    let prompt = prompts::topic_analysis(&ctx.topic);
    let opts = GenerateOptions {
        fallback_to_text: true,
        ..Default::default()
    };

    match deps
        .llm
        .generate_and_parse::<RawTopicQueries>(&prompt, &opts, &ctx.cancel)
        .await
    {
        Ok(ParseOutcome::Parsed { value, .. }) => {
            let mut per_provider = HashMap::new();
            let pairs = [
                (Provider::GoogleCse, value.google_cse),
                (Provider::NewsApi, value.news_api),
                (Provider::EventRegistry, value.event_registry),
                (Provider::GoogleNews, value.google_news),
            ];
            for (provider, query) in pairs {
                if let Some(query) = query.map(|q| q.trim().to_string()) {
                    if !query.is_empty() {
                        per_provider.insert(provider, query);
                    }
                }
            }
            Ok(ProviderQueries {
                main_query: ctx.topic.clone(),
                per_provider,
            })
        }
        Ok(ParseOutcome::Fallback { .. }) => Ok(ProviderQueries::uniform(ctx.topic.clone())),
        Err(err) if is_abort(&err) => Err(err),
        Err(err) => {
            warn!(error = %err, "Topic analysis failed, using raw topic");
            Ok(ProviderQueries::uniform(ctx.topic.clone()))
        }
    }
}

pub struct RetrievalOutput {
    pub main_query: String,
    pub accepted: Vec<NormalizedArticle>,
    pub clusters: Vec<StoryCluster>,
    pub metrics: RetrievalMetrics,
}

/// Retrieval + extraction + clustering, with `retrieval` and `ranking` stage
/// events and the batch/cluster artifacts.
pub async fn run_retrieval(
    deps: &PipelineDeps,
    ctx: &RunContext,
    emitter: &StageEmitter,
) -> Result<RetrievalOutput> {
    emitter.start(Stage::Retrieval, format!("Retrieving: {}", ctx.topic));
    let result = retrieval_inner(deps, ctx, emitter).await;
    match &result {
        Ok(output) => {
            emitter.success(
                Stage::Retrieval,
                Some(json!({
                    "accepted": output.accepted.len(),
                    "query": &output.main_query,
                })),
            );
            emitter.start(Stage::Ranking, "Clustering accepted articles");
            emitter.success(
                Stage::Ranking,
                Some(json!({ "clusters": output.clusters.len() })),
            );
        }
        Err(err) => emitter.failure(Stage::Retrieval, format!("{err:#}")),
    }
    result
}

async fn retrieval_inner(
    deps: &PipelineDeps,
    ctx: &RunContext,
    emitter: &StageEmitter,
) -> Result<RetrievalOutput> {
    ctx.check_cancelled()?;

    let queries = analyze_topic(deps, ctx).await?;
    let knobs = RetrievalKnobs::from_config(&deps.config.retrieval);
    let batch = retrieve_candidates(
        &queries,
        &deps.providers,
        ctx.recency_hours,
        &knobs,
        &ctx.cancel,
    )
    .await?;

    emitter.progress(
        Stage::Retrieval,
        format!("{} candidates after dedup", batch.candidates.len()),
        None,
    );

    let budget = batch.candidates.len().min(knobs.max_attempts);
    let outcome = extract_and_filter(
        &batch.main_query,
        ctx.recency_hours,
        &batch.candidates[..budget],
        deps.fetcher.as_ref(),
        &deps.limits,
        &deps.config.retrieval,
        &ctx.cancel,
    )
    .await?;

    let mut metrics = batch.metrics;
    metrics.merge(&outcome.metrics);

    for article in &outcome.accepted {
        deps.store.save_normalized(article).await;
    }
    deps.store
        .save(
            &ctx.run_id,
            "retrieval_batch",
            &json!({
                "runId": &ctx.run_id,
                "query": batch.main_query,
                "recencyHours": ctx.recency_hours,
                "fetchedAt": Utc::now(),
                "articles": &outcome.accepted,
                "metrics": &metrics,
            }),
        )
        .await;

    if outcome.accepted.len() < deps.config.retrieval.min_accepted {
        warn!(
            accepted = outcome.accepted.len(),
            min_accepted = deps.config.retrieval.min_accepted,
            "Accepted fewer articles than the configured floor"
        );
    }

    let clusters = cluster_articles(&outcome.accepted, &deps.config.retrieval);
    deps.store
        .save(&ctx.run_id, "retrieval_clusters", &clusters)
        .await;

    info!(
        run_id = %ctx.run_id,
        accepted = outcome.accepted.len(),
        clusters = clusters.len(),
        "Retrieval stage complete"
    );

    Ok(RetrievalOutput {
        main_query: batch.main_query,
        accepted: outcome.accepted,
        clusters,
        metrics,
    })
}

/// Outline stage with events and artifact.
pub async fn run_outline_stage(
    deps: &PipelineDeps,
    ctx: &RunContext,
    topic: &str,
    clusters: &[StoryCluster],
    emitter: &StageEmitter,
) -> Result<OutlineOutcome> {
    emitter.start(Stage::Outline, "Generating outline");
    ctx.check_cancelled()?;

    match generate_outline(&deps.llm, topic, clusters, &ctx.cancel).await {
        Ok(outcome) => {
            deps.store
                .save(
                    &ctx.run_id,
                    "outline",
                    &json!({
                        "thesis": &outcome.payload.thesis,
                        "outline": &outcome.payload.outline,
                        "coverage": &outcome.payload.coverage,
                        "rawResponse": &outcome.raw_response,
                        "attempts": outcome.attempts,
                    }),
                )
                .await;
            emitter.success(
                Stage::Outline,
                Some(json!({ "points": outcome.payload.outline.len() })),
            );
            Ok(outcome)
        }
        Err(err) => {
            emitter.failure(Stage::Outline, format!("{err:#}"));
            Err(err)
        }
    }
}

/// Targeted research for every outline point, or the deterministic cluster
/// projection in the serverless profile.
pub async fn run_research_stage(
    deps: &PipelineDeps,
    ctx: &RunContext,
    topic: &str,
    outline: &OutlinePayload,
    clusters: &[StoryCluster],
    emitter: &StageEmitter,
) -> Result<Vec<TargetedResearchResult>> {
    emitter.start(
        Stage::TargetedResearch,
        format!("Researching {} outline points", outline.outline.len()),
    );
    ctx.check_cancelled()?;

    if deps.config.is_serverless() {
        let evidence = build_evidence_from_clusters(outline, clusters);
        let results: Vec<TargetedResearchResult> = evidence
            .into_iter()
            .map(|item| TargetedResearchResult {
                outline_index: item.outline_index,
                point: item.point.clone(),
                queries: Vec::new(),
                clusters: Vec::new(),
                evidence: item,
            })
            .collect();
        emitter.success(
            Stage::TargetedResearch,
            Some(json!({ "points": results.len(), "mode": "clusterProjection" })),
        );
        return Ok(results);
    }

    let research_ctx = ResearchContext {
        llm: &deps.llm,
        providers: &deps.providers,
        fetcher: deps.fetcher.as_ref(),
        limits: &deps.limits,
        config: &deps.config.retrieval,
        rewriter: &deps.rewriter,
    };

    match research_all_points(&research_ctx, topic, outline, ctx.recency_hours, &ctx.cancel).await
    {
        Ok(results) => {
            deps.store
                .save(&ctx.run_id, "targeted_research", &results)
                .await;
            emitter.success(
                Stage::TargetedResearch,
                Some(json!({ "points": results.len() })),
            );
            Ok(results)
        }
        Err(err) => {
            emitter.failure(Stage::TargetedResearch, format!("{err:#}"));
            Err(err)
        }
    }
}

/// One outline point's targeted research, for the per-point endpoint.
pub async fn run_single_research_point(
    deps: &PipelineDeps,
    ctx: &RunContext,
    topic: &str,
    outline_index: usize,
    point: &str,
    summary: &str,
    emitter: &StageEmitter,
) -> Result<TargetedResearchResult> {
    emitter.start(
        Stage::TargetedResearch,
        format!("Researching point {}", outline_index + 1),
    );
    ctx.check_cancelled()?;

    let research_ctx = ResearchContext {
        llm: &deps.llm,
        providers: &deps.providers,
        fetcher: deps.fetcher.as_ref(),
        limits: &deps.limits,
        config: &deps.config.retrieval,
        rewriter: &deps.rewriter,
    };

    match crate::research::research_point(
        &research_ctx,
        topic,
        outline_index,
        point,
        summary,
        ctx.recency_hours,
        &ctx.cancel,
    )
    .await
    {
        Ok(result) => {
            emitter.success(
                Stage::TargetedResearch,
                Some(json!({ "clusters": result.clusters.len() })),
            );
            Ok(result)
        }
        Err(err) => {
            emitter.failure(Stage::TargetedResearch, format!("{err:#}"));
            Err(err)
        }
    }
}

/// Article synthesis with events and artifacts.
#[allow(clippy::too_many_arguments)]
pub async fn run_synthesis_stage(
    deps: &PipelineDeps,
    ctx: &RunContext,
    topic: &str,
    outline: &OutlinePayload,
    clusters: &[StoryCluster],
    evidence: &[EvidenceItem],
    previous_article: &str,
    provided_catalog: Option<Vec<SourceCatalogEntry>>,
    emitter: &StageEmitter,
) -> Result<ArticleResult> {
    emitter.start(Stage::Synthesis, "Synthesizing article");
    ctx.check_cancelled()?;

    let input = SynthesisInput {
        topic,
        outline,
        clusters,
        evidence,
        previous_article,
        provided_catalog,
    };

    match synthesize_article(&deps.llm, &input, &ctx.cancel).await {
        Ok(result) => {
            deps.store
                .save(&ctx.run_id, "source_catalog", &result.source_catalog)
                .await;
            deps.store.save(&ctx.run_id, "article", &result).await;
            emitter.success(
                Stage::Synthesis,
                Some(json!({
                    "wordCount": result.word_count,
                    "attempts": result.attempts,
                    "noveltyScore": result.novelty_score,
                })),
            );
            Ok(result)
        }
        Err(err) => {
            emitter.failure(Stage::Synthesis, format!("{err:#}"));
            Err(err)
        }
    }
}

/// Image-prompt stage (independent of the main chain).
pub async fn run_image_prompt_stage(
    deps: &PipelineDeps,
    ctx: &RunContext,
    article: &str,
    emitter: &StageEmitter,
) -> Result<ImagePromptPayload> {
    emitter.start(Stage::ImagePrompt, "Generating image prompt");
    ctx.check_cancelled()?;

    match generate_image_prompt(&deps.llm, article, &ctx.cancel).await {
        Ok(payload) => {
            deps.store.save(&ctx.run_id, "image_prompt", &payload).await;
            emitter.success(Stage::ImagePrompt, None);
            Ok(payload)
        }
        Err(err) => {
            emitter.failure(Stage::ImagePrompt, format!("{err:#}"));
            Err(err)
        }
    }
}

/// The full pipeline: retrieval → ranking → outline → targeted research →
/// synthesis. Emits the diagnostic result events along the way.
pub async fn run_full_pipeline(
    deps: &PipelineDeps,
    ctx: &RunContext,
    emitter: &StageEmitter,
) -> Result<ArticleResult> {
    let retrieval = run_retrieval(deps, ctx, emitter).await?;
    emitter.named(
        "retrieval-result",
        json!({
            "runId": &ctx.run_id,
            "accepted": retrieval.accepted.len(),
            "clusters": retrieval.clusters.len(),
            "perProvider": &retrieval.metrics,
        }),
    );

    let outline = run_outline_stage(deps, ctx, &ctx.topic, &retrieval.clusters, emitter).await?;
    emitter.named(
        "outline-result",
        json!({
            "runId": &ctx.run_id,
            "thesis": &outline.payload.thesis,
            "points": outline.payload.outline.len(),
            "attempts": outline.attempts,
        }),
    );

    let research = run_research_stage(
        deps,
        ctx,
        &ctx.topic,
        &outline.payload,
        &retrieval.clusters,
        emitter,
    )
    .await?;
    let evidence: Vec<EvidenceItem> = research.iter().map(|r| r.evidence.clone()).collect();

    run_synthesis_stage(
        deps,
        ctx,
        &ctx.topic,
        &outline.payload,
        &retrieval.clusters,
        &evidence,
        "",
        None,
        emitter,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::tests::{scripted_llm, test_chain};
    use async_trait::async_trait;
    use gemini_client::StructuredClient;

    fn test_config(serverless: bool) -> Config {
        let mut config = Config::from_env();
        config.persistence.mode = if serverless {
            briefwire_common::PersistenceMode::None
        } else {
            briefwire_common::PersistenceMode::Fs
        };
        config
    }

    struct NoopFetcher;

    #[async_trait]
    impl PageFetcher for NoopFetcher {
        async fn fetch_text(&self, _url: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn deps_with_llm(llm: Llm, serverless: bool) -> PipelineDeps {
        PipelineDeps {
            config: Arc::new(test_config(serverless)),
            llm: Arc::new(llm),
            providers: Vec::new(),
            fetcher: Arc::new(NoopFetcher),
            limits: Arc::new(HostLimits::new(2, 1)),
            rewriter: Arc::new(QueryRewriter::new()),
            store: Arc::new(ArtifactStore::None),
        }
    }

    fn run_ctx(deps: &PipelineDeps, topic: &str) -> RunContext {
        RunContext::new("run1".into(), topic.into(), 168, deps.config.clone())
    }

    struct FakeProvider {
        items: Vec<(String, String)>,
    }

    #[async_trait]
    impl SearchProvider for FakeProvider {
        fn provider(&self) -> Provider {
            Provider::NewsApi
        }

        async fn search(
            &self,
            _query: &str,
            _recency_hours: u32,
            _limit: usize,
        ) -> Result<Vec<briefwire_retrieval::providers::SearchItem>> {
            Ok(self
                .items
                .iter()
                .map(|(url, title)| briefwire_retrieval::providers::SearchItem {
                    title: title.clone(),
                    url: url.clone(),
                    source_name: Some("Example Wire".into()),
                    published_at: Some(Utc::now() - chrono::Duration::hours(10)),
                    snippet: None,
                    provider_data: None,
                })
                .collect())
        }
    }

    struct RelevantFetcher;

    #[async_trait]
    impl PageFetcher for RelevantFetcher {
        async fn fetch_text(&self, _url: &str) -> Result<String> {
            Ok((0..200)
                .map(|i| format!("regulation enforcement detail number{i} outcome{i}"))
                .collect::<Vec<_>>()
                .join(". "))
        }
    }

    /// Scenario: three candidates for one story, outline and article accepted
    /// on their first attempts, every stage reports success.
    #[tokio::test]
    async fn full_pipeline_happy_path() {
        let article_body = (0..9)
            .map(|i| {
                format!(
                    "On 2026-07-{:02} regulators advanced enforcement with new guidance and detailed timelines for affected companies across markets [{}].",
                    (i % 27) + 1,
                    (i % 3) + 1
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let synthesis = serde_json::json!({
            "title": "Enforcement week",
            "article": article_body,
            "sources": []
        })
        .to_string();

        let llm = scripted_llm(vec![
            // Topic analysis.
            r#"{"newsApi": "ai regulation enforcement"}"#,
            // Outline: one cluster, one point.
            r#"{"thesis": "Enforcement became concrete this week.", "outline": [
                {"point": "Regulation enforcement ramps", "summary": "Enforcement begins", "supports": ["C01"], "dates": []}
            ]}"#,
            // Query expansion: nothing useful, baseline only.
            r#"{"queries": []}"#,
            &synthesis,
        ]);

        let mut deps = deps_with_llm(llm, false);
        deps.providers = vec![Box::new(FakeProvider {
            items: vec![
                ("https://one.example/story".into(), "Regulators ramp enforcement".into()),
                ("https://two.example/story".into(), "Regulators ramp enforcement again".into()),
                ("https://three.example/story".into(), "Enforcement ramps at regulators".into()),
            ],
        })];
        deps.fetcher = Arc::new(RelevantFetcher);

        let ctx = run_ctx(&deps, "ai regulation");
        let (emitter, mut rx) = StageEmitter::new(ctx.run_id.clone());

        let result = run_full_pipeline(&deps, &ctx, &emitter)
            .await
            .expect("pipeline should succeed");
        drop(emitter);

        assert_eq!(result.attempts, 1);
        assert!(result.article.contains("Key developments"));
        assert!(!result.sources.is_empty());
        assert!(!result.source_catalog.is_empty());

        let mut successes = std::collections::HashSet::new();
        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if let crate::OutboundEvent::Stage(stage_event) = event {
                match stage_event.status {
                    briefwire_common::StageStatus::Success => {
                        successes.insert(stage_event.stage);
                    }
                    briefwire_common::StageStatus::Failure => failures += 1,
                    _ => {}
                }
            }
        }
        assert_eq!(failures, 0);
        for stage in [
            Stage::Retrieval,
            Stage::Ranking,
            Stage::Outline,
            Stage::TargetedResearch,
            Stage::Synthesis,
        ] {
            assert!(successes.contains(&stage), "missing success for {stage:?}");
        }
    }

    #[tokio::test]
    async fn serverless_skips_topic_analysis() {
        // No scripted responses: an LLM call would error the test.
        let deps = deps_with_llm(scripted_llm(vec![]), true);
        let ctx = run_ctx(&deps, "ai regulation");
        let queries = analyze_topic(&deps, &ctx).await.unwrap();
        assert!(queries.per_provider.is_empty());
        assert_eq!(queries.main_query, "ai regulation");
    }

    #[tokio::test]
    async fn topic_analysis_maps_provider_queries() {
        let deps = deps_with_llm(
            scripted_llm(vec![
                r#"{"googleCse": "cse q", "newsApi": "news q", "eventRegistry": "", "googleNews": "gn q"}"#,
            ]),
            false,
        );
        let ctx = run_ctx(&deps, "topic");
        let queries = analyze_topic(&deps, &ctx).await.unwrap();
        assert_eq!(queries.query_for(Provider::GoogleCse), "cse q");
        assert_eq!(queries.query_for(Provider::NewsApi), "news q");
        // Empty strings fall back to the main query.
        assert_eq!(queries.query_for(Provider::EventRegistry), "topic");
    }

    #[tokio::test]
    async fn topic_analysis_failure_falls_back_to_topic() {
        let deps = deps_with_llm(scripted_llm(vec!["not json"]), false);
        let ctx = run_ctx(&deps, "fallback topic");
        let queries = analyze_topic(&deps, &ctx).await.unwrap();
        assert!(queries.per_provider.is_empty());
        assert_eq!(queries.main_query, "fallback topic");
    }

    #[tokio::test]
    async fn empty_pipeline_fails_at_outline_with_no_clusters() {
        // Serverless (skips topic analysis), no providers → no candidates →
        // no clusters → outline stage raises the canonical error.
        let deps = deps_with_llm(scripted_llm(vec![]), true);
        let ctx = run_ctx(&deps, "anything");
        let (emitter, mut rx) = StageEmitter::new(ctx.run_id.clone());

        let err = run_full_pipeline(&deps, &ctx, &emitter).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot generate outline: no clusters provided"
        );

        // The outline stage reported the failure.
        let mut saw_outline_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let crate::OutboundEvent::Stage(stage_event) = event {
                if stage_event.stage == Stage::Outline
                    && stage_event.status == briefwire_common::StageStatus::Failure
                {
                    saw_outline_failure = true;
                }
            }
        }
        assert!(saw_outline_failure);
    }

    #[tokio::test]
    async fn abort_detection_covers_both_error_families() {
        assert!(is_abort(&anyhow::Error::from(BriefError::Aborted)));
        assert!(is_abort(&anyhow::anyhow!(Aborted)));
        assert!(!is_abort(&anyhow::anyhow!("ordinary failure")));
    }

    #[tokio::test]
    async fn cancelled_run_context_aborts_stages() {
        let deps = deps_with_llm(scripted_llm(vec![]), true);
        let ctx = run_ctx(&deps, "topic");
        ctx.cancel.cancel();
        let (emitter, _rx) = StageEmitter::new(ctx.run_id.clone());
        let err = run_full_pipeline(&deps, &ctx, &emitter).await.unwrap_err();
        assert!(is_abort(&err));
    }

    #[tokio::test]
    async fn abort_from_llm_propagates_out_of_topic_analysis() {
        struct AbortingGen;
        #[async_trait]
        impl gemini_client::TextGenerator for AbortingGen {
            async fn generate_text(
                &self,
                _model: &str,
                _prompt: &str,
                _opts: &GenerateOptions,
                _cancel: &CancellationToken,
            ) -> Result<String> {
                Err(anyhow::anyhow!(Aborted))
            }
        }
        let llm: Llm = StructuredClient::new(Box::new(AbortingGen), test_chain());
        let deps = deps_with_llm(llm, false);
        let ctx = run_ctx(&deps, "topic");
        let err = analyze_topic(&deps, &ctx).await.unwrap_err();
        assert!(is_abort(&err));
    }

}
