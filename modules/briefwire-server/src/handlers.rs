//! The `/api` surface. SSE handlers spawn the pipeline onto a task and hand
//! the event channel back as the response; JSON handlers run inline.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use briefwire_common::ids::run_id as new_run_id;
use briefwire_common::util::parse_recency_hours;
use briefwire_common::{
    Candidate, EvidenceItem, NormalizedArticle, OutlinePayload, RunContext, SourceCatalogEntry,
    StoryCluster,
};
use briefwire_pipeline::run::{
    analyze_topic, run_full_pipeline, run_image_prompt_stage, run_outline_stage, run_retrieval,
    run_single_research_point, run_synthesis_stage,
};
use briefwire_pipeline::StageEmitter;
use briefwire_retrieval::extract::extract_and_filter;
use briefwire_retrieval::retriever::{retrieve_candidates, RetrievalKnobs};

use crate::sse::sse_response;
use crate::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message.into() })),
    )
}

/// Effective recency for a request: the parsed/clamped override, or the
/// configured default.
fn effective_recency(state: &AppState, raw: Option<&str>) -> u32 {
    parse_recency_hours(raw, state.config.recency_hours_default)
        .unwrap_or(state.config.recency_hours_default)
}

fn effective_recency_num(state: &AppState, raw: Option<f64>) -> u32 {
    let as_string = raw.map(|v| v.to_string());
    effective_recency(state, as_string.as_deref())
}

fn run_id_or_new(provided: Option<String>) -> String {
    provided
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_run_id)
}

// --- Liveness and config ---

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "ts": Utc::now() }))
}

pub async fn public_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.config.public_view())
}

// --- Full pipeline stream ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAgentParams {
    pub topic: Option<String>,
    pub topic_query: Option<String>,
    pub recency_hours: Option<String>,
}

pub async fn run_agent_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RunAgentParams>,
) -> Result<impl IntoResponse, ApiError> {
    let topic = params
        .topic
        .or(params.topic_query)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| bad_request("topic is required"))?;

    let recency = effective_recency(&state, params.recency_hours.as_deref());
    let deps = state.deps(&headers);
    let ctx = RunContext::new(new_run_id(), topic, recency, state.config.clone());
    let (emitter, rx) = StageEmitter::new(ctx.run_id.clone());

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = run_full_pipeline(&deps, &ctx, &emitter).await {
            warn!(run_id = %ctx.run_id, error = %err, "Pipeline run failed");
            emitter.fatal(format!("{err:#}"));
        }
    });

    Ok(sse_response(rx, cancel, state.config.server.heartbeat_interval_ms))
}

// --- Retrieval-only stream ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveParams {
    pub topic: Option<String>,
    pub recency_hours: Option<String>,
    pub run_id: Option<String>,
}

pub async fn retrieve_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RetrieveParams>,
) -> Result<impl IntoResponse, ApiError> {
    let topic = params
        .topic
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| bad_request("topic is required"))?;

    let recency = effective_recency(&state, params.recency_hours.as_deref());
    let deps = state.deps(&headers);
    let ctx = RunContext::new(new_run_id(), topic, recency, state.config.clone());
    let (emitter, rx) = StageEmitter::new(ctx.run_id.clone());

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        match run_retrieval(&deps, &ctx, &emitter).await {
            Ok(output) => emitter.named(
                "retrieval-result",
                json!({
                    "runId": ctx.run_id,
                    "accepted": output.accepted.len(),
                    "clusters": output.clusters,
                    "perProvider": output.metrics,
                }),
            ),
            Err(err) => emitter.fatal(format!("{err:#}")),
        }
    });

    Ok(sse_response(rx, cancel, state.config.server.heartbeat_interval_ms))
}

// --- Retrieval candidates (JSON) ---

pub async fn retrieve_candidates_json(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RetrieveParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = params
        .topic
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| bad_request("topic is required"))?;

    let recency = effective_recency(&state, params.recency_hours.as_deref());
    let deps = state.deps(&headers);
    let ctx = RunContext::new(
        run_id_or_new(params.run_id),
        topic,
        recency,
        state.config.clone(),
    );

    let queries = analyze_topic(&deps, &ctx).await;
    let batch = match queries {
        Ok(queries) => {
            let knobs = RetrievalKnobs::from_config(&deps.config.retrieval);
            retrieve_candidates(&queries, &deps.providers, recency, &knobs, &ctx.cancel).await
        }
        Err(err) => Err(err),
    };
    // Reap the run's deadline task; this handler is done with the token.
    ctx.cancel.cancel();
    let batch = batch.map_err(|err| bad_request(format!("{err:#}")))?;

    Ok(Json(json!({
        "runId": ctx.run_id,
        "recencyHours": recency,
        "mainQuery": batch.main_query,
        "candidateCount": batch.candidates.len(),
        "candidates": batch.candidates,
        "perProvider": batch.metrics,
    })))
}

// --- Extraction-only (JSON) ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractBatchBody {
    pub run_id: Option<String>,
    pub main_query: String,
    pub candidates: Vec<Candidate>,
    pub recency_hours: Option<f64>,
}

pub async fn extract_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ExtractBatchBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.candidates.is_empty() {
        return Err(bad_request("candidates must not be empty"));
    }
    let recency = effective_recency_num(&state, body.recency_hours);
    let deps = state.deps(&headers);
    let ctx = RunContext::new(
        run_id_or_new(body.run_id),
        body.main_query.clone(),
        recency,
        state.config.clone(),
    );

    let outcome = extract_and_filter(
        &body.main_query,
        recency,
        &body.candidates,
        deps.fetcher.as_ref(),
        &deps.limits,
        &deps.config.retrieval,
        &ctx.cancel,
    )
    .await;
    ctx.cancel.cancel();
    let outcome = outcome.map_err(|err| bad_request(format!("{err:#}")))?;

    for article in &outcome.accepted {
        deps.store.save_normalized(article).await;
    }

    let extraction_errors: Vec<serde_json::Value> = outcome
        .metrics
        .per_provider
        .iter()
        .flat_map(|(provider, m)| {
            m.errors
                .iter()
                .map(move |e| json!({ "provider": provider, "error": e }))
        })
        .collect();

    Ok(Json(json!({
        "accepted": outcome.accepted,
        "perProvider": outcome.metrics,
        "extractionErrors": extraction_errors,
    })))
}

// --- Clustering-only (JSON) ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBody {
    pub run_id: Option<String>,
    pub articles: Vec<NormalizedArticle>,
    pub recency_hours: Option<f64>,
}

pub async fn cluster_articles_json(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClusterBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = run_id_or_new(body.run_id);
    let clusters = briefwire_retrieval::cluster_articles(&body.articles, &state.config.retrieval);
    state.store.save(&run_id, "retrieval_clusters", &clusters).await;
    Ok(Json(json!({
        "runId": run_id,
        "clusterCount": clusters.len(),
        "clusters": clusters,
    })))
}

// --- Outline stream ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineBody {
    pub run_id: Option<String>,
    pub topic: String,
    pub clusters: Vec<StoryCluster>,
    pub recency_hours: Option<f64>,
}

pub async fn generate_outline_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OutlineBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.topic.trim().is_empty() {
        return Err(bad_request("topic is required"));
    }
    let recency = effective_recency_num(&state, body.recency_hours);
    let deps = state.deps(&headers);
    let ctx = RunContext::new(
        run_id_or_new(body.run_id),
        body.topic.clone(),
        recency,
        state.config.clone(),
    );
    let (emitter, rx) = StageEmitter::new(ctx.run_id.clone());

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        match run_outline_stage(&deps, &ctx, &ctx.topic, &body.clusters, &emitter).await {
            Ok(outcome) => emitter.named(
                "outline-result",
                json!({
                    "runId": ctx.run_id,
                    "thesis": outcome.payload.thesis,
                    "outline": outcome.payload.outline,
                    "attempts": outcome.attempts,
                }),
            ),
            Err(err) => emitter.fatal(format!("{err:#}")),
        }
    });

    Ok(sse_response(rx, cancel, state.config.server.heartbeat_interval_ms))
}

// --- Targeted research stream (single point) ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchBody {
    pub run_id: Option<String>,
    pub topic: String,
    pub outline_index: usize,
    pub point: String,
    pub summary: Option<String>,
    pub recency_hours: Option<f64>,
}

pub async fn targeted_research_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ResearchBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.topic.trim().is_empty() || body.point.trim().is_empty() {
        return Err(bad_request("topic and point are required"));
    }
    let recency = effective_recency_num(&state, body.recency_hours);
    let deps = state.deps(&headers);
    let ctx = RunContext::new(
        run_id_or_new(body.run_id),
        body.topic.clone(),
        recency,
        state.config.clone(),
    );
    let (emitter, rx) = StageEmitter::new(ctx.run_id.clone());

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        let summary = body.summary.unwrap_or_default();
        match run_single_research_point(
            &deps,
            &ctx,
            &ctx.topic,
            body.outline_index,
            &body.point,
            &summary,
            &emitter,
        )
        .await
        {
            Ok(result) => emitter.named(
                "targeted-research-result",
                serde_json::to_value(&result).unwrap_or_else(|_| json!({})),
            ),
            Err(err) => emitter.fatal(format!("{err:#}")),
        }
    });

    Ok(sse_response(rx, cancel, state.config.server.heartbeat_interval_ms))
}

// --- Article stream ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleBody {
    pub run_id: Option<String>,
    pub topic: String,
    pub outline: OutlinePayload,
    pub clusters: Vec<StoryCluster>,
    pub evidence: Vec<EvidenceItem>,
    pub source_catalog: Option<Vec<SourceCatalogEntry>>,
    pub recency_hours: Option<f64>,
    pub previous_article: Option<String>,
}

pub async fn generate_article_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ArticleBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.topic.trim().is_empty() {
        return Err(bad_request("topic is required"));
    }
    if body.outline.outline.is_empty() {
        return Err(bad_request("outline must contain at least one point"));
    }
    let recency = effective_recency_num(&state, body.recency_hours);
    let deps = state.deps(&headers);
    let ctx = RunContext::new(
        run_id_or_new(body.run_id),
        body.topic.clone(),
        recency,
        state.config.clone(),
    );
    let (emitter, rx) = StageEmitter::new(ctx.run_id.clone());

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        let previous = body.previous_article.unwrap_or_default();
        if let Err(err) = run_synthesis_stage(
            &deps,
            &ctx,
            &ctx.topic,
            &body.outline,
            &body.clusters,
            &body.evidence,
            &previous,
            body.source_catalog,
            &emitter,
        )
        .await
        {
            emitter.fatal(format!("{err:#}"));
        }
    });

    Ok(sse_response(rx, cancel, state.config.server.heartbeat_interval_ms))
}

// --- Image prompt stream ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePromptBody {
    pub run_id: Option<String>,
    pub article: String,
}

pub async fn generate_image_prompt_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ImagePromptBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.article.trim().is_empty() {
        return Err(bad_request("article is required"));
    }
    let deps = state.deps(&headers);
    let ctx = RunContext::new(
        run_id_or_new(body.run_id),
        String::new(),
        state.config.recency_hours_default,
        state.config.clone(),
    );
    let (emitter, rx) = StageEmitter::new(ctx.run_id.clone());

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = run_image_prompt_stage(&deps, &ctx, &body.article, &emitter).await {
            emitter.fatal(format!("{err:#}"));
        }
    });

    Ok(sse_response(rx, cancel, state.config.server.heartbeat_interval_ms))
}

// --- Artifacts ---

pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path((run_id, kind)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .load(&run_id, &kind)
        .await
        .map(Json)
        .map_err(|err| not_found(format!("{err:#}")))
}

pub async fn get_article(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .load(&run_id, "article")
        .await
        .map(Json)
        .map_err(|err| not_found(format!("{err:#}")))
}

pub async fn get_normalized(
    State(state): State<Arc<AppState>>,
    Path(article_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .load_normalized(&article_id)
        .await
        .map(Json)
        .map_err(|err| not_found(format!("{err:#}")))
}
