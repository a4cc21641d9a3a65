use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use briefwire_common::Config;
use briefwire_pipeline::artifacts::ArtifactStore;
use briefwire_pipeline::research::QueryRewriter;
use briefwire_pipeline::{Llm, PipelineDeps};
use briefwire_retrieval::fetch::{HttpFetcher, PageFetcher};
use briefwire_retrieval::limits::HostLimits;
use briefwire_retrieval::providers::enabled_providers;
use gemini_client::{GateGenerator, LlmGate, ModelChain, StructuredClient, TextGenerator};

mod handlers;
mod headers;
mod sse;

use headers::{effective_gemini, effective_provider_keys, parse_overrides};

/// Shared server state. The gate, host limits, rewrite cache, and artifact
/// store are the only cross-run resources; everything else is rebuilt per
/// request so header overrides stay request-scoped.
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: Arc<LlmGate>,
    pub limits: Arc<HostLimits>,
    pub rewriter: Arc<QueryRewriter>,
    pub store: Arc<ArtifactStore>,
    pub fetcher: Arc<dyn PageFetcher>,
}

impl AppState {
    /// Per-request pipeline deps with header overrides applied.
    pub fn deps(&self, headers: &HeaderMap) -> PipelineDeps {
        let overrides = parse_overrides(headers);
        let (api_key, rpm) = effective_gemini(&self.config, &overrides);

        let generator: Box<dyn TextGenerator> =
            Box::new(GateGenerator::new(self.gate.clone(), api_key, rpm));
        let llm: Llm = StructuredClient::new(
            generator,
            ModelChain {
                primary: self.config.gemini.model.clone(),
                flash: self.config.gemini.flash_model.clone(),
                flash_lite: self.config.gemini.flash_lite_model.clone(),
            },
        );

        let provider_keys = effective_provider_keys(&self.config, &overrides);

        PipelineDeps {
            config: self.config.clone(),
            llm: Arc::new(llm),
            providers: enabled_providers(&provider_keys),
            fetcher: self.fetcher.clone(),
            limits: self.limits.clone(),
            rewriter: self.rewriter.clone(),
            store: self.store.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("briefwire={}", config.log_level).parse()?),
        )
        .init();

    config.log_redacted();

    let config = Arc::new(config);
    let state = Arc::new(AppState {
        gate: Arc::new(LlmGate::new()),
        limits: Arc::new(HostLimits::new(
            config.retrieval.global_concurrency,
            config.retrieval.per_host_concurrency,
        )),
        rewriter: Arc::new(QueryRewriter::new()),
        store: Arc::new(ArtifactStore::from_config(&config.persistence)),
        fetcher: Arc::new(HttpFetcher::new()),
        config: config.clone(),
    });

    let app = Router::new()
        .route("/api/healthz", get(handlers::healthz))
        .route("/api/config", get(handlers::public_config))
        // Streams
        .route("/api/run-agent-stream", get(handlers::run_agent_stream))
        .route("/api/retrieve-stream", get(handlers::retrieve_stream))
        .route(
            "/api/generate-outline-stream",
            post(handlers::generate_outline_stream),
        )
        .route(
            "/api/targeted-research-stream",
            post(handlers::targeted_research_stream),
        )
        .route(
            "/api/generate-article-stream",
            post(handlers::generate_article_stream),
        )
        .route(
            "/api/generate-image-prompt-stream",
            post(handlers::generate_image_prompt_stream),
        )
        // Stage-at-a-time JSON endpoints
        .route(
            "/api/retrieve-candidates",
            get(handlers::retrieve_candidates_json),
        )
        .route("/api/extract-batch", post(handlers::extract_batch))
        .route("/api/cluster-articles", post(handlers::cluster_articles_json))
        // Artifacts
        .route(
            "/api/runs/{run_id}/artifacts/{kind}",
            get(handlers::get_artifact),
        )
        .route("/api/article/{run_id}", get(handlers::get_article))
        .route("/api/normalized/{article_id}", get(handlers::get_normalized))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        );

    let addr = format!("0.0.0.0:{}", config.server.port);
    info!("briefwire server starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
