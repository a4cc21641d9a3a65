use std::env;

use serde_json::json;

/// Requests-per-minute budget is always clamped to this window, regardless of
/// whether the value came from the environment or a request header.
pub const RPM_MIN: u32 = 1;
pub const RPM_MAX: u32 = 10;

pub const RECENCY_MIN_HOURS: u32 = 6;
pub const RECENCY_MAX_HOURS: u32 = 720;
pub const RECENCY_DEFAULT_HOURS: u32 = 168;

pub fn clamp_rpm(rpm: u32) -> u32 {
    rpm.clamp(RPM_MIN, RPM_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    Fs,
    None,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub min_accepted: usize,
    pub max_attempts: usize,
    pub max_candidates: usize,
    pub total_budget_ms: u64,
    pub cluster_threshold: f64,
    pub attach_threshold: f64,
    pub min_word_count: usize,
    pub banned_host_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub flash_model: String,
    pub flash_lite_model: String,
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub google_cse_api_key: String,
    pub google_cse_cx: String,
    pub news_api_key: String,
    pub event_registry_api_key: String,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub mode: PersistenceMode,
    pub outputs_dir: String,
    pub normalized_dir: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub retrieval: RetrievalConfig,
    pub gemini: GeminiConfig,
    pub providers: ProviderKeys,
    pub persistence: PersistenceConfig,
    pub recency_hours_default: u32,
    pub log_level: String,
    pub metrics_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables. Every knob has a
    /// default; only provider/LLM keys may legitimately be empty (the
    /// matching connectors are then disabled).
    pub fn from_env() -> Self {
        let raw_data_root = env::var("RAW_DATA_ROOT").unwrap_or_else(|_| "data".to_string());
        let mode = match env::var("PERSISTENCE_MODE").as_deref() {
            Ok("none") => PersistenceMode::None,
            _ => PersistenceMode::Fs,
        };

        Self {
            server: ServerConfig {
                port: env_parsed("PORT", 8787),
                heartbeat_interval_ms: env_parsed("HEARTBEAT_INTERVAL_MS", 15_000),
            },
            retrieval: RetrievalConfig {
                global_concurrency: env_parsed("RETRIEVAL_GLOBAL_CONCURRENCY", 6usize).max(1),
                per_host_concurrency: env_parsed("RETRIEVAL_PER_HOST_CONCURRENCY", 2usize).max(1),
                min_accepted: env_parsed("RETRIEVAL_MIN_ACCEPTED", 8),
                max_attempts: env_parsed("RETRIEVAL_MAX_ATTEMPTS", 40),
                max_candidates: env_parsed("RETRIEVAL_MAX_CANDIDATES", 60),
                total_budget_ms: env_parsed("RETRIEVAL_TOTAL_BUDGET_MS", 180_000),
                cluster_threshold: env_parsed("RETRIEVAL_CLUSTER_THRESHOLD", 0.35),
                attach_threshold: env_parsed("RETRIEVAL_ATTACH_THRESHOLD", 0.2),
                min_word_count: env_parsed("RETRIEVAL_MIN_WORD_COUNT", 150),
                banned_host_patterns: env::var("RETRIEVAL_BANNED_HOSTS")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            gemini: GeminiConfig {
                api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
                model: env::var("GEMINI_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-pro".to_string()),
                flash_model: env::var("GEMINI_FLASH_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
                flash_lite_model: env::var("GEMINI_FLASH_LITE_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash-lite".to_string()),
                requests_per_minute: clamp_rpm(env_parsed("GEMINI_RPM", 6u32)),
            },
            providers: ProviderKeys {
                google_cse_api_key: env::var("GOOGLE_CSE_API_KEY").unwrap_or_default(),
                google_cse_cx: env::var("GOOGLE_CSE_CX").unwrap_or_default(),
                news_api_key: env::var("NEWS_API_KEY").unwrap_or_default(),
                event_registry_api_key: env::var("EVENT_REGISTRY_API_KEY").unwrap_or_default(),
            },
            persistence: PersistenceConfig {
                mode,
                outputs_dir: format!("{raw_data_root}/outputs"),
                normalized_dir: format!("{raw_data_root}/normalized"),
            },
            recency_hours_default: env_parsed("RECENCY_HOURS", RECENCY_DEFAULT_HOURS)
                .clamp(RECENCY_MIN_HOURS, RECENCY_MAX_HOURS),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            metrics_enabled: env_parsed("METRICS_ENABLED", true),
        }
    }

    /// The serverless-host profile: no persistence, strict subrequest budget.
    /// Topic analysis is skipped and targeted research is replaced with a
    /// deterministic cluster projection.
    pub fn is_serverless(&self) -> bool {
        self.persistence.mode == PersistenceMode::None
    }

    /// Log the presence of each secret without revealing its value.
    pub fn log_redacted(&self) {
        let vars = [
            ("GEMINI_API_KEY", &self.gemini.api_key),
            ("GOOGLE_CSE_API_KEY", &self.providers.google_cse_api_key),
            ("GOOGLE_CSE_CX", &self.providers.google_cse_cx),
            ("NEWS_API_KEY", &self.providers.news_api_key),
            (
                "EVENT_REGISTRY_API_KEY",
                &self.providers.event_registry_api_key,
            ),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
    }

    /// Public projection of the config for GET /api/config. No secrets.
    pub fn public_view(&self) -> serde_json::Value {
        json!({
            "recencyHoursDefault": self.recency_hours_default,
            "retrieval": {
                "globalConcurrency": self.retrieval.global_concurrency,
                "perHostConcurrency": self.retrieval.per_host_concurrency,
                "minAccepted": self.retrieval.min_accepted,
                "maxAttempts": self.retrieval.max_attempts,
                "maxCandidates": self.retrieval.max_candidates,
                "totalBudgetMs": self.retrieval.total_budget_ms,
            },
            "gemini": {
                "model": self.gemini.model,
                "flashModel": self.gemini.flash_model,
                "flashLiteModel": self.gemini.flash_lite_model,
                "requestsPerMinute": self.gemini.requests_per_minute,
            },
            "providers": {
                "googleCse": !self.providers.google_cse_api_key.is_empty()
                    && !self.providers.google_cse_cx.is_empty(),
                "newsApi": !self.providers.news_api_key.is_empty(),
                "eventRegistry": !self.providers.event_registry_api_key.is_empty(),
                "googleNews": true,
            },
            "persistence": {
                "mode": match self.persistence.mode {
                    PersistenceMode::Fs => "fs",
                    PersistenceMode::None => "none",
                },
            },
            "serverless": self.is_serverless(),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
