//! Per-request overrides: clients may supply their own API keys and rate
//! budget through request headers, overriding server defaults for that
//! request only.

use axum::http::HeaderMap;

use briefwire_common::config::{clamp_rpm, Config, ProviderKeys};

#[derive(Debug, Default, Clone)]
pub struct HeaderOverrides {
    pub gemini_api_key: Option<String>,
    pub gemini_rpm: Option<u32>,
    pub google_cse_api_key: Option<String>,
    pub google_cse_cx: Option<String>,
    pub news_api_key: Option<String>,
    pub event_registry_api_key: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub fn parse_overrides(headers: &HeaderMap) -> HeaderOverrides {
    HeaderOverrides {
        gemini_api_key: header_string(headers, "x-gemini-api-key"),
        gemini_rpm: header_string(headers, "x-gemini-rpm")
            .and_then(|v| v.parse::<u32>().ok())
            .map(clamp_rpm),
        google_cse_api_key: header_string(headers, "x-google-cse-api-key"),
        google_cse_cx: header_string(headers, "x-google-cse-cx"),
        news_api_key: header_string(headers, "x-newsapi-key"),
        event_registry_api_key: header_string(headers, "x-eventregistry-api-key"),
    }
}

/// Provider keys with per-request overrides applied.
pub fn effective_provider_keys(config: &Config, overrides: &HeaderOverrides) -> ProviderKeys {
    ProviderKeys {
        google_cse_api_key: overrides
            .google_cse_api_key
            .clone()
            .unwrap_or_else(|| config.providers.google_cse_api_key.clone()),
        google_cse_cx: overrides
            .google_cse_cx
            .clone()
            .unwrap_or_else(|| config.providers.google_cse_cx.clone()),
        news_api_key: overrides
            .news_api_key
            .clone()
            .unwrap_or_else(|| config.providers.news_api_key.clone()),
        event_registry_api_key: overrides
            .event_registry_api_key
            .clone()
            .unwrap_or_else(|| config.providers.event_registry_api_key.clone()),
    }
}

/// Gemini key + rpm with per-request overrides applied; rpm is clamped to
/// [1, 10] regardless of where it came from.
pub fn effective_gemini(config: &Config, overrides: &HeaderOverrides) -> (String, u32) {
    let api_key = overrides
        .gemini_api_key
        .clone()
        .unwrap_or_else(|| config.gemini.api_key.clone());
    let rpm = clamp_rpm(
        overrides
            .gemini_rpm
            .unwrap_or(config.gemini.requests_per_minute),
    );
    (api_key, rpm)
}
