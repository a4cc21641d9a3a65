use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lru::LruCache;
use rand::Rng;
use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ApiError, GeminiClient};
use crate::structured::{GenerateOptions, TextGenerator};
use crate::types::{GenerateContentRequest, GenerateContentResponse, GenerationConfig};

/// At most this many distinct API keys keep live rate-limit state.
const KEY_CACHE_CAPACITY: usize = 32;
/// Sliding request window shared by all callers of one key.
const WINDOW: Duration = Duration::from_secs(60);
/// HTTP attempts per gated call.
const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_CAP_MS: u64 = 60_000;

/// The caller's token was cancelled while waiting on the gate or the API.
#[derive(Debug, thiserror::Error)]
#[error("Operation aborted")]
pub struct Aborted;

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)quota|unavailable|overload|temporar").expect("valid transient regex")
});

/// Google RPC RetryInfo shows up in error bodies as `"retryDelay": "34s"`.
static RETRY_DELAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""retryDelay"\s*:\s*"(\d+(?:\.\d+)?)s""#).expect("valid retryDelay regex")
});

struct KeyState {
    client: GeminiClient,
    window: Mutex<VecDeque<Instant>>,
}

/// Sliding-window request budget per API key, plus transient-failure retries
/// around the actual LLM call. State is bounded: least-recently-used keys are
/// evicted once more than `KEY_CACHE_CAPACITY` keys have been seen.
pub struct LlmGate {
    keys: StdMutex<LruCache<String, Arc<KeyState>>>,
}

impl Default for LlmGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmGate {
    pub fn new() -> Self {
        Self {
            keys: StdMutex::new(LruCache::new(
                NonZeroUsize::new(KEY_CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
        }
    }

    fn state_for(&self, api_key: &str) -> Arc<KeyState> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = keys.get(api_key) {
            return state.clone();
        }
        let state = Arc::new(KeyState {
            client: GeminiClient::new(api_key),
            window: Mutex::new(VecDeque::new()),
        });
        keys.put(api_key.to_string(), state.clone());
        state
    }

    /// Atomic check-and-reserve on the key's sliding window. Either records
    /// `now` and returns, or sleeps until the oldest timestamp ages out and
    /// re-checks. The window lock is never held across the sleep.
    async fn acquire_slot(
        &self,
        state: &KeyState,
        rpm: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rpm = rpm.clamp(1, 10) as usize;
        loop {
            let wait = {
                let mut window = state.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= WINDOW)
                {
                    window.pop_front();
                }
                if window.len() < rpm {
                    window.push_back(now);
                    None
                } else {
                    // Oldest entry is the next to age out.
                    window
                        .front()
                        .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
                }
            };
            match wait {
                None => return Ok(()),
                Some(duration) => {
                    debug!(wait_ms = duration.as_millis() as u64, "LLM gate window full");
                    sleep_cancellable(duration, cancel).await?;
                }
            }
        }
    }

    /// Gated generateContent call: one window slot, then up to `MAX_ATTEMPTS`
    /// HTTP attempts with exponential backoff. Server retry hints override
    /// the computed backoff when parseable. Non-transient errors surface
    /// immediately.
    pub async fn generate(
        &self,
        api_key: &str,
        rpm: u32,
        model: &str,
        request: &GenerateContentRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateContentResponse> {
        let state = self.state_for(api_key);
        self.acquire_slot(&state, rpm, cancel).await?;

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(anyhow!(Aborted));
            }
            match state.client.generate(model, request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !is_transient(&err) {
                        return Err(err);
                    }
                    if attempt + 1 == MAX_ATTEMPTS {
                        return Err(err);
                    }
                    let backoff = retry_hint_ms(&err).unwrap_or_else(|| backoff_ms(attempt));
                    warn!(
                        model,
                        attempt = attempt + 1,
                        backoff_ms = backoff,
                        error = %err,
                        "Transient LLM error, retrying after backoff"
                    );
                    last_err = Some(err);
                    sleep_cancellable(Duration::from_millis(backoff), cancel).await?;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("LLM call failed with no attempts")))
    }
}

/// `min(60_000, 1000 * 2^attempt)` plus up to a second of jitter.
fn backoff_ms(attempt: u32) -> u64 {
    let base = 1000u64.saturating_mul(1u64 << attempt.min(16));
    base.min(BACKOFF_CAP_MS) + rand::rng().random_range(0..1000)
}

/// Transient iff HTTP 429/503 or the message smells like a quota/availability
/// problem.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(api) = err.downcast_ref::<ApiError>() {
        if api.status == 429 || api.status == 503 {
            return true;
        }
        return TRANSIENT_RE.is_match(&api.body);
    }
    TRANSIENT_RE.is_match(&err.to_string())
}

/// Server-provided retry hint: the `Retry-After` header, or a
/// `"retryDelay": "Ns"` fragment in the error body.
pub fn retry_hint_ms(err: &anyhow::Error) -> Option<u64> {
    let api = err.downcast_ref::<ApiError>()?;
    if let Some(ms) = api.retry_after_ms {
        return Some(ms);
    }
    let captures = RETRY_DELAY_RE.captures(&api.body)?;
    let seconds: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some((seconds * 1000.0) as u64)
}

pub(crate) async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(anyhow!(Aborted)),
    }
}

/// A gate + key pairing that the structured client can drive.
pub struct GateGenerator {
    gate: Arc<LlmGate>,
    api_key: String,
    rpm: u32,
}

impl GateGenerator {
    pub fn new(gate: Arc<LlmGate>, api_key: impl Into<String>, rpm: u32) -> Self {
        Self {
            gate,
            api_key: api_key.into(),
            rpm: rpm.clamp(1, 10),
        }
    }
}

#[async_trait]
impl TextGenerator for GateGenerator {
    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let config = GenerationConfig {
            response_mime_type: opts
                .response_json
                .then(|| "application/json".to_string()),
            temperature: opts.temperature,
            max_output_tokens: opts.max_output_tokens,
        };
        let request = GenerateContentRequest::user_prompt(prompt, Some(config));
        let response = self
            .gate
            .generate(&self.api_key, self.rpm, model, &request, cancel)
            .await?;
        Ok(response.text().unwrap_or_default())
    }
}
