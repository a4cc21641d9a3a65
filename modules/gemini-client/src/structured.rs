use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::extract::parse_tolerant;
use crate::gate::{is_transient, Aborted};

/// One prompt-to-text call against a named model. The production impl is
/// `GateGenerator`; tests substitute scripted fakes.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

#[async_trait]
impl TextGenerator for Box<dyn TextGenerator> {
    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        (**self).generate_text(model, prompt, opts, cancel).await
    }
}

#[async_trait]
impl TextGenerator for std::sync::Arc<dyn TextGenerator> {
    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        (**self).generate_text(model, prompt, opts, cancel).await
    }
}

/// Fallback order for generation: primary model first, then the flash tiers.
#[derive(Debug, Clone)]
pub struct ModelChain {
    pub primary: String,
    pub flash: String,
    pub flash_lite: String,
}

impl ModelChain {
    fn at(&self, attempt: usize) -> &str {
        match attempt {
            0 => &self.primary,
            1 => &self.flash,
            _ => &self.flash_lite,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub response_json: bool,
    /// When JSON parsing fails, hand the raw text back to the caller instead
    /// of erroring.
    pub fallback_to_text: bool,
}

/// Outcome of a structured generation: either a parsed value, or the raw text
/// when the caller opted into a text fallback.
#[derive(Debug)]
pub enum ParseOutcome<T> {
    Parsed { value: T, raw: String },
    Fallback { raw: String },
}

impl<T> ParseOutcome<T> {
    pub fn raw(&self) -> &str {
        match self {
            ParseOutcome::Parsed { raw, .. } => raw,
            ParseOutcome::Fallback { raw } => raw,
        }
    }
}

const MAX_ATTEMPTS: usize = 3;

/// Structured LLM client: retry across a model chain, then tolerant parsing.
pub struct StructuredClient<G> {
    generator: G,
    chain: ModelChain,
}

impl<G: TextGenerator> StructuredClient<G> {
    pub fn new(generator: G, chain: ModelChain) -> Self {
        Self { generator, chain }
    }

    /// Up to three attempts, dropping to the next model in the chain after
    /// each failed one. An empty response body is a transient failure. Aborts
    /// and non-transient errors on the final attempt surface immediately.
    pub async fn generate_with_retry(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let model = self.chain.at(attempt);
            match self
                .generator
                .generate_text(model, prompt, opts, cancel)
                .await
            {
                Ok(text) if text.trim().is_empty() => {
                    warn!(model, attempt = attempt + 1, "Empty response from LLM");
                    last_err = Some(anyhow!("Empty response from LLM"));
                }
                Ok(text) => return Ok(text),
                Err(err) => {
                    if err.downcast_ref::<Aborted>().is_some() {
                        return Err(err);
                    }
                    let final_attempt = attempt + 1 == MAX_ATTEMPTS;
                    if !is_transient(&err) && final_attempt {
                        return Err(err);
                    }
                    warn!(
                        model,
                        attempt = attempt + 1,
                        error = %err,
                        "LLM attempt failed, falling back to next model"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("LLM generation failed")))
    }

    /// Generate with `responseMimeType: application/json`, then parse through
    /// the tolerant extractor. On a parse failure with `fallback_to_text`
    /// set, the raw text is returned for the caller's own fallback handling.
    pub async fn generate_and_parse<T: DeserializeOwned>(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<ParseOutcome<T>> {
        let json_opts = GenerateOptions {
            response_json: true,
            ..opts.clone()
        };
        let raw = self.generate_with_retry(prompt, &json_opts, cancel).await?;

        match parse_tolerant(&raw).and_then(|v| {
            serde_json::from_value::<T>(v).map_err(|e| anyhow!("JSON shape mismatch: {e}"))
        }) {
            Ok(value) => Ok(ParseOutcome::Parsed { value, raw }),
            Err(err) if opts.fallback_to_text => {
                warn!(error = %err, "Structured parse failed, returning raw text");
                Ok(ParseOutcome::Fallback { raw })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn chain() -> ModelChain {
        ModelChain {
            primary: "pro".into(),
            flash: "flash".into(),
            flash_lite: "lite".into(),
        }
    }

    /// Scripted generator: pops one canned result per call and records the
    /// model each call used.
    struct Scripted {
        responses: Mutex<Vec<Result<String>>>,
        models: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                models: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate_text(
            &self,
            model: &str,
            _prompt: &str,
            _opts: &GenerateOptions,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.models.lock().unwrap().push(model.to_string());
            self.responses.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn first_success_wins() {
        let client = StructuredClient::new(Scripted::new(vec![Ok("hello".into())]), chain());
        let text = client
            .generate_with_retry("p", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn empty_response_falls_to_next_model() {
        let scripted = Scripted::new(vec![Ok("".into()), Ok("recovered".into())]);
        let client = StructuredClient::new(scripted, chain());
        let text = client
            .generate_with_retry("p", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "recovered");
        assert_eq!(
            *client.generator.models.lock().unwrap(),
            vec!["pro".to_string(), "flash".to_string()]
        );
    }

    #[tokio::test]
    async fn chain_exhaustion_reports_last_error() {
        let scripted = Scripted::new(vec![
            Err(anyhow!("quota exceeded")),
            Err(anyhow!("quota exceeded")),
            Err(anyhow!("quota exceeded")),
        ]);
        let client = StructuredClient::new(scripted, chain());
        let err = client
            .generate_with_retry("p", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota"));
        assert_eq!(client.generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abort_surfaces_immediately() {
        let scripted = Scripted::new(vec![Err(anyhow!(Aborted))]);
        let client = StructuredClient::new(scripted, chain());
        let err = client
            .generate_with_retry("p", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Aborted>().is_some());
        assert_eq!(client.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parse_success_returns_value_and_raw() {
        #[derive(serde::Deserialize)]
        struct Payload {
            thesis: String,
        }
        let scripted = Scripted::new(vec![Ok("```json\n{\"thesis\": \"t\"}\n```".into())]);
        let client = StructuredClient::new(scripted, chain());
        let outcome: ParseOutcome<Payload> = client
            .generate_and_parse("p", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ParseOutcome::Parsed { value, raw } => {
                assert_eq!(value.thesis, "t");
                assert!(raw.contains("thesis"));
            }
            ParseOutcome::Fallback { .. } => panic!("expected parsed outcome"),
        }
    }

    #[tokio::test]
    async fn parse_failure_with_fallback_returns_raw_text() {
        #[derive(serde::Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            thesis: String,
        }
        let scripted = Scripted::new(vec![Ok("Just prose, no JSON here.".into())]);
        let client = StructuredClient::new(scripted, chain());
        let opts = GenerateOptions {
            fallback_to_text: true,
            ..Default::default()
        };
        let outcome: ParseOutcome<Payload> = client
            .generate_and_parse("p", &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ParseOutcome::Fallback { .. }));
    }

    #[tokio::test]
    async fn parse_failure_without_fallback_errors() {
        #[derive(serde::Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            thesis: String,
        }
        let scripted = Scripted::new(vec![Ok("no json".into())]);
        let client = StructuredClient::new(scripted, chain());
        let result: Result<ParseOutcome<Payload>> = client
            .generate_and_parse("p", &GenerateOptions::default(), &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }
}
