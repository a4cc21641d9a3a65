//! Extraction + filter stage: download each candidate under global and
//! per-host limits, normalize the text, and keep what passes the freshness,
//! quality, and relevance filters.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use briefwire_common::config::RetrievalConfig;
use briefwire_common::ids::{canonical_url, host_of};
use briefwire_common::util::{
    content_token_set, promotional_phrase_count, truncate_to_char_boundary, word_count,
};
use briefwire_common::{
    BriefError, Candidate, NormalizedArticle, Provenance, RetrievalMetrics,
};

use crate::fetch::PageFetcher;
use crate::limits::HostLimits;

const MIN_UNIQUE_WORDS: usize = 80;
const MIN_RELEVANCE: f64 = 0.1;
const MAX_PROMOTIONAL_PHRASES: usize = 2;
const MAX_QUERY_TOKENS: usize = 24;
const EXCERPT_MAX_CHARS: usize = 600;

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub accepted: Vec<NormalizedArticle>,
    pub metrics: RetrievalMetrics,
}

enum CandidateResult {
    Accepted(Box<NormalizedArticle>),
    Rejected(&'static str),
    Failed(String),
}

/// Query tokens used for the relevance overlap, capped to the first
/// `MAX_QUERY_TOKENS` distinct tokens.
pub fn tokenize_for_relevance(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(|t| t.to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_QUERY_TOKENS)
        .collect()
}

/// Accept/reject policy for one extracted article. Returns the rejection
/// reason, or `None` when the article is accepted.
pub fn evaluate_article(
    article: &NormalizedArticle,
    query: &str,
    recency_hours: u32,
    config: &RetrievalConfig,
) -> Option<&'static str> {
    match article.published_at {
        Some(published) => {
            let cutoff = Utc::now() - ChronoDuration::hours(recency_hours as i64);
            if published < cutoff {
                return Some("stale");
            }
        }
        None => {
            if !article.provenance.provider.allows_undated() {
                return Some("missing_published_at");
            }
        }
    }

    if article.word_count < config.min_word_count {
        return Some("too_short");
    }

    let article_tokens = content_token_set(&format!("{} {}", article.title, article.body));
    if article_tokens.len() < MIN_UNIQUE_WORDS {
        return Some("too_few_unique_words");
    }

    let query_tokens = tokenize_for_relevance(query);
    if !query_tokens.is_empty() {
        let overlap = query_tokens
            .iter()
            .filter(|t| article_tokens.contains(*t))
            .count();
        let relevance = overlap as f64 / query_tokens.len() as f64;
        if relevance < MIN_RELEVANCE {
            return Some("irrelevant");
        }
    }

    if config
        .banned_host_patterns
        .iter()
        .any(|pattern| article.source_host.contains(pattern))
    {
        return Some("banned_host");
    }

    if promotional_phrase_count(&article.body) > MAX_PROMOTIONAL_PHRASES {
        return Some("promotional");
    }

    None
}

fn normalize(candidate: &Candidate, body: String) -> NormalizedArticle {
    let canonical = canonical_url(&candidate.url);
    let trimmed = body.trim().to_string();
    let excerpt = truncate_to_char_boundary(&trimmed, EXCERPT_MAX_CHARS)
        .trim()
        .to_string();
    NormalizedArticle {
        id: candidate.id.clone(),
        title: candidate.title.clone(),
        source_host: host_of(&canonical),
        canonical_url: canonical,
        source_name: candidate.source_name.clone(),
        published_at: candidate.published_at,
        excerpt,
        word_count: word_count(&trimmed),
        body: trimmed,
        provenance: Provenance {
            provider: candidate.provider,
            fetched_at: Utc::now(),
        },
    }
}

/// Run the extraction stage over all candidates. Individual failures are
/// recorded in metrics and never fail the stage; output ordering is not
/// guaranteed.
pub async fn extract_and_filter(
    query: &str,
    recency_hours: u32,
    candidates: &[Candidate],
    fetcher: &dyn PageFetcher,
    limits: &HostLimits,
    config: &RetrievalConfig,
    cancel: &CancellationToken,
) -> Result<ExtractionOutcome> {
    let tasks = candidates.iter().map(|candidate| async move {
        let result = extract_one(candidate, query, recency_hours, fetcher, limits, config, cancel)
            .await;
        (candidate.provider, result)
    });

    let results = join_all(tasks).await;

    let mut accepted = Vec::new();
    let mut metrics = RetrievalMetrics::default();
    for (provider, result) in results {
        let entry = metrics.provider_mut(provider);
        match result {
            Ok(CandidateResult::Accepted(article)) => {
                entry.accepted += 1;
                accepted.push(*article);
            }
            Ok(CandidateResult::Rejected(reason)) => {
                *entry.rejected.entry(reason.to_string()).or_default() += 1;
            }
            Ok(CandidateResult::Failed(message)) => {
                entry.errors.push(message);
            }
            // Cancellation is the one error that stops the stage.
            Err(err) => return Err(err),
        }
    }

    Ok(ExtractionOutcome { accepted, metrics })
}

async fn extract_one(
    candidate: &Candidate,
    query: &str,
    recency_hours: u32,
    fetcher: &dyn PageFetcher,
    limits: &HostLimits,
    config: &RetrievalConfig,
    cancel: &CancellationToken,
) -> Result<CandidateResult> {
    let host = host_of(&candidate.url);
    let permits = limits.acquire(&host, cancel).await?;

    if cancel.is_cancelled() {
        return Err(BriefError::Aborted.into());
    }

    let fetched = fetcher.fetch_text(&candidate.url).await;
    drop(permits);

    let body = match fetched {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            debug!(url = %candidate.url, "Empty extraction result");
            return Ok(CandidateResult::Rejected("empty_content"));
        }
        Err(err) => {
            warn!(url = %candidate.url, error = %err, "Extraction failed");
            return Ok(CandidateResult::Failed(format!(
                "{}: {err:#}",
                candidate.url
            )));
        }
    };

    let article = normalize(candidate, body);
    match evaluate_article(&article, query, recency_hours, config) {
        None => Ok(CandidateResult::Accepted(Box::new(article))),
        Some(reason) => {
            debug!(url = %candidate.url, reason, "Article rejected");
            Ok(CandidateResult::Rejected(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use briefwire_common::ids::candidate_id;
    use briefwire_common::Provider;
    use std::collections::HashMap;

    fn test_config() -> RetrievalConfig {
        RetrievalConfig {
            global_concurrency: 4,
            per_host_concurrency: 2,
            min_accepted: 4,
            max_attempts: 10,
            max_candidates: 40,
            total_budget_ms: 60_000,
            cluster_threshold: 0.35,
            attach_threshold: 0.2,
            min_word_count: 150,
            banned_host_patterns: vec!["spam.example".into()],
        }
    }

    fn long_body(topic_word: &str) -> String {
        // 200 distinct sentence fragments so unique-word and length gates pass.
        (0..200)
            .map(|i| format!("{topic_word} policy detail number{i} shifting outcome{i}"))
            .collect::<Vec<_>>()
            .join(". ")
    }

    fn candidate(url: &str, provider: Provider, published: bool) -> Candidate {
        Candidate {
            id: candidate_id(url),
            provider,
            title: "Regulation update".into(),
            url: url.into(),
            source_name: Some("Example".into()),
            published_at: published.then(Utc::now),
            snippet: None,
            provider_data: None,
        }
    }

    fn article_from(candidate: &Candidate, body: &str) -> NormalizedArticle {
        normalize(candidate, body.to_string())
    }

    #[test]
    fn fresh_relevant_article_is_accepted() {
        let c = candidate("https://a.example/x", Provider::NewsApi, true);
        let article = article_from(&c, &long_body("regulation"));
        assert_eq!(
            evaluate_article(&article, "regulation news", 168, &test_config()),
            None
        );
    }

    #[test]
    fn missing_date_rejected_except_for_google() {
        let config = test_config();
        let dated = candidate("https://a.example/x", Provider::NewsApi, false);
        let article = article_from(&dated, &long_body("regulation"));
        assert_eq!(
            evaluate_article(&article, "regulation", 168, &config),
            Some("missing_published_at")
        );

        let google = candidate("https://b.example/y", Provider::GoogleCse, false);
        let article = article_from(&google, &long_body("regulation"));
        assert_eq!(evaluate_article(&article, "regulation", 168, &config), None);
    }

    #[test]
    fn stale_article_is_rejected() {
        let mut c = candidate("https://a.example/x", Provider::NewsApi, true);
        c.published_at = Some(Utc::now() - ChronoDuration::hours(200));
        let article = article_from(&c, &long_body("regulation"));
        assert_eq!(
            evaluate_article(&article, "regulation", 168, &test_config()),
            Some("stale")
        );
    }

    #[test]
    fn short_article_is_rejected() {
        let c = candidate("https://a.example/x", Provider::NewsApi, true);
        let article = article_from(&c, "too short to count");
        assert_eq!(
            evaluate_article(&article, "regulation", 168, &test_config()),
            Some("too_short")
        );
    }

    #[test]
    fn irrelevant_article_is_rejected() {
        let c = candidate("https://a.example/x", Provider::NewsApi, true);
        let article = article_from(&c, &long_body("gardening"));
        assert_eq!(
            evaluate_article(&article, "quantum computing breakthrough", 168, &test_config()),
            Some("irrelevant")
        );
    }

    #[test]
    fn banned_host_is_rejected() {
        let c = candidate("https://spam.example/x", Provider::NewsApi, true);
        let article = article_from(&c, &long_body("regulation"));
        assert_eq!(
            evaluate_article(&article, "regulation", 168, &test_config()),
            Some("banned_host")
        );
    }

    #[test]
    fn promotional_article_is_rejected() {
        let c = candidate("https://a.example/x", Provider::NewsApi, true);
        let body = format!(
            "{} subscribe now. buy now. click here.",
            long_body("regulation")
        );
        let article = article_from(&c, &body);
        assert_eq!(
            evaluate_article(&article, "regulation", 168, &test_config()),
            Some("promotional")
        );
    }

    #[test]
    fn relevance_tokens_are_capped_and_distinct() {
        let query = (0..40)
            .map(|i| format!("token{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let tokens = tokenize_for_relevance(&format!("{query} {query}"));
        assert_eq!(tokens.len(), MAX_QUERY_TOKENS);
    }

    #[test]
    fn excerpt_is_bounded() {
        let c = candidate("https://a.example/x", Provider::NewsApi, true);
        let article = article_from(&c, &long_body("regulation"));
        assert!(article.excerpt.len() <= EXCERPT_MAX_CHARS);
        assert!(article.word_count > 150);
    }

    struct FakeFetcher {
        pages: HashMap<String, Result<String, String>>,
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String> {
            match self.pages.get(url) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(message)) => Err(anyhow::anyhow!("{message}")),
                None => Ok(String::new()),
            }
        }
    }

    #[tokio::test]
    async fn stage_isolates_failures_and_counts_metrics() {
        let good = candidate("https://a.example/good", Provider::NewsApi, true);
        let broken = candidate("https://b.example/broken", Provider::NewsApi, true);
        let empty = candidate("https://c.example/empty", Provider::GoogleNews, true);

        let mut pages = HashMap::new();
        pages.insert(good.url.clone(), Ok(long_body("regulation")));
        pages.insert(broken.url.clone(), Err("connection reset".to_string()));
        pages.insert(empty.url.clone(), Ok(String::new()));

        let fetcher = FakeFetcher { pages };
        let limits = HostLimits::new(4, 2);
        let outcome = extract_and_filter(
            "regulation",
            168,
            &[good, broken, empty],
            &fetcher,
            &limits,
            &test_config(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.accepted.len(), 1);
        let news = &outcome.metrics.per_provider[&Provider::NewsApi];
        assert_eq!(news.accepted, 1);
        assert_eq!(news.errors.len(), 1);
        let gn = &outcome.metrics.per_provider[&Provider::GoogleNews];
        assert_eq!(gn.rejected["empty_content"], 1);
    }

    #[tokio::test]
    async fn cancelled_stage_aborts() {
        let c = candidate("https://a.example/x", Provider::NewsApi, true);
        let fetcher = FakeFetcher {
            pages: HashMap::new(),
        };
        let limits = HostLimits::new(2, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = extract_and_filter(
            "q",
            168,
            &[c],
            &fetcher,
            &limits,
            &test_config(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(BriefError::is_aborted(&err));
    }
}
