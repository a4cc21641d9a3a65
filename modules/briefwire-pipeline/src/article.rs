//! Article synthesis: build the source catalog, drive the LLM through a
//! validate → repair → retry loop, and mechanically own everything the model
//! cannot be trusted with (citation ids, the Key developments section, the
//! sources list).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use briefwire_common::util::{content_token_set, word_count, PROMOTIONAL_PHRASES};
use briefwire_common::{
    ArticleResult, ArticleSource, Citation, EvidenceItem, OutlinePayload, SourceCatalogEntry,
    StoryCluster,
};
use gemini_client::{GenerateOptions, ParseOutcome};

use crate::prompts;
use crate::repair::{prompt_with_repairs, MAX_REPAIR_ATTEMPTS};
use crate::Llm;

const MIN_CITATIONS: usize = 8;
const WORD_COUNT_RANGE: (usize, usize) = (350, 900);
const MIN_PARAGRAPH_WORDS: usize = 8;

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("valid citation regex"));
static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("valid date regex"));
static KEY_DEV_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:#{1,6}[ \t]*)?\**[ \t]*key developments[^\n]*$")
        .expect("valid heading regex")
});
static KEY_DEV_BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- (\d{4}-\d{2}-\d{2}|Undated) - .+ - .+ \(https?://\S+\) \[\d+\]$")
        .expect("valid bullet regex")
});

pub struct SynthesisInput<'a> {
    pub topic: &'a str,
    pub outline: &'a OutlinePayload,
    pub clusters: &'a [StoryCluster],
    pub evidence: &'a [EvidenceItem],
    pub previous_article: &'a str,
    pub provided_catalog: Option<Vec<SourceCatalogEntry>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SynthesisTargets {
    pub narrative_date_target: usize,
    pub distinct_source_target: usize,
    pub key_dev_min: usize,
    pub key_dev_max: usize,
}

pub fn compute_targets(catalog_len: usize, available_dates: usize) -> SynthesisTargets {
    let key_dev_min = catalog_len.clamp(1, 5);
    SynthesisTargets {
        narrative_date_target: available_dates.min(3),
        distinct_source_target: catalog_len.clamp(1, 6),
        key_dev_min,
        key_dev_max: key_dev_min.max(catalog_len.min(7)),
    }
}

/// Authoritative citation-id → source mapping: evidence citations first, then
/// cluster members, first-seen order by URL, ids from 1 and never reused.
pub fn build_source_catalog(
    evidence: &[EvidenceItem],
    clusters: &[StoryCluster],
) -> Vec<SourceCatalogEntry> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut catalog: Vec<SourceCatalogEntry> = Vec::new();

    let mut push = |title: &str, url: &str, source: &str, published_at| {
        if url.is_empty() || !seen.insert(url.to_string()) {
            return;
        }
        catalog.push(SourceCatalogEntry {
            id: (catalog.len() + 1) as u32,
            title: title.to_string(),
            url: url.to_string(),
            source: source.to_string(),
            published_at,
        });
    };

    for item in evidence {
        for citation in &item.citations {
            push(
                &citation.title,
                &citation.url,
                &citation.source,
                citation.published_at,
            );
        }
    }
    for cluster in clusters {
        for member in &cluster.members {
            let source = member
                .source_name
                .clone()
                .unwrap_or_else(|| member.source_host.clone());
            push(
                &member.title,
                &member.canonical_url,
                &source,
                member.published_at,
            );
        }
    }

    catalog
}

/// Rewrite evidence digests so their citation numbers are catalog ids.
pub fn normalize_evidence(
    evidence: &[EvidenceItem],
    catalog: &[SourceCatalogEntry],
) -> Vec<EvidenceItem> {
    let by_url: HashMap<&str, u32> = catalog.iter().map(|e| (e.url.as_str(), e.id)).collect();

    evidence
        .iter()
        .map(|item| {
            let citations: Vec<Citation> = item
                .citations
                .iter()
                .filter_map(|c| {
                    by_url.get(c.url.as_str()).map(|&id| Citation {
                        id,
                        title: c.title.clone(),
                        url: c.url.clone(),
                        published_at: c.published_at,
                        source: c.source.clone(),
                    })
                })
                .collect();
            let digest = citations
                .iter()
                .map(|c| {
                    let date = c
                        .published_at
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "Undated".to_string());
                    format!("[{}] {date} - {}: {}.", c.id, c.source, c.title)
                })
                .collect::<Vec<_>>()
                .join("\n");
            EvidenceItem {
                outline_index: item.outline_index,
                point: item.point.clone(),
                digest,
                citations,
            }
        })
        .collect()
}

/// Distinct ISO dates available to the narrative, newest first.
fn available_dates(catalog: &[SourceCatalogEntry]) -> Vec<String> {
    let dates: BTreeSet<String> = catalog
        .iter()
        .filter_map(|e| e.published_at.map(|d| d.format("%Y-%m-%d").to_string()))
        .collect();
    dates.into_iter().rev().collect()
}

#[derive(Debug, Default, Deserialize)]
struct RawSource {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

struct Coerced {
    title: String,
    article: String,
    sources: Vec<ArticleSource>,
}

fn first_string(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty())
    })
}

fn sources_array(value: &serde_json::Value) -> Option<Vec<RawSource>> {
    const SOURCE_KEYS: [&str; 6] = [
        "sources",
        "citations",
        "references",
        "refs",
        "sourceList",
        "source_list",
    ];
    let roots = [
        Some(value),
        value.get("raw"),
        value.get("raw").and_then(|r| r.get("data")),
    ];
    for root in roots.into_iter().flatten() {
        for key in SOURCE_KEYS {
            if let Some(array) = root.get(key).and_then(|v| v.as_array()) {
                let parsed: Vec<RawSource> = array
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect();
                if !parsed.is_empty() {
                    return Some(parsed);
                }
            }
        }
    }
    None
}

/// Single shape-tolerance layer: pull title, body, and sources out of
/// whatever JSON the model produced.
fn coerce_payload(value: &serde_json::Value, catalog: &[SourceCatalogEntry]) -> Coerced {
    let title = first_string(value, &["title", "headline"]).unwrap_or_default();

    let article = first_string(value, &["article", "body", "content", "text", "markdown"])
        .or_else(|| {
            value.get("sections").and_then(|v| v.as_array()).map(|sections| {
                sections
                    .iter()
                    .filter_map(|s| first_string(s, &["text", "content", "body"]))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })
        })
        .unwrap_or_default();

    let mut sources: Vec<ArticleSource> = sources_array(value)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(i, raw)| {
            let url = raw.url?;
            if url.trim().is_empty() {
                return None;
            }
            Some(ArticleSource {
                id: raw.id.unwrap_or((i + 1) as u32),
                title: raw.title.unwrap_or_default(),
                url,
            })
        })
        .collect();

    if sources.is_empty() {
        // Derive from inline [n] markers against the catalog.
        let used: BTreeSet<u32> = CITATION_RE
            .captures_iter(&article)
            .filter_map(|c| c[1].parse().ok())
            .collect();
        sources = catalog
            .iter()
            .filter(|entry| used.contains(&entry.id))
            .map(|entry| ArticleSource {
                id: entry.id,
                title: entry.title.clone(),
                url: entry.url.clone(),
            })
            .collect();
    }
    if sources.is_empty() {
        sources = catalog
            .iter()
            .take(10)
            .map(|entry| ArticleSource {
                id: entry.id,
                title: entry.title.clone(),
                url: entry.url.clone(),
            })
            .collect();
    }

    Coerced {
        title,
        article,
        sources,
    }
}

/// Drop `[n]` markers that do not resolve to a catalog id. Returns the
/// cleaned text and whether anything was removed.
fn strip_unknown_citations(article: &str, catalog: &[SourceCatalogEntry]) -> (String, bool) {
    let known: HashSet<u32> = catalog.iter().map(|e| e.id).collect();
    let mut stripped_any = false;
    let cleaned = CITATION_RE.replace_all(article, |caps: &regex::Captures<'_>| {
        match caps[1].parse::<u32>() {
            Ok(id) if known.contains(&id) => caps[0].to_string(),
            _ => {
                stripped_any = true;
                String::new()
            }
        }
    });
    (cleaned.into_owned(), stripped_any)
}

/// The catalog, not the model, owns "Key developments": sort by published
/// date descending (undated last, stable), format bullets, and replace the
/// model's section wholesale.
fn rewrite_key_developments(
    article: &str,
    catalog: &[SourceCatalogEntry],
    key_dev_max: usize,
) -> String {
    let mut ranked: Vec<&SourceCatalogEntry> = catalog.iter().collect();
    ranked.sort_by(|a, b| match (b.published_at, a.published_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let bullets: Vec<String> = ranked
        .iter()
        .take(key_dev_max)
        .map(|entry| {
            let date = entry
                .published_at
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "Undated".to_string());
            format!(
                "- {date} - {} - {} ({}) [{}]",
                entry.source, entry.title, entry.url, entry.id
            )
        })
        .collect();

    match KEY_DEV_HEADING_RE.find(article) {
        Some(heading) => {
            let heading_line = heading.as_str().trim_end();
            format!(
                "{}{}\n\n{}",
                &article[..heading.start()],
                heading_line,
                bullets.join("\n")
            )
        }
        None => format!(
            "{}\n\n## Key developments\n\n{}",
            article.trim_end(),
            bullets.join("\n")
        ),
    }
}

struct Validation {
    errors: Vec<String>,
    warnings: Vec<String>,
    used_ids: BTreeSet<u32>,
}

fn validate_article_body(
    article: &str,
    catalog: &[SourceCatalogEntry],
    targets: &SynthesisTargets,
) -> Validation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let (narrative, key_dev) = match KEY_DEV_HEADING_RE.find(article) {
        Some(heading) => (&article[..heading.start()], Some(&article[heading.end()..])),
        None => (article, None),
    };

    // Citation demands are on the narrative; the Key developments bullets
    // carry ids mechanically and would inflate the count.
    let known: HashSet<u32> = catalog.iter().map(|e| e.id).collect();
    let all_citations: Vec<u32> = CITATION_RE
        .captures_iter(narrative)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    let used_ids: BTreeSet<u32> = all_citations
        .iter()
        .copied()
        .filter(|id| known.contains(id))
        .collect();

    if all_citations.len() < MIN_CITATIONS {
        errors.push(format!(
            "Article contains {} citations; expected at least {MIN_CITATIONS}",
            all_citations.len()
        ));
    }
    if used_ids.len() < targets.distinct_source_target {
        errors.push(format!(
            "Article cites {} distinct sources; expected at least {}",
            used_ids.len(),
            targets.distinct_source_target
        ));
    }

    let narrative_dates: HashSet<&str> = ISO_DATE_RE
        .find_iter(narrative)
        .map(|m| m.as_str())
        .collect();
    if narrative_dates.len() < targets.narrative_date_target {
        warnings.push(format!(
            "Narrative mentions {} dates; target is {}",
            narrative_dates.len(),
            targets.narrative_date_target
        ));
    }

    match key_dev {
        None => errors.push("Article is missing a Key developments section".to_string()),
        Some(section) => {
            let bullets: Vec<&str> = section
                .lines()
                .map(str::trim_end)
                .filter(|line| line.starts_with("- "))
                .collect();
            if bullets.len() < targets.key_dev_min || bullets.len() > targets.key_dev_max {
                errors.push(format!(
                    "Key developments has {} bullets; expected between {} and {}",
                    bullets.len(),
                    targets.key_dev_min,
                    targets.key_dev_max
                ));
            }
            for bullet in bullets {
                if !KEY_DEV_BULLET_RE.is_match(bullet) {
                    errors.push(format!("Malformed Key developments bullet: {bullet}"));
                }
            }
        }
    }

    // Paragraph citation coverage is advisory only.
    for paragraph in narrative.split("\n\n") {
        let trimmed = paragraph.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("- ") {
            continue;
        }
        if word_count(trimmed) >= MIN_PARAGRAPH_WORDS && !CITATION_RE.is_match(trimmed) {
            warnings.push(format!(
                "Paragraph without citation: {}…",
                trimmed.chars().take(60).collect::<String>()
            ));
        }
    }

    for phrase in PROMOTIONAL_PHRASES {
        if article.to_lowercase().contains(phrase) {
            errors.push(format!("Article contains promotional language: \"{phrase}\""));
        }
    }

    Validation {
        errors,
        warnings,
        used_ids,
    }
}

/// `1 − |prev ∩ curr| / |curr|` over case-folded alphanumeric tokens of
/// length > 3, rounded to 3 decimals. An empty previous article scores 1.
pub fn compute_novelty_score(previous: &str, current: &str) -> f64 {
    if previous.trim().is_empty() {
        return 1.0;
    }
    let current_tokens = content_token_set(current);
    if current_tokens.is_empty() {
        return 1.0;
    }
    let previous_tokens = content_token_set(previous);
    let overlap = current_tokens
        .iter()
        .filter(|t| previous_tokens.contains(*t))
        .count();
    let score = 1.0 - overlap as f64 / current_tokens.len() as f64;
    (score * 1000.0).round() / 1000.0
}

/// Sources list rebuilt from what the article actually cites, padded from the
/// coerced list where ids agree with the catalog.
fn repair_sources(
    coerced: &[ArticleSource],
    used_ids: &BTreeSet<u32>,
    catalog: &[SourceCatalogEntry],
) -> Vec<ArticleSource> {
    let by_id: HashMap<u32, &SourceCatalogEntry> = catalog.iter().map(|e| (e.id, e)).collect();
    let mut sources: Vec<ArticleSource> = used_ids
        .iter()
        .filter_map(|id| {
            by_id.get(id).map(|entry| ArticleSource {
                id: entry.id,
                title: entry.title.clone(),
                url: entry.url.clone(),
            })
        })
        .collect();
    if sources.is_empty() {
        sources = coerced
            .iter()
            .filter(|s| by_id.contains_key(&s.id))
            .cloned()
            .collect();
    }
    sources
}

/// Drive the synthesis stage end to end. Up to three attempts; fatal
/// validation errors append a repair instruction, warnings ride along in the
/// result.
pub async fn synthesize_article(
    llm: &Llm,
    input: &SynthesisInput<'_>,
    cancel: &CancellationToken,
) -> Result<ArticleResult> {
    let catalog = match &input.provided_catalog {
        Some(provided) if !provided.is_empty() => provided.clone(),
        _ => build_source_catalog(input.evidence, input.clusters),
    };
    if catalog.is_empty() {
        return Err(anyhow!("Cannot synthesize article: source catalog is empty"));
    }

    let evidence = normalize_evidence(input.evidence, &catalog);
    let dates = available_dates(&catalog);
    let targets = compute_targets(catalog.len(), dates.len());

    let digest_block = evidence
        .iter()
        .map(|e| format!("Point {}: {}\n{}", e.outline_index + 1, e.point, e.digest))
        .collect::<Vec<_>>()
        .join("\n\n");

    let base_prompt = prompts::synthesis(
        input.topic,
        &serde_json::to_string_pretty(input.outline)?,
        &digest_block,
        &serde_json::to_string_pretty(&catalog)?,
        &dates.join(", "),
        input.previous_article,
        targets.narrative_date_target,
        targets.distinct_source_target,
        targets.key_dev_min,
        targets.key_dev_max,
    );

    let opts = GenerateOptions {
        fallback_to_text: true,
        ..Default::default()
    };
    let mut prompt = base_prompt.clone();
    let mut last_errors: Vec<String> = Vec::new();

    for attempt in 1..=MAX_REPAIR_ATTEMPTS {
        let outcome: ParseOutcome<serde_json::Value> =
            llm.generate_and_parse(&prompt, &opts, cancel).await?;

        let (payload, raw_text) = match outcome {
            ParseOutcome::Parsed { value, raw } if value.is_object() => (value, raw),
            // Prose responses (or stray non-object JSON fragments) become the
            // article body directly.
            ParseOutcome::Parsed { raw, .. } | ParseOutcome::Fallback { raw } => {
                (serde_json::json!({ "article": raw.clone() }), raw)
            }
        };

        let coerced = coerce_payload(&payload, &catalog);
        let mut warnings: Vec<String> = Vec::new();

        let (cleaned, stripped) = strip_unknown_citations(&coerced.article, &catalog);
        if stripped {
            warnings.push("Removed citation markers that were not in the source catalog".into());
        }

        let article_text = rewrite_key_developments(&cleaned, &catalog, targets.key_dev_max);

        let validation = validate_article_body(&article_text, &catalog, &targets);
        warnings.extend(validation.warnings.iter().cloned());

        if !validation.errors.is_empty() {
            warn!(
                attempt,
                errors = validation.errors.len(),
                "Article validation failed"
            );
            last_errors = validation.errors;
            prompt = prompt_with_repairs(&base_prompt, &last_errors);
            continue;
        }

        let words = word_count(&article_text);
        if words < WORD_COUNT_RANGE.0 || words > WORD_COUNT_RANGE.1 {
            warnings.push(format!(
                "Article word count {words} outside [{}, {}]",
                WORD_COUNT_RANGE.0, WORD_COUNT_RANGE.1
            ));
        }

        let sources = repair_sources(&coerced.sources, &validation.used_ids, &catalog);
        let title = if coerced.title.trim().is_empty() {
            format!("Weekly briefing: {}", input.topic)
        } else {
            coerced.title
        };

        return Ok(ArticleResult {
            title,
            article: article_text,
            sources,
            word_count: words,
            raw_response: raw_text,
            attempts: attempt,
            novelty_score: compute_novelty_score(input.previous_article, &cleaned),
            source_catalog: catalog,
            warnings,
        });
    }

    Err(anyhow!(
        "Article validation failed after {MAX_REPAIR_ATTEMPTS} attempts: {}",
        last_errors.join("; ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::tests::{cluster, scripted_llm};
    use briefwire_common::OutlinePoint;
    use chrono::{TimeZone, Utc};

    fn catalog(n: usize) -> Vec<SourceCatalogEntry> {
        (0..n)
            .map(|i| SourceCatalogEntry {
                id: (i + 1) as u32,
                title: format!("Source title {}", i + 1),
                url: format!("https://src{}.example/story", i + 1),
                source: format!("Source {}", i + 1),
                published_at: Some(
                    Utc.with_ymd_and_hms(2026, 7, (i % 27 + 1) as u32, 9, 0, 0).unwrap(),
                ),
            })
            .collect()
    }

    fn evidence_item(index: usize, ids: &[u32]) -> EvidenceItem {
        EvidenceItem {
            outline_index: index,
            point: format!("point {index}"),
            digest: String::new(),
            citations: ids
                .iter()
                .map(|id| Citation {
                    id: *id,
                    title: format!("Source title {id}"),
                    url: format!("https://src{id}.example/story"),
                    published_at: Some(Utc.with_ymd_and_hms(2026, 7, 20, 9, 0, 0).unwrap()),
                    source: format!("Source {id}"),
                })
                .collect(),
        }
    }

    fn outline_fixture() -> OutlinePayload {
        OutlinePayload {
            thesis: "A thesis that is long enough.".into(),
            outline: vec![OutlinePoint {
                point: "the point".into(),
                summary: "the summary".into(),
                supports: vec!["cl0".into()],
                dates: vec!["2026-07-20".into()],
            }],
            coverage: None,
        }
    }

    /// A body with `count` citations cycling through the first `distinct`
    /// catalog ids, long enough to clear the word-count floor.
    fn cited_body(count: usize, distinct: usize) -> String {
        let mut paragraphs = Vec::new();
        for i in 0..count {
            let id = (i % distinct) + 1;
            paragraphs.push(format!(
                "On 2026-07-{:02} regulators moved again and coverage expanded with fresh details about enforcement, funding, and deployment timelines across several markets [{id}].",
                (i % 27) + 1
            ));
        }
        paragraphs.join("\n\n")
    }

    #[test]
    fn catalog_assigns_first_seen_ids() {
        let evidence = vec![evidence_item(0, &[1, 2]), evidence_item(1, &[2, 3])];
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let catalog = build_source_catalog(&evidence, &clusters);

        let urls: Vec<&str> = catalog.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://src1.example/story",
                "https://src2.example/story",
                "https://src3.example/story",
                "https://news.example/cl0",
            ]
        );
        let ids: Vec<u32> = catalog.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn targets_scale_with_catalog() {
        let t = compute_targets(1, 0);
        assert_eq!(t.distinct_source_target, 1);
        assert_eq!(t.key_dev_min, 1);
        assert_eq!(t.key_dev_max, 1);
        assert_eq!(t.narrative_date_target, 0);

        let t = compute_targets(10, 8);
        assert_eq!(t.distinct_source_target, 6);
        assert_eq!(t.key_dev_min, 5);
        assert_eq!(t.key_dev_max, 7);
        assert_eq!(t.narrative_date_target, 3);
    }

    #[test]
    fn coercion_prefers_field_order() {
        let catalog = catalog(3);
        let value = serde_json::json!({
            "headline": "H",
            "body": "The body text",
            "raw": {"data": {"source_list": [
                {"id": 1, "title": "t", "url": "https://src1.example/story"},
                {"title": "no url"}
            ]}}
        });
        let coerced = coerce_payload(&value, &catalog);
        assert_eq!(coerced.title, "H");
        assert_eq!(coerced.article, "The body text");
        assert_eq!(coerced.sources.len(), 1);
    }

    #[test]
    fn coercion_concatenates_sections() {
        let value = serde_json::json!({
            "title": "T",
            "sections": [{"text": "one"}, {"content": "two"}, {"body": "three"}]
        });
        let coerced = coerce_payload(&value, &catalog(2));
        assert_eq!(coerced.article, "one\n\ntwo\n\nthree");
    }

    #[test]
    fn coercion_derives_sources_from_inline_citations() {
        let value = serde_json::json!({
            "article": "Something happened [2] and then more [3]."
        });
        let coerced = coerce_payload(&value, &catalog(5));
        let ids: Vec<u32> = coerced.sources.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn key_developments_is_rewritten_from_catalog() {
        let catalog = catalog(6);
        let article = "Intro paragraph.\n\n## Key developments\n\n- model-invented bullet (https://bogus.example) [99]";
        let rewritten = rewrite_key_developments(article, &catalog, 7);
        assert!(!rewritten.contains("bogus.example"));
        let bullet_count = rewritten.lines().filter(|l| l.starts_with("- ")).count();
        assert_eq!(bullet_count, 6);
        for line in rewritten.lines().filter(|l| l.starts_with("- ")) {
            assert!(KEY_DEV_BULLET_RE.is_match(line), "bad bullet: {line}");
            // Every bullet URL comes from the catalog.
            assert!(catalog.iter().any(|e| line.contains(&e.url)));
        }
    }

    #[test]
    fn key_developments_appended_when_missing() {
        let rewritten = rewrite_key_developments("Just a narrative.", &catalog(2), 7);
        assert!(rewritten.contains("## Key developments"));
        assert!(rewritten.lines().any(|l| l.starts_with("- ")));
    }

    #[test]
    fn bold_colonized_heading_is_recognized() {
        let article = format!(
            "{}\n\n**Key developments (past 14 days):**\n\n- old bullet",
            cited_body(8, 6)
        );
        let rewritten = rewrite_key_developments(&article, &catalog(6), 7);
        assert!(rewritten.contains("**Key developments (past 14 days):**"));
        let validation = validate_article_body(&rewritten, &catalog(6), &compute_targets(6, 5));
        assert!(
            validation.errors.is_empty(),
            "errors: {:?}",
            validation.errors
        );
    }

    #[test]
    fn too_few_citations_is_fatal() {
        let catalog = catalog(8);
        let body = rewrite_key_developments(&cited_body(4, 4), &catalog, 7);
        let validation = validate_article_body(&body, &catalog, &compute_targets(8, 5));
        assert!(validation
            .errors
            .iter()
            .any(|e| e == "Article contains 4 citations; expected at least 8"));
    }

    #[test]
    fn undated_catalog_entries_sort_last_in_key_developments() {
        let mut catalog = catalog(3);
        catalog[0].published_at = None;
        let rewritten = rewrite_key_developments("Body.", &catalog, 7);
        let bullets: Vec<&str> = rewritten
            .lines()
            .filter(|l| l.starts_with("- "))
            .collect();
        assert!(bullets.last().unwrap().starts_with("- Undated"));
    }

    #[test]
    fn novelty_score_properties() {
        assert_eq!(compute_novelty_score("", "anything at all here"), 1.0);
        assert_eq!(
            compute_novelty_score("identical words everywhere", "identical words everywhere"),
            0.0
        );
        let partial = compute_novelty_score(
            "shared vocabulary appears here",
            "shared vocabulary plus entirely novel material today",
        );
        assert!(partial > 0.0 && partial < 1.0);
        // Deterministic.
        assert_eq!(
            compute_novelty_score("alpha beta gamma words", "gamma words delta epsilon"),
            compute_novelty_score("alpha beta gamma words", "gamma words delta epsilon"),
        );
    }

    fn synthesis_response(citations: usize, distinct: usize) -> String {
        serde_json::json!({
            "title": "The week in review",
            "article": cited_body(citations, distinct),
            "sources": []
        })
        .to_string()
    }

    #[tokio::test]
    async fn happy_path_first_attempt() {
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let evidence = vec![evidence_item(0, &[1, 2, 3, 4, 5, 6])];
        let outline = outline_fixture();
        let response = synthesis_response(10, 6);
        let llm = scripted_llm(vec![&response]);

        let result = synthesize_article(
            &llm,
            &SynthesisInput {
                topic: "ai regulation",
                outline: &outline,
                clusters: &clusters,
                evidence: &evidence,
                previous_article: "",
                provided_catalog: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.novelty_score, 1.0);
        assert!(result.article.contains("Key developments"));
        // Sources reflect the ids actually cited.
        assert!(!result.sources.is_empty());
        let catalog_ids: HashSet<u32> = result.source_catalog.iter().map(|e| e.id).collect();
        assert!(result.sources.iter().all(|s| catalog_ids.contains(&s.id)));
    }

    #[tokio::test]
    async fn validation_failure_then_repair_succeeds() {
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let evidence = vec![evidence_item(0, &[1, 2, 3, 4, 5, 6])];
        let outline = outline_fixture();
        let first = synthesis_response(4, 4);
        let second = synthesis_response(10, 6);
        let llm = scripted_llm(vec![&first, &second]);

        let result = synthesize_article(
            &llm,
            &SynthesisInput {
                topic: "ai regulation",
                outline: &outline,
                clusters: &clusters,
                evidence: &evidence,
                previous_article: "",
                provided_catalog: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn third_failure_raises() {
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let evidence = vec![evidence_item(0, &[1, 2, 3, 4, 5, 6])];
        let outline = outline_fixture();
        let bad = synthesis_response(2, 2);
        let llm = scripted_llm(vec![&bad, &bad, &bad]);

        let err = synthesize_article(
            &llm,
            &SynthesisInput {
                topic: "t",
                outline: &outline,
                clusters: &clusters,
                evidence: &evidence,
                previous_article: "",
                provided_catalog: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn unknown_citations_are_stripped_and_warned() {
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let evidence = vec![evidence_item(0, &[1, 2, 3, 4, 5, 6])];
        let outline = outline_fixture();
        let body = format!("{} Bad marker here [99].", cited_body(10, 6));
        let response = serde_json::json!({
            "title": "T", "article": body, "sources": []
        })
        .to_string();
        let llm = scripted_llm(vec![&response]);

        let result = synthesize_article(
            &llm,
            &SynthesisInput {
                topic: "t",
                outline: &outline,
                clusters: &clusters,
                evidence: &evidence,
                previous_article: "",
                provided_catalog: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!result.article.contains("[99]"));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("not in the source catalog")));
    }

    #[tokio::test]
    async fn text_fallback_becomes_article_payload() {
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let evidence = vec![evidence_item(0, &[1, 2, 3, 4, 5, 6])];
        let outline = outline_fixture();
        // Prose (not JSON) with enough citations to validate.
        let prose = cited_body(10, 6);
        let llm = scripted_llm(vec![&prose]);

        let result = synthesize_article(
            &llm,
            &SynthesisInput {
                topic: "fallback topic",
                outline: &outline,
                clusters: &clusters,
                evidence: &evidence,
                previous_article: "",
                provided_catalog: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.title, "Weekly briefing: fallback topic");
        assert!(result.article.contains("Key developments"));
    }

    #[tokio::test]
    async fn word_count_drift_warns_but_passes() {
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let evidence = vec![evidence_item(0, &[1, 2, 3, 4, 5, 6])];
        let outline = outline_fixture();
        // Dense short paragraphs: > 8 citations but < 350 words.
        let body = (0..9)
            .map(|i| format!("Short cited line number {i} [{}].", (i % 6) + 1))
            .collect::<Vec<_>>()
            .join("\n\n");
        let response = serde_json::json!({"title": "T", "article": body, "sources": []}).to_string();
        let llm = scripted_llm(vec![&response]);

        let result = synthesize_article(
            &llm,
            &SynthesisInput {
                topic: "t",
                outline: &outline,
                clusters: &clusters,
                evidence: &evidence,
                previous_article: "",
                provided_catalog: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("word count")));
    }

    #[tokio::test]
    async fn previous_article_lowers_novelty() {
        let clusters = vec![cluster("cl0", "Cluster story", 5)];
        let evidence = vec![evidence_item(0, &[1, 2, 3, 4, 5, 6])];
        let outline = outline_fixture();
        let body = cited_body(10, 6);
        let response = serde_json::json!({"title": "T", "article": body, "sources": []}).to_string();
        let llm = scripted_llm(vec![&response]);

        let result = synthesize_article(
            &llm,
            &SynthesisInput {
                topic: "t",
                outline: &outline,
                clusters: &clusters,
                evidence: &evidence,
                previous_article: &body,
                provided_catalog: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(result.novelty_score < 0.5);
    }
}
