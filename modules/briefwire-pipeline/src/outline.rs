//! Outline generation: the model sees an aliased cluster listing, and its
//! response is normalized (aliases, dates, point count, coverage) before
//! validation. Validation failures feed a repair instruction into the next
//! attempt.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use briefwire_common::util::truncate_to_char_boundary;
use briefwire_common::{OutlinePayload, OutlinePoint, StoryCluster};
use gemini_client::{GenerateOptions, ParseOutcome};

use crate::prompts;
use crate::repair::{prompt_with_repairs, MAX_REPAIR_ATTEMPTS};
use crate::Llm;

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex"));
static ISO_DATE_FIND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("valid date-find regex"));

const MIN_THESIS_CHARS: usize = 12;

#[derive(Debug)]
pub struct OutlineOutcome {
    pub payload: OutlinePayload,
    pub raw_response: String,
    pub attempts: u32,
}

/// `P = max(1, min(5, N))`.
pub fn required_points(cluster_count: usize) -> usize {
    cluster_count.clamp(1, 5)
}

/// `K = max(1, min(4, N))`.
pub fn required_distinct_clusters(cluster_count: usize) -> usize {
    cluster_count.clamp(1, 4)
}

/// What the model actually returns, before normalization.
#[derive(Debug, Default, Deserialize)]
struct RawOutline {
    #[serde(default)]
    thesis: String,
    #[serde(default)]
    outline: Vec<RawPoint>,
    #[serde(default)]
    coverage: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPoint {
    #[serde(default)]
    point: String,
    #[serde(default)]
    summary: String,
    #[serde(default, deserialize_with = "string_or_vec")]
    supports: Vec<String>,
    #[serde(default, deserialize_with = "string_or_vec")]
    dates: Vec<String>,
}

/// Models drift between `"supports": "C01"` and `"supports": ["C01"]`.
fn string_or_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::String(s) => vec![s],
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        other => vec![other.to_string()],
    })
}

struct ClusterIndex {
    alias_to_id: HashMap<String, String>,
    ids: HashSet<String>,
    /// Cluster ids ordered by score, best first.
    ranked_ids: Vec<String>,
}

/// Listing shown to the model plus the alias/id lookup used afterwards.
fn build_listing(clusters: &[StoryCluster]) -> (String, ClusterIndex) {
    let mut ranked: Vec<&StoryCluster> = clusters.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut alias_to_id = HashMap::new();
    let mut lines = Vec::new();
    for (i, cluster) in ranked.iter().enumerate() {
        let alias = format!("C{:02}", i + 1);
        let date = cluster
            .representative
            .published_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "undated".to_string());
        let source = cluster
            .representative
            .source_name
            .clone()
            .unwrap_or_else(|| cluster.representative.source_host.clone());
        lines.push(format!(
            "{alias} | {date} | {source} | {} | {}",
            cluster.representative.title,
            truncate_to_char_boundary(&cluster.representative.excerpt, 200),
        ));
        alias_to_id.insert(alias, cluster.cluster_id.clone());
    }

    let index = ClusterIndex {
        alias_to_id,
        ids: clusters.iter().map(|c| c.cluster_id.clone()).collect(),
        ranked_ids: ranked.iter().map(|c| c.cluster_id.clone()).collect(),
    };
    (lines.join("\n"), index)
}

fn cluster_by_id<'a>(clusters: &'a [StoryCluster], id: &str) -> Option<&'a StoryCluster> {
    clusters.iter().find(|c| c.cluster_id == id)
}

/// Normalize model drift before validation: alias resolution, date cleanup,
/// point-count trim/pad, and distinct-cluster coverage.
fn normalize_outline(
    raw: RawOutline,
    clusters: &[StoryCluster],
    index: &ClusterIndex,
    points_target: usize,
    distinct_target: usize,
) -> OutlinePayload {
    let mut outline: Vec<OutlinePoint> = raw
        .outline
        .into_iter()
        .map(|point| {
            // 1. Aliases become cluster ids; unknown tokens are dropped.
            let mut seen_supports = HashSet::new();
            let supports: Vec<String> = point
                .supports
                .iter()
                .filter_map(|token| {
                    let token = token.trim();
                    index
                        .alias_to_id
                        .get(&token.to_uppercase())
                        .cloned()
                        .or_else(|| index.ids.contains(token).then(|| token.to_string()))
                })
                .filter(|id| seen_supports.insert(id.clone()))
                .collect();

            // 2. Dates: strip time components, keep only ISO matches.
            let mut seen_dates = HashSet::new();
            let mut dates: Vec<String> = point
                .dates
                .iter()
                .filter_map(|raw_date| {
                    ISO_DATE_FIND_RE
                        .find(raw_date)
                        .map(|m| m.as_str().to_string())
                })
                .filter(|date| seen_dates.insert(date.clone()))
                .collect();

            // A dated supporting cluster lends its date to a dateless point.
            if dates.is_empty() {
                if let Some(id) = supports.first() {
                    if let Some(date) = cluster_by_id(clusters, id)
                        .and_then(|c| c.representative.published_at)
                    {
                        dates.push(date.format("%Y-%m-%d").to_string());
                    }
                }
            }

            OutlinePoint {
                point: point.point.trim().to_string(),
                summary: point.summary.trim().to_string(),
                supports,
                dates,
            }
        })
        .collect();

    // 3. Trim or pad to the required point count.
    outline.truncate(points_target);
    if outline.len() < points_target {
        let used: HashSet<&String> = outline.iter().flat_map(|p| p.supports.iter()).collect();
        let unused: Vec<String> = index
            .ranked_ids
            .iter()
            .filter(|id| !used.contains(*id))
            .cloned()
            .collect();
        for id in unused {
            if outline.len() >= points_target {
                break;
            }
            if let Some(cluster) = cluster_by_id(clusters, &id) {
                let dates = cluster
                    .representative
                    .published_at
                    .map(|d| vec![d.format("%Y-%m-%d").to_string()])
                    .unwrap_or_default();
                outline.push(OutlinePoint {
                    point: cluster.representative.title.clone(),
                    summary: cluster.representative.excerpt.clone(),
                    supports: vec![id],
                    dates,
                });
            }
        }
    }

    // 4. Round-robin unused clusters into points until coverage reaches K.
    let mut covered: HashSet<String> = outline
        .iter()
        .flat_map(|p| p.supports.iter().cloned())
        .collect();
    if covered.len() < distinct_target && !outline.is_empty() {
        let unused: Vec<String> = index
            .ranked_ids
            .iter()
            .filter(|id| !covered.contains(*id))
            .cloned()
            .collect();
        for (i, id) in unused.into_iter().enumerate() {
            if covered.len() >= distinct_target {
                break;
            }
            let slot = i % outline.len();
            outline[slot].supports.push(id.clone());
            covered.insert(id);
        }
    }

    OutlinePayload {
        thesis: raw.thesis.trim().to_string(),
        outline,
        coverage: raw.coverage,
    }
}

/// Validation over the normalized payload. Returns human-readable rule
/// violations; an empty list means the outline is accepted.
fn validate_outline(
    payload: &OutlinePayload,
    index: &ClusterIndex,
    points_target: usize,
    distinct_target: usize,
) -> Vec<String> {
    let mut errors = Vec::new();

    if payload.thesis.len() < MIN_THESIS_CHARS {
        errors.push(format!(
            "Thesis must be at least {MIN_THESIS_CHARS} characters"
        ));
    }
    if payload.outline.len() != points_target {
        errors.push(format!(
            "Outline must contain exactly {points_target} points; got {}",
            payload.outline.len()
        ));
    }

    for (i, point) in payload.outline.iter().enumerate() {
        if point.supports.is_empty() {
            errors.push(format!("Point {} must cite at least one cluster", i + 1));
        }
        for id in &point.supports {
            if !index.ids.contains(id) {
                errors.push(format!("Point {} cites unknown cluster '{id}'", i + 1));
            }
        }
        for date in &point.dates {
            if !ISO_DATE_RE.is_match(date) {
                errors.push(format!("Point {} has malformed date '{date}'", i + 1));
            }
        }
    }

    let covered: HashSet<&String> = payload
        .outline
        .iter()
        .flat_map(|p| p.supports.iter())
        .collect();
    if covered.len() < distinct_target {
        errors.push(format!(
            "Outline must cover at least {distinct_target} distinct clusters; got {}",
            covered.len()
        ));
    }

    errors
}

/// Drive the outline stage: up to three attempts, appending a numbered
/// repair instruction after each failed validation.
pub async fn generate_outline(
    llm: &Llm,
    topic: &str,
    clusters: &[StoryCluster],
    cancel: &CancellationToken,
) -> Result<OutlineOutcome> {
    if clusters.is_empty() {
        bail!("Cannot generate outline: no clusters provided");
    }

    let points_target = required_points(clusters.len());
    let distinct_target = required_distinct_clusters(clusters.len());
    let (listing, index) = build_listing(clusters);
    let base_prompt = prompts::outline(topic, &listing, points_target, distinct_target);

    let opts = GenerateOptions {
        fallback_to_text: true,
        ..Default::default()
    };
    let mut prompt = base_prompt.clone();
    let mut last_errors: Vec<String> = Vec::new();

    for attempt in 1..=MAX_REPAIR_ATTEMPTS {
        let outcome: ParseOutcome<RawOutline> =
            llm.generate_and_parse(&prompt, &opts, cancel).await?;

        let (raw_outline, raw_text) = match outcome {
            ParseOutcome::Parsed { value, raw } => (value, raw),
            ParseOutcome::Fallback { raw } => {
                warn!(attempt, "Outline response was not parseable JSON");
                last_errors = vec!["Response was not parseable JSON".to_string()];
                prompt = prompt_with_repairs(&base_prompt, &last_errors);
                let _ = raw;
                continue;
            }
        };

        let payload = normalize_outline(raw_outline, clusters, &index, points_target, distinct_target);
        let errors = validate_outline(&payload, &index, points_target, distinct_target);
        if errors.is_empty() {
            return Ok(OutlineOutcome {
                payload,
                raw_response: raw_text,
                attempts: attempt,
            });
        }

        warn!(attempt, errors = errors.len(), "Outline validation failed");
        last_errors = errors;
        prompt = prompt_with_repairs(&base_prompt, &last_errors);
    }

    Err(anyhow!(
        "Outline validation failed after {MAX_REPAIR_ATTEMPTS} attempts: {}",
        last_errors.join("; ")
    ))
}
