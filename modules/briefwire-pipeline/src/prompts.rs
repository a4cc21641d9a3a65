//! Prompt builders. Plain templates; everything dynamic is interpolated by
//! the calling stage.

/// Ask for provider-specific query phrasings for a raw topic.
pub fn topic_analysis(topic: &str) -> String {
    format!(
        r#"You are tuning news-search queries. For the topic below, produce one query string per search backend. Keep each query under 12 words, drop filler words, keep named entities.

Topic: {topic}

Respond with JSON only:
{{
  "googleCse": "...",
  "newsApi": "...",
  "eventRegistry": "...",
  "googleNews": "..."
}}"#
    )
}

/// Outline generation over a cluster listing. Clusters are referred to by
/// short aliases (C01, C02, ...) to keep the prompt compact.
pub fn outline(
    topic: &str,
    cluster_listing: &str,
    points: usize,
    distinct_clusters: usize,
) -> String {
    format!(
        r#"You are drafting the outline of a weekly intelligence briefing.

Topic: {topic}

Story clusters from this week's coverage:
{cluster_listing}

Write a thesis (one sentence, at least 12 characters) and exactly {points} outline points. Every point must cite at least one cluster alias in its "supports" array, and the outline overall must cover at least {distinct_clusters} distinct clusters. Dates must be ISO formatted (YYYY-MM-DD) and drawn from the cluster listing.

Respond with JSON only:
{{
  "thesis": "...",
  "outline": [
    {{"point": "...", "summary": "...", "supports": ["C01"], "dates": ["2026-07-28"]}}
  ]
}}"#
    )
}

/// Expand one outline point into sharper sub-queries.
pub fn query_expansion(topic: &str, point: &str, summary: &str) -> String {
    format!(
        r#"Turn this briefing outline point into up to 2 focused news-search queries. Prefer concrete entities and events over abstractions.

Topic: {topic}
Point: {point}
Summary: {summary}

Respond with JSON only: {{"queries": ["...", "..."]}}"#
    )
}

#[allow(clippy::too_many_arguments)]
pub fn synthesis(
    topic: &str,
    outline_json: &str,
    evidence_digest: &str,
    source_catalog_json: &str,
    available_dates: &str,
    previous_article: &str,
    narrative_date_target: usize,
    distinct_source_target: usize,
    key_dev_min: usize,
    key_dev_max: usize,
) -> String {
    let previous_block = if previous_article.trim().is_empty() {
        String::new()
    } else {
        format!("\nLast week's article, for continuity (do not repeat it):\n{previous_article}\n")
    };
    format!(
        r#"Write this week's intelligence briefing article.

Topic: {topic}

Outline:
{outline_json}

Evidence digests:
{evidence_digest}

Source catalog (cite ONLY these ids, as [n]):
{source_catalog_json}

Dates available in the evidence: {available_dates}
{previous_block}
Requirements:
- Cite sources inline as [n] using catalog ids; at least 8 citations across the article and at least {distinct_source_target} distinct ids.
- Weave at least {narrative_date_target} dates into the narrative.
- End with a "Key developments" section of {key_dev_min} to {key_dev_max} bullets (it will be checked against the catalog).
- 350 to 900 words. No promotional language.

Respond with JSON only:
{{
  "title": "...",
  "article": "... full Markdown body ...",
  "sources": [{{"id": 1, "title": "...", "url": "..."}}]
}}"#
    )
}

pub fn image_prompt(article: &str) -> String {
    format!(
        r#"Create visual direction for this briefing article. Either 1-5 slide descriptors or a single free-form brief.

Article:
{article}

Respond with JSON only, one of:
{{"slides": [{{"headline": "...", "visual": "...", "mood": "..."}}]}}
{{"brief": "..."}}"#
    )
}
