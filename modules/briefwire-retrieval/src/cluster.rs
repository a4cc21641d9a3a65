//! Story clustering over accepted articles: Jaccard similarity on title +
//! excerpt tokens, greedy merge/attach, freshness- and diversity-weighted
//! representatives.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use briefwire_common::config::RetrievalConfig;
use briefwire_common::ids::cluster_id;
use briefwire_common::util::content_token_set;
use briefwire_common::{ClusterCitation, NormalizedArticle, StoryCluster};

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn signature(article: &NormalizedArticle) -> HashSet<String> {
    content_token_set(&format!("{} {}", article.title, article.excerpt))
}

/// Freshness in (0, 1]: halves roughly every day of age. Undated articles
/// get a low constant so they sort behind anything dated.
fn freshness(article: &NormalizedArticle) -> f64 {
    match article.published_at {
        Some(published) => {
            let age_hours = (Utc::now() - published).num_minutes().max(0) as f64 / 60.0;
            1.0 / (1.0 + age_hours / 24.0)
        }
        None => 0.05,
    }
}

/// Per-article ranking score: freshness plus a bonus for hosts that appear
/// rarely in the accepted set.
fn article_score(article: &NormalizedArticle, host_counts: &HashMap<&str, usize>) -> f64 {
    let diversity = 1.0
        / (*host_counts
            .get(article.source_host.as_str())
            .unwrap_or(&1)) as f64;
    freshness(article) + 0.5 * diversity
}

struct DraftCluster {
    signature: HashSet<String>,
    core: Vec<usize>,
    attached: Vec<usize>,
}

/// Group accepted articles into ranked story clusters. Cluster ids are short
/// random strings, stable for the duration of the run.
pub fn cluster_articles(
    articles: &[NormalizedArticle],
    config: &RetrievalConfig,
) -> Vec<StoryCluster> {
    let mut host_counts: HashMap<&str, usize> = HashMap::new();
    for article in articles {
        *host_counts.entry(article.source_host.as_str()).or_default() += 1;
    }

    let signatures: Vec<HashSet<String>> = articles.iter().map(signature).collect();
    let mut drafts: Vec<DraftCluster> = Vec::new();

    for (idx, sig) in signatures.iter().enumerate() {
        let best = drafts
            .iter_mut()
            .map(|draft| (jaccard(sig, &draft.signature), draft))
            .max_by(|(a, _), (b, _)| a.total_cmp(b));

        match best {
            Some((similarity, draft)) if similarity >= config.cluster_threshold => {
                // Core membership extends the cluster signature.
                draft.signature.extend(sig.iter().cloned());
                draft.core.push(idx);
            }
            Some((similarity, draft)) if similarity >= config.attach_threshold => {
                draft.attached.push(idx);
            }
            _ => drafts.push(DraftCluster {
                signature: sig.clone(),
                core: vec![idx],
                attached: Vec::new(),
            }),
        }
    }

    let mut clusters: Vec<StoryCluster> = drafts
        .into_iter()
        .map(|draft| {
            let member_indices: Vec<usize> =
                draft.core.iter().chain(draft.attached.iter()).copied().collect();
            let members: Vec<NormalizedArticle> = member_indices
                .iter()
                .map(|&i| articles[i].clone())
                .collect();

            let representative = members
                .iter()
                .max_by(|a, b| {
                    article_score(a, &host_counts).total_cmp(&article_score(b, &host_counts))
                })
                .cloned()
                .unwrap_or_else(|| members[0].clone());

            let citations = members
                .iter()
                .map(|m| ClusterCitation {
                    title: m.title.clone(),
                    url: m.canonical_url.clone(),
                    published_at: m.published_at,
                })
                .collect();

            let freshness_sum: f64 = members.iter().map(freshness).sum();
            let score = members.len() as f64 + freshness_sum;

            StoryCluster {
                cluster_id: cluster_id(),
                representative,
                members,
                citations,
                score,
            }
        })
        .collect();

    clusters.sort_by(|a, b| b.score.total_cmp(&a.score));
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use briefwire_common::{Provenance, Provider};
    use chrono::Duration as ChronoDuration;

    fn config() -> RetrievalConfig {
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
            banned_host_patterns: Vec::new(),
        }
    }

    fn article(id: &str, title: &str, excerpt: &str, host: &str, age_hours: i64) -> NormalizedArticle {
        NormalizedArticle {
            id: id.into(),
            title: title.into(),
            canonical_url: format!("https://{host}/{id}"),
            source_host: host.into(),
            source_name: Some(host.into()),
            published_at: Some(Utc::now() - ChronoDuration::hours(age_hours)),
            excerpt: excerpt.into(),
            body: excerpt.into(),
            word_count: 500,
            provenance: Provenance {
                provider: Provider::NewsApi,
                fetched_at: Utc::now(),
            },
        }
    }

    #[test]
    fn same_story_clusters_together() {
        let articles = vec![
            article(
                "a1",
                "Parliament passes sweeping artificial intelligence act",
                "Lawmakers approved the landmark artificial intelligence regulation after months of negotiation",
                "one.example",
                2,
            ),
            article(
                "a2",
                "Sweeping artificial intelligence act passes parliament vote",
                "The landmark artificial intelligence regulation was approved by lawmakers after negotiation",
                "two.example",
                4,
            ),
            article(
                "b1",
                "Chipmaker unveils record quarterly earnings report",
                "Record quarterly earnings driven by datacenter demand surprised analysts this week",
                "three.example",
                1,
            ),
        ];

        let clusters = cluster_articles(&articles, &config());
        assert_eq!(clusters.len(), 2);
        let big = clusters.iter().find(|c| c.members.len() == 2).unwrap();
        assert!(big.members.iter().any(|m| m.id == "a1"));
        assert!(big.members.iter().any(|m| m.id == "a2"));
    }

    #[test]
    fn representative_is_a_member() {
        let articles = vec![
            article("a1", "Story alpha develops quickly", "Story alpha develops quickly across regions", "one.example", 10),
            article("a2", "Story alpha develops quickly today", "Story alpha develops quickly across many regions", "two.example", 1),
        ];
        let clusters = cluster_articles(&articles, &config());
        for cluster in &clusters {
            assert!(cluster
                .members
                .iter()
                .any(|m| m.id == cluster.representative.id));
        }
    }

    #[test]
    fn fresher_article_wins_representative() {
        let articles = vec![
            article("old", "Budget standoff negotiations continue", "Budget standoff negotiations continue between parties", "one.example", 96),
            article("new", "Budget standoff negotiations continue further", "Budget standoff negotiations continue between both parties", "two.example", 1),
        ];
        let clusters = cluster_articles(&articles, &config());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].representative.id, "new");
    }

    #[test]
    fn score_is_monotone_in_size() {
        let mut articles = vec![
            article("s1", "Solo unrelated gardening feature", "Completely different gardening topic about heirloom tomato growing", "one.example", 2),
        ];
        for i in 0..3 {
            articles.push(article(
                &format!("m{i}"),
                "Major merger announcement shakes markets",
                "Major merger announcement shakes markets as both companies confirm terms",
                &format!("host{i}.example"),
                2,
            ));
        }
        let clusters = cluster_articles(&articles, &config());
        assert_eq!(clusters.len(), 2);
        assert!(clusters[0].members.len() > clusters[1].members.len());
        assert!(clusters[0].score > clusters[1].score);
    }

    #[test]
    fn cluster_ids_are_unique() {
        let articles = vec![
            article("a", "Topic one entirely separate subject", "Topic one entirely separate subject matter here", "one.example", 2),
            article("b", "Topic two wholly different material", "Topic two wholly different material covered there", "two.example", 2),
        ];
        let clusters = cluster_articles(&articles, &config());
        let ids: HashSet<_> = clusters.iter().map(|c| c.cluster_id.clone()).collect();
        assert_eq!(ids.len(), clusters.len());
    }

    #[test]
    fn empty_input_yields_no_clusters() {
        assert!(cluster_articles(&[], &config()).is_empty());
    }
}
