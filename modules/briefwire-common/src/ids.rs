use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

/// A short URL-safe random identifier for runs.
pub fn run_id() -> String {
    random_id(10)
}

/// Cluster ids are shorter; they only need to be unique within one run.
pub fn cluster_id() -> String {
    random_id(8)
}

fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Stable candidate id: first 16 hex chars of sha256 over the canonical URL.
pub fn candidate_id(canonical_url: &str) -> String {
    let digest = Sha256::digest(canonical_url.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Canonicalize a URL for dedup: lowercase, strip fragment and query.
pub fn canonical_url(raw: &str) -> String {
    match url::Url::parse(raw.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.set_query(None);
            parsed.to_string().to_lowercase()
        }
        Err(_) => {
            let trimmed = raw.trim();
            let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
            let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
            without_query.to_lowercase()
        }
    }
}

/// The lowercased hostname of a URL, or an empty string when unparseable.
pub fn host_of(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_default()
}
