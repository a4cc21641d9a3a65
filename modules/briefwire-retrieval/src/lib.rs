pub mod cluster;
pub mod extract;
pub mod fetch;
pub mod limits;
pub mod providers;
pub mod retriever;

pub use cluster::cluster_articles;
pub use extract::{evaluate_article, extract_and_filter, ExtractionOutcome};
pub use limits::{run_indexed, HostLimits};
pub use retriever::{retrieve_candidates, RetrievalKnobs, RetrievedBatch};
