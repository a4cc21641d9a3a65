//! Per-run artifact persistence. Mode `fs` writes JSON files under
//! `outputs/<run_id>/`; mode `none` silently drops everything (the
//! serverless-host profile). Persistence failures are logged and never fail
//! a run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use briefwire_common::config::{PersistenceConfig, PersistenceMode};
use briefwire_common::{BriefError, NormalizedArticle};

pub enum ArtifactStore {
    Fs {
        outputs_dir: PathBuf,
        normalized_dir: PathBuf,
    },
    None,
}

/// Artifact kinds are fixed names; anything else would be a path-traversal
/// hazard on the read endpoints.
const KNOWN_KINDS: &[&str] = &[
    "retrieval_batch",
    "retrieval_clusters",
    "outline",
    "targeted_research",
    "source_catalog",
    "article",
    "image_prompt",
];

fn safe_component(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ArtifactStore {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        match config.mode {
            PersistenceMode::Fs => ArtifactStore::Fs {
                outputs_dir: PathBuf::from(&config.outputs_dir),
                normalized_dir: PathBuf::from(&config.normalized_dir),
            },
            PersistenceMode::None => ArtifactStore::None,
        }
    }

    /// Best-effort save: failures are logged, not surfaced.
    pub async fn save<T: Serialize>(&self, run_id: &str, kind: &str, value: &T) {
        if let Err(err) = self.try_save(run_id, kind, value).await {
            warn!(run_id, kind, error = %err, "Failed to persist artifact");
        }
    }

    async fn try_save<T: Serialize>(&self, run_id: &str, kind: &str, value: &T) -> Result<()> {
        let ArtifactStore::Fs { outputs_dir, .. } = self else {
            return Ok(());
        };
        if !safe_component(run_id) || !KNOWN_KINDS.contains(&kind) {
            return Err(BriefError::Persistence(format!(
                "refusing artifact path for run={run_id} kind={kind}"
            ))
            .into());
        }
        let dir = outputs_dir.join(run_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create run output dir")?;
        let path = dir.join(format!("{kind}.json"));
        let json = serde_json::to_vec_pretty(value).context("Failed to serialize artifact")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub async fn save_normalized(&self, article: &NormalizedArticle) {
        let ArtifactStore::Fs { normalized_dir, .. } = self else {
            return;
        };
        if !safe_component(&article.id) {
            warn!(article_id = %article.id, "Refusing unsafe normalized-article id");
            return;
        }
        let result: Result<()> = async {
            tokio::fs::create_dir_all(normalized_dir)
                .await
                .context("Failed to create normalized dir")?;
            let path = normalized_dir.join(format!("{}.json", article.id));
            let json = serde_json::to_vec_pretty(article)?;
            tokio::fs::write(&path, json).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(article_id = %article.id, error = %err, "Failed to persist normalized article");
        }
    }

    pub async fn load(&self, run_id: &str, kind: &str) -> Result<serde_json::Value> {
        let ArtifactStore::Fs { outputs_dir, .. } = self else {
            return Err(BriefError::Persistence("persistence is disabled".into()).into());
        };
        if !safe_component(run_id) || !KNOWN_KINDS.contains(&kind) {
            return Err(BriefError::Validation(format!("unknown artifact kind: {kind}")).into());
        }
        let path = outputs_dir.join(run_id).join(format!("{kind}.json"));
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Artifact not found: {run_id}/{kind}"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn load_normalized(&self, article_id: &str) -> Result<serde_json::Value> {
        let ArtifactStore::Fs { normalized_dir, .. } = self else {
            return Err(BriefError::Persistence("persistence is disabled".into()).into());
        };
        if !safe_component(article_id) {
            return Err(BriefError::Validation("invalid article id".into()).into());
        }
        let path = normalized_dir.join(format!("{article_id}.json"));
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Normalized article not found: {article_id}"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
