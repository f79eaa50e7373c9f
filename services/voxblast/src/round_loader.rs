use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use voxblast_core::{Round, RoundSource};

/// Either a bare array of rounds or an object with a `rounds` field.
#[derive(Deserialize)]
#[serde(untagged)]
enum RoundFile {
    Bare(Vec<Round>),
    Wrapped { rounds: Vec<Round> },
}

pub fn load_rounds(path: &Path) -> Result<Vec<Round>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read rounds file: {}", path.display()))?;
    let rounds = match serde_json::from_str::<RoundFile>(&content)
        .with_context(|| format!("Failed to parse rounds file: {}", path.display()))?
    {
        RoundFile::Bare(rounds) | RoundFile::Wrapped { rounds } => rounds,
    };

    let mut seen = HashSet::new();
    for round in &rounds {
        if !seen.insert(round.id.as_str()) {
            bail!("Duplicate round id {:?} in {}", round.id, path.display());
        }
        // The first answer is the one spoken back as feedback.
        if round.canonical_answer().trim().is_empty() {
            bail!("Round {:?} has no accepted answer to reveal", round.id);
        }
    }
    Ok(rounds)
}

/// Reads rounds from a JSON file each time the session asks for them.
pub struct FileRoundSource {
    path: PathBuf,
}

impl FileRoundSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RoundSource for FileRoundSource {
    async fn load_rounds(&self) -> Result<Vec<Round>> {
        let path = self.path.clone();
        let rounds = tokio::task::spawn_blocking(move || load_rounds(&path))
            .await
            .context("Round loader task failed")??;
        tracing::info!("Loaded {} rounds from {}", rounds.len(), self.path.display());
        Ok(rounds)
    }
}
