use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

// One prompt/answer cycle. Immutable once the session has loaded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub prompt: String,
    /// Accepted answers in preference order. The first one is spoken as feedback.
    pub answers: Vec<String>,
    #[serde(default)]
    pub media: Option<String>,
    /// Demonstration rounds play normally but never count toward the score.
    #[serde(default)]
    pub demo: bool,
}

impl Round {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, answers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            answers,
            media: None,
            demo: false,
        }
    }

    pub fn demo(mut self) -> Self {
        self.demo = true;
        self
    }

    pub fn is_scored(&self) -> bool {
        !self.demo
    }

    /// The answer announced when the round is revealed.
    pub fn canonical_answer(&self) -> &str {
        self.answers.first().map(String::as_str).unwrap_or_default()
    }
}

/// Supplies the ordered rounds for a session. Read once at session start.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoundSource: Send + Sync {
    async fn load_rounds(&self) -> Result<Vec<Round>>;
}
