/// Errors that end a session before its first round.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to load rounds: {0:#}")]
    RoundSource(anyhow::Error),
    #[error("the round source returned no rounds")]
    NoRounds,
}
