pub mod capture;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod playback;
pub mod round;
pub mod scope;
pub mod session;
pub mod session_state;
pub mod timer;
pub mod watchdog;

mod sync;
#[cfg(test)]
mod test_support;

use std::time::Duration;

/// Represents notifications the core (`QuizSession`) issues to the host runtime.
///
/// This enum is the primary API for decoupling the session's decision-making
/// from the host's handling of results (persisting scores, showing recovery UI).
/// The core itself performs no persistence.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A round reached intermission. `correct` is false for timeouts, skips and
    /// exhausted attempts.
    RoundComplete { round_id: String, correct: bool },
    /// Every round has been played. Emitted exactly once per session.
    SessionComplete { correct_count: u32, total_scored: u32 },
    /// The watchdog saw no activity for longer than its threshold.
    SessionStuck { idle_for: Duration },
}

pub use config::SessionConfig;
pub use round::{Round, RoundSource};
pub use session::{Collaborators, QuizSession, SessionHandle, SessionSummary};
pub use session_state::{Phase, SessionState};
