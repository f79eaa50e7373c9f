//! Session Configuration Module
//!
//! Timings and thresholds that shape a quiz session. The fuzzy-match
//! thresholds and the grace length are tuned values, so they live here as
//! plain fields instead of being baked into the algorithms that read them.

use crate::collaborators::VoiceParams;
use crate::matcher::MatchThresholds;
use std::time::Duration;

// --- Defaults ---

pub const DEFAULT_ROUND_SECONDS: u64 = 12;
pub const DEFAULT_GRACE_SECONDS: u64 = 3;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Ceiling on a single `speak` call so a sink that never reports an end cannot stall a round.
pub const PLAYBACK_HARD_TIMEOUT: Duration = Duration::from_secs(15);
pub const WATCHDOG_THRESHOLD: Duration = Duration::from_secs(30);
pub const WATCHDOG_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub round_duration: Duration,
    pub grace_duration: Duration,
    pub max_attempts: u32,
    pub thresholds: MatchThresholds,
    /// Pause before feedback speech so effects and speech do not overlap.
    pub feedback_lead_in: Duration,
    pub beam_duration: Duration,
    pub explosion_duration: Duration,
    /// How long the `wrong` and `timeout` phases stay on screen.
    pub verdict_display: Duration,
    pub reveal_hold: Duration,
    pub intermission: Duration,
    pub playback_timeout: Duration,
    pub recognizer_restart_delay: Duration,
    pub watchdog_poll: Duration,
    pub watchdog_threshold: Duration,
    pub voice: VoiceParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            round_duration: Duration::from_secs(DEFAULT_ROUND_SECONDS),
            grace_duration: Duration::from_secs(DEFAULT_GRACE_SECONDS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            thresholds: MatchThresholds::default(),
            feedback_lead_in: Duration::from_millis(400),
            beam_duration: Duration::from_millis(700),
            explosion_duration: Duration::from_millis(900),
            verdict_display: Duration::from_millis(800),
            reveal_hold: Duration::from_millis(1200),
            intermission: Duration::from_millis(2500),
            playback_timeout: PLAYBACK_HARD_TIMEOUT,
            recognizer_restart_delay: Duration::from_millis(250),
            watchdog_poll: WATCHDOG_POLL,
            watchdog_threshold: WATCHDOG_THRESHOLD,
            voice: VoiceParams::default(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    pub fn with_round_duration(mut self, duration: Duration) -> Self {
        self.config.round_duration = duration;
        self
    }

    pub fn with_grace_duration(mut self, duration: Duration) -> Self {
        self.config.grace_duration = duration;
        self
    }

    /// Values below one are raised to one; a round always accepts at least one guess.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_thresholds(mut self, thresholds: MatchThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn with_voice(mut self, voice: VoiceParams) -> Self {
        self.config.voice = voice;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
