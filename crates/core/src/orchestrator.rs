//! Evaluation Orchestrator
//!
//! Decides, on any "round over" trigger, whether an evaluation may run, then
//! scores the buffered phrases and walks the outcome sequence. A timer lapse
//! and a user submission can be scheduled at the same moment; the
//! single-flight guard makes sure only one of them produces an outcome.

use crate::capture::CaptureCoordinator;
use crate::config::SessionConfig;
use crate::matcher::Matcher;
use crate::playback::{PlaybackSequencer, SpeechKind};
use crate::round::Round;
use crate::scope::{Cancelled, CancellationScope, ScopeChain};
use crate::session_state::{IntermissionSnapshot, SessionEvent, SessionMachine};
use crate::sync::lock;
use crate::timer::RoundTimer;
use crate::watchdog::ActivityClock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationTrigger {
    /// The user asked for their answer to be judged.
    Submitted,
    /// The round timer (and any grace extension) lapsed.
    TimerExpired,
    /// The host skipped the round.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    /// Wrong, but attempts remain; the round continues.
    Retry,
    Missed,
}

/// Sent once per round when it reaches intermission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub index: usize,
    pub round_id: String,
    pub correct: bool,
    pub scored: bool,
}

/// `evaluationInProgress`. Owned by the orchestrator and read by the capture
/// coordinator's restart policy. Set by [`SingleFlightGuard::try_acquire`]
/// before a pass does any asynchronous work; cleared when the returned
/// permit drops, which happens exactly once on every exit path.
#[derive(Debug, Clone, Default)]
pub struct SingleFlightGuard(Arc<AtomicBool>);

impl SingleFlightGuard {
    pub fn try_acquire(&self) -> Option<EvaluationPermit> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| EvaluationPermit(self.0.clone()))
    }

    pub fn in_progress(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct EvaluationPermit(Arc<AtomicBool>);

impl Drop for EvaluationPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Guesses submitted this round, bounded by a maximum.
#[derive(Debug, Clone, Copy)]
pub struct AttemptCounter {
    used: u32,
    max: u32,
}

impl AttemptCounter {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    /// Records a guess and returns how many remain.
    pub fn record(&mut self) -> u32 {
        self.used = (self.used + 1).min(self.max);
        self.remaining()
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.used
    }
}

#[derive(Debug, Default)]
pub struct Scoreboard {
    correct: AtomicU32,
    scored: AtomicU32,
}

impl Scoreboard {
    pub fn record_correct(&self) {
        self.correct.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_scored_round(&self) {
        self.scored.fetch_add(1, Ordering::SeqCst);
    }

    pub fn correct(&self) -> u32 {
        self.correct.load(Ordering::SeqCst)
    }

    pub fn scored(&self) -> u32 {
        self.scored.load(Ordering::SeqCst)
    }
}

struct ActiveRound {
    index: usize,
    round: Arc<Round>,
    attempts: AttemptCounter,
}

pub struct EvaluationOrchestrator {
    config: Arc<SessionConfig>,
    matcher: Matcher,
    machine: SessionMachine,
    playback: PlaybackSequencer,
    capture: CaptureCoordinator,
    timer: RoundTimer,
    scopes: Arc<ScopeChain>,
    guard: SingleFlightGuard,
    activity: ActivityClock,
    scoreboard: Arc<Scoreboard>,
    outcomes: mpsc::UnboundedSender<RoundOutcome>,
    cue: Option<Arc<[u8]>>,
    round: Mutex<Option<ActiveRound>>,
}

impl EvaluationOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<SessionConfig>,
        machine: SessionMachine,
        playback: PlaybackSequencer,
        capture: CaptureCoordinator,
        timer: RoundTimer,
        scopes: Arc<ScopeChain>,
        guard: SingleFlightGuard,
        activity: ActivityClock,
        scoreboard: Arc<Scoreboard>,
        outcomes: mpsc::UnboundedSender<RoundOutcome>,
        cue: Option<Arc<[u8]>>,
    ) -> Self {
        Self {
            matcher: Matcher::new(config.thresholds),
            config,
            machine,
            playback,
            capture,
            timer,
            scopes,
            guard,
            activity,
            scoreboard,
            outcomes,
            cue,
            round: Mutex::new(None),
        }
    }

    /// Makes `round` the target of subsequent evaluations and resets its attempts.
    pub fn begin_round(&self, index: usize, round: Arc<Round>) {
        *lock(&self.round) = Some(ActiveRound {
            index,
            round,
            attempts: AttemptCounter::new(self.config.max_attempts),
        });
    }

    pub fn guard(&self) -> &SingleFlightGuard {
        &self.guard
    }

    /// Runs one evaluation pass, or returns at once if another pass holds the
    /// guard. Never fails; a superseded round ends the pass silently.
    pub async fn evaluate(&self, trigger: EvaluationTrigger) {
        let Some(permit) = self.guard.try_acquire() else {
            tracing::debug!("evaluation already in flight, ignoring {:?}", trigger);
            return;
        };
        // Before any await, so a pending lapse cannot fire mid-evaluation.
        self.timer.cancel();
        self.activity.touch();

        let phase = self.machine.phase();
        if !phase.permits_listening() {
            tracing::debug!("{:?} in phase {:?}, nothing to evaluate", trigger, phase);
            return;
        }
        let Some(scope) = self.scopes.current() else {
            return;
        };
        let Some((index, round)) = self.current_round() else {
            return;
        };

        match self.run_pass(trigger, &scope, index, &round).await {
            Ok(verdict) => tracing::info!("round {} resolved as {:?}", round.id, verdict),
            Err(cancelled) => tracing::debug!("evaluation abandoned: {}", cancelled),
        }
        drop(permit);
    }

    fn current_round(&self) -> Option<(usize, Arc<Round>)> {
        lock(&self.round)
            .as_ref()
            .map(|active| (active.index, active.round.clone()))
    }

    fn record_attempt(&self) -> u32 {
        lock(&self.round)
            .as_mut()
            .map(|active| active.attempts.record())
            .unwrap_or(0)
    }

    // Resumption check after each step.
    fn step(&self, scope: &CancellationScope) -> Result<(), Cancelled> {
        self.activity.touch();
        scope.check()
    }

    async fn run_pass(
        &self,
        trigger: EvaluationTrigger,
        scope: &CancellationScope,
        index: usize,
        round: &Round,
    ) -> Result<Verdict, Cancelled> {
        let heard = self.capture.phrases();
        let correct = self.matcher.matches(&heard, &round.answers);
        tracing::info!(
            "evaluating round {} on {:?}: heard {:?}, correct: {}",
            round.id,
            trigger,
            heard,
            correct
        );
        self.step(scope)?;

        if correct {
            self.celebrate(scope, index, round).await?;
            return Ok(Verdict::Correct);
        }

        // Only guesses use up attempts; a lapse or a skip ends the round.
        if trigger == EvaluationTrigger::Submitted {
            let remaining = self.record_attempt();
            if remaining > 0 {
                self.retry(remaining).await?;
                return Ok(Verdict::Retry);
            }
        }

        self.reveal(scope, index, round, trigger).await?;
        Ok(Verdict::Missed)
    }

    async fn celebrate(
        &self,
        scope: &CancellationScope,
        index: usize,
        round: &Round,
    ) -> Result<(), Cancelled> {
        scope.run(self.playback.wait_until_idle()).await?;
        self.playback.mute_for_capture(false);
        self.capture.close();
        if round.is_scored() {
            self.scoreboard.record_correct();
        }
        self.step(scope)?;

        let cue = self
            .cue
            .as_ref()
            .and_then(|cue| self.playback.play_cue(cue.to_vec()));
        self.machine.dispatch(SessionEvent::AnswerAccepted);
        scope.sleep(self.config.beam_duration).await?;
        self.machine.dispatch(SessionEvent::BeamFinished);
        scope.sleep(self.config.explosion_duration).await?;
        self.machine.dispatch(SessionEvent::ExplosionFinished);

        // Feedback speech must never be talked over by the cue.
        if let Some(cue) = cue {
            scope.run(cue.finished()).await?;
        }
        self.step(scope)?;

        scope
            .run(self.playback.speak(round.canonical_answer(), SpeechKind::Feedback))
            .await?;
        scope.sleep(self.config.reveal_hold).await?;
        self.hand_off(scope, index, round, true)
    }

    async fn retry(&self, attempts_left: u32) -> Result<(), Cancelled> {
        let scope = self.scopes.begin();
        self.capture.clear();
        self.machine
            .dispatch(SessionEvent::AnswerRejected { attempts_left });
        scope.sleep(self.config.verdict_display).await?;
        self.machine.dispatch(SessionEvent::RetryReady);
        // The recognizer may have ended while this pass held the guard.
        if let Err(e) = self.capture.resume() {
            tracing::warn!("capture could not resume for the retry: {:#}", e);
        }
        self.timer.start(self.config.round_duration);
        self.step(&scope)
    }

    async fn reveal(
        &self,
        scope: &CancellationScope,
        index: usize,
        round: &Round,
        trigger: EvaluationTrigger,
    ) -> Result<(), Cancelled> {
        self.capture.close();
        scope.run(self.playback.wait_until_idle()).await?;
        self.playback.mute_for_capture(false);
        self.step(scope)?;

        let event = match trigger {
            EvaluationTrigger::Submitted => SessionEvent::AnswerRejected { attempts_left: 0 },
            EvaluationTrigger::TimerExpired | EvaluationTrigger::Skipped => SessionEvent::TimedOut,
        };
        self.machine.dispatch(event);
        scope.sleep(self.config.verdict_display).await?;
        self.machine.dispatch(SessionEvent::Revealed);

        scope
            .run(self.playback.speak(round.canonical_answer(), SpeechKind::Feedback))
            .await?;
        scope.sleep(self.config.reveal_hold).await?;
        self.hand_off(scope, index, round, false)
    }

    fn hand_off(
        &self,
        scope: &CancellationScope,
        index: usize,
        round: &Round,
        correct: bool,
    ) -> Result<(), Cancelled> {
        self.step(scope)?;
        self.machine
            .dispatch(SessionEvent::IntermissionStarted(IntermissionSnapshot {
                prompt: round.prompt.clone(),
                answer: round.canonical_answer().to_string(),
            }));
        if self
            .outcomes
            .send(RoundOutcome {
                index,
                round_id: round.id.clone(),
                correct,
                scored: round.is_scored(),
            })
            .is_err()
        {
            tracing::warn!("round outcome for {} had no receiver", round.id);
        }
        Ok(())
    }
}
