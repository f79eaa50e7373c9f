//! Session Controller
//!
//! Drives a quiz session round by round. `QuizSession` owns every component
//! and wires them together; `SessionHandle` is what the host keeps to feed
//! user intent back in and to render phase changes.

use crate::Notification;
use crate::capture::CaptureCoordinator;
use crate::collaborators::{AudioSink, SpeechRecognizer, SpeechSynthesizer};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::orchestrator::{
    EvaluationOrchestrator, EvaluationTrigger, RoundOutcome, Scoreboard, SingleFlightGuard,
};
use crate::playback::{PlaybackSequencer, SpeechKind};
use crate::round::{Round, RoundSource};
use crate::scope::ScopeChain;
use crate::session_state::{Phase, SessionEvent, SessionMachine, SessionState};
use crate::timer::{ExpiryPolicy, RoundTimer};
use crate::watchdog::{ActivityClock, Watchdog};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// The runtime services a session plays through.
pub struct Collaborators {
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    /// Pre-loaded audio played as the beam fires. Optional.
    pub cue: Option<Arc<[u8]>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub correct_count: u32,
    pub total_scored: u32,
    pub rounds_played: usize,
    /// False if the session was stopped before its last round ended.
    pub completed: bool,
}

/// Bridges the round timer to the rest of the session.
struct SessionExpiryPolicy {
    capture: CaptureCoordinator,
    machine: SessionMachine,
    triggers: mpsc::UnboundedSender<EvaluationTrigger>,
}

impl ExpiryPolicy for SessionExpiryPolicy {
    fn grace_eligible(&self) -> bool {
        self.capture.is_open() && self.capture.has_phrases()
    }

    fn grace_started(&self) {
        self.machine.dispatch(SessionEvent::GraceGranted);
    }

    fn expired(&self) {
        if self.triggers.send(EvaluationTrigger::TimerExpired).is_err() {
            tracing::debug!("round timer lapsed after the session ended");
        }
    }
}

/// Host-side control of a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    triggers: mpsc::UnboundedSender<EvaluationTrigger>,
    playback: PlaybackSequencer,
    scopes: Arc<ScopeChain>,
    machine: SessionMachine,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// The user wants the buffered answer judged now.
    pub fn submit(&self) {
        self.trigger(EvaluationTrigger::Submitted);
    }

    /// Gives up on the current round. Prompt audio stops at once and the
    /// answer is revealed.
    pub fn skip(&self) {
        self.playback.interrupt();
        self.trigger(EvaluationTrigger::Skipped);
    }

    /// Ends the session after the current step. Pending waits are cancelled.
    pub fn stop(&self) {
        tracing::info!("session stop requested");
        self.shutdown.cancel();
        self.scopes.close();
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.machine.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.machine.snapshot()
    }

    fn trigger(&self, trigger: EvaluationTrigger) {
        if self.triggers.send(trigger).is_err() {
            tracing::debug!("{:?} after the session ended, ignored", trigger);
        }
    }
}

pub struct QuizSession {
    config: Arc<SessionConfig>,
    machine: SessionMachine,
    playback: PlaybackSequencer,
    capture: CaptureCoordinator,
    timer: RoundTimer,
    scopes: Arc<ScopeChain>,
    orchestrator: Arc<EvaluationOrchestrator>,
    scoreboard: Arc<Scoreboard>,
    activity: ActivityClock,
    triggers: mpsc::UnboundedSender<EvaluationTrigger>,
    pending_triggers: Option<mpsc::UnboundedReceiver<EvaluationTrigger>>,
    outcomes: mpsc::UnboundedReceiver<RoundOutcome>,
    notifications: mpsc::UnboundedSender<Notification>,
    shutdown: CancellationToken,
}

impl QuizSession {
    /// Builds a session and the channel its notifications arrive on.
    pub fn new(
        config: SessionConfig,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let config = Arc::new(config);
        let activity = ActivityClock::default();
        let machine = SessionMachine::new(activity.clone());
        let playback = PlaybackSequencer::new(
            collaborators.synthesizer,
            collaborators.sink,
            config.voice.clone(),
            config.feedback_lead_in,
            config.playback_timeout,
        );
        let guard = SingleFlightGuard::default();
        let capture = CaptureCoordinator::new(
            collaborators.recognizer,
            machine.clone(),
            guard.clone(),
            playback.clone(),
            config.recognizer_restart_delay,
        );

        let (triggers, pending_triggers) = mpsc::unbounded_channel();
        let timer = RoundTimer::new(
            config.grace_duration,
            Arc::new(SessionExpiryPolicy {
                capture: capture.clone(),
                machine: machine.clone(),
                triggers: triggers.clone(),
            }),
        );

        let scopes = Arc::new(ScopeChain::new());
        let scoreboard = Arc::new(Scoreboard::default());
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(EvaluationOrchestrator::new(
            config.clone(),
            machine.clone(),
            playback.clone(),
            capture.clone(),
            timer.clone(),
            scopes.clone(),
            guard,
            activity.clone(),
            scoreboard.clone(),
            outcomes_tx,
            collaborators.cue,
        ));
        let (notifications, notifications_rx) = mpsc::unbounded_channel();

        let session = Self {
            config,
            machine,
            playback,
            capture,
            timer,
            scopes,
            orchestrator,
            scoreboard,
            activity,
            triggers,
            pending_triggers: Some(pending_triggers),
            outcomes,
            notifications,
            shutdown: CancellationToken::new(),
        };
        (session, notifications_rx)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            triggers: self.triggers.clone(),
            playback: self.playback.clone(),
            scopes: self.scopes.clone(),
            machine: self.machine.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Plays every round from `source` in order.
    ///
    /// Returns early with a partial summary if [`SessionHandle::stop`] is
    /// called. `SessionComplete` is only notified when every round was played.
    pub async fn run(mut self, source: &dyn RoundSource) -> Result<SessionSummary, SessionError> {
        let rounds = source
            .load_rounds()
            .await
            .map_err(SessionError::RoundSource)?;
        if rounds.is_empty() {
            return Err(SessionError::NoRounds);
        }
        tracing::info!("starting session with {} rounds", rounds.len());

        let dispatcher = self
            .pending_triggers
            .take()
            .map(|triggers| self.spawn_dispatcher(triggers));
        let watchdog_stop = self.shutdown.child_token();
        let watchdog = Watchdog::new(
            self.activity.clone(),
            self.config.watchdog_poll,
            self.config.watchdog_threshold,
        )
        .spawn(self.notifications.clone(), watchdog_stop.clone());

        let total = rounds.len();
        let mut rounds_played = 0;
        for (index, round) in rounds.into_iter().enumerate() {
            let round = Arc::new(round);
            let Some(outcome) = self.play_round(index, total, round).await else {
                break;
            };
            rounds_played += 1;
            tracing::info!(
                "round {} complete (correct: {}, score {}/{})",
                outcome.round_id,
                outcome.correct,
                self.scoreboard.correct(),
                self.scoreboard.scored()
            );
            self.notify(Notification::RoundComplete {
                round_id: outcome.round_id,
                correct: outcome.correct,
            });

            if index + 1 < total {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.intermission) => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
        }

        self.capture.close();
        self.timer.cancel();
        self.scopes.close();
        self.playback.halt();
        self.machine.dispatch(SessionEvent::SessionFinished);
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        watchdog_stop.cancel();
        let _ = watchdog.await;

        let summary = SessionSummary {
            correct_count: self.scoreboard.correct(),
            total_scored: self.scoreboard.scored(),
            rounds_played,
            completed: rounds_played == total && !self.shutdown.is_cancelled(),
        };
        if summary.completed {
            self.notify(Notification::SessionComplete {
                correct_count: summary.correct_count,
                total_scored: summary.total_scored,
            });
        }
        tracing::info!("session finished: {:?}", summary);
        Ok(summary)
    }

    // Each trigger gets its own task so a long pass never delays the
    // guard check of the next one.
    fn spawn_dispatcher(
        &self,
        mut triggers: mpsc::UnboundedReceiver<EvaluationTrigger>,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            while let Some(trigger) = triggers.recv().await {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.evaluate(trigger).await });
            }
        })
    }

    /// Returns `None` if the session was stopped before the round resolved.
    async fn play_round(
        &mut self,
        index: usize,
        total: usize,
        round: Arc<Round>,
    ) -> Option<RoundOutcome> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.scopes.begin();
        self.timer.cancel();
        self.orchestrator.begin_round(index, round.clone());
        self.capture.clear();
        self.playback.begin_round();
        if round.is_scored() {
            self.scoreboard.record_scored_round();
        }

        self.machine.dispatch(SessionEvent::RoundReset);
        self.machine.dispatch(SessionEvent::RoundStarted);
        tracing::info!("round {} ({}/{}): {}", round.id, index + 1, total, round.prompt);
        if let Err(e) = self.capture.open() {
            tracing::warn!("speech capture unavailable this round: {:#}", e);
        }

        let spoken = tokio::select! {
            outcome = self.playback.speak(&round.prompt, SpeechKind::Prompt) => outcome,
            _ = self.shutdown.cancelled() => return None,
        };
        let interactive = !self.playback.is_interrupted();
        tracing::debug!("prompt ended ({:?}), interactive: {}", spoken, interactive);
        self.machine
            .dispatch(SessionEvent::PromptSpoken { interactive });
        if self.machine.phase() == Phase::Listening && !self.orchestrator.guard().in_progress() {
            self.timer.start(self.config.round_duration);
        }

        loop {
            let outcome = tokio::select! {
                outcome = self.outcomes.recv() => outcome?,
                _ = self.shutdown.cancelled() => return None,
            };
            if outcome.index == index {
                return Some(outcome);
            }
            tracing::debug!("discarding outcome of earlier round {}", outcome.round_id);
        }
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("notification receiver dropped");
        }
    }
}
