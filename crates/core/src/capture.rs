//! Capture Coordinator
//!
//! Wraps a continuous recognizer that the platform may end at any time. The
//! coordinator buffers the distinct phrases heard this round and decides, in
//! one place, whether an ended recognizer gets restarted.

use crate::collaborators::{RecognitionEvent, SpeechRecognizer};
use crate::orchestrator::SingleFlightGuard;
use crate::playback::PlaybackSequencer;
use crate::session_state::{Phase, SessionEvent, SessionMachine};
use crate::sync::lock;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Restart policy for a recognizer that ended on its own: only if nobody
/// closed capture, no evaluation is running, and the phase still listens.
pub fn should_restart(closed: bool, evaluating: bool, phase: Phase) -> bool {
    !closed && !evaluating && phase.permits_listening()
}

struct CaptureState {
    /// Set before the recognizer is asked to stop, so the stop's own `End`
    /// event can never restart a coordinator its caller believes is closed.
    closed: bool,
    /// A pump is reading recognizer events. Cleared when the pump gives up.
    running: bool,
    // Bumped on every launch; a pump only acts while it owns the current value.
    generation: u64,
    phrases: Vec<String>,
}

struct Inner {
    recognizer: Arc<dyn SpeechRecognizer>,
    machine: SessionMachine,
    guard: SingleFlightGuard,
    playback: PlaybackSequencer,
    restart_delay: Duration,
    state: Mutex<CaptureState>,
}

#[derive(Clone)]
pub struct CaptureCoordinator {
    inner: Arc<Inner>,
}

impl CaptureCoordinator {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        machine: SessionMachine,
        guard: SingleFlightGuard,
        playback: PlaybackSequencer,
        restart_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                recognizer,
                machine,
                guard,
                playback,
                restart_delay,
                state: Mutex::new(CaptureState {
                    closed: true,
                    running: false,
                    generation: 0,
                    phrases: Vec::new(),
                }),
            }),
        }
    }

    /// Starts the recognizer. Does nothing if capture is already open.
    pub fn open(&self) -> Result<()> {
        let generation = {
            let mut state = lock(&self.inner.state);
            if !state.closed {
                return Ok(());
            }
            state.closed = false;
            Self::claim(&mut state)
        };
        self.launch(generation)?;
        tracing::debug!("capture opened (run {})", generation);
        Ok(())
    }

    /// Restarts a recognizer that ended while a restart was not allowed.
    /// Does nothing if capture is closed or a pump is still alive.
    pub fn resume(&self) -> Result<()> {
        let generation = {
            let mut state = lock(&self.inner.state);
            if state.closed || state.running {
                return Ok(());
            }
            Self::claim(&mut state)
        };
        self.launch(generation)?;
        tracing::debug!("capture resumed (run {})", generation);
        Ok(())
    }

    fn claim(state: &mut CaptureState) -> u64 {
        state.running = true;
        state.generation += 1;
        state.generation
    }

    fn launch(&self, generation: u64) -> Result<()> {
        match self.inner.recognizer.start() {
            Ok(events) => {
                tokio::spawn(pump(self.inner.clone(), generation, events));
                Ok(())
            }
            Err(e) => {
                let mut state = lock(&self.inner.state);
                if state.generation == generation {
                    state.closed = true;
                    state.running = false;
                }
                Err(e).context("Failed to start speech recognizer")
            }
        }
    }

    /// Closes capture. Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.recognizer.stop();
        tracing::debug!("capture closed");
    }

    pub fn is_open(&self) -> bool {
        !lock(&self.inner.state).closed
    }

    /// Snapshot of this round's phrases, in the order they were first heard.
    pub fn phrases(&self) -> Vec<String> {
        lock(&self.inner.state).phrases.clone()
    }

    pub fn has_phrases(&self) -> bool {
        !lock(&self.inner.state).phrases.is_empty()
    }

    pub fn clear(&self) {
        lock(&self.inner.state).phrases.clear();
    }
}

async fn pump(inner: Arc<Inner>, generation: u64, mut events: mpsc::Receiver<RecognitionEvent>) {
    loop {
        match events.recv().await {
            Some(RecognitionEvent::Phrase { text, is_final }) => {
                tracing::trace!("heard {:?} (final: {})", text, is_final);
                inner.accept(generation, &text);
            }
            Some(RecognitionEvent::Error(reason)) => {
                tracing::warn!("speech recognizer error (ignored): {}", reason);
            }
            Some(RecognitionEvent::End) | None => {
                tokio::time::sleep(inner.restart_delay).await;
                match inner.restart(generation) {
                    Some(next) => events = next,
                    None => break,
                }
            }
        }
    }
}

impl Inner {
    fn accept(&self, generation: u64, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        {
            let mut state = lock(&self.state);
            if state.closed || state.generation != generation {
                return;
            }
            if state.phrases.iter().any(|p| p == text) {
                return;
            }
            state.phrases.push(text.to_string());
        }
        self.machine.dispatch(SessionEvent::SpeechDetected);
        self.playback.mute_for_capture(true);
    }

    fn restart(&self, generation: u64) -> Option<mpsc::Receiver<RecognitionEvent>> {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return None;
        }
        let phase = self.machine.phase();
        if !should_restart(state.closed, self.guard.in_progress(), phase) {
            tracing::debug!(
                "recognizer ended, not restarting (closed: {}, phase: {:?})",
                state.closed,
                phase
            );
            state.running = false;
            return None;
        }
        match self.recognizer.start() {
            Ok(events) => {
                tracing::debug!("recognizer ended on its own, restarted");
                Some(events)
            }
            Err(e) => {
                tracing::warn!("failed to restart speech recognizer: {:#}", e);
                state.running = false;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MockSpeechRecognizer, VoiceParams};
    use crate::test_support::{FakeRecognizer, FakeSink, FakeSynthesizer, settle};
    use crate::watchdog::ActivityClock;

    struct Rig {
        recognizer: Arc<FakeRecognizer>,
        machine: SessionMachine,
        guard: SingleFlightGuard,
        capture: CaptureCoordinator,
    }

    fn rig() -> Rig {
        let recognizer = Arc::new(FakeRecognizer::default());
        let machine = SessionMachine::new(ActivityClock::default());
        let guard = SingleFlightGuard::default();
        let playback = PlaybackSequencer::new(
            Arc::new(FakeSynthesizer::default()),
            Arc::new(FakeSink::new(Duration::from_secs(1))),
            VoiceParams::default(),
            Duration::ZERO,
            Duration::from_secs(15),
        );
        let capture = CaptureCoordinator::new(
            recognizer.clone(),
            machine.clone(),
            guard.clone(),
            playback,
            Duration::from_millis(250),
        );
        machine.dispatch(SessionEvent::RoundStarted);
        machine.dispatch(SessionEvent::PromptSpoken { interactive: true });
        Rig {
            recognizer,
            machine,
            guard,
            capture,
        }
    }

    #[test]
    fn restart_policy_requires_every_condition() {
        assert!(should_restart(false, false, Phase::Listening));
        assert!(should_restart(false, false, Phase::Wrong));
        assert!(!should_restart(true, false, Phase::Listening));
        assert!(!should_restart(false, true, Phase::Listening));
        assert!(!should_restart(false, false, Phase::Reveal));
        assert!(!should_restart(false, false, Phase::Intermission));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_are_dropped_and_speech_is_flagged() {
        let rig = rig();
        rig.capture.open().unwrap();

        rig.recognizer.say("apple");
        rig.recognizer.say("apple ");
        rig.recognizer.say("a pull");
        rig.recognizer.fail("network");
        settle().await;

        assert_eq!(rig.capture.phrases(), vec!["apple", "a pull"]);
        assert!(rig.machine.snapshot().has_detected_speech);
    }

    #[tokio::test(start_paused = true)]
    async fn spontaneous_end_restarts_while_listening() {
        let rig = rig();
        rig.capture.open().unwrap();

        rig.recognizer.end_spontaneously();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(rig.recognizer.starts(), 2);
        rig.recognizer.say("pear");
        settle().await;
        assert_eq!(rig.capture.phrases(), vec!["pear"]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_restart_while_an_evaluation_is_running() {
        let rig = rig();
        rig.capture.open().unwrap();

        let _permit = rig.guard.try_acquire().unwrap();
        rig.recognizer.end_spontaneously();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(rig.recognizer.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_revives_a_recognizer_that_ended_mid_evaluation() {
        let rig = rig();
        rig.capture.open().unwrap();

        let permit = rig.guard.try_acquire().unwrap();
        rig.recognizer.end_spontaneously();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.recognizer.starts(), 1);
        assert!(rig.capture.is_open(), "ending on its own is not a close");

        drop(permit);
        rig.capture.resume().unwrap();
        assert_eq!(rig.recognizer.starts(), 2);
        rig.recognizer.say("pear");
        settle().await;
        assert_eq!(rig.capture.phrases(), vec!["pear"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_leaves_a_live_or_closed_capture_alone() {
        let rig = rig();
        rig.capture.resume().unwrap();
        assert_eq!(rig.recognizer.starts(), 0, "closed capture stays closed");

        rig.capture.open().unwrap();
        rig.capture.resume().unwrap();
        assert_eq!(rig.recognizer.starts(), 1);

        rig.capture.close();
        tokio::time::sleep(Duration::from_secs(1)).await;
        rig.capture.resume().unwrap();
        assert_eq!(rig.recognizer.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_restart_once_the_phase_stops_listening() {
        let rig = rig();
        rig.capture.open().unwrap();

        rig.machine.dispatch(SessionEvent::AnswerAccepted);
        rig.recognizer.end_spontaneously();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(rig.recognizer.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_twice_never_restarts_or_duplicates() {
        let rig = rig();
        rig.capture.open().unwrap();
        rig.recognizer.say("apple");
        settle().await;

        rig.capture.close();
        rig.capture.close();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(rig.recognizer.stops(), 1);
        assert_eq!(rig.recognizer.starts(), 1);
        assert!(!rig.recognizer.is_running());
        assert_eq!(rig.capture.phrases(), vec!["apple"]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_requests_exactly_one_stop() {
        let (tx, rx) = mpsc::channel(4);
        let mut recognizer = MockSpeechRecognizer::new();
        recognizer.expect_start().times(1).return_once(move || Ok(rx));
        recognizer.expect_stop().times(1).return_const(());

        let machine = SessionMachine::new(ActivityClock::default());
        machine.dispatch(SessionEvent::RoundStarted);
        let playback = PlaybackSequencer::new(
            Arc::new(FakeSynthesizer::default()),
            Arc::new(FakeSink::new(Duration::from_secs(1))),
            VoiceParams::default(),
            Duration::ZERO,
            Duration::from_secs(15),
        );
        let capture = CaptureCoordinator::new(
            Arc::new(recognizer),
            machine,
            SingleFlightGuard::default(),
            playback,
            Duration::from_millis(250),
        );

        capture.open().unwrap();
        capture.close();
        // The stop completion arrives after the flag is already set.
        tx.send(RecognitionEvent::End).await.unwrap();
        capture.close();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!capture.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn phrases_after_close_are_ignored() {
        let (tx, rx) = mpsc::channel(4);
        let mut recognizer = MockSpeechRecognizer::new();
        recognizer.expect_start().times(1).return_once(move || Ok(rx));
        recognizer.expect_stop().return_const(());

        let machine = SessionMachine::new(ActivityClock::default());
        machine.dispatch(SessionEvent::RoundStarted);
        let playback = PlaybackSequencer::new(
            Arc::new(FakeSynthesizer::default()),
            Arc::new(FakeSink::new(Duration::from_secs(1))),
            VoiceParams::default(),
            Duration::ZERO,
            Duration::from_secs(15),
        );
        let capture = CaptureCoordinator::new(
            Arc::new(recognizer),
            machine,
            SingleFlightGuard::default(),
            playback,
            Duration::from_millis(250),
        );

        capture.open().unwrap();
        tx.send(RecognitionEvent::Phrase {
            text: "early".into(),
            is_final: false,
        })
        .await
        .unwrap();
        settle().await;
        capture.close();
        tx.send(RecognitionEvent::Phrase {
            text: "late".into(),
            is_final: true,
        })
        .await
        .unwrap();
        settle().await;

        assert_eq!(capture.phrases(), vec!["early"]);
    }
}
