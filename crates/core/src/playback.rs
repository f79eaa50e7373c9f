//! Playback Sequencer
//!
//! Serializes every piece of session audio (prompts, feedback, the cue) into a
//! single active stream. Starting a stream supersedes the previous one, and
//! the superseded caller is completed right away so nobody awaits forever.

use crate::collaborators::{AudioSink, SpeechSynthesizer, StreamControl, StreamEnd, VoiceParams};
use crate::sync::lock;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechKind {
    Prompt,
    /// Announces the answer. Plays even if the round was interrupted.
    Feedback,
    Cue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Superseded,
    Failed,
    TimedOut,
    /// Nothing was played: the round was interrupted, synthesis produced no
    /// audio, or a prompt arrived while feedback or the cue was playing.
    Skipped,
}

/// Completion of one started stream.
pub struct PlaybackTicket {
    outcome: oneshot::Receiver<PlaybackOutcome>,
}

impl PlaybackTicket {
    pub async fn finished(self) -> PlaybackOutcome {
        self.outcome.await.unwrap_or(PlaybackOutcome::Superseded)
    }
}

struct ActiveStream {
    id: u64,
    kind: SpeechKind,
    control: Arc<dyn StreamControl>,
    done: Option<oneshot::Sender<PlaybackOutcome>>,
    superseded: CancellationToken,
}

#[derive(Default)]
struct SequencerState {
    next_id: u64,
    active: Option<ActiveStream>,
    /// `speak` calls still synthesizing. The sequencer is busy while any are.
    pending: usize,
    /// Prompt audio plays at zero volume while the user is being captured.
    muted: bool,
    /// Cancelled by a skip; blocks prompt audio until the next round begins.
    interrupted: CancellationToken,
}

struct Inner {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    voice: VoiceParams,
    feedback_lead_in: Duration,
    hard_timeout: Duration,
    state: Mutex<SequencerState>,
    idle: watch::Sender<bool>,
}

impl Inner {
    fn publish_idle(&self, state: &SequencerState) {
        self.idle
            .send_replace(state.active.is_none() && state.pending == 0);
    }
}

/// Holds the sequencer busy for the lifetime of one `speak` call, including
/// when the caller drops it mid-synthesis.
struct PendingSpeech<'a>(&'a Inner);

impl<'a> PendingSpeech<'a> {
    fn new(inner: &'a Inner) -> Self {
        let mut state = lock(&inner.state);
        state.pending += 1;
        inner.publish_idle(&state);
        Self(inner)
    }
}

impl Drop for PendingSpeech<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.pending = state.pending.saturating_sub(1);
        self.0.publish_idle(&state);
    }
}

#[derive(Clone)]
pub struct PlaybackSequencer {
    inner: Arc<Inner>,
}

impl PlaybackSequencer {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        voice: VoiceParams,
        feedback_lead_in: Duration,
        hard_timeout: Duration,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                synthesizer,
                sink,
                voice,
                feedback_lead_in,
                hard_timeout,
                state: Mutex::new(SequencerState::default()),
                idle,
            }),
        }
    }

    /// Synthesizes `text` and plays it to completion, supersession, failure or
    /// the hard timeout, whichever comes first. The timeout bounds synthesis
    /// and playback together. Never fails: a synthesis fault is logged and
    /// reported as [`PlaybackOutcome::Skipped`].
    pub async fn speak(&self, text: &str, kind: SpeechKind) -> PlaybackOutcome {
        if kind == SpeechKind::Feedback {
            tokio::time::sleep(self.inner.feedback_lead_in).await;
        } else if self.is_interrupted() {
            tracing::debug!("round interrupted, not speaking {:?}", text);
            return PlaybackOutcome::Skipped;
        }

        let _pending = PendingSpeech::new(&self.inner);
        let deadline = Instant::now() + self.inner.hard_timeout;
        // Feedback ignores skips, so it waits on a token nobody cancels.
        let interrupted = match kind {
            SpeechKind::Feedback => CancellationToken::new(),
            _ => lock(&self.inner.state).interrupted.clone(),
        };

        let synthesis = self.inner.synthesizer.synthesize(text, &self.inner.voice);
        let result = tokio::select! {
            _ = interrupted.cancelled() => {
                tracing::debug!("round interrupted while synthesizing {:?}", text);
                return PlaybackOutcome::Skipped;
            }
            result = tokio::time::timeout_at(deadline, synthesis) => result,
        };
        let audio = match result {
            Ok(Ok(audio)) if !audio.is_empty() => audio,
            Ok(Ok(_)) => {
                tracing::warn!("synthesizer returned no audio for {:?}", text);
                return PlaybackOutcome::Skipped;
            }
            Ok(Err(e)) => {
                tracing::warn!("speech synthesis failed, skipping: {:#}", e);
                return PlaybackOutcome::Skipped;
            }
            Err(_) => {
                tracing::warn!("speech synthesis timed out after {:?}", self.inner.hard_timeout);
                return PlaybackOutcome::TimedOut;
            }
        };

        match self.start(audio, kind, deadline) {
            Ok(Some(ticket)) => ticket.finished().await,
            Ok(None) => PlaybackOutcome::Skipped,
            Err(e) => {
                tracing::warn!("audio sink refused stream: {:#}", e);
                PlaybackOutcome::Failed
            }
        }
    }

    /// Starts already-encoded audio (the cue) without waiting for it.
    pub fn play_cue(&self, audio: Vec<u8>) -> Option<PlaybackTicket> {
        let deadline = Instant::now() + self.inner.hard_timeout;
        match self.start(audio, SpeechKind::Cue, deadline) {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!("failed to start cue: {:#}", e);
                None
            }
        }
    }

    /// Returns `None` when a prompt is declined: the round was skipped, or
    /// feedback or the cue owns the output.
    fn start(
        &self,
        audio: Vec<u8>,
        kind: SpeechKind,
        deadline: Instant,
    ) -> Result<Option<PlaybackTicket>> {
        let (done, outcome) = oneshot::channel();
        let superseded = CancellationToken::new();

        let (id, ended) = {
            let mut state = lock(&self.inner.state);
            if kind == SpeechKind::Prompt {
                let outranked = state
                    .active
                    .as_ref()
                    .is_some_and(|a| a.kind != SpeechKind::Prompt);
                if outranked || state.interrupted.is_cancelled() {
                    tracing::debug!("prompt audio arrived too late, dropped");
                    return Ok(None);
                }
            }
            if let Some(previous) = state.active.take() {
                Self::supersede(previous);
            }
            let volume = if state.muted && kind == SpeechKind::Prompt {
                0.0
            } else {
                1.0
            };
            let stream = match self.inner.sink.play(audio, volume) {
                Ok(stream) => stream,
                Err(e) => {
                    self.inner.publish_idle(&state);
                    return Err(e);
                }
            };
            state.next_id += 1;
            let id = state.next_id;
            state.active = Some(ActiveStream {
                id,
                kind,
                control: stream.control,
                done: Some(done),
                superseded: superseded.clone(),
            });
            self.inner.publish_idle(&state);
            (id, stream.ended)
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = superseded.cancelled() => return,
                end = ended => match end {
                    Ok(StreamEnd::Completed) => PlaybackOutcome::Completed,
                    Ok(StreamEnd::Failed(reason)) => {
                        tracing::warn!("audio stream {} failed: {}", id, reason);
                        PlaybackOutcome::Failed
                    }
                    Err(_) => PlaybackOutcome::Failed,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("audio stream {} never ended, forcing completion", id);
                    PlaybackOutcome::TimedOut
                }
            };
            Self::finish(&inner, id, outcome);
        });

        tracing::trace!("started {:?} stream {}", kind, id);
        Ok(Some(PlaybackTicket { outcome }))
    }

    fn finish(inner: &Inner, id: u64, outcome: PlaybackOutcome) {
        let mut state = lock(&inner.state);
        let is_current = state.active.as_ref().is_some_and(|a| a.id == id);
        if !is_current {
            return;
        }
        if let Some(mut active) = state.active.take() {
            if outcome == PlaybackOutcome::TimedOut {
                active.control.halt();
            }
            if let Some(done) = active.done.take() {
                let _ = done.send(outcome);
            }
        }
        inner.publish_idle(&state);
    }

    // Completes the superseded caller synchronously, before the new stream starts.
    fn supersede(mut previous: ActiveStream) {
        previous.superseded.cancel();
        previous.control.halt();
        if let Some(done) = previous.done.take() {
            let _ = done.send(PlaybackOutcome::Superseded);
        }
    }

    /// Resolves immediately when nothing is playing or being synthesized,
    /// otherwise when the last of those ends, errors or is halted.
    pub async fn wait_until_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle.borrow()
    }

    /// Mutes (or restores) prompt audio in place while capture is active.
    /// The stream keeps running so its completion timing is unchanged.
    pub fn mute_for_capture(&self, muted: bool) {
        let mut state = lock(&self.inner.state);
        if state.muted == muted {
            return;
        }
        state.muted = muted;
        if let Some(active) = state.active.as_ref().filter(|a| a.kind == SpeechKind::Prompt) {
            active.control.set_volume(if muted { 0.0 } else { 1.0 });
        }
    }

    /// Marks the round interrupted and halts any non-feedback stream. Prompt
    /// synthesis still in flight is abandoned.
    pub fn interrupt(&self) {
        let mut state = lock(&self.inner.state);
        state.interrupted.cancel();
        if state
            .active
            .as_ref()
            .is_some_and(|a| a.kind != SpeechKind::Feedback)
        {
            if let Some(active) = state.active.take() {
                Self::supersede(active);
                self.inner.publish_idle(&state);
            }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        lock(&self.inner.state).interrupted.is_cancelled()
    }

    /// Clears per-round flags.
    pub fn begin_round(&self) {
        let mut state = lock(&self.inner.state);
        state.interrupted = CancellationToken::new();
        state.muted = false;
    }

    /// Stops whatever is playing.
    pub fn halt(&self) {
        let mut state = lock(&self.inner.state);
        if let Some(active) = state.active.take() {
            Self::supersede(active);
            self.inner.publish_idle(&state);
        }
    }
}
