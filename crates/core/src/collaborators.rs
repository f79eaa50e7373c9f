//! Contracts for the collaborators the session depends on but does not own.
//!
//! The session never talks to a speaker, a microphone or a network directly.
//! Each of those sits behind one of these traits so the core logic can run
//! against real devices in the service and against fakes in tests.

use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Voice settings forwarded verbatim to the synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            speed: 1.0,
        }
    }
}

/// Turns text into encoded audio. May be slow or fail; an empty or failed
/// result is treated as "nothing to play" by the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>>;
}

/// How an audio stream ended, as reported by the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Completed,
    Failed(String),
}

/// Live controls for a stream that is currently playing.
pub trait StreamControl: Send + Sync {
    fn set_volume(&self, volume: f32);
    /// Stops the stream. The sink may or may not report an end afterwards.
    fn halt(&self);
}

/// A stream handed back by [`AudioSink::play`]. `ended` resolves once when the
/// stream completes or errors; a dropped sender counts as a failure.
pub struct AudioStream {
    pub control: Arc<dyn StreamControl>,
    pub ended: oneshot::Receiver<StreamEnd>,
}

/// Plays encoded audio.
pub trait AudioSink: Send + Sync {
    fn play(&self, audio: Vec<u8>, volume: f32) -> Result<AudioStream>;
}

/// Events from a continuous recognizer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Phrase { text: String, is_final: bool },
    /// Platform fault. Logged and ignored.
    Error(String),
    /// The recognizer stopped on its own or after `stop()`.
    End,
}

/// A continuous speech recognizer that may end spontaneously.
#[cfg_attr(test, automock)]
pub trait SpeechRecognizer: Send + Sync {
    /// Starts recognition and returns the event stream for this run.
    fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>>;
    /// Requests a stop. Completion arrives later as an `End` event.
    fn stop(&self);
}
