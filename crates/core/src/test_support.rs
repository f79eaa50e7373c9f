//! Hand-written collaborators for tests that need to drive asynchronous
//! completion, which `mockall` expectations cannot do on their own.

use crate::collaborators::{
    AudioSink, AudioStream, RecognitionEvent, SpeechRecognizer, SpeechSynthesizer, StreamControl,
    StreamEnd, VoiceParams,
};
use crate::session_state::{Phase, SessionMachine};
use crate::sync::lock;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Returns the text's bytes as "audio" and remembers what it was asked to say.
#[derive(Default)]
pub struct FakeSynthesizer {
    spoken: Mutex<Vec<String>>,
    delays: HashMap<String, Duration>,
}

impl FakeSynthesizer {
    /// Makes synthesis of `text` take `delay`.
    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    pub fn spoken(&self) -> Vec<String> {
        lock(&self.spoken).clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>> {
        lock(&self.spoken).push(text.to_string());
        if let Some(delay) = self.delays.get(text) {
            tokio::time::sleep(*delay).await;
        }
        Ok(text.as_bytes().to_vec())
    }
}

#[derive(Default)]
struct SinkLog {
    start_volumes: Vec<f32>,
    start_times: Vec<Instant>,
    last_volume: Option<f32>,
    halted: usize,
    // Held so never-ending streams keep their sender alive.
    pending: Vec<oneshot::Sender<StreamEnd>>,
}

/// Plays every stream for a fixed duration, or forever.
pub struct FakeSink {
    duration: Option<Duration>,
    log: Arc<Mutex<SinkLog>>,
}

impl FakeSink {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            log: Arc::default(),
        }
    }

    pub fn never_ending() -> Self {
        Self {
            duration: None,
            log: Arc::default(),
        }
    }

    pub fn started(&self) -> usize {
        lock(&self.log).start_volumes.len()
    }

    pub fn start_volumes(&self) -> Vec<f32> {
        lock(&self.log).start_volumes.clone()
    }

    pub fn start_times(&self) -> Vec<Instant> {
        lock(&self.log).start_times.clone()
    }

    pub fn last_volume(&self) -> Option<f32> {
        lock(&self.log).last_volume
    }

    pub fn halted(&self) -> usize {
        lock(&self.log).halted
    }
}

struct FakeControl {
    log: Arc<Mutex<SinkLog>>,
    halted: Arc<AtomicBool>,
}

impl StreamControl for FakeControl {
    fn set_volume(&self, volume: f32) {
        lock(&self.log).last_volume = Some(volume);
    }

    fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            lock(&self.log).halted += 1;
        }
    }
}

impl AudioSink for FakeSink {
    fn play(&self, _audio: Vec<u8>, volume: f32) -> Result<AudioStream> {
        let (tx, rx) = oneshot::channel();
        let halted = Arc::new(AtomicBool::new(false));
        {
            let mut log = lock(&self.log);
            log.start_volumes.push(volume);
            log.start_times.push(Instant::now());
            log.last_volume = Some(volume);
        }
        match self.duration {
            Some(duration) => {
                let halted = halted.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    if !halted.load(Ordering::SeqCst) {
                        let _ = tx.send(StreamEnd::Completed);
                    }
                });
            }
            None => lock(&self.log).pending.push(tx),
        }
        Ok(AudioStream {
            control: Arc::new(FakeControl {
                log: self.log.clone(),
                halted,
            }),
            ended: rx,
        })
    }
}

/// A recognizer the test speaks into.
#[derive(Default)]
pub struct FakeRecognizer {
    current: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeRecognizer {
    pub fn say(&self, text: &str) {
        self.send(RecognitionEvent::Phrase {
            text: text.to_string(),
            is_final: true,
        });
    }

    pub fn fail(&self, reason: &str) {
        self.send(RecognitionEvent::Error(reason.to_string()));
    }

    /// Ends the current run the way a platform recognizer does on its own.
    pub fn end_spontaneously(&self) {
        if let Some(tx) = lock(&self.current).take() {
            let _ = tx.try_send(RecognitionEvent::End);
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.current).is_some()
    }

    fn send(&self, event: RecognitionEvent) {
        if let Some(tx) = lock(&self.current).as_ref() {
            let _ = tx.try_send(event);
        }
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>> {
        let (tx, rx) = mpsc::channel(32);
        *lock(&self.current) = Some(tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.end_spontaneously();
    }
}

/// Lets spawned tasks run up to their next suspension point.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Records every phase the machine moves through after creation.
pub struct PhaseLog {
    phases: Arc<Mutex<Vec<Phase>>>,
}

impl PhaseLog {
    pub fn record(machine: &SessionMachine) -> Self {
        let phases = Arc::new(Mutex::new(Vec::new()));
        let mut rx = machine.subscribe();
        let sink = phases.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let phase = rx.borrow_and_update().phase;
                let mut log = lock(&sink);
                if log.last() != Some(&phase) {
                    log.push(phase);
                }
            }
        });
        Self { phases }
    }

    /// Phases in order, consecutive repeats collapsed.
    pub async fn distinct(&self) -> Vec<Phase> {
        settle().await;
        lock(&self.phases).clone()
    }

    pub async fn count(&self, phase: Phase) -> usize {
        self.distinct().await.into_iter().filter(|p| *p == phase).count()
    }
}
