use crate::watchdog::ActivityClock;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Idle,
    Speaking,
    Listening,
    GracePeriod,
    Beam,
    Explosion,
    Reveal,
    Timeout,
    Wrong,
    Intermission,
    Finished,
}

impl Phase {
    /// Phases in which the recognizer is allowed to run (and be restarted).
    pub fn permits_listening(self) -> bool {
        matches!(
            self,
            Phase::Speaking | Phase::Listening | Phase::GracePeriod | Phase::Wrong
        )
    }
}

/// Cosmetic enemy variant. Always derived from the phase, never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EnemyVisual {
    #[default]
    Hidden,
    Approaching,
    Taunting,
    Hit,
    Exploding,
    Attacking,
    Retreating,
}

impl From<Phase> for EnemyVisual {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Idle | Phase::Intermission | Phase::Finished => EnemyVisual::Hidden,
            Phase::Speaking | Phase::Listening | Phase::GracePeriod => EnemyVisual::Approaching,
            Phase::Wrong => EnemyVisual::Taunting,
            Phase::Beam => EnemyVisual::Hit,
            Phase::Explosion => EnemyVisual::Exploding,
            Phase::Timeout => EnemyVisual::Attacking,
            Phase::Reveal => EnemyVisual::Retreating,
        }
    }
}

/// Prompt/answer pair kept on screen during the pause between rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntermissionSnapshot {
    pub prompt: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub phase: Phase,
    pub enemy_visual: EnemyVisual,
    pub has_detected_speech: bool,
    pub last_intermission: Option<IntermissionSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A round is being (re)initialized.
    RoundReset,
    RoundStarted,
    /// The prompt finished playing. Non-interactive rounds stay put.
    PromptSpoken { interactive: bool },
    SpeechDetected,
    GraceGranted,
    AnswerAccepted,
    BeamFinished,
    ExplosionFinished,
    /// The round timer lapsed without a usable answer.
    TimedOut,
    AnswerRejected { attempts_left: u32 },
    RetryReady,
    Revealed,
    IntermissionStarted(IntermissionSnapshot),
    SessionFinished,
}

/// The single reducer. Events that do not apply to the current phase return
/// the state unchanged. `Finished` is terminal.
pub fn reduce(state: &SessionState, event: &SessionEvent) -> SessionState {
    use Phase::*;

    let phase = state.phase;
    if phase == Finished {
        return state.clone();
    }

    let mut next = state.clone();
    match event {
        SessionEvent::RoundReset => {
            next.phase = Idle;
            next.has_detected_speech = false;
        }
        SessionEvent::RoundStarted if matches!(phase, Idle | Intermission) => {
            next.phase = Speaking;
        }
        SessionEvent::PromptSpoken { interactive: true } if phase == Speaking => {
            next.phase = Listening;
        }
        SessionEvent::SpeechDetected if phase.permits_listening() => {
            next.has_detected_speech = true;
        }
        SessionEvent::GraceGranted if matches!(phase, Listening | Wrong) => {
            next.phase = GracePeriod;
        }
        SessionEvent::AnswerAccepted if phase.permits_listening() => {
            next.phase = Beam;
        }
        SessionEvent::BeamFinished if phase == Beam => {
            next.phase = Explosion;
        }
        SessionEvent::ExplosionFinished if phase == Explosion => {
            next.phase = Reveal;
        }
        SessionEvent::TimedOut if phase.permits_listening() => {
            next.phase = Timeout;
        }
        SessionEvent::AnswerRejected { attempts_left } if phase.permits_listening() => {
            if *attempts_left > 0 {
                next.phase = Wrong;
                next.has_detected_speech = false;
            } else {
                next.phase = Timeout;
            }
        }
        SessionEvent::RetryReady if phase == Wrong => {
            next.phase = Listening;
        }
        SessionEvent::Revealed if phase == Timeout => {
            next.phase = Reveal;
        }
        SessionEvent::IntermissionStarted(snapshot) if phase == Reveal => {
            next.phase = Intermission;
            next.last_intermission = Some(snapshot.clone());
        }
        SessionEvent::SessionFinished => {
            next.phase = Finished;
        }
        _ => return next,
    }
    next.enemy_visual = EnemyVisual::from(next.phase);
    next
}

/// The authoritative phase register. Cloning shares the same register.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: std::sync::Arc<watch::Sender<SessionState>>,
    activity: ActivityClock,
}

impl SessionMachine {
    pub fn new(activity: ActivityClock) -> Self {
        let (tx, _) = watch::channel(SessionState::default());
        Self {
            state: std::sync::Arc::new(tx),
            activity,
        }
    }

    /// Applies `event` through [`reduce`]. Returns whether the state changed.
    pub fn dispatch(&self, event: SessionEvent) -> bool {
        let mut from = Phase::Idle;
        let changed = self.state.send_if_modified(|state| {
            from = state.phase;
            let next = reduce(state, &event);
            if next == *state {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            self.activity.touch();
            let to = self.phase();
            if from != to {
                tracing::debug!("phase {:?} -> {:?} on {:?}", from, to, event);
            }
        } else {
            tracing::trace!("{:?} ignored in phase {:?}", event, from);
        }
        changed
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}
