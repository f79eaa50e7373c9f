use crate::sync::lock;
#[cfg(test)]
use mockall::automock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// What the round timer consults and notifies when it lapses.
///
/// Callbacks run while the timer's lock is held, so they must not call back
/// into the timer. In exchange, once [`RoundTimer::cancel`] has returned no
/// callback from the cancelled run can take effect.
#[cfg_attr(test, automock)]
pub trait ExpiryPolicy: Send + Sync {
    /// True if speech is being captured and worth a grace extension.
    fn grace_eligible(&self) -> bool;
    fn grace_started(&self);
    /// The round is over as far as the clock is concerned.
    fn expired(&self);
}

#[derive(Default)]
struct TimerState {
    // Bumped on every start and cancel; a run only acts if it still owns it.
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// A cancellable countdown with one grace extension.
#[derive(Clone)]
pub struct RoundTimer {
    grace: Duration,
    policy: Arc<dyn ExpiryPolicy>,
    state: Arc<Mutex<TimerState>>,
}

impl RoundTimer {
    pub fn new(grace: Duration, policy: Arc<dyn ExpiryPolicy>) -> Self {
        Self {
            grace,
            policy,
            state: Arc::default(),
        }
    }

    /// Starts a countdown, replacing any countdown already running.
    pub fn start(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.generation += 1;
        let generation = state.generation;
        if let Some(task) = state.task.take() {
            task.abort();
        }

        let timer_state = self.state.clone();
        let policy = self.policy.clone();
        let grace = self.grace;
        state.task = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            {
                let state = lock(&timer_state);
                if state.generation != generation {
                    return;
                }
                if !policy.grace_eligible() {
                    policy.expired();
                    return;
                }
                tracing::debug!("round timer lapsed mid-speech, granting {:?} grace", grace);
                policy.grace_started();
            }

            tokio::time::sleep(grace).await;
            let state = lock(&timer_state);
            if state.generation == generation {
                policy.expired();
            }
        }));
        tracing::debug!("round timer started for {:?}", duration);
    }

    /// Idempotent. After this returns, the cancelled countdown has no effect.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state)
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingPolicy {
        speaking: AtomicBool,
        graces: AtomicUsize,
        expiries: AtomicUsize,
    }

    impl ExpiryPolicy for RecordingPolicy {
        fn grace_eligible(&self) -> bool {
            self.speaking.load(Ordering::SeqCst)
        }
        fn grace_started(&self) {
            self.graces.fetch_add(1, Ordering::SeqCst);
        }
        fn expired(&self) {
            self.expiries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn timer(policy: &Arc<RecordingPolicy>) -> RoundTimer {
        RoundTimer::new(Duration::from_secs(3), policy.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_duration() {
        let policy = Arc::new(RecordingPolicy::default());
        let timer = timer(&policy);

        timer.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(policy.expiries.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(policy.expiries.load(Ordering::SeqCst), 1);
        assert_eq!(policy.graces.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_fires_after_cancel_returns() {
        let policy = Arc::new(RecordingPolicy::default());
        let timer = timer(&policy);

        timer.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(policy.expiries.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_the_same_instant_as_expiry_wins() {
        let policy = Arc::new(RecordingPolicy::default());
        let timer = timer(&policy);

        timer.start(Duration::from_secs(10));
        // Wake exactly at the deadline; whichever runs first, cancel must hold.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let fired_before = policy.expiries.load(Ordering::SeqCst);
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(policy.expiries.load(Ordering::SeqCst), fired_before);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_discards_the_previous_countdown() {
        let policy = Arc::new(RecordingPolicy::default());
        let timer = timer(&policy);

        timer.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(8)).await;
        timer.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(policy.expiries.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(policy.expiries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn grants_one_grace_extension_while_speech_is_captured() {
        let policy = Arc::new(RecordingPolicy::default());
        policy.speaking.store(true, Ordering::SeqCst);
        let timer = timer(&policy);

        timer.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(policy.graces.load(Ordering::SeqCst), 1);
        assert_eq!(policy.expiries.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(policy.graces.load(Ordering::SeqCst), 1, "only one extension");
        assert_eq!(policy.expiries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_grace_suppresses_the_second_expiry() {
        let policy = Arc::new(RecordingPolicy::default());
        policy.speaking.store(true, Ordering::SeqCst);
        let timer = timer(&policy);

        timer.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(policy.graces.load(Ordering::SeqCst), 1);
        assert_eq!(policy.expiries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn policy_is_consulted_once_per_lapse() {
        let mut policy = MockExpiryPolicy::new();
        policy.expect_grace_eligible().times(1).return_const(false);
        policy.expect_grace_started().never();
        policy.expect_expired().times(1).return_const(());
        let policy = Arc::new(policy);
        let timer = RoundTimer::new(Duration::from_secs(3), policy.clone());

        timer.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        timer.cancel();
        drop(timer);
        tokio::task::yield_now().await;

        // Expectations are verified when the last reference drops.
        let policy = Arc::try_unwrap(policy).ok().expect("timer released the policy");
        drop(policy);
    }
}
