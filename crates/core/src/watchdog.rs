use crate::Notification;
use crate::sync::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Last-activity timestamp, touched by every phase transition and every
/// orchestrator step.
#[derive(Debug, Clone)]
pub struct ActivityClock(Arc<Mutex<Instant>>);

impl Default for ActivityClock {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }
}

impl ActivityClock {
    pub fn touch(&self) {
        *lock(&self.0) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.0).elapsed()
    }
}

/// Detects a hung session from the outside. It only reports; it never
/// touches session state.
pub struct Watchdog {
    clock: ActivityClock,
    poll: Duration,
    threshold: Duration,
}

impl Watchdog {
    pub fn new(clock: ActivityClock, poll: Duration, threshold: Duration) -> Self {
        Self {
            clock,
            poll,
            threshold,
        }
    }

    /// Polls until `cancel` fires. Reports once per stall and re-arms when
    /// activity resumes.
    pub fn spawn(
        self,
        notifications: mpsc::UnboundedSender<Notification>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reported = false;
            let mut ticker = tokio::time::interval(self.poll);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let idle_for = self.clock.idle_for();
                        if idle_for <= self.threshold {
                            if reported {
                                tracing::info!("session activity resumed");
                            }
                            reported = false;
                        } else if !reported {
                            tracing::warn!("session stuck: no activity for {:?}", idle_for);
                            reported = true;
                            if notifications
                                .send(Notification::SessionStuck { idle_for })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}
