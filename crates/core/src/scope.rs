//! Per-round cancellation.
//!
//! Every delay or wait that belongs to a round goes through that round's
//! [`CancellationScope`]. Starting a new round or a retry signals the previous
//! scope, so a continuation left over from an older round wakes up with
//! [`Cancelled`] instead of mutating state that now belongs to a newer one.

use crate::sync::lock;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("round scope {0} was superseded")]
pub struct Cancelled(pub u64);

#[derive(Debug, Clone)]
pub struct CancellationScope {
    id: u64,
    token: CancellationToken,
}

impl CancellationScope {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resumption check: every step of a multi-step sequence calls this before
    /// producing a side effect.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_live() {
            Ok(())
        } else {
            Err(Cancelled(self.id))
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drives `future` unless the scope is signalled first.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Cancelled(self.id)),
            output = future => Ok(output),
        }
    }
}

/// Hands out one scope at a time. Beginning a scope signals the one before it.
#[derive(Debug, Default)]
pub struct ScopeChain {
    state: Mutex<ChainState>,
}

#[derive(Debug, Default)]
struct ChainState {
    next_id: u64,
    current: Option<CancellationScope>,
}

impl ScopeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> CancellationScope {
        let mut state = lock(&self.state);
        if let Some(previous) = state.current.take() {
            previous.token.cancel();
        }
        state.next_id += 1;
        let scope = CancellationScope {
            id: state.next_id,
            token: CancellationToken::new(),
        };
        state.current = Some(scope.clone());
        tracing::debug!("began round scope {}", scope.id);
        scope
    }

    pub fn current(&self) -> Option<CancellationScope> {
        lock(&self.state).current.clone()
    }

    /// Signals the current scope without starting a replacement.
    pub fn close(&self) {
        if let Some(scope) = lock(&self.state).current.take() {
            scope.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn beginning_a_scope_cancels_pending_waits_of_the_previous_one() {
        let chain = ScopeChain::new();
        let first = chain.begin();
        let waiter = {
            let first = first.clone();
            tokio::spawn(async move { first.sleep(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;

        let second = chain.begin();

        assert_eq!(waiter.await.unwrap(), Err(Cancelled(first.id())));
        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(chain.current().map(|s| s.id()), Some(second.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn live_scope_lets_sleeps_finish() {
        let chain = ScopeChain::new();
        let scope = chain.begin();
        assert_eq!(scope.sleep(Duration::from_millis(500)).await, Ok(()));
        assert_eq!(scope.check(), Ok(()));
    }

    #[test]
    fn close_leaves_no_current_scope() {
        let chain = ScopeChain::new();
        let scope = chain.begin();
        chain.close();
        assert!(chain.current().is_none());
        assert_eq!(scope.check(), Err(Cancelled(scope.id())));
    }
}
