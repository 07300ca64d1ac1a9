//! Barrier between a transport interruption and the moment every consumer has
//! finished reacting to it.
//!
//! Each interruption opens a new epoch expecting one completion signal per consumer
//! known at that time. Signals carry the epoch they answer, so a straggler from an
//! earlier interruption never completes a later one.

use tokio::sync::watch;

pub type Epoch = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    Stable,
    Interrupted,
    Failed,
}

#[derive(Clone, Copy, Debug)]
struct Phase {
    state: RecoveryState,
    epoch: Epoch,
    expected: usize,
    signaled: usize,
}

pub struct InterruptionCoordinator {
    phase: watch::Sender<Phase>,
}

impl Default for InterruptionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptionCoordinator {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase { state: RecoveryState::Stable, epoch: 0, expected: 0, signaled: 0 });
        Self { phase }
    }

    /// Opens a new epoch expecting `consumers` completion signals.
    pub fn begin(&self, consumers: usize) -> Epoch {
        let mut epoch = 0;
        self.phase.send_modify(|p| {
            p.epoch += 1;
            p.expected = consumers;
            p.signaled = 0;
            if p.state != RecoveryState::Failed {
                p.state = if consumers == 0 { RecoveryState::Stable } else { RecoveryState::Interrupted };
            }
            epoch = p.epoch;
        });
        log::debug!("transport interrupted, epoch {}, waiting on {} consumers", epoch, consumers);
        epoch
    }

    /// Counts one completion for `epoch`. Returns `false` for stale or surplus signals.
    pub fn signal(&self, epoch: Epoch) -> bool {
        self.phase.send_if_modified(|p| {
            if p.state != RecoveryState::Interrupted || p.epoch != epoch {
                log::debug!("ignoring interruption signal for epoch {}, current is {}", epoch, p.epoch);
                return false;
            }
            p.signaled += 1;
            if p.signaled >= p.expected {
                log::debug!("interruption processing complete for epoch {}", epoch);
                p.state = RecoveryState::Stable;
            }
            true
        })
    }

    /// Resolves once the current interruption, if any, is complete, released or failed.
    pub async fn wait_for_completion(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|p| p.state != RecoveryState::Interrupted).await;
    }

    /// Terminal: recovery will not complete. Releases waiters.
    pub fn fail(&self) {
        self.phase.send_modify(|p| p.state = RecoveryState::Failed);
    }

    /// Releases waiters without counting signals, used when the connection closes.
    pub fn release(&self) {
        self.phase.send_if_modified(|p| {
            if p.state == RecoveryState::Interrupted {
                p.state = RecoveryState::Stable;
                true
            } else {
                false
            }
        });
    }

    #[inline]
    pub fn state(&self) -> RecoveryState {
        self.phase.borrow().state
    }

    #[inline]
    pub fn epoch(&self) -> Epoch {
        self.phase.borrow().epoch
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.state() == RecoveryState::Interrupted
    }

    /// `(signaled, expected)` for the current epoch.
    #[inline]
    pub fn progress(&self) -> (usize, usize) {
        let p = self.phase.borrow();
        (p.signaled, p.expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn unblocks_on_the_nth_signal_of_the_current_epoch() {
        let c = Arc::new(InterruptionCoordinator::new());
        let epoch = c.begin(3);
        assert!(c.is_interrupted());

        let done = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (c, done) = (c.clone(), done.clone());
            tokio::spawn(async move {
                c.wait_for_completion().await;
                done.store(true, Ordering::SeqCst);
            })
        };

        assert!(c.signal(epoch));
        assert!(c.signal(epoch));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(c.progress(), (2, 3));

        assert!(c.signal(epoch));
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(c.state(), RecoveryState::Stable);
        assert!(!c.signal(epoch));
    }

    #[tokio::test]
    async fn stale_epoch_signals_do_not_count() {
        let c = InterruptionCoordinator::new();
        let first = c.begin(2);
        c.signal(first);
        let second = c.begin(1);
        assert_ne!(first, second);

        assert!(!c.signal(first));
        assert!(c.is_interrupted());
        assert!(c.signal(second));
        assert!(!c.is_interrupted());
        tokio::time::timeout(Duration::from_millis(100), c.wait_for_completion()).await.unwrap();
    }

    #[tokio::test]
    async fn no_consumers_means_nothing_to_wait_for() {
        let c = InterruptionCoordinator::new();
        c.begin(0);
        assert_eq!(c.state(), RecoveryState::Stable);
        tokio::time::timeout(Duration::from_millis(100), c.wait_for_completion()).await.unwrap();
    }

    #[tokio::test]
    async fn release_and_fail_wake_waiters() {
        let c = Arc::new(InterruptionCoordinator::new());
        c.begin(5);
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_for_completion().await })
        };
        c.release();
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();

        c.begin(5);
        c.fail();
        assert_eq!(c.state(), RecoveryState::Failed);
        tokio::time::timeout(Duration::from_millis(100), c.wait_for_completion()).await.unwrap();
        c.begin(1);
        assert_eq!(c.state(), RecoveryState::Failed);
    }
}
