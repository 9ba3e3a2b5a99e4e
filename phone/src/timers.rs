use std::{collections::HashMap, time::Duration};

use ota_common::TimerKind;
use tokio::{sync::mpsc, task::AbortHandle};

use crate::session::SessionMsg;

/// Named, cancellable timers owned by one update session.
///
/// Expiries are delivered back into the session channel tagged with a
/// generation. An expiry that was already queued when its timer got
/// cancelled or re-armed carries a stale generation and is refused by
/// [`TimerTable::claim`].
pub struct TimerTable {
    tx: mpsc::UnboundedSender<SessionMsg>,
    armed: HashMap<TimerKind, (u64, AbortHandle)>,
    generation: u64,
}

impl TimerTable {
    pub fn new(tx: mpsc::UnboundedSender<SessionMsg>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            generation: 0,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionMsg::TimerFired { kind, generation });
        });
        self.armed.insert(kind, (generation, task.abort_handle()));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.armed.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Accepts an expiry only if it belongs to the currently armed timer of its kind.
    pub fn claim(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.armed.get(&kind) {
            Some((armed, _)) if *armed == generation => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    #[cfg(test)]
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_fired(msg: Option<SessionMsg>) -> (TimerKind, u64) {
        match msg {
            Some(SessionMsg::TimerFired { kind, generation }) => (kind, generation),
            other => panic!("expected timer expiry, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_delivers_claimable_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerTable::new(tx);

        timers.arm(TimerKind::Retry, Duration::from_secs(5));
        assert!(timers.is_armed(TimerKind::Retry));

        let (kind, generation) = expect_fired(rx.recv().await);
        assert_eq!(kind, TimerKind::Retry);
        assert!(timers.claim(kind, generation));
        assert!(!timers.is_armed(TimerKind::Retry));
        assert!(!timers.claim(kind, generation));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerTable::new(tx);

        timers.arm(TimerKind::Watchdog, Duration::from_secs(1));
        timers.cancel(TimerKind::Watchdog);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_supersedes_previous_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerTable::new(tx);

        timers.arm(TimerKind::Transition, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let (_, stale) = expect_fired(rx.recv().await);

        // The first expiry is already queued when the timer is re-armed.
        timers.arm(TimerKind::Transition, Duration::from_secs(10));
        assert!(!timers.claim(TimerKind::Transition, stale));

        let (_, fresh) = expect_fired(rx.recv().await);
        assert!(timers.claim(TimerKind::Transition, fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_every_kind() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerTable::new(tx);

        timers.arm(TimerKind::Retry, Duration::from_secs(1));
        timers.arm(TimerKind::Watchdog, Duration::from_secs(2));
        timers.arm(TimerKind::Restart, Duration::from_secs(3));
        timers.cancel_all();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(timers.armed_count(), 0);
        assert!(rx.try_recv().is_err());
    }
}
