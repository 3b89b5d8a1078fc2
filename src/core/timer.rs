//! One-shot timers with race-free cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A one-shot timer. The callback re-arms by scheduling a replacement
/// timer from inside itself when appropriate.
#[derive(Debug)]
pub struct Timer {
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Run `callback` after `delay` unless cancelled first.
    pub fn schedule<F>(delay: Duration, callback: F) -> Timer
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Claim the firing slot; a concurrent cancel() that claimed it
            // first suppresses the callback.
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                callback.await;
            }
        });
        Timer { fired, handle }
    }

    /// Attempt to cancel. Returns `true` when the callback will never run;
    /// `false` when it already started (or finished), in which case the
    /// callback owns any cleanup.
    pub fn cancel(&self) -> bool {
        let won = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.handle.abort();
        }
        won
    }
}

/// The four logical timers a node runs.
#[derive(Debug, Default)]
pub struct TimerSet {
    pub election: Option<Timer>,
    pub vote: Option<Timer>,
    pub step_down: Option<Timer>,
    pub snapshot: Option<Timer>,
}

impl TimerSet {
    pub fn cancel_all(&mut self) {
        for timer in [
            self.election.take(),
            self.vote.take(),
            self.step_down.take(),
            self.snapshot.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _t = Timer::schedule(Duration::from_millis(50), async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_suppresses_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let t = Timer::schedule(Duration::from_millis(50), async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(t.cancel());
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_reports_loss() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let t = Timer::schedule(Duration::from_millis(10), async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert!(!t.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_cancel_is_a_no_op() {
        let t = Timer::schedule(Duration::from_millis(50), async {});
        assert!(t.cancel());
        assert!(!t.cancel());
    }
}
