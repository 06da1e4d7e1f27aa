//! Cooperative pause/resume/cancel control
//!
//! Workers poll the flag between case boundaries, never mid-provider-call;
//! a cancel therefore lands within one in-flight call plus one idempotent
//! write.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

/// What the user has asked the iteration to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Shared control flag
#[derive(Default)]
pub struct ControlFlag {
    state: AtomicU8,
    changed: Notify,
}

impl ControlFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> ControlSignal {
        match self.state.load(Ordering::SeqCst) {
            1 => ControlSignal::Pause,
            2 => ControlSignal::Cancel,
            _ => ControlSignal::Run,
        }
    }

    pub fn pause(&self) {
        self.state.store(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Resume from a pause; a cancel is never un-done
    pub fn resume(&self) {
        let _ = self.state.compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Cancellation is sticky; resume never clears it (a cancelled
    /// iteration is terminal)
    pub fn cancel(&self) {
        self.state.store(2, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Wait until the flag reads `Run` or `Cancel` (i.e. a paused consumer
    /// can proceed or must stop)
    pub async fn wait_unpaused(&self) -> ControlSignal {
        loop {
            let signal = self.signal();
            if signal != ControlSignal::Pause {
                return signal;
            }
            let _ = tokio::time::timeout(std::time::Duration::from_millis(50), self.changed.notified()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_signal_transitions() {
        let flag = ControlFlag::new();
        assert_eq!(flag.signal(), ControlSignal::Run);
        flag.pause();
        assert_eq!(flag.signal(), ControlSignal::Pause);
        flag.resume();
        assert_eq!(flag.signal(), ControlSignal::Run);
        flag.cancel();
        assert_eq!(flag.signal(), ControlSignal::Cancel);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let flag = ControlFlag::new();
        flag.cancel();
        flag.resume();
        assert_eq!(flag.signal(), ControlSignal::Cancel);
    }

    #[tokio::test]
    async fn test_wait_unpaused() {
        let flag = Arc::new(ControlFlag::new());
        flag.pause();

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait_unpaused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.resume();

        let signal = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(signal, ControlSignal::Run);
    }
}
