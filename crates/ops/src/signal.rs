//! Single-slot completion channel for one in-flight mutation.

use std::time::Duration;

use tokio::sync::mpsc;

/// Trivial token delivered when the awaited post-condition is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("no convergence within {0:?}")]
    TimedOut(Duration),
    /// The signaling side was dropped without signaling.
    #[error("signal abandoned")]
    Abandoned,
}

/// Writer half, held by the matcher inside a pending operation.
#[derive(Debug)]
pub struct SignalSender {
    tx: mpsc::Sender<ConvergenceToken>,
}

/// Reader half, held by the caller blocked on the mutation.
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::Receiver<ConvergenceToken>,
}

/// Create a fresh signal. Signals are never reused.
pub fn convergence_signal() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (SignalSender { tx }, SignalReceiver { rx })
}

impl SignalSender {
    /// Buffer one token without blocking. Returns false when a token is already
    /// buffered or the receiver is gone; both cases are no-ops.
    pub fn signal(&self) -> bool {
        self.tx.try_send(ConvergenceToken).is_ok()
    }
}

impl SignalReceiver {
    /// Take a buffered token if one is present.
    pub fn try_take(&mut self) -> Option<ConvergenceToken> {
        self.rx.try_recv().ok()
    }

    /// Consume the signal. `None` waits without bound.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<ConvergenceToken, SignalError> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx.recv()).await.map_err(|_| SignalError::TimedOut(limit))?,
            None => self.rx.recv().await,
        };
        received.ok_or(SignalError::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_signal_is_a_noop() {
        let (tx, rx) = convergence_signal();
        assert!(tx.signal());
        assert!(!tx.signal());
        assert_eq!(rx.wait(Some(Duration::from_millis(10))).await, Ok(ConvergenceToken));
    }

    #[tokio::test]
    async fn token_survives_sender_drop() {
        let (tx, rx) = convergence_signal();
        tx.signal();
        drop(tx);
        assert_eq!(rx.wait(None).await, Ok(ConvergenceToken));
    }

    #[tokio::test]
    async fn dropped_sender_abandons_waiter() {
        let (tx, rx) = convergence_signal();
        drop(tx);
        assert_eq!(rx.wait(None).await, Err(SignalError::Abandoned));
    }

    #[tokio::test]
    async fn wait_times_out() {
        let (_tx, rx) = convergence_signal();
        let limit = Duration::from_millis(20);
        assert_eq!(rx.wait(Some(limit)).await, Err(SignalError::TimedOut(limit)));
    }

    #[tokio::test]
    async fn signal_after_consumption_is_dropped() {
        let (tx, mut rx) = convergence_signal();
        assert!(rx.try_take().is_none());
        tx.signal();
        assert_eq!(rx.try_take(), Some(ConvergenceToken));
        drop(rx);
        assert!(!tx.signal());
    }

    #[tokio::test]
    async fn signal_from_another_task_wakes_waiter() {
        let (tx, rx) = convergence_signal();
        let waiter = tokio::spawn(rx.wait(Some(Duration::from_secs(2))));
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.signal();
        assert_eq!(waiter.await.expect("join"), Ok(ConvergenceToken));
    }
}
