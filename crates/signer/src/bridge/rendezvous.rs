use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

/// How a bootstrap wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Released,
    TimedOut,
    /// There was nothing to wait for: never armed, already awaited, or the
    /// slot was re-armed and this waiter abandoned.
    NotArmed,
}

/// Single-slot park/release primitive.
///
/// At most one waiter is recorded at a time. A release with no armed waiter
/// does nothing and is not remembered for a later `arm`.
#[derive(Debug, Default)]
pub struct Rendezvous {
    slot: Mutex<Option<oneshot::Sender<()>>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a waiter. Arm before sending the request whose reply will
    /// release it.
    pub fn arm(&self) -> Parked {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        Parked { rx }
    }

    /// Wakes the armed waiter. Returns whether one was armed.
    pub fn release(&self) -> bool {
        let waiter = self.slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        match waiter {
            // The waiter may already have timed out and dropped its receiver.
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// The waiting half handed out by [`Rendezvous::arm`].
#[derive(Debug)]
pub struct Parked {
    rx: oneshot::Receiver<()>,
}

impl Parked {
    /// Waits until released or until `timeout` elapses, whichever is first.
    pub async fn wait(self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => WaitOutcome::Released,
            Ok(Err(_)) => WaitOutcome::NotArmed,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}
