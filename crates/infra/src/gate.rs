//! Concurrency gate: a bounded permit pool for in-flight deliveries.
//!
//! The pool is a bounded channel pre-filled with `max` tokens. Acquiring a
//! permit takes a token (blocking the calling thread while none is left);
//! dropping the permit puts it back. Because acquisition happens on the log
//! client's delivery thread, a saturated gate stalls that thread and with it
//! the rate at which the client pushes new events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How often a blocked acquisition re-checks the cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("permit acquisition cancelled")]
    Cancelled,

    #[error("concurrency gate closed")]
    Closed,
}

/// Bounded permit pool shared by all deliveries of one subscriber.
#[derive(Debug)]
pub struct ConcurrencyGate {
    max: usize,
    tokens_tx: Sender<()>,
    tokens_rx: Receiver<()>,
    closed: AtomicBool,
    /// Dropped on close so blocked acquirers wake up immediately.
    close_signal: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl ConcurrencyGate {
    /// Create a gate with `max` permits (at least one).
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        let (tokens_tx, tokens_rx) = channel::bounded(max);
        for _ in 0..max {
            // Capacity equals the token count, so this never fails.
            let _ = tokens_tx.try_send(());
        }
        let (close_tx, close_rx) = channel::bounded(0);

        Self {
            max,
            tokens_tx,
            tokens_rx,
            closed: AtomicBool::new(false),
            close_signal: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.max - self.tokens_rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Block until a permit is free, the token is cancelled, or the gate closes.
    pub fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        loop {
            if self.is_closed() {
                return Err(GateError::Closed);
            }
            if cancel.is_cancelled() {
                return Err(GateError::Cancelled);
            }

            crossbeam::select! {
                recv(self.tokens_rx) -> token => {
                    return match token {
                        Ok(()) if self.is_closed() => {
                            let _ = self.tokens_tx.try_send(());
                            Err(GateError::Closed)
                        }
                        Ok(()) => Ok(self.permit()),
                        Err(_) => Err(GateError::Closed),
                    };
                }
                recv(self.close_rx) -> _ => return Err(GateError::Closed),
                default(CANCEL_POLL) => {}
            }
        }
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Result<Option<GatePermit>, GateError> {
        if self.is_closed() {
            return Err(GateError::Closed);
        }
        match self.tokens_rx.try_recv() {
            Ok(()) => Ok(Some(self.permit())),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(GateError::Closed),
        }
    }

    /// Refuse further acquisitions and wake blocked acquirers. Idempotent.
    ///
    /// Permits already handed out stay valid and are returned on drop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut signal = self
            .close_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        signal.take();
    }

    fn permit(&self) -> GatePermit {
        GatePermit {
            tokens: self.tokens_tx.clone(),
        }
    }
}

/// One held slot of the gate. Released exactly once, when dropped.
#[derive(Debug)]
pub struct GatePermit {
    tokens: Sender<()>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let _ = self.tokens.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn permits_are_returned_on_drop() {
        let gate = ConcurrencyGate::new(2);
        let cancel = CancellationToken::new();

        let a = gate.acquire(&cancel).unwrap();
        let b = gate.acquire(&cancel).unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert!(gate.try_acquire().unwrap().is_none());

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn zero_is_treated_as_one() {
        assert_eq!(ConcurrencyGate::new(0).max(), 1);
    }

    #[test]
    fn blocked_acquire_returns_on_cancel() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).unwrap();

        let (g, c) = (Arc::clone(&gate), cancel.clone());
        let waiter = thread::spawn(move || g.acquire(&c).map(|_| ()));
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        assert_eq!(waiter.join().unwrap(), Err(GateError::Cancelled));
    }

    #[test]
    fn blocked_acquire_returns_on_close() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).unwrap();

        let g = Arc::clone(&gate);
        let started = Instant::now();
        let waiter = thread::spawn(move || g.acquire(&CancellationToken::new()).map(|_| ()));
        thread::sleep(Duration::from_millis(50));
        gate.close();
        gate.close();

        assert_eq!(waiter.join().unwrap(), Err(GateError::Closed));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(gate.try_acquire().unwrap_err(), GateError::Closed);
    }

    #[test]
    fn blocked_acquire_proceeds_when_a_permit_is_released() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let cancel = CancellationToken::new();
        let held = gate.acquire(&cancel).unwrap();

        let (g, c) = (Arc::clone(&gate), cancel.clone());
        let waiter = thread::spawn(move || g.acquire(&c).is_ok());
        thread::sleep(Duration::from_millis(30));
        drop(held);

        assert!(waiter.join().unwrap());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 24,
                ..ProptestConfig::default()
            })]

            /// Property: no more than `max` permits are ever held at once.
            #[test]
            fn outstanding_permits_never_exceed_max(max in 1usize..6, workers in 1usize..16) {
                let gate = Arc::new(ConcurrencyGate::new(max));
                let current = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));

                let handles: Vec<_> = (0..workers)
                    .map(|_| {
                        let (gate, current, peak) = (Arc::clone(&gate), Arc::clone(&current), Arc::clone(&peak));
                        thread::spawn(move || {
                            let cancel = CancellationToken::new();
                            for _ in 0..5 {
                                let _permit = gate.acquire(&cancel).unwrap();
                                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::yield_now();
                                current.fetch_sub(1, Ordering::SeqCst);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }

                prop_assert!(peak.load(Ordering::SeqCst) <= max);
                prop_assert_eq!(gate.in_flight(), 0);
            }
        }
    }
}
