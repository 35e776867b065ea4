//! Translates connection-drop notifications into the `Dropped` lifecycle event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::log::{DropCallback, DropReason, LogError};

/// Listener for the `Dropped` lifecycle event.
pub type DroppedListener = Arc<dyn Fn(DropReason, Option<LogError>) + Send + Sync>;

/// Watches one live connection for termination.
///
/// Whatever the cause, the first drop notification clears the
/// processing-live flag and fires the listener; later notifications for
/// the same connection are ignored and leave the flag alone, since it may
/// already belong to a newer subscription.
pub struct DropDetector {
    processing_live: Arc<AtomicBool>,
    fired: AtomicBool,
    notify: DroppedListener,
}

impl DropDetector {
    pub fn new(processing_live: Arc<AtomicBool>, notify: DroppedListener) -> Self {
        Self {
            processing_live,
            fired: AtomicBool::new(false),
            notify,
        }
    }

    pub fn on_drop(&self, reason: DropReason, error: Option<LogError>) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.processing_live.store(false, Ordering::SeqCst);

        match (&reason, &error) {
            (DropReason::SubscriberRequested, None) => info!(reason = %reason, "subscription dropped"),
            (_, Some(e)) => warn!(reason = %reason, error = %e, "subscription dropped"),
            (_, None) => warn!(reason = %reason, "subscription dropped"),
        }

        (self.notify)(reason, error);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Drop callback to register on the live connection.
    pub fn into_callback(self: Arc<Self>) -> DropCallback {
        Arc::new(move |reason, error| self.on_drop(reason, error))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording() -> (DroppedListener, Arc<Mutex<Vec<(DropReason, Option<LogError>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: DroppedListener = Arc::new(move |reason: DropReason, error: Option<LogError>| {
            sink.lock().unwrap().push((reason, error));
        });
        (listener, seen)
    }

    #[test]
    fn first_drop_clears_live_and_notifies() {
        let live = Arc::new(AtomicBool::new(true));
        let (listener, seen) = recording();
        let detector = DropDetector::new(Arc::clone(&live), listener);

        detector.on_drop(
            DropReason::ServerError,
            Some(LogError::Connection("reset by peer".into())),
        );

        assert!(!live.load(Ordering::SeqCst));
        assert!(detector.has_fired());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, DropReason::ServerError);
        assert_eq!(seen[0].1, Some(LogError::Connection("reset by peer".into())));
    }

    #[test]
    fn repeated_drops_fire_once() {
        let live = Arc::new(AtomicBool::new(true));
        let (listener, seen) = recording();
        let callback = Arc::new(DropDetector::new(Arc::clone(&live), listener)).into_callback();

        callback(DropReason::ConnectionClosed, None);
        callback(DropReason::SubscriberRequested, None);
        callback(DropReason::Unknown, None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, DropReason::ConnectionClosed);
    }

    #[test]
    fn late_duplicate_does_not_clear_a_newer_subscription() {
        let live = Arc::new(AtomicBool::new(true));
        let (listener, seen) = recording();
        let detector = DropDetector::new(Arc::clone(&live), listener);

        detector.on_drop(DropReason::ConnectionClosed, None);
        assert!(!live.load(Ordering::SeqCst));

        live.store(true, Ordering::SeqCst);
        detector.on_drop(DropReason::SubscriberRequested, None);

        assert!(live.load(Ordering::SeqCst));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
