//! Shared test doubles.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use eventline_events::{
    ErrorContext, ErrorVerdict, HandlerPipeline, Headers, MessageContext, SharedRecord,
};

/// Poll `condition` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Scripted pipeline that records what it was handed.
#[derive(Default)]
pub(crate) struct RecordingPipeline {
    /// Dispatches that fail before the first success; `None` fails forever.
    fail_first: Option<usize>,
    handled_at: Option<u32>,
    cancel_at: Option<(usize, CancellationToken)>,
    /// Dispatches that panic before any other behaviour applies.
    panic_first: usize,
    delay: Duration,

    dispatches: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    error_attempts: Mutex<Vec<u32>>,
    errors: Mutex<Vec<String>>,
    headers: Mutex<Vec<Headers>>,
    records: Mutex<Vec<SharedRecord>>,
}

impl RecordingPipeline {
    pub(crate) fn succeeding() -> Self {
        Self {
            fail_first: Some(0),
            ..Self::default()
        }
    }

    pub(crate) fn failing_first(n: usize) -> Self {
        Self {
            fail_first: Some(n),
            ..Self::default()
        }
    }

    pub(crate) fn always_failing() -> Self {
        Self::default()
    }

    /// Error policy reports `Handled` from this attempt on.
    pub(crate) fn handled_at(mut self, attempt: u32) -> Self {
        self.handled_at = Some(attempt);
        self
    }

    /// Fire `token` during the `n`th dispatch.
    pub(crate) fn cancel_at(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_at = Some((n, token));
        self
    }

    pub(crate) fn panicking_first(mut self, n: usize) -> Self {
        self.panic_first = n;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn error_attempts(&self) -> Vec<u32> {
        self.error_attempts.lock().unwrap().clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub(crate) fn headers(&self) -> Vec<Headers> {
        self.headers.lock().unwrap().clone()
    }

    /// Records in dispatch order (retries included).
    pub(crate) fn records(&self) -> Vec<SharedRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl HandlerPipeline for RecordingPipeline {
    fn dispatch(&self, ctx: &mut MessageContext) -> anyhow::Result<()> {
        let n = self.dispatches.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        self.headers.lock().unwrap().push(ctx.headers().clone());
        self.records.lock().unwrap().push(ctx.record().clone());

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if let Some((at, token)) = &self.cancel_at {
            if n == *at {
                token.cancel();
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if n <= self.panic_first {
            panic!("scripted panic on dispatch {n}");
        }
        match self.fail_first {
            Some(limit) if n > limit + self.panic_first => Ok(()),
            _ => Err(anyhow!("scripted failure on dispatch {n}")),
        }
    }

    fn on_error(&self, ctx: &ErrorContext) -> ErrorVerdict {
        self.error_attempts.lock().unwrap().push(ctx.attempt());
        self.errors.lock().unwrap().push(ctx.error().to_string());
        match self.handled_at {
            Some(at) if ctx.attempt() >= at => ErrorVerdict::Handled,
            _ => ErrorVerdict::NotHandled,
        }
    }
}
