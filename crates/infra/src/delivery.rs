//! Delivery loop: per-event state machine from arrival to acknowledgment.
//!
//! ```text
//! Received ──(payload not JSON)──────────────────────────────► Skipped (ack)
//!    │
//!    ├─► decode descriptor
//!    ├─► acquire gate permit (blocks the log client's thread)
//!    └─► spawn unit of work, return to the log client
//!              │
//!              loop {
//!                dispatch ──ok──► Succeeded
//!                   │err
//!                   ▼
//!                on_error(attempt) ──handled──► Handled
//!                   │not handled
//!                   └─► cancelled? ──yes──► Abandoned (no ack)
//!              }
//!              ack (Succeeded | Handled), then release permit
//! ```
//!
//! ## Rules
//! - Attempt numbers start at 1 and grow by one per dispatch of the same event
//! - There is no attempt cap: retrying stops only on `Handled` or cancellation
//! - Handler failures never leave the loop; a panicking dispatch counts as a
//!   failed attempt
//! - Each accepted event is acknowledged at most once, and only after a
//!   terminal outcome; the permit is released after the acknowledgment

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use eventline_events::{
    Descriptor, ErrorContext, ErrorVerdict, HandlerPipeline, MessageContext, SharedRecord,
};

use crate::gate::{ConcurrencyGate, GateError, GatePermit};
use crate::log::EventCallback;
use crate::subscription::Acknowledger;

/// Result of a single dispatch attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed and the error policy did not handle it.
    Retry,
    /// Failed and the error policy handled it.
    Handled,
}

/// Final state of one delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Payload was not structured; acknowledged without dispatch.
    Skipped,
    Succeeded { attempts: u32 },
    Handled { attempts: u32 },
    /// Cancellation fired before a terminal verdict; not acknowledged.
    Abandoned { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryOutcome::Abandoned { .. })
    }
}

/// What the delivery callback did with an arriving record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    Skipped,
    /// Handed to a unit of work holding a permit.
    Accepted,
    /// Not accepted (cancelled, gate closed, or no worker thread); the log
    /// redelivers it later.
    Refused,
}

/// Drives records from the log client into the handler pipeline.
pub struct DeliveryLoop {
    gate: Arc<ConcurrencyGate>,
    pipeline: Arc<dyn HandlerPipeline>,
    acknowledger: Acknowledger,
    cancel: CancellationToken,
}

impl DeliveryLoop {
    pub fn new(
        gate: Arc<ConcurrencyGate>,
        pipeline: Arc<dyn HandlerPipeline>,
        acknowledger: Acknowledger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gate,
            pipeline,
            acknowledger,
            cancel,
        }
    }

    /// Delivery callback to register on the live connection.
    pub fn into_callback(self: Arc<Self>) -> EventCallback {
        Arc::new(move |record| {
            self.on_event(record);
        })
    }

    /// Handle one record on the log client's thread.
    ///
    /// Occupies the calling thread only for decode and permit acquisition;
    /// dispatch runs on a separate worker thread.
    pub fn on_event(self: &Arc<Self>, record: SharedRecord) -> Admission {
        if !record.is_json() {
            trace!(event_id = %record.event_id(), event_type = %record.event_type(), "skipping non-structured entry");
            self.acknowledge(&record);
            return Admission::Skipped;
        }

        let descriptor = match Descriptor::decode(record.metadata()) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(event_id = %record.event_id(), error = %e, "undecodable metadata; delivering without descriptor headers");
                Descriptor::default()
            }
        };

        let permit = match self.gate.acquire(&self.cancel) {
            Ok(permit) => permit,
            Err(GateError::Cancelled) => {
                debug!(event_id = %record.event_id(), "cancelled; not accepting");
                return Admission::Refused;
            }
            Err(GateError::Closed) => {
                debug!(event_id = %record.event_id(), "gate closed; not accepting");
                return Admission::Refused;
            }
        };

        let this = Arc::clone(self);
        let event_id = record.event_id();
        let spawned = thread::Builder::new()
            .name(format!("delivery-{event_id}"))
            .spawn(move || {
                this.complete(record, descriptor, permit);
            });

        match spawned {
            Ok(_) => Admission::Accepted,
            Err(e) => {
                // The closure (and its permit) was dropped with the failed spawn.
                error!(event_id = %event_id, error = %e, "failed to spawn delivery worker");
                Admission::Refused
            }
        }
    }

    /// Run a record to its outcome, acknowledge if terminal, then release the permit.
    pub fn complete(&self, record: SharedRecord, descriptor: Descriptor, permit: GatePermit) -> DeliveryOutcome {
        let outcome = self.run_attempts(&record, &descriptor);
        if outcome.is_terminal() {
            self.acknowledge(&record);
        } else {
            debug!(event_id = %record.event_id(), ?outcome, "delivery abandoned without acknowledgment");
        }
        drop(permit);
        outcome
    }

    /// Dispatch until success, a handled failure, or cancellation.
    pub fn run_attempts(&self, record: &SharedRecord, descriptor: &Descriptor) -> DeliveryOutcome {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.attempt(record, descriptor, attempt) {
                AttemptOutcome::Succeeded => return DeliveryOutcome::Succeeded { attempts: attempt },
                AttemptOutcome::Handled => return DeliveryOutcome::Handled { attempts: attempt },
                AttemptOutcome::Retry if self.cancel.is_cancelled() => {
                    return DeliveryOutcome::Abandoned { attempts: attempt };
                }
                AttemptOutcome::Retry => continue,
            }
        }
    }

    fn attempt(&self, record: &SharedRecord, descriptor: &Descriptor, attempt: u32) -> AttemptOutcome {
        let mut context = MessageContext::new(Arc::clone(record), descriptor, self.cancel.clone());

        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| self.pipeline.dispatch(&mut context)))
            .unwrap_or_else(|payload| Err(anyhow!("handler panicked: {}", panic_message(&*payload))));

        match dispatched {
            Ok(()) => {
                trace!(event_id = %record.event_id(), attempt, "dispatched");
                AttemptOutcome::Succeeded
            }
            Err(e) => {
                warn!(
                    event_id = %record.event_id(),
                    event_type = %record.event_type(),
                    attempt,
                    error = %e,
                    "dispatch failed"
                );
                let failure = ErrorContext::from_failure(context, e, attempt);
                match self.pipeline.on_error(&failure) {
                    ErrorVerdict::Handled => AttemptOutcome::Handled,
                    ErrorVerdict::NotHandled => AttemptOutcome::Retry,
                }
            }
        }
    }

    fn acknowledge(&self, record: &SharedRecord) {
        if let Err(e) = self.acknowledger.acknowledge(record) {
            error!(event_id = %record.event_id(), group = %self.acknowledger.group(), error = %e, "acknowledge failed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
