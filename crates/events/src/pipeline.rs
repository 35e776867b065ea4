//! Handler pipeline boundary (application side of the delivery loop).

use std::sync::Arc;

use crate::context::{ErrorContext, MessageContext};

/// Verdict of the error policy for one failed dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorVerdict {
    /// The failure was dealt with (logged, parked, dead-lettered, ...); stop retrying.
    Handled,
    /// Redispatch the same event.
    NotHandled,
}

/// Application handler pipeline the delivery loop dispatches into.
///
/// The engine never resolves a pipeline through global state; one is injected
/// into the subscriber at construction time and shared by every delivery.
///
/// ## Delivery guarantees
///
/// Dispatch is at-least-once: a failed dispatch whose error is not handled is
/// retried with the same event, and a crash before acknowledgment causes the
/// log to redeliver. Handlers must be idempotent.
///
/// ## Threading
///
/// `dispatch` runs on a worker thread owned by the delivery loop, possibly
/// concurrently for distinct events (bounded by the concurrency gate). Events
/// of one origin stream reach the delivery loop in log order, but once handed
/// to worker threads their dispatches may overlap.
pub trait HandlerPipeline: Send + Sync {
    /// Handle one delivery attempt.
    fn dispatch(&self, context: &mut MessageContext) -> anyhow::Result<()>;

    /// Decide whether a failed attempt has been dealt with.
    ///
    /// `context.attempt()` starts at 1 and grows by one per failure of the same
    /// event; there is no built-in cap, so escalation (parking, dead-lettering)
    /// is this method's decision.
    fn on_error(&self, context: &ErrorContext) -> ErrorVerdict;
}

impl<P> HandlerPipeline for Arc<P>
where
    P: HandlerPipeline + ?Sized,
{
    fn dispatch(&self, context: &mut MessageContext) -> anyhow::Result<()> {
        (**self).dispatch(context)
    }

    fn on_error(&self, context: &ErrorContext) -> ErrorVerdict {
        (**self).on_error(context)
    }
}
