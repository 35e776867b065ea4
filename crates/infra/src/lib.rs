//! Subscription and delivery engine: routing provisioning, consumer groups,
//! bounded-concurrency delivery, drop detection.

pub mod delivery;
pub mod drop_detector;
pub mod error;
pub mod gate;
pub mod log;
pub mod routing;
pub mod subscriber;
pub mod subscription;

#[cfg(test)]
pub(crate) mod test_support;


pub use delivery::{Admission, AttemptOutcome, DeliveryLoop, DeliveryOutcome};
pub use drop_detector::{DropDetector, DroppedListener};
pub use error::EngineError;
pub use gate::{ConcurrencyGate, GateError, GatePermit};
pub use log::{
    ConsumerGroupSettings, DistributionStrategy, DropReason, DurableLog, InMemoryLog,
    LiveConnection, LogError, RoutingAdmin, StartPosition,
};
pub use routing::{RoutingDefinition, RoutingProvisioner, RoutingSpec};
pub use subscriber::EventSubscriber;
pub use subscription::{
    Acknowledger, CHECKPOINT_INTERVAL, DeliveryCallbacks, SubscriptionHandle, SubscriptionManager,
};
