//! Consumer-group management and live connections.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use eventline_events::EventRecord;

use crate::error::EngineError;
use crate::log::{
    ConsumerGroupSettings, DistributionStrategy, DropCallback, DurableLog, EventCallback,
    LiveConnection, LogError, StartPosition,
};

/// Fixed checkpoint interval of every consumer group the engine creates.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(15);

/// Callbacks registered on a live connection.
#[derive(Clone)]
pub struct DeliveryCallbacks {
    pub on_event: EventCallback,
    pub on_drop: DropCallback,
}

/// Acknowledgment reference for one consumer group.
///
/// Cheap to clone; usable before the live connection exists, so the
/// delivery loop can be built ahead of `connect`.
#[derive(Clone)]
pub struct Acknowledger {
    log: Arc<dyn DurableLog>,
    target: String,
    group: String,
}

impl Acknowledger {
    pub fn new(log: Arc<dyn DurableLog>, stream_name: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        Self {
            log,
            target: stream_name.clone(),
            group: stream_name,
        }
    }

    pub fn acknowledge(&self, record: &EventRecord) -> Result<(), LogError> {
        self.log.acknowledge(&self.target, &self.group, record)
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl core::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("target", &self.target)
            .field("group", &self.group)
            .finish()
    }
}

/// A live subscription to a consumer group.
pub struct SubscriptionHandle {
    stream_name: String,
    acknowledger: Acknowledger,
    connection: Box<dyn LiveConnection>,
}

impl SubscriptionHandle {
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn is_live(&self) -> bool {
        !self.connection.is_stopped()
    }

    pub fn acknowledge(&self, record: &EventRecord) -> Result<(), LogError> {
        self.acknowledger.acknowledge(record)
    }

    pub fn acknowledger(&self) -> Acknowledger {
        self.acknowledger.clone()
    }

    /// Stop the live connection, waiting at most `grace`. Idempotent.
    pub fn stop(&self, grace: Duration) -> Result<(), LogError> {
        self.connection.stop(grace)
    }
}

impl core::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("stream_name", &self.stream_name)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Ensures the endpoint's consumer group exists and opens live connections.
pub struct SubscriptionManager {
    log: Arc<dyn DurableLog>,
}

impl SubscriptionManager {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self { log }
    }

    /// Consumer-group settings for a read batch size.
    ///
    /// The live buffer holds `read_batch_size²` entries; new groups start at
    /// the current tail and use pinned distribution so one origin stream is
    /// always served by the same consumer.
    pub fn settings_for(read_batch_size: usize) -> ConsumerGroupSettings {
        ConsumerGroupSettings {
            read_batch_size,
            live_buffer_size: read_batch_size.saturating_mul(read_batch_size),
            checkpoint_after: CHECKPOINT_INTERVAL,
            resolve_links: true,
            start_from: StartPosition::Tail,
            strategy: DistributionStrategy::Pinned,
        }
    }

    pub fn acknowledger(&self, stream_name: &str) -> Acknowledger {
        Acknowledger::new(Arc::clone(&self.log), stream_name)
    }

    /// Create the consumer group named after the routing target (idempotent).
    pub fn ensure_consumer_group(&self, stream_name: &str, read_batch_size: usize) -> Result<(), EngineError> {
        let settings = Self::settings_for(read_batch_size);
        match self.log.create_consumer_group(stream_name, stream_name, &settings) {
            Ok(()) => {
                info!(
                    group = %stream_name,
                    read_batch_size,
                    live_buffer_size = settings.live_buffer_size,
                    "consumer group created"
                );
                Ok(())
            }
            Err(LogError::AlreadyExists(_)) => {
                debug!(group = %stream_name, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure the consumer group and open a live connection to it.
    ///
    /// Automatic acknowledgment is disabled: every delivered record must be
    /// acknowledged by the caller (see [`Acknowledger`]).
    #[instrument(skip(self, cancel, callbacks), err)]
    pub fn connect(
        &self,
        stream_name: &str,
        read_batch_size: usize,
        cancel: &CancellationToken,
        callbacks: DeliveryCallbacks,
    ) -> Result<SubscriptionHandle, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.ensure_consumer_group(stream_name, read_batch_size)?;

        let connection = self.log.connect_consumer_group(
            stream_name,
            stream_name,
            callbacks.on_event,
            callbacks.on_drop,
            false,
        )?;
        info!(group = %stream_name, "subscription live");

        Ok(SubscriptionHandle {
            stream_name: stream_name.to_string(),
            acknowledger: self.acknowledger(stream_name),
            connection,
        })
    }
}

#[cfg(test)]
mod tests {
    use eventline_events::{NewEvent, SharedRecord};

    use super::*;
    use crate::log::{DropReason, InMemoryLog, RoutingAdmin};
    use crate::routing::RoutingDefinition;
    use crate::test_support::wait_until;

    fn callbacks() -> DeliveryCallbacks {
        DeliveryCallbacks {
            on_event: Arc::new(|_: SharedRecord| {}),
            on_drop: Arc::new(|_: DropReason, _: Option<LogError>| {}),
        }
    }

    fn provisioned_log() -> (InMemoryLog, String) {
        let log = InMemoryLog::new();
        log.connect().unwrap();
        let def = RoutingDefinition::new("demo", "1.0.0.0", ["Ping"]).unwrap();
        log.create_definition(def.stream_name(), def.text()).unwrap();
        (log, def.stream_name().to_string())
    }

    #[test]
    fn settings_follow_read_batch_size() {
        let settings = SubscriptionManager::settings_for(100);
        assert_eq!(settings.read_batch_size, 100);
        assert_eq!(settings.live_buffer_size, 10_000);
        assert_eq!(settings.checkpoint_after, Duration::from_secs(15));
        assert!(settings.resolve_links);
        assert_eq!(settings.start_from, StartPosition::Tail);
        assert_eq!(settings.strategy, DistributionStrategy::Pinned);
    }

    #[test]
    fn live_buffer_saturates() {
        assert_eq!(SubscriptionManager::settings_for(usize::MAX).live_buffer_size, usize::MAX);
    }

    #[test]
    fn group_is_named_after_stream_and_creation_is_idempotent() {
        let (log, stream) = provisioned_log();
        let manager = SubscriptionManager::new(Arc::new(log.clone()));

        manager.ensure_consumer_group(&stream, 100).unwrap();
        manager.ensure_consumer_group(&stream, 100).unwrap();

        let settings = log.consumer_group_settings("demo.1.0.0.0", "demo.1.0.0.0").unwrap();
        assert_eq!(settings.live_buffer_size, 10_000);
    }

    #[test]
    fn connect_opens_manual_ack_connection() {
        let (log, stream) = provisioned_log();
        let manager = SubscriptionManager::new(Arc::new(log.clone()));

        let handle = manager
            .connect(&stream, 10, &CancellationToken::new(), callbacks())
            .unwrap();
        assert!(handle.is_live());

        let record = log.append("p-1", NewEvent::json("Ping", &1).unwrap());
        // Delivered but never auto-acknowledged.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(log.acknowledgments(&stream, &stream, record.event_id()), 0);

        handle.acknowledge(&record).unwrap();
        assert_eq!(log.acknowledgments(&stream, &stream, record.event_id()), 1);

        handle.stop(Duration::from_secs(1)).unwrap();
        handle.stop(Duration::from_secs(1)).unwrap();
        assert!(wait_until(Duration::from_secs(1), || !handle.is_live()));
    }

    #[test]
    fn cancelled_token_prevents_connect() {
        let (log, stream) = provisioned_log();
        let manager = SubscriptionManager::new(Arc::new(log));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            manager.connect(&stream, 10, &cancel, callbacks()),
            Err(EngineError::Cancelled)
        ));
    }
}
