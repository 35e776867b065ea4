//! The engine's lifecycle surface: setup, subscribe, dispose.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use eventline_core::SubscriberConfig;
use eventline_events::{HandlerPipeline, TypeRegistry};

use crate::delivery::DeliveryLoop;
use crate::drop_detector::{DropDetector, DroppedListener};
use crate::error::EngineError;
use crate::gate::ConcurrencyGate;
use crate::log::{DropReason, DurableLog, LogError, RoutingAdmin};
use crate::routing::{RoutingDefinition, RoutingProvisioner};
use crate::subscription::{DeliveryCallbacks, SubscriptionHandle, SubscriptionManager};

/// Consumer-side subscription engine for one endpoint version.
///
/// ```text
/// new ──► setup ──► subscribe ──► (live) ──► dispose
///                       ▲            │
///                       └── dropped ◄┘
/// ```
pub struct EventSubscriber {
    config: SubscriberConfig,
    log: Arc<dyn DurableLog>,
    admin: Arc<dyn RoutingAdmin>,
    pipeline: Arc<dyn HandlerPipeline>,
    gate: Arc<ConcurrencyGate>,
    processing_live: Arc<AtomicBool>,
    disposed: AtomicBool,
    listeners: Arc<RwLock<Vec<DroppedListener>>>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    definition: Option<RoutingDefinition>,
    active: Option<Active>,
}

struct Active {
    handle: SubscriptionHandle,
    cancel: CancellationToken,
    detector: Arc<DropDetector>,
}

impl EventSubscriber {
    pub fn new(
        log: Arc<dyn DurableLog>,
        admin: Arc<dyn RoutingAdmin>,
        pipeline: Arc<dyn HandlerPipeline>,
        config: SubscriberConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        Ok(Self {
            gate: Arc::new(ConcurrencyGate::new(config.max_parallel_deliveries)),
            config,
            log,
            admin,
            pipeline,
            processing_live: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
            listeners: Arc::new(RwLock::new(Vec::new())),
            state: Mutex::new(State::default()),
        })
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Connect the log client and provision the routing target for the
    /// registry's event types.
    ///
    /// Fails with [`EngineError::VersionConflict`] when the target exists
    /// with a different definition; the subscriber then stays un-set-up.
    #[instrument(skip(self, registry), fields(endpoint = %self.config.endpoint, version = %self.config.version), err)]
    pub fn setup(&self, registry: &dyn TypeRegistry) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }

        self.log.connect()?;

        let definition = RoutingProvisioner::new(Arc::clone(&self.admin)).provision(
            &self.config.endpoint,
            &self.config.version,
            &registry.event_types(),
        )?;
        info!(stream = %definition.stream_name(), types = definition.event_types().len(), "setup complete");

        self.lock_state().definition = Some(definition);
        Ok(())
    }

    /// Open the live subscription and start delivering.
    ///
    /// `cancel` stops new permit acquisitions and retry loops when fired;
    /// dispose cancels a child of it without touching the caller's token.
    pub fn subscribe(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }

        let mut state = self.lock_state();
        let stream_name = state
            .definition
            .as_ref()
            .map(|d| d.stream_name().to_string())
            .ok_or(EngineError::NotSetUp)?;

        if let Some(active) = &state.active {
            if active.handle.is_live() && !active.detector.has_fired() {
                return Err(EngineError::AlreadySubscribed);
            }
        }
        if let Some(stale) = state.active.take() {
            debug!(stream = %stream_name, "replacing dropped subscription");
            stale.cancel.cancel();
        }

        let manager = SubscriptionManager::new(Arc::clone(&self.log));
        let child = cancel.child_token();

        let delivery = Arc::new(DeliveryLoop::new(
            Arc::clone(&self.gate),
            Arc::clone(&self.pipeline),
            manager.acknowledger(&stream_name),
            child.clone(),
        ));
        let detector = Arc::new(DropDetector::new(
            Arc::clone(&self.processing_live),
            self.fan_out(),
        ));

        self.processing_live.store(true, Ordering::SeqCst);
        let connected = manager.connect(
            &stream_name,
            self.config.read_batch_size,
            &child,
            DeliveryCallbacks {
                on_event: delivery.into_callback(),
                on_drop: Arc::clone(&detector).into_callback(),
            },
        );

        match connected {
            Ok(handle) => {
                state.active = Some(Active {
                    handle,
                    cancel: child,
                    detector,
                });
                Ok(())
            }
            Err(e) => {
                self.processing_live.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stop the subscription and close the gate. Idempotent.
    ///
    /// Bounded by the configured grace period. Units of work already
    /// dispatching are not awaited; their acknowledgments may still land
    /// after this returns.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("already disposed");
            return;
        }

        let active = self.lock_state().active.take();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Err(e) = active.handle.stop(self.config.dispose_grace) {
                warn!(stream = %active.handle.stream_name(), error = %e, "live connection did not stop cleanly");
            }
        }

        self.gate.close();
        self.processing_live.store(false, Ordering::SeqCst);
        info!(endpoint = %self.config.endpoint, version = %self.config.version, "subscriber disposed");
    }

    pub fn processing_live(&self) -> bool {
        self.processing_live.load(Ordering::SeqCst)
    }

    /// Register a listener for the `Dropped` lifecycle event.
    pub fn on_dropped<F>(&self, listener: F)
    where
        F: Fn(DropReason, Option<LogError>) + Send + Sync + 'static,
    {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(listener)),
        }
    }

    /// Routing target name, once set up.
    pub fn stream_name(&self) -> Option<String> {
        self.lock_state()
            .definition
            .as_ref()
            .map(|d| d.stream_name().to_string())
    }

    /// Deliveries currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn fan_out(&self) -> DroppedListener {
        let listeners = Arc::clone(&self.listeners);
        Arc::new(move |reason, error| {
            let snapshot: Vec<DroppedListener> = match listeners.read() {
                Ok(l) => l.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            for listener in snapshot {
                listener(reason, error.clone());
            }
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl core::fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSubscriber")
            .field("config", &self.config)
            .field("processing_live", &self.processing_live())
            .field("in_flight", &self.in_flight())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
