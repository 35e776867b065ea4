//! In-memory durable log for tests/dev.
//!
//! Implements the full client contract in-process:
//! - origin streams with per-stream sequence numbers and a global order
//! - routing definitions that link matching entries (exact type) into a
//!   target, backfilled from the start of the log on creation
//! - consumer groups with a start position, a checkpoint (first
//!   unacknowledged entry) and manual or automatic acknowledgment
//! - live connections with one reader thread and a fixed set of consumer
//!   threads; `Pinned` routes every origin stream to one consumer thread so
//!   per-stream order is kept
//!
//! No persistence, no replication. Not optimized for performance.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use eventline_core::EventId;
use eventline_events::{EventRecord, NewEvent, SharedRecord};

use super::{
    ConsumerGroupSettings, DistributionStrategy, DropCallback, DropReason, DurableLog,
    EventCallback, LiveConnection, LogError, RoutingAdmin, StartPosition,
};
use crate::routing::RoutingSpec;

const DEFAULT_CONSUMER_WORKERS: usize = 4;
const IDLE_WAIT: Duration = Duration::from_millis(50);
/// Per-consumer channel slots are allocated up front; larger live buffers are clamped.
const MAX_CONSUMER_BUFFER: usize = 4_096;

type GroupKey = (String, String);

fn group_key(target: &str, group: &str) -> GroupKey {
    (target.to_string(), group.to_string())
}

struct Route {
    text: String,
    spec: RoutingSpec,
}

struct GroupState {
    settings: ConsumerGroupSettings,
    /// Next target index handed to the live connection.
    cursor: usize,
    /// First target index not yet acknowledged.
    checkpoint: usize,
    acked: HashSet<EventId>,
    ack_counts: HashMap<EventId, u32>,
    ack_order: Vec<EventId>,
    live: Option<Arc<LiveShared>>,
}

#[derive(Default)]
struct LogState {
    connected: bool,
    streams: HashMap<String, Vec<SharedRecord>>,
    all: Vec<SharedRecord>,
    routes: BTreeMap<String, Route>,
    targets: HashMap<String, Vec<SharedRecord>>,
    groups: HashMap<GroupKey, GroupState>,
}

impl LogState {
    fn ensure_connected(&self) -> Result<(), LogError> {
        if self.connected {
            Ok(())
        } else {
            Err(LogError::Connection("client not connected".to_string()))
        }
    }

    /// Take the next batch of unacknowledged entries for a group.
    ///
    /// Returns `None` when the group no longer exists.
    fn next_batch(&mut self, target: &str, group: &str, batch: usize) -> Option<Vec<SharedRecord>> {
        let LogState { targets, groups, .. } = self;
        let state = groups.get_mut(&group_key(target, group))?;
        let entries = targets.get(target).map(Vec::as_slice).unwrap_or(&[]);

        let mut out = Vec::new();
        while state.cursor < entries.len() && out.len() < batch {
            let record = &entries[state.cursor];
            state.cursor += 1;
            if !state.acked.contains(&record.event_id()) {
                out.push(Arc::clone(record));
            }
        }
        Some(out)
    }
}

struct Shared {
    state: Mutex<LogState>,
    appended: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acknowledge(&self, target: &str, group: &str, record: &EventRecord) -> Result<(), LogError> {
        let mut state = self.lock();
        let LogState { targets, groups, .. } = &mut *state;

        let group_state = groups
            .get_mut(&group_key(target, group))
            .ok_or_else(|| LogError::NotFound(format!("{target}::{group}")))?;

        let id = record.event_id();
        *group_state.ack_counts.entry(id).or_insert(0) += 1;
        group_state.ack_order.push(id);
        group_state.acked.insert(id);

        if let Some(entries) = targets.get(target) {
            while group_state.checkpoint < entries.len()
                && group_state.acked.contains(&entries[group_state.checkpoint].event_id())
            {
                group_state.checkpoint += 1;
            }
        }
        Ok(())
    }
}

/// Per-connection flags shared by the connection handle and its threads.
struct LiveShared {
    stopped: AtomicBool,
    dropped: AtomicBool,
    on_drop: DropCallback,
}

impl LiveShared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns `true` if this call performed the stop.
    fn halt(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    fn notify_drop(&self, reason: DropReason, error: Option<LogError>) {
        if !self.dropped.swap(true, Ordering::SeqCst) {
            (self.on_drop)(reason, error);
        }
    }
}

/// Signals thread exit (including unwinding) to the connection handle.
struct DoneSignal(Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// In-process durable log.
#[derive(Clone)]
pub struct InMemoryLog {
    shared: Arc<Shared>,
    consumer_workers: usize,
}

impl core::fmt::Debug for InMemoryLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryLog")
            .field("consumer_workers", &self.consumer_workers)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState::default()),
                appended: Condvar::new(),
            }),
            consumer_workers: DEFAULT_CONSUMER_WORKERS,
        }
    }

    /// Number of consumer threads per live connection.
    pub fn with_consumer_workers(mut self, workers: usize) -> Self {
        self.consumer_workers = workers.max(1);
        self
    }

    /// Append an event to an origin stream and link it into every matching
    /// routing target.
    pub fn append(&self, stream_id: &str, event: NewEvent) -> SharedRecord {
        let mut state = self.shared.lock();

        let sequence_number = state.streams.get(stream_id).map_or(0, |s| s.len() as u64);
        let record = Arc::new(EventRecord::new(
            EventId::new(),
            stream_id,
            sequence_number,
            Utc::now(),
            event,
        ));

        state
            .streams
            .entry(stream_id.to_string())
            .or_default()
            .push(Arc::clone(&record));
        state.all.push(Arc::clone(&record));

        let LogState { routes, targets, .. } = &mut *state;
        for (name, route) in routes.iter() {
            if route.spec.matches(record.event_type()) {
                targets
                    .entry(name.clone())
                    .or_default()
                    .push(Arc::clone(&record));
            }
        }

        drop(state);
        self.shared.appended.notify_all();
        record
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Entries linked into a routing target, in target order.
    pub fn target_entries(&self, target: &str) -> Vec<SharedRecord> {
        self.shared.lock().targets.get(target).cloned().unwrap_or_default()
    }

    pub fn consumer_group_settings(&self, target: &str, group: &str) -> Option<ConsumerGroupSettings> {
        self.shared
            .lock()
            .groups
            .get(&group_key(target, group))
            .map(|g| g.settings.clone())
    }

    /// How many times an event was acknowledged on a group.
    pub fn acknowledgments(&self, target: &str, group: &str, event_id: EventId) -> u32 {
        self.shared
            .lock()
            .groups
            .get(&group_key(target, group))
            .and_then(|g| g.ack_counts.get(&event_id).copied())
            .unwrap_or(0)
    }

    /// Acknowledged events in acknowledgment order (duplicates included).
    pub fn acknowledged(&self, target: &str, group: &str) -> Vec<EventId> {
        self.shared
            .lock()
            .groups
            .get(&group_key(target, group))
            .map(|g| g.ack_order.clone())
            .unwrap_or_default()
    }

    /// Terminate a group's live connection from the server side.
    ///
    /// Returns `false` when there was no live connection to drop.
    pub fn drop_consumer_group(
        &self,
        target: &str,
        group: &str,
        reason: DropReason,
        error: Option<LogError>,
    ) -> bool {
        let live = {
            let mut state = self.shared.lock();
            state
                .groups
                .get_mut(&group_key(target, group))
                .and_then(|g| g.live.take())
        };

        match live {
            Some(live) if live.halt() => {
                self.shared.appended.notify_all();
                debug!(target = %target, group = %group, reason = %reason, "consumer group dropped");
                live.notify_drop(reason, error);
                true
            }
            _ => false,
        }
    }

    fn spawn_thread<F>(name: String, f: F) -> Result<(), LogError>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new()
            .name(name)
            .spawn(f)
            .map(|_| ())
            .map_err(|e| LogError::Server(format!("failed to spawn delivery thread: {e}")))
    }
}

impl RoutingAdmin for InMemoryLog {
    fn get_definition(&self, name: &str) -> Result<Option<String>, LogError> {
        let state = self.shared.lock();
        state.ensure_connected()?;
        Ok(state.routes.get(name).map(|r| r.text.clone()))
    }

    fn create_definition(&self, name: &str, definition: &str) -> Result<(), LogError> {
        let spec = RoutingSpec::parse(definition)?;

        let mut state = self.shared.lock();
        state.ensure_connected()?;
        if state.routes.contains_key(name) {
            return Err(LogError::AlreadyExists(name.to_string()));
        }

        let backfill: Vec<SharedRecord> = state
            .all
            .iter()
            .filter(|r| spec.matches(r.event_type()))
            .cloned()
            .collect();
        state
            .targets
            .entry(name.to_string())
            .or_default()
            .extend(backfill);
        state.routes.insert(
            name.to_string(),
            Route {
                text: definition.to_string(),
                spec,
            },
        );

        drop(state);
        self.shared.appended.notify_all();
        Ok(())
    }
}

impl DurableLog for InMemoryLog {
    fn connect(&self) -> Result<(), LogError> {
        self.shared.lock().connected = true;
        Ok(())
    }

    fn create_consumer_group(
        &self,
        target: &str,
        group: &str,
        settings: &ConsumerGroupSettings,
    ) -> Result<(), LogError> {
        let mut state = self.shared.lock();
        state.ensure_connected()?;

        let key = group_key(target, group);
        if state.groups.contains_key(&key) {
            return Err(LogError::AlreadyExists(format!("{target}::{group}")));
        }

        let start = match settings.start_from {
            StartPosition::Beginning => 0,
            StartPosition::Tail => state.targets.get(target).map_or(0, Vec::len),
        };
        state.groups.insert(
            key,
            GroupState {
                settings: settings.clone(),
                cursor: start,
                checkpoint: start,
                acked: HashSet::new(),
                ack_counts: HashMap::new(),
                ack_order: Vec::new(),
                live: None,
            },
        );
        Ok(())
    }

    fn connect_consumer_group(
        &self,
        target: &str,
        group: &str,
        on_event: EventCallback,
        on_drop: DropCallback,
        auto_ack: bool,
    ) -> Result<Box<dyn LiveConnection>, LogError> {
        let (settings, live) = {
            let mut state = self.shared.lock();
            state.ensure_connected()?;

            let group_state = state
                .groups
                .get_mut(&group_key(target, group))
                .ok_or_else(|| LogError::NotFound(format!("{target}::{group}")))?;

            if group_state.live.as_ref().is_some_and(|l| !l.is_stopped()) {
                return Err(LogError::Server(format!(
                    "consumer group {target}::{group} already has a live connection"
                )));
            }

            let live = Arc::new(LiveShared {
                stopped: AtomicBool::new(false),
                dropped: AtomicBool::new(false),
                on_drop,
            });
            group_state.live = Some(Arc::clone(&live));
            // Anything handed out but never acknowledged is delivered again.
            group_state.cursor = group_state.checkpoint;
            (group_state.settings.clone(), live)
        };

        let workers = self.consumer_workers;
        let capacity = (settings.live_buffer_size / workers).clamp(1, MAX_CONSUMER_BUFFER);
        let (done_tx, done_rx) = channel::unbounded::<()>();
        let connection = InMemoryConnection {
            live: Arc::clone(&live),
            shared: Arc::clone(&self.shared),
            done: done_rx,
            threads: workers + 1,
        };

        let mut senders = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = channel::bounded::<SharedRecord>(capacity);
            senders.push(tx);

            let worker = ConsumerWorker {
                shared: Arc::clone(&self.shared),
                live: Arc::clone(&live),
                target: target.to_string(),
                group: group.to_string(),
                on_event: Arc::clone(&on_event),
                auto_ack,
            };
            let done = DoneSignal(done_tx.clone());
            Self::spawn_thread(format!("{group}-consumer-{i}"), move || {
                let _done = done;
                worker.run(rx);
            })?;
        }

        let reader = Reader {
            shared: Arc::clone(&self.shared),
            live,
            target: target.to_string(),
            group: group.to_string(),
            batch: settings.read_batch_size.max(1),
            strategy: settings.strategy,
        };
        let done = DoneSignal(done_tx);
        Self::spawn_thread(format!("{group}-reader"), move || {
            let _done = done;
            reader.run(senders);
        })?;

        debug!(target = %target, group = %group, workers, auto_ack, "live connection opened");
        Ok(Box::new(connection))
    }

    fn acknowledge(&self, target: &str, group: &str, record: &EventRecord) -> Result<(), LogError> {
        self.shared.acknowledge(target, group, record)
    }
}

/// Pulls batches from the target and fans them out to consumer threads.
struct Reader {
    shared: Arc<Shared>,
    live: Arc<LiveShared>,
    target: String,
    group: String,
    batch: usize,
    strategy: DistributionStrategy,
}

impl Reader {
    fn run(self, consumers: Vec<Sender<SharedRecord>>) {
        let mut round_robin = 0usize;

        loop {
            let records = {
                let mut state = self.shared.lock();
                loop {
                    if self.live.is_stopped() {
                        return;
                    }
                    match state.next_batch(&self.target, &self.group, self.batch) {
                        Some(records) if !records.is_empty() => break records,
                        Some(_) => {}
                        None => return,
                    }
                    state = self
                        .shared
                        .appended
                        .wait_timeout(state, IDLE_WAIT)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            };

            for record in records {
                let idx = match self.strategy {
                    DistributionStrategy::Pinned => pinned_consumer(record.stream_id(), consumers.len()),
                    DistributionStrategy::RoundRobin => {
                        round_robin = round_robin.wrapping_add(1);
                        round_robin % consumers.len()
                    }
                };
                // Blocks while the consumer's share of the live buffer is full.
                if consumers[idx].send(record).is_err() {
                    return;
                }
            }
        }
    }
}

fn pinned_consumer(stream_id: &str, consumers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    stream_id.hash(&mut hasher);
    (hasher.finish() % consumers as u64) as usize
}

/// Invokes the event callback for every record routed to one consumer.
struct ConsumerWorker {
    shared: Arc<Shared>,
    live: Arc<LiveShared>,
    target: String,
    group: String,
    on_event: EventCallback,
    auto_ack: bool,
}

impl ConsumerWorker {
    fn run(self, records: Receiver<SharedRecord>) {
        for record in records.iter() {
            if self.live.is_stopped() {
                break;
            }
            (self.on_event)(Arc::clone(&record));

            if self.auto_ack {
                if let Err(e) = self.shared.acknowledge(&self.target, &self.group, &record) {
                    warn!(group = %self.group, error = %e, "auto-acknowledge failed");
                }
            }
        }
    }
}

/// Live connection handle returned by [`InMemoryLog`].
pub struct InMemoryConnection {
    live: Arc<LiveShared>,
    shared: Arc<Shared>,
    done: Receiver<()>,
    threads: usize,
}

impl LiveConnection for InMemoryConnection {
    fn stop(&self, grace: Duration) -> Result<(), LogError> {
        if !self.live.halt() {
            return Ok(());
        }
        self.shared.appended.notify_all();

        let deadline = Instant::now() + grace;
        let mut finished = 0;
        let mut result = Ok(());
        while finished < self.threads {
            match self.done.recv_deadline(deadline) {
                Ok(()) => finished += 1,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    result = Err(LogError::Timeout(format!(
                        "{} delivery thread(s) still busy after {grace:?}",
                        self.threads - finished
                    )));
                    break;
                }
            }
        }

        self.live.notify_drop(DropReason::SubscriberRequested, None);
        result
    }

    fn is_stopped(&self) -> bool {
        self.live.is_stopped()
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if self.live.halt() {
            self.shared.appended.notify_all();
        }
    }
}
