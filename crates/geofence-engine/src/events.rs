//! Typed geofence events and their delivery to subscribers
//!
//! Two kinds of subscriber are supported:
//! - callbacks, invoked synchronously inside [`EventEmitter::emit`]
//! - bounded queues ([`EventQueue`]), which apply an [`OverflowPolicy`] when
//!   full. Only [`OverflowPolicy::Block`] ever makes the producer wait.
//!
//! Delivery happens in registration order. `emit` works on a snapshot of the
//! subscriber list, so unsubscribing from within a callback only affects
//! later deliveries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Event derived from a (vehicle, geofence) transition
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type"))]
pub enum GeofenceEvent {
    #[cfg_attr(
        feature = "serde",
        serde(rename = "GEOFENCE_ENTER", rename_all = "camelCase")
    )]
    Enter {
        vehicle_id: String,
        geofence_id: String,
        at: i64,
    },
    /// `dwell_seconds` is `None` when the entry time was unknown
    #[cfg_attr(
        feature = "serde",
        serde(rename = "GEOFENCE_EXIT", rename_all = "camelCase")
    )]
    Exit {
        vehicle_id: String,
        geofence_id: String,
        at: i64,
        dwell_seconds: Option<f64>,
    },
    #[cfg_attr(
        feature = "serde",
        serde(rename = "GEOFENCE_DWELL", rename_all = "camelCase")
    )]
    Dwell {
        vehicle_id: String,
        geofence_id: String,
        at: i64,
        dwell_seconds: f64,
    },
    #[cfg_attr(
        feature = "serde",
        serde(rename = "GEOFENCE_SPEED", rename_all = "camelCase")
    )]
    Speed {
        vehicle_id: String,
        geofence_id: String,
        at: i64,
        speed: f64,
        limit: f64,
    },
}

impl GeofenceEvent {
    #[inline]
    pub fn vehicle_id(&self) -> &str {
        match self {
            Self::Enter { vehicle_id, .. }
            | Self::Exit { vehicle_id, .. }
            | Self::Dwell { vehicle_id, .. }
            | Self::Speed { vehicle_id, .. } => vehicle_id,
        }
    }

    #[inline]
    pub fn geofence_id(&self) -> &str {
        match self {
            Self::Enter { geofence_id, .. }
            | Self::Exit { geofence_id, .. }
            | Self::Dwell { geofence_id, .. }
            | Self::Speed { geofence_id, .. } => geofence_id,
        }
    }

    /// Sample timestamp (epoch millis) that produced the event
    #[inline]
    pub fn at(&self) -> i64 {
        match self {
            Self::Enter { at, .. }
            | Self::Exit { at, .. }
            | Self::Dwell { at, .. }
            | Self::Speed { at, .. } => *at,
        }
    }

    /// Wire name of the event type
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Enter { .. } => "GEOFENCE_ENTER",
            Self::Exit { .. } => "GEOFENCE_EXIT",
            Self::Dwell { .. } => "GEOFENCE_DWELL",
            Self::Speed { .. } => "GEOFENCE_SPEED",
        }
    }

    /// Dwell duration carried by EXIT and DWELL events
    pub fn dwell_seconds(&self) -> Option<f64> {
        match self {
            Self::Exit { dwell_seconds, .. } => *dwell_seconds,
            Self::Dwell { dwell_seconds, .. } => Some(*dwell_seconds),
            _ => None,
        }
    }
}

/// What a full [`EventQueue`] does with a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room
    #[default]
    DropOldest,
    /// Refuse the incoming event and keep the queue as is
    DropNewest,
    /// Make the producer wait until the consumer frees a slot
    ///
    /// Nothing is ever dropped. The consumer must run on another thread than
    /// the producer, otherwise a full queue deadlocks.
    Block,
}

type Callback = Box<dyn Fn(&GeofenceEvent) + Send + Sync>;

enum Sink {
    Callback(Callback),
    Queue(Arc<QueueInner>),
}

struct Subscriber {
    id: u64,
    active: AtomicBool,
    sink: Sink,
}

impl Subscriber {
    fn deliver(&self, event: &GeofenceEvent) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        match &self.sink {
            Sink::Callback(callback) => callback(event),
            Sink::Queue(queue) => {
                queue.push(event.clone());
            }
        }
    }
}

struct QueueInner {
    events: Mutex<VecDeque<GeofenceEvent>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    closed: AtomicBool,
    /// Wakes async receivers
    notify: Notify,
    /// Signalled when an event is queued or the queue closes
    filled: Condvar,
    /// Signalled when an event is taken or the queue closes
    freed: Condvar,
}

fn recover<'a>(
    result: std::sync::LockResult<MutexGuard<'a, VecDeque<GeofenceEvent>>>,
) -> MutexGuard<'a, VecDeque<GeofenceEvent>> {
    result.unwrap_or_else(|poisoned| {
        tracing::warn!("Event queue mutex poisoned; recovering");
        poisoned.into_inner()
    })
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, VecDeque<GeofenceEvent>> {
        recover(self.events.lock())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<GeofenceEvent> {
        let event = self.lock().pop_front();
        if event.is_some() {
            self.freed.notify_one();
        }
        event
    }

    /// Returns false when the event was not queued
    fn push(&self, event: GeofenceEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut events = self.lock();
            if events.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            "Event queue full ({} events), dropping oldest",
                            self.capacity
                        );
                        events.pop_front();
                    }
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            "Event queue full ({} events), dropping {}",
                            self.capacity,
                            event.type_name()
                        );
                        return false;
                    }
                    OverflowPolicy::Block => {
                        events = recover(self.freed.wait_while(events, |events| {
                            events.len() >= self.capacity && !self.is_closed()
                        }));
                        if self.is_closed() {
                            return false;
                        }
                    }
                }
            }
            events.push_back(event);
        }
        self.filled.notify_one();
        self.notify.notify_one();
        true
    }

    fn close(&self) {
        {
            // Under the lock so a waiter cannot miss the flag
            let _events = self.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.filled.notify_all();
        self.freed.notify_all();
        // Wake a pending `recv` so it can observe the close
        self.notify.notify_one();
    }
}

struct EmitterInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl EmitterInner {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Subscriber list lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Subscriber list lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn register(&self, sink: Sink) -> Arc<Subscriber> {
        let subscriber = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            sink,
        });
        self.write().push(subscriber.clone());
        subscriber
    }

    fn unregister(&self, id: u64) {
        self.write().retain(|s| {
            if s.id == id {
                s.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
    }
}

impl Drop for EmitterInner {
    fn drop(&mut self) {
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for subscriber in subscribers.drain(..) {
            if let Sink::Queue(queue) = &subscriber.sink {
                queue.close();
            }
        }
    }
}

/// In-process publish/subscribe hub for [`GeofenceEvent`]s
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl EventEmitter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a synchronous callback
    ///
    /// The callback runs on the producer's thread. Keep it short; anything
    /// slow belongs behind [`EventEmitter::subscribe`].
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&GeofenceEvent) + Send + Sync + 'static,
    {
        let subscriber = self.inner.register(Sink::Callback(Box::new(callback)));
        Subscription {
            id: subscriber.id,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Register a bounded queue subscriber
    ///
    /// A capacity of zero is treated as one.
    pub fn subscribe(&self, capacity: usize, policy: OverflowPolicy) -> EventQueue {
        let capacity = capacity.max(1);
        let queue = Arc::new(QueueInner {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            filled: Condvar::new(),
            freed: Condvar::new(),
        });
        let subscriber = self.inner.register(Sink::Queue(queue.clone()));
        EventQueue {
            id: subscriber.id,
            queue,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every subscriber, in registration order
    pub fn emit(&self, event: &GeofenceEvent) {
        let subscribers: Vec<Arc<Subscriber>> = self.inner.read().clone();
        for subscriber in &subscribers {
            subscriber.deliver(event);
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Unregister everything and close all queues
    ///
    /// Queued events stay readable; `recv` returns `None` once they are drained.
    pub fn close(&self) {
        let subscribers = std::mem::take(&mut *self.inner.write());
        for subscriber in subscribers {
            subscriber.active.store(false, Ordering::Release);
            if let Sink::Queue(queue) = &subscriber.sink {
                queue.close();
            }
        }
    }
}

/// Handle for a callback registered with [`EventEmitter::on_event`]
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    emitter: Weak<EmitterInner>,
}

impl Subscription {
    /// Stop delivery to this callback. Safe to call from inside the callback.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.emitter.upgrade() {
            inner.unregister(self.id);
        }
    }
}

/// Receiving end of a bounded subscriber queue
///
/// Dropping the queue unsubscribes it.
pub struct EventQueue {
    id: u64,
    queue: Arc<QueueInner>,
    emitter: Weak<EmitterInner>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.queue.capacity)
            .field("policy", &self.queue.policy)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventQueue {
    /// Pop the oldest queued event without waiting
    pub fn try_recv(&self) -> Option<GeofenceEvent> {
        self.queue.pop()
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<GeofenceEvent> {
        let events: Vec<GeofenceEvent> = self.queue.lock().drain(..).collect();
        self.queue.freed.notify_all();
        events
    }

    /// Block the current thread until the next event arrives
    ///
    /// Returns `None` once the queue is closed and empty. Must not be called
    /// from an async context; use [`EventQueue::recv`] there.
    pub fn blocking_recv(&self) -> Option<GeofenceEvent> {
        let events = self.queue.lock();
        let mut events = recover(
            self.queue
                .filled
                .wait_while(events, |events| events.is_empty() && !self.queue.is_closed()),
        );
        let event = events.pop_front();
        drop(events);
        if event.is_some() {
            self.queue.freed.notify_one();
        }
        event
    }

    /// Wait for the next event; `None` once the queue is closed and empty
    pub async fn recv(&self) -> Option<GeofenceEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.is_closed() {
                // Events pushed between the pop and the close check
                return self.try_recv();
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.queue.policy
    }

    /// Number of events lost to the overflow policy so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Unsubscribe; already queued events remain readable
    pub fn close(&self) {
        self.queue.close();
        if let Some(inner) = self.emitter.upgrade() {
            inner.unregister(self.id);
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.close();
    }
}
