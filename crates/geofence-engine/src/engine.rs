//! GeofenceEngine - Top-level service for location ingestion
//!
//! This module provides the high-level API: construct one engine at startup,
//! share it by `Arc`, load fences, subscribe to events and feed it samples.

use crate::events::{EventEmitter, EventQueue, OverflowPolicy, Subscription};
use crate::registry::GeofenceRegistry;
use crate::state::StateStore;
use crate::{Geofence, GeofenceEvent, Result, geometry, rules};

use geo::Point;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Configuration for the engine
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct EngineConfig {
    /// Vehicles without a sample for this long (milliseconds of sample time)
    /// lose all their state. `None` disables idle eviction.
    /// Default: one hour
    pub idle_timeout_ms: Option<i64>,
    /// Run the idle sweep automatically every N samples (0 = only on demand).
    /// Default: 10 000
    pub eviction_interval: u64,
    /// Capacity used by [`GeofenceEngine::subscribe_default`].
    /// Default: 1024
    pub queue_capacity: usize,
    /// Overflow policy used by [`GeofenceEngine::subscribe_default`].
    /// Default: drop oldest
    pub overflow_policy: OverflowPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: Some(60 * 60 * 1000),
            eviction_interval: 10_000,
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// One location report for a vehicle
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct LocationSample {
    #[cfg_attr(feature = "serde", serde(rename = "id", alias = "vehicleId"))]
    pub vehicle_id: String,
    pub lat: f64,
    pub lng: f64,
    /// Speed in km/h, if the device reports one
    #[cfg_attr(feature = "serde", serde(default, alias = "speed"))]
    pub speed_kph: Option<f64>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl LocationSample {
    /// Sample without a speed
    pub fn new(vehicle_id: impl Into<String>, lat: f64, lng: f64, timestamp: i64) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            lat,
            lng,
            speed_kph: None,
            timestamp,
        }
    }

    pub fn with_speed(mut self, speed_kph: f64) -> Self {
        self.speed_kph = Some(speed_kph);
        self
    }

    /// Position as a `geo::Point` (`x = lng`, `y = lat`)
    #[inline]
    pub fn point(&self) -> Point<f64> {
        Point::new(self.lng, self.lat)
    }
}

/// Counters describing the work done by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct EngineStats {
    /// Samples evaluated
    pub samples: u64,
    /// Samples ignored because of invalid coordinates
    pub rejected_samples: u64,
    /// (sample, fence) checks answered by the bounding box alone
    pub bbox_rejections: u64,
    /// Exact circle/polygon tests performed
    pub exact_tests: u64,
    /// Events produced (before any subscriber overflow)
    pub events_emitted: u64,
    /// Vehicles removed by the idle sweep
    pub evicted_vehicles: u64,
}

#[derive(Debug, Default)]
struct Counters {
    samples: AtomicU64,
    rejected_samples: AtomicU64,
    bbox_rejections: AtomicU64,
    exact_tests: AtomicU64,
    events_emitted: AtomicU64,
    evicted_vehicles: AtomicU64,
}

/// The geofence evaluation service
///
/// `GeofenceEngine` is `Send + Sync`. Samples for different vehicles may be
/// evaluated concurrently; samples for one vehicle are serialized by a
/// per-vehicle lock that is held through event emission, so each vehicle's
/// events are delivered in input order. Callbacks therefore must not feed
/// samples for the vehicle they are being notified about.
#[derive(Debug)]
pub struct GeofenceEngine {
    config: EngineConfig,
    registry: GeofenceRegistry,
    state: StateStore,
    emitter: EventEmitter,
    counters: Counters,
    /// Latest sample timestamp seen, used as "now" by the idle sweep
    latest_timestamp: AtomicI64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl GeofenceEngine {
    /// Create a new engine with no fences and no subscribers
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: GeofenceRegistry::new(),
            state: StateStore::new(),
            emitter: EventEmitter::new(),
            counters: Counters::default(),
            latest_timestamp: AtomicI64::new(i64::MIN),
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &GeofenceRegistry {
        &self.registry
    }

    #[inline]
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    #[inline]
    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Replace the fence set
    ///
    /// State of fences that disappear or become inactive is discarded.
    pub fn load_geofences(&self, fences: Vec<Geofence>) -> Result<()> {
        let previous = self.registry.load(fences)?;
        let current = self.registry.snapshot();
        let still_active: HashSet<&str> = current
            .iter()
            .filter(|f| f.is_active())
            .map(|f| f.id())
            .collect();
        for fence in previous.iter() {
            if !still_active.contains(fence.id()) {
                self.state.forget_geofence(fence.id());
            }
        }
        Ok(())
    }

    /// Insert or replace one fence
    ///
    /// Deactivating a fence discards its state, so re-activation starts
    /// every vehicle from outside.
    pub fn upsert_geofence(&self, fence: Geofence) -> Result<()> {
        let id = fence.id().to_string();
        let active = fence.is_active();
        self.registry.upsert(fence)?;
        if !active {
            self.state.forget_geofence(&id);
        }
        Ok(())
    }

    /// Remove a fence and its state; unknown ids are a no-op
    pub fn remove_geofence(&self, id: &str) -> bool {
        match self.registry.remove(id) {
            Some(_) => {
                self.state.forget_geofence(id);
                true
            }
            None => false,
        }
    }

    /// Register a synchronous event callback
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&GeofenceEvent) + Send + Sync + 'static,
    {
        self.emitter.on_event(callback)
    }

    /// Register a bounded event queue
    pub fn subscribe(&self, capacity: usize, policy: OverflowPolicy) -> EventQueue {
        self.emitter.subscribe(capacity, policy)
    }

    /// Register a bounded event queue using the configured defaults
    pub fn subscribe_default(&self) -> EventQueue {
        self.emitter
            .subscribe(self.config.queue_capacity, self.config.overflow_policy)
    }

    /// Evaluate one location report given as loose fields
    pub fn evaluate(
        &self,
        vehicle_id: &str,
        lat: f64,
        lng: f64,
        speed_kph: Option<f64>,
        timestamp: i64,
    ) -> usize {
        self.evaluate_location(&LocationSample {
            vehicle_id: vehicle_id.to_string(),
            lat,
            lng,
            speed_kph,
            timestamp,
        })
    }

    /// Evaluate one sample against every active fence and emit the results
    ///
    /// Returns the number of events emitted. Samples with invalid coordinates
    /// are ignored.
    pub fn evaluate_location(&self, sample: &LocationSample) -> usize {
        #[cfg(feature = "profiling")]
        profiling::scope!("engine::evaluate_location");

        let point = sample.point();
        if !geometry::is_valid_wgs84(point) {
            tracing::debug!(
                vehicle = %sample.vehicle_id,
                "Ignoring sample with invalid coordinates ({}, {})",
                sample.lat,
                sample.lng
            );
            self.counters
                .rejected_samples
                .fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let slot = self.state.slot(&sample.vehicle_id);
        let mut pairs = slot.lock();
        slot.touch(sample.timestamp);
        // Taken under the vehicle lock: a fence removed before this point has
        // already had its pairs purged and must not be evaluated again
        let fences = self.registry.snapshot();

        let mut events = Vec::new();
        let mut bbox_rejections = 0;
        let mut exact_tests = 0;

        for fence in fences.iter().filter(|f| f.is_active()) {
            if !fence.bbox_contains(point) {
                bbox_rejections += 1;
                // Leaving the box is leaving the fence
                if let Some(pair) = pairs.get_mut(fence.id()).filter(|p| p.inside) {
                    rules::apply(fence, pair, false, sample, &mut events);
                }
                continue;
            }

            exact_tests += 1;
            let inside = fence.contains(point);
            match pairs.get_mut(fence.id()) {
                Some(pair) => {
                    rules::apply(fence, pair, inside, sample, &mut events);
                }
                None => {
                    let pair = pairs.entry(fence.id().to_string()).or_default();
                    rules::apply(fence, pair, inside, sample, &mut events);
                }
            }
        }

        for event in &events {
            self.emitter.emit(event);
        }
        drop(pairs);

        self.counters.samples.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bbox_rejections
            .fetch_add(bbox_rejections, Ordering::Relaxed);
        self.counters
            .exact_tests
            .fetch_add(exact_tests, Ordering::Relaxed);
        self.counters
            .events_emitted
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        self.maybe_sweep(sample.timestamp);
        events.len()
    }

    /// Evaluate many samples, one parallel task per vehicle
    ///
    /// Samples of the same vehicle are evaluated in input order; ordering
    /// across vehicles is unspecified. Returns the number of events emitted.
    pub fn evaluate_batch(&self, samples: &[LocationSample]) -> usize {
        #[cfg(feature = "profiling")]
        profiling::scope!("engine::evaluate_batch");

        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<Vec<&LocationSample>> = Vec::new();
        for sample in samples {
            let group = *index.entry(sample.vehicle_id.as_str()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push(sample);
        }

        groups
            .par_iter()
            .map(|group| {
                group
                    .iter()
                    .map(|sample| self.evaluate_location(sample))
                    .sum::<usize>()
            })
            .sum()
    }

    /// Drop state of vehicles idle for longer than the configured timeout
    ///
    /// `now` is in sample time (epoch millis). Returns the number evicted.
    pub fn evict_idle(&self, now: i64) -> usize {
        let Some(timeout) = self.config.idle_timeout_ms else {
            return 0;
        };
        let evicted = self.state.evict_idle(now, timeout);
        self.counters
            .evicted_vehicles
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    fn maybe_sweep(&self, timestamp: i64) {
        let latest = self
            .latest_timestamp
            .fetch_max(timestamp, Ordering::Relaxed)
            .max(timestamp);
        let interval = self.config.eviction_interval;
        if interval == 0 || self.config.idle_timeout_ms.is_none() {
            return;
        }
        if self.counters.samples.load(Ordering::Relaxed) % interval == 0 {
            self.evict_idle(latest);
        }
    }

    /// Snapshot of the engine counters
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            samples: c.samples.load(Ordering::Relaxed),
            rejected_samples: c.rejected_samples.load(Ordering::Relaxed),
            bbox_rejections: c.bbox_rejections.load(Ordering::Relaxed),
            exact_tests: c.exact_tests.load(Ordering::Relaxed),
            events_emitted: c.events_emitted.load(Ordering::Relaxed),
            evicted_vehicles: c.evicted_vehicles.load(Ordering::Relaxed),
        }
    }
}
