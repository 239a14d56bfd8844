//! Per-(vehicle, geofence) enter/exit bookkeeping
//!
//! Every vehicle gets its own slot behind its own mutex, so different vehicles
//! can be evaluated in parallel while updates for one vehicle are serialized.
//! Slots are created lazily and removed only through the eviction methods.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// State of one (vehicle, geofence) pair
///
/// Invariants: `entered_at.is_some() == inside`, and `dwell_reported` implies
/// `inside`. The default value is "outside".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PairState {
    pub inside: bool,
    pub entered_at: Option<i64>,
    pub dwell_reported: bool,
}

impl PairState {
    /// Move to inside, starting a new entry cycle
    #[inline]
    pub(crate) fn enter(&mut self, at: i64) {
        self.inside = true;
        self.entered_at = Some(at);
        self.dwell_reported = false;
    }

    /// Move back to the initial outside state
    #[inline]
    pub(crate) fn reset(&mut self) {
        *self = PairState::default();
    }
}

pub(crate) type PairMap = HashMap<String, PairState>;

/// All state kept for one vehicle
#[derive(Debug)]
pub(crate) struct VehicleSlot {
    /// Timestamp of the latest sample, read without taking the pair lock
    last_seen: AtomicI64,
    pairs: Mutex<PairMap>,
}

impl VehicleSlot {
    fn new() -> Self {
        Self {
            last_seen: AtomicI64::new(i64::MIN),
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the pair map; the guard serializes evaluation for this vehicle
    pub(crate) fn lock(&self) -> MutexGuard<'_, PairMap> {
        self.pairs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Vehicle state mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    #[inline]
    pub(crate) fn touch(&self, timestamp: i64) {
        self.last_seen.fetch_max(timestamp, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }
}

/// Concurrent store of [`PairState`]s keyed by vehicle id, then geofence id
#[derive(Debug, Default)]
pub struct StateStore {
    vehicles: DashMap<String, Arc<VehicleSlot>>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for a vehicle, created on first use
    ///
    /// The map shard lock is released before returning, so callers may hold
    /// the slot's own lock for as long as they need.
    pub(crate) fn slot(&self, vehicle_id: &str) -> Arc<VehicleSlot> {
        if let Some(slot) = self.vehicles.get(vehicle_id) {
            return slot.value().clone();
        }
        self.vehicles
            .entry(vehicle_id.to_string())
            .or_insert_with(|| Arc::new(VehicleSlot::new()))
            .value()
            .clone()
    }

    fn slots(&self) -> Vec<Arc<VehicleSlot>> {
        self.vehicles.iter().map(|e| e.value().clone()).collect()
    }

    /// Copy of a pair's state; `None` if the pair was never evaluated
    pub fn pair(&self, vehicle_id: &str, geofence_id: &str) -> Option<PairState> {
        let slot = self.vehicles.get(vehicle_id)?.value().clone();
        let pairs = slot.lock();
        pairs.get(geofence_id).copied()
    }

    /// Whether the vehicle is currently inside the fence
    pub fn is_inside(&self, vehicle_id: &str, geofence_id: &str) -> bool {
        self.pair(vehicle_id, geofence_id)
            .is_some_and(|pair| pair.inside)
    }

    /// Timestamp of the vehicle's latest evaluated sample
    pub fn last_seen(&self, vehicle_id: &str) -> Option<i64> {
        let last_seen = self.vehicles.get(vehicle_id)?.last_seen();
        (last_seen != i64::MIN).then_some(last_seen)
    }

    /// Number of tracked vehicles
    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Number of tracked pairs across all vehicles
    pub fn pair_count(&self) -> usize {
        self.slots().iter().map(|slot| slot.lock().len()).sum()
    }

    /// Drop every pair that refers to `geofence_id`
    ///
    /// Returns the number of pairs removed.
    pub fn forget_geofence(&self, geofence_id: &str) -> usize {
        let removed = self
            .slots()
            .iter()
            .filter(|slot| slot.lock().remove(geofence_id).is_some())
            .count();
        if removed > 0 {
            tracing::debug!(
                fence = geofence_id,
                "Discarded state for {} vehicle(s)",
                removed
            );
        }
        removed
    }

    /// Drop all state of one vehicle
    pub fn forget_vehicle(&self, vehicle_id: &str) -> bool {
        self.vehicles.remove(vehicle_id).is_some()
    }

    /// Drop vehicles whose latest sample is older than `now - timeout_ms`
    ///
    /// A slot currently held by an evaluation is kept. Returns the number of
    /// vehicles evicted.
    pub fn evict_idle(&self, now: i64, timeout_ms: i64) -> usize {
        let cutoff = now.saturating_sub(timeout_ms);
        let mut evicted = 0;
        self.vehicles.retain(|_, slot| {
            let keep = slot.last_seen() >= cutoff || Arc::strong_count(slot) > 1;
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            tracing::debug!("Evicted {} idle vehicle(s) (cutoff {})", evicted, cutoff);
        }
        evicted
    }

    /// Drop everything
    pub fn clear(&self) {
        self.vehicles.clear();
    }
}
