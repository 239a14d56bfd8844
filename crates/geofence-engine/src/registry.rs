//! GeofenceRegistry - Copy-on-write store of fence definitions
//!
//! Readers take a cheap `Arc` snapshot of the whole fence set and iterate it
//! without holding any lock. Writers build a new set and swap it in, so an
//! evaluation pass never observes a half-applied mutation.

use crate::{Geofence, GeofenceError, Result};

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Immutable view of the registry at one point in time, in registry order
pub type FenceSnapshot = Arc<[Arc<Geofence>]>;

/// Thread-safe registry of geofences
#[derive(Debug)]
pub struct GeofenceRegistry {
    /// Current fence set. Only the `Arc` is swapped under the write lock.
    fences: RwLock<FenceSnapshot>,
}

impl Default for GeofenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl GeofenceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            fences: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Replace the entire fence set
    ///
    /// The batch is validated as a whole; on error the previous set is kept.
    /// Returns the set that was replaced.
    pub fn load(&self, fences: Vec<Geofence>) -> Result<FenceSnapshot> {
        #[cfg(feature = "profiling")]
        profiling::scope!("registry::load");

        let mut seen = HashSet::with_capacity(fences.len());
        for fence in &fences {
            fence.validate()?;
            if !seen.insert(fence.id()) {
                return Err(GeofenceError::DuplicateId(fence.id().to_string()));
            }
        }

        let next: FenceSnapshot = fences.into_iter().map(Arc::new).collect();
        let count = next.len();
        let previous = std::mem::replace(&mut *self.write(), next);
        tracing::info!(
            "Loaded {} geofences (replacing {})",
            count,
            previous.len()
        );
        Ok(previous)
    }

    /// Insert a fence, or replace the fence with the same id in place
    ///
    /// Returns the replaced fence, if any.
    pub fn upsert(&self, fence: Geofence) -> Result<Option<Arc<Geofence>>> {
        fence.validate()?;
        let fence = Arc::new(fence);

        let mut guard = self.write();
        let mut next: Vec<Arc<Geofence>> = guard.to_vec();
        let previous = match next.iter().position(|f| f.id() == fence.id()) {
            Some(index) => Some(std::mem::replace(&mut next[index], fence)),
            None => {
                next.push(fence);
                None
            }
        };
        *guard = next.into();
        Ok(previous)
    }

    /// Remove a fence by id; unknown ids are a no-op
    pub fn remove(&self, id: &str) -> Option<Arc<Geofence>> {
        let mut guard = self.write();
        let index = guard.iter().position(|f| f.id() == id)?;
        let mut next: Vec<Arc<Geofence>> = guard.to_vec();
        let removed = next.remove(index);
        *guard = next.into();
        Some(removed)
    }

    /// Current fence set; cheap to call once per evaluation pass
    #[inline]
    pub fn snapshot(&self) -> FenceSnapshot {
        self.read().clone()
    }

    /// Look up a fence by id
    pub fn get(&self, id: &str) -> Option<Arc<Geofence>> {
        self.read().iter().find(|f| f.id() == id).cloned()
    }

    /// Number of fences, active or not
    #[inline]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of fences taking part in evaluation
    pub fn active_count(&self) -> usize {
        self.read().iter().filter(|f| f.is_active()).count()
    }

    fn read(&self) -> RwLockReadGuard<'_, FenceSnapshot> {
        self.fences.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Registry lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, FenceSnapshot> {
        self.fences.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Registry lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}
