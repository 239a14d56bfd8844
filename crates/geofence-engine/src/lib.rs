//! Geofence Engine - Enter/Exit/Dwell/Speed Evaluation for Vehicle Fleets
//!
//! This library evaluates streams of vehicle location samples against a registry of
//! circular and polygonal geofences. It keeps enter/exit state per (vehicle, fence)
//! pair and publishes typed events to subscribers.
//!
//! # Architecture
//!
//! - **[`geometry`]**: Haversine distance, point-in-circle/polygon, bounding boxes
//! - **[`Geofence`]**: Shape + rules + precomputed pre-filter box
//! - **[`GeofenceRegistry`]**: Copy-on-write fence set, safe to mutate mid-evaluation
//! - **[`StateStore`]**: Per-(vehicle, fence) state with explicit eviction
//! - **[`EventEmitter`]**: Callback and bounded-queue subscribers
//! - **[`GeofenceEngine`]**: The service object tying it all together
//!
//! # Example
//!
//! ```
//! use geofence_engine::{EngineConfig, Geofence, GeofenceEngine, GeofenceEvent, LocationSample};
//!
//! let engine = GeofenceEngine::new(EngineConfig::default());
//! engine.load_geofences(vec![Geofence::circle("depot", 0.0, 0.0, 100.0)]).unwrap();
//! let events = engine.subscribe_default();
//!
//! engine.evaluate_location(&LocationSample::new("truck-1", 0.0, 0.0, 0));
//! engine.evaluate_location(&LocationSample::new("truck-1", 0.002, 0.002, 60_000));
//!
//! let received = events.drain();
//! assert!(matches!(received[0], GeofenceEvent::Enter { .. }));
//! assert_eq!(received[1].dwell_seconds(), Some(60.0));
//! ```
//!
//! # Performance Characteristics
//!
//! - **Evaluation**: O(F) bbox checks per sample (F = fences), exact tests only on bbox hits
//! - **Registry reads**: one `Arc` clone per sample, mutation is O(F) copy-on-write
//! - **Parallelism**: different vehicles evaluate concurrently, one vehicle is serialized

#[cfg(feature = "serde")]
pub mod definition;
mod engine;
mod events;
mod fence;
pub mod geometry;
mod registry;
mod rules;
mod state;

// Public API exports
pub use engine::{EngineConfig, EngineStats, GeofenceEngine, LocationSample};
pub use events::{EventEmitter, EventQueue, GeofenceEvent, OverflowPolicy, Subscription};
pub use fence::{Direction, FenceMeta, Geofence, RuleSet, Shape, ShapeKind};
pub use registry::GeofenceRegistry;
pub use rules::Transition;
pub use state::{PairState, StateStore};

/// Error types for the geofence engine
///
/// Only the definition/registry boundary produces errors; evaluation never fails.
#[derive(Debug, thiserror::Error)]
pub enum GeofenceError {
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid rule on fence '{id}': {reason}")]
    InvalidRule { id: String, reason: String },

    #[error("Fence '{id}' is missing required field '{field}'")]
    MissingField { id: String, field: &'static str },

    #[error("Fence '{id}' declares type '{kind}' but its geometry does not match")]
    ShapeMismatch { id: String, kind: String },

    #[error("Duplicate geofence id: {0}")]
    DuplicateId(String),

    #[error("Geofence id must not be empty")]
    EmptyId,

    #[cfg(feature = "serde")]
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GeofenceError>;
