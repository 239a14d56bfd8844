//! Geofence Replay - Application Library
//!
//! Loads geofence definitions, replays recorded vehicle locations (JSON lines
//! or GPX tracks) through a [`geofence_engine::GeofenceEngine`] and writes the
//! resulting events as JSON lines.

pub mod gpx_samples;
pub mod logging;
mod replay;
mod settings;

pub use replay::{ReplaySummary, collect_samples, replay, run};
pub use settings::{Overflow, Settings};

use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a replay
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Geofence(#[from] geofence_engine::GeofenceError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse GPX {path}: {source}")]
    Gpx {
        path: PathBuf,
        #[source]
        source: gpx::errors::GpxError,
    },

    #[error("No samples to replay; pass --samples or --gpx")]
    NoInput,

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to write events: {0}")]
    Output(#[source] std::io::Error),

    #[error("Replay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
