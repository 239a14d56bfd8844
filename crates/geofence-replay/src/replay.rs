//! The replay pipeline
//!
//! Fences and samples are loaded up front. Samples are then fed to the engine
//! on one blocking task while a second blocking task drains the event queue
//! and writes one JSON object per line. With the default `block` overflow
//! policy the feeder waits for the writer, so every event is printed.
//! Closing the emitter after the last sample lets the writer finish once the
//! queue is empty.

use crate::gpx_samples::load_gpx_samples;
use crate::{ReplayError, Settings};
use geofence_engine::definition::{load_geofences_file, read_samples};
use geofence_engine::{EngineStats, EventQueue, GeofenceEngine, LocationSample};
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;

/// What a replay did
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySummary {
    /// Samples fed to the engine
    pub samples: usize,
    /// Events written to the output
    pub events_written: u64,
    /// Events lost because the output fell behind
    pub events_dropped: u64,
    pub stats: EngineStats,
}

fn read_sample_file(path: &Path) -> Result<Vec<LocationSample>, ReplayError> {
    if path.as_os_str() == "-" {
        return Ok(read_samples(std::io::stdin().lock())?);
    }
    let file = std::fs::File::open(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let samples = read_samples(BufReader::new(file))?;
    tracing::info!("Loaded {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

fn vehicle_for(settings: &Settings, path: &Path) -> String {
    settings.vehicle.clone().unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    })
}

/// Gather every sample source named in `settings`, in timestamp order
///
/// The sort is stable, so samples sharing a timestamp keep their input order.
pub fn collect_samples(settings: &Settings) -> Result<Vec<LocationSample>, ReplayError> {
    let mut samples = Vec::new();
    if let Some(path) = &settings.samples {
        samples.extend(read_sample_file(path)?);
    }
    for path in &settings.gpx_files {
        samples.extend(load_gpx_samples(path, &vehicle_for(settings, path))?);
    }
    if samples.is_empty() {
        return Err(ReplayError::NoInput);
    }
    samples.sort_by_key(|s| s.timestamp);
    Ok(samples)
}

fn write_events<W: Write>(queue: EventQueue, mut out: W) -> Result<(u64, u64, W), ReplayError> {
    let mut written = 0u64;
    while let Some(event) = queue.blocking_recv() {
        serde_json::to_writer(&mut out, &event)?;
        out.write_all(b"\n").map_err(ReplayError::Output)?;
        written += 1;
    }
    out.flush().map_err(ReplayError::Output)?;
    Ok((written, queue.dropped(), out))
}

/// Run a full replay, writing events to `out`
///
/// `out` is handed back so callers can inspect buffered output.
pub async fn replay<W>(settings: &Settings, out: W) -> Result<(ReplaySummary, W), ReplayError>
where
    W: Write + Send + 'static,
{
    let fences = load_geofences_file(&settings.fences)?;
    let samples = collect_samples(settings)?;

    let engine = Arc::new(GeofenceEngine::new(settings.engine_config()));
    engine.load_geofences(fences)?;
    let queue = engine.subscribe_default();
    let writer = tokio::task::spawn_blocking(move || write_events(queue, out));

    let feeder = {
        let engine = engine.clone();
        let parallel = settings.parallel;
        tokio::task::spawn_blocking(move || {
            if parallel {
                engine.evaluate_batch(&samples);
            } else {
                for sample in &samples {
                    engine.evaluate_location(sample);
                }
            }
            samples.len()
        })
    };

    let fed = feeder.await?;
    engine.emitter().close();
    let (events_written, events_dropped, out) = writer.await??;

    if events_dropped > 0 {
        tracing::warn!(
            "Output fell behind: {} events dropped (queue capacity {})",
            events_dropped,
            engine.config().queue_capacity
        );
    }

    let summary = ReplaySummary {
        samples: fed,
        events_written,
        events_dropped,
        stats: engine.stats(),
    };
    Ok((summary, out))
}

/// Replay to stdout
pub async fn run(settings: &Settings) -> Result<ReplaySummary, ReplayError> {
    let (summary, _) = replay(settings, std::io::BufWriter::new(std::io::stdout())).await?;
    Ok(summary)
}
