use clap::{Parser, ValueEnum};
use geofence_engine::{EngineConfig, OverflowPolicy};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Geofence Replay - feed recorded vehicle locations through the geofence engine
pub struct Settings {
    /// JSON file with the array of geofence definitions
    #[clap(short, long, value_name = "FILE")]
    pub fences: PathBuf,

    /// JSON-lines file of location samples ("-" reads stdin)
    #[clap(short, long, value_name = "FILE")]
    pub samples: Option<PathBuf>,

    /// GPX files whose track points are replayed as samples
    #[clap(short, long = "gpx", value_name = "FILE")]
    pub gpx_files: Vec<PathBuf>,

    /// Vehicle id for GPX samples (defaults to each file's stem)
    #[clap(long)]
    pub vehicle: Option<String>,

    /// Drop the state of vehicles silent for this many seconds of sample time (0 = never)
    #[clap(long, default_value = "3600")]
    pub idle_timeout_secs: u64,

    /// Run the idle sweep every N samples
    #[clap(long, default_value = "10000")]
    pub eviction_interval: u64,

    /// Capacity of the event queue feeding the output
    #[clap(long, default_value = "1024")]
    pub queue_capacity: usize,

    /// What to do when the event queue is full (block waits for the writer)
    #[clap(long, value_enum, default_value = "block")]
    pub overflow: Overflow,

    /// Evaluate all samples as one parallel batch (per-vehicle order only)
    #[clap(long, default_value = "false")]
    pub parallel: bool,
}

/// CLI spelling of [`OverflowPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Overflow {
    Block,
    DropOldest,
    DropNewest,
}

impl From<Overflow> for OverflowPolicy {
    fn from(value: Overflow) -> Self {
        match value {
            Overflow::Block => OverflowPolicy::Block,
            Overflow::DropOldest => OverflowPolicy::DropOldest,
            Overflow::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

impl Settings {
    /// Parse the process arguments, exiting with usage on error
    pub fn from_cli() -> Self {
        match Settings::try_parse() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Engine configuration derived from the flags
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            idle_timeout_ms: (self.idle_timeout_secs > 0)
                .then(|| i64::try_from(self.idle_timeout_secs.saturating_mul(1000)).unwrap_or(i64::MAX)),
            eviction_interval: self.eviction_interval,
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::parse_from(["geofence-replay", "--fences", "fences.json"]);
        assert_eq!(settings.fences, PathBuf::from("fences.json"));
        assert!(settings.samples.is_none());
        assert!(settings.gpx_files.is_empty());
        assert!(!settings.parallel);
        assert_eq!(settings.overflow, Overflow::Block);
        assert_eq!(
            settings.engine_config(),
            EngineConfig {
                overflow_policy: OverflowPolicy::Block,
                ..EngineConfig::default()
            }
        );
    }

    #[test]
    fn test_engine_config_from_flags() {
        let settings = Settings::parse_from([
            "geofence-replay",
            "-f",
            "fences.json",
            "-g",
            "a.gpx",
            "-g",
            "b.gpx",
            "--idle-timeout-secs",
            "0",
            "--queue-capacity",
            "8",
            "--overflow",
            "drop-newest",
        ]);
        assert_eq!(settings.gpx_files.len(), 2);

        let config = settings.engine_config();
        assert_eq!(config.idle_timeout_ms, None);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
    }

    #[test]
    fn test_fences_are_required() {
        assert!(Settings::try_parse_from(["geofence-replay"]).is_err());
    }
}
