//! Turning GPX tracks into location samples
//!
//! Every timestamped track point becomes one sample. Speed comes from the
//! point's own `<speed>` (m/s) when present, otherwise from the distance to
//! the previous point of the same segment over the elapsed time.

use crate::ReplayError;
use geo::Point;
use geofence_engine::LocationSample;
use geofence_engine::geometry::distance_m;
use gpx::{Gpx, Waypoint};
use std::io::BufReader;
use std::path::Path;
use time::OffsetDateTime;

/// Epoch milliseconds of a waypoint, if it carries a time
fn timestamp_ms(waypoint: &Waypoint) -> Option<i64> {
    let time = OffsetDateTime::from(waypoint.time.clone()?);
    i64::try_from(time.unix_timestamp_nanos() / 1_000_000).ok()
}

/// Convert every timestamped track point of `gpx` into samples for `vehicle_id`
pub fn samples_from_gpx(gpx: &Gpx, vehicle_id: &str) -> Vec<LocationSample> {
    let mut samples = Vec::new();
    let mut untimed = 0usize;

    for segment in gpx.tracks.iter().flat_map(|t| t.segments.iter()) {
        let mut previous: Option<(Point<f64>, i64)> = None;

        for waypoint in &segment.points {
            let Some(timestamp) = timestamp_ms(waypoint) else {
                untimed += 1;
                continue;
            };
            let point = waypoint.point();
            let mut sample = LocationSample::new(vehicle_id, point.y(), point.x(), timestamp);

            let derived = previous.and_then(|(prev_point, prev_timestamp)| {
                let elapsed_s = (timestamp - prev_timestamp) as f64 / 1000.0;
                (elapsed_s > 0.0).then(|| distance_m(prev_point, point) / elapsed_s)
            });
            if let Some(mps) = waypoint.speed.or(derived) {
                sample = sample.with_speed(mps * 3.6);
            }

            samples.push(sample);
            previous = Some((point, timestamp));
        }
    }

    if untimed > 0 {
        tracing::warn!(
            vehicle = vehicle_id,
            "Skipped {} GPX points without a time",
            untimed
        );
    }
    samples
}

/// Read a GPX file and convert it into samples
pub fn load_gpx_samples(path: &Path, vehicle_id: &str) -> Result<Vec<LocationSample>, ReplayError> {
    profiling::scope!("load_gpx_samples");

    let file = std::fs::File::open(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let gpx = gpx::read(BufReader::new(file)).map_err(|source| ReplayError::Gpx {
        path: path.to_path_buf(),
        source,
    })?;
    let samples = samples_from_gpx(&gpx, vehicle_id);
    tracing::info!(
        "Loaded {} samples for {} from {}",
        samples.len(),
        vehicle_id,
        path.display()
    );
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpx::{Track, TrackSegment};

    fn waypoint(lat: f64, lng: f64, secs: Option<i64>) -> Waypoint {
        let mut wp = Waypoint::new(Point::new(lng, lat));
        wp.time = secs.map(|s| OffsetDateTime::from_unix_timestamp(s).unwrap().into());
        wp
    }

    fn gpx_with(segments: Vec<Vec<Waypoint>>) -> Gpx {
        let mut gpx = Gpx::default();
        let mut track = Track::default();
        for points in segments {
            let mut segment = TrackSegment::default();
            segment.points = points;
            track.segments.push(segment);
        }
        gpx.tracks.push(track);
        gpx
    }

    #[test]
    fn test_points_become_samples() {
        let gpx = gpx_with(vec![vec![
            waypoint(1.0, 2.0, Some(100)),
            waypoint(1.5, 2.5, Some(160)),
        ]]);
        let samples = samples_from_gpx(&gpx, "truck");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].vehicle_id, "truck");
        assert_eq!((samples[0].lat, samples[0].lng), (1.0, 2.0));
        assert_eq!(samples[0].timestamp, 100_000);
        assert_eq!(samples[1].timestamp, 160_000);
    }

    #[test]
    fn test_speed_is_derived_from_distance() {
        // 0.001 degrees of latitude is about 111 m
        let gpx = gpx_with(vec![vec![
            waypoint(0.0, 0.0, Some(0)),
            waypoint(0.001, 0.0, Some(10)),
        ]]);
        let samples = samples_from_gpx(&gpx, "v");
        assert!(samples[0].speed_kph.is_none());

        let expected = distance_m(Point::new(0.0, 0.0), Point::new(0.0, 0.001)) / 10.0 * 3.6;
        let speed = samples[1].speed_kph.unwrap();
        assert!((speed - expected).abs() < 1e-9);
        assert!((speed - 40.0).abs() < 0.1);
    }

    #[test]
    fn test_recorded_speed_wins() {
        let mut fast = waypoint(0.001, 0.0, Some(10));
        fast.speed = Some(20.0);
        let gpx = gpx_with(vec![vec![waypoint(0.0, 0.0, Some(0)), fast]]);
        let samples = samples_from_gpx(&gpx, "v");
        assert_eq!(samples[1].speed_kph, Some(72.0));
    }

    #[test]
    fn test_untimed_points_are_skipped() {
        let gpx = gpx_with(vec![vec![
            waypoint(0.0, 0.0, Some(0)),
            waypoint(0.0005, 0.0, None),
            waypoint(0.001, 0.0, Some(10)),
        ]]);
        let samples = samples_from_gpx(&gpx, "v");
        assert_eq!(samples.len(), 2);
        // Derived from the previous timed point
        assert!(samples[1].speed_kph.is_some());
    }

    #[test]
    fn test_segments_do_not_share_speed() {
        let gpx = gpx_with(vec![
            vec![waypoint(0.0, 0.0, Some(0))],
            vec![waypoint(0.001, 0.0, Some(10))],
        ]);
        let samples = samples_from_gpx(&gpx, "v");
        assert_eq!(samples.len(), 2);
        assert!(samples[1].speed_kph.is_none());
    }

    #[test]
    fn test_parse_gpx_document() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><trkseg>
    <trkpt lat="0.0" lon="0.0"><time>2024-01-01T00:00:00Z</time></trkpt>
    <trkpt lat="0.001" lon="0.0"><time>2024-01-01T00:00:30Z</time></trkpt>
  </trkseg></trk>
</gpx>"#;
        let gpx = gpx::read(xml.as_bytes()).unwrap();
        let samples = samples_from_gpx(&gpx, "v");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp, 1_704_067_200_000);
        assert_eq!(samples[1].timestamp - samples[0].timestamp, 30_000);
    }

    #[test]
    fn test_missing_file() {
        let err = load_gpx_samples(Path::new("/definitely/not/here.gpx"), "v").unwrap_err();
        assert!(matches!(err, ReplayError::Io { .. }));
    }
}
