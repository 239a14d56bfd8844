//! JSON definitions of geofences and location samples
//!
//! Definitions are the loosely typed form supplied by collaborators:
//!
//! ```json
//! {"id": "depot", "name": "Depot", "type": "circle",
//!  "geometry": {"center": {"lat": 0.0, "lng": 0.0}, "radius": 100.0},
//!  "rules": {"dwellSeconds": 30, "direction": "both"},
//!  "meta": {"color": "#ff0000"}}
//! ```
//!
//! Converting a definition into a [`Geofence`] applies the defaults (empty
//! rules, active unless explicitly `false`) and validates it.

use crate::{
    Direction, FenceMeta, Geofence, GeofenceError, LocationSample, Result, RuleSet, Shape,
    ShapeKind,
};

use geo::{Coord, Point};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// A WGS84 position as written in definitions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    #[serde(alias = "lon")]
    pub lng: f64,
}

/// Geometry block; which fields are required depends on the fence type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeometryDefinition {
    pub center: Option<LatLng>,
    #[serde(alias = "radiusMeters")]
    pub radius: Option<f64>,
    #[serde(alias = "vertices", alias = "points")]
    pub path: Option<Vec<LatLng>>,
}

/// Rule block with every field optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleDefinition {
    pub dwell_seconds: Option<f64>,
    pub speed_limit: Option<f64>,
    pub direction: Option<Direction>,
    pub schedule: Option<serde_json::Value>,
}

impl From<RuleDefinition> for RuleSet {
    fn from(rules: RuleDefinition) -> Self {
        RuleSet {
            dwell_seconds: rules.dwell_seconds,
            speed_limit: rules.speed_limit,
            direction: rules.direction.unwrap_or_default(),
            schedule: rules.schedule.map(|schedule| schedule.to_string()),
        }
    }
}

/// A geofence as supplied by a collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    #[serde(default)]
    pub geometry: GeometryDefinition,
    #[serde(default)]
    pub rules: Option<RuleDefinition>,
    #[serde(default)]
    pub meta: Option<FenceMeta>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl GeofenceDefinition {
    fn shape(&self) -> Result<Shape> {
        let geometry = &self.geometry;
        match self.kind {
            ShapeKind::Circle => {
                let (center, radius) = match (geometry.center, geometry.radius) {
                    (Some(center), Some(radius)) => (center, radius),
                    (None, None) if geometry.path.is_some() => {
                        return Err(self.mismatch());
                    }
                    (None, _) => return Err(self.missing("center")),
                    (_, None) => return Err(self.missing("radius")),
                };
                Ok(Shape::Circle {
                    center: Point::new(center.lng, center.lat),
                    radius_m: radius,
                })
            }
            ShapeKind::Polygon => {
                let Some(path) = &geometry.path else {
                    if geometry.center.is_some() {
                        return Err(self.mismatch());
                    }
                    return Err(self.missing("path"));
                };
                let vertices = path
                    .iter()
                    .map(|p| Coord { x: p.lng, y: p.lat })
                    .collect();
                Ok(Shape::Polygon { vertices })
            }
        }
    }

    fn missing(&self, field: &'static str) -> GeofenceError {
        GeofenceError::MissingField {
            id: self.id.clone(),
            field,
        }
    }

    fn mismatch(&self) -> GeofenceError {
        GeofenceError::ShapeMismatch {
            id: self.id.clone(),
            kind: match self.kind {
                ShapeKind::Circle => "circle".to_string(),
                ShapeKind::Polygon => "polygon".to_string(),
            },
        }
    }
}

impl TryFrom<GeofenceDefinition> for Geofence {
    type Error = GeofenceError;

    fn try_from(definition: GeofenceDefinition) -> Result<Self> {
        let shape = definition.shape()?;
        let name = definition
            .name
            .clone()
            .unwrap_or_else(|| definition.id.clone());
        let fence = Geofence::new(definition.id, name, shape)
            .with_rules(definition.rules.map(RuleSet::from).unwrap_or_default())
            .with_meta(definition.meta.unwrap_or_default())
            .with_active(definition.active.unwrap_or(true));
        fence.validate()?;
        Ok(fence)
    }
}

/// Parse and validate a JSON array of geofence definitions
pub fn parse_geofences(json: &str) -> Result<Vec<Geofence>> {
    let definitions: Vec<GeofenceDefinition> = serde_json::from_str(json)?;
    definitions.into_iter().map(Geofence::try_from).collect()
}

/// Read and validate a JSON array of geofence definitions
pub fn read_geofences<R: Read>(reader: R) -> Result<Vec<Geofence>> {
    let definitions: Vec<GeofenceDefinition> = serde_json::from_reader(reader)?;
    definitions.into_iter().map(Geofence::try_from).collect()
}

/// Load geofence definitions from a JSON file
pub fn load_geofences_file<P: AsRef<Path>>(path: P) -> Result<Vec<Geofence>> {
    let file = std::fs::File::open(path.as_ref())?;
    let fences = read_geofences(BufReader::new(file))?;
    tracing::debug!(
        "Read {} geofence definitions from {}",
        fences.len(),
        path.as_ref().display()
    );
    Ok(fences)
}

/// Read location samples from JSON lines, skipping blank lines
pub fn read_samples<R: BufRead>(reader: R) -> Result<Vec<LocationSample>> {
    let mut samples = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        samples.push(serde_json::from_str(line)?);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_circle_with_defaults() {
        let fences = parse_geofences(
            r#"[{"id": "depot", "type": "circle",
                 "geometry": {"center": {"lat": 1.0, "lng": 2.0}, "radius": 150}}]"#,
        )
        .unwrap();
        let fence = &fences[0];
        assert_eq!(fence.id(), "depot");
        assert_eq!(fence.name(), "depot");
        assert!(fence.is_active());
        assert_eq!(fence.rules(), &RuleSet::default());
        assert_eq!(
            fence.shape(),
            &Shape::Circle {
                center: Point::new(2.0, 1.0),
                radius_m: 150.0
            }
        );
    }

    #[test]
    fn test_parse_polygon_with_rules() {
        let fences = parse_geofences(
            r##"[{"id": "yard", "name": "Yard", "type": "polygon",
                 "geometry": {"vertices": [{"lat": 0, "lng": 0}, {"lat": 0, "lng": 1}, {"lat": 1, "lng": 1}]},
                 "rules": {"dwellSeconds": 30, "speedLimit": 20.5, "direction": "exit",
                           "schedule": {"days": ["mon"]}},
                 "meta": {"color": "#00ff00"},
                 "active": false}]"##,
        )
        .unwrap();
        let fence = &fences[0];
        assert_eq!(fence.name(), "Yard");
        assert!(!fence.is_active());
        assert_eq!(fence.meta().color.as_deref(), Some("#00ff00"));

        let rules = fence.rules();
        assert_eq!(rules.dwell_seconds, Some(30.0));
        assert_eq!(rules.speed_limit, Some(20.5));
        assert_eq!(rules.direction, Direction::Exit);
        assert_eq!(rules.schedule.as_deref(), Some(r#"{"days":["mon"]}"#));

        match fence.shape() {
            Shape::Polygon { vertices } => assert_eq!(vertices[1], Coord { x: 1.0, y: 0.0 }),
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_null_rule_fields_disable_filters() {
        let fences = parse_geofences(
            r#"[{"id": "a", "type": "circle", "geometry": {"center": {"lat": 0, "lng": 0}, "radius": 1},
                 "rules": {"dwellSeconds": null, "direction": null}}]"#,
        )
        .unwrap();
        assert_eq!(fences[0].rules(), &RuleSet::default());
    }

    #[test]
    fn test_degenerate_polygon_is_accepted() {
        let fences = parse_geofences(
            r#"[{"id": "line", "type": "polygon", "geometry": {"path": [{"lat": 0, "lng": 0}, {"lat": 1, "lng": 1}]}}]"#,
        )
        .unwrap();
        assert!(fences[0].shape().is_degenerate());
    }

    #[test]
    fn test_missing_fields() {
        let err = parse_geofences(
            r#"[{"id": "c", "type": "circle", "geometry": {"center": {"lat": 0, "lng": 0}}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, GeofenceError::MissingField { field: "radius", .. }));

        let err = parse_geofences(r#"[{"id": "p", "type": "polygon"}]"#).unwrap_err();
        assert!(matches!(err, GeofenceError::MissingField { field: "path", .. }));
    }

    #[test]
    fn test_shape_mismatch() {
        let err = parse_geofences(
            r#"[{"id": "x", "type": "circle", "geometry": {"path": [{"lat": 0, "lng": 0}]}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, GeofenceError::ShapeMismatch { ref kind, .. } if kind == "circle"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = parse_geofences(
            r#"[{"id": "c", "type": "circle", "geometry": {"center": {"lat": 95, "lng": 0}, "radius": 10}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, GeofenceError::InvalidGeometry(_)));

        let err = parse_geofences(r#"[{"id": "c", "type": "hexagon"}]"#).unwrap_err();
        assert!(matches!(err, GeofenceError::Json(_)));
    }

    #[test]
    fn test_read_samples_jsonl() {
        let input = concat!(
            r#"{"id": "t1", "lat": 0.0, "lng": 0.0, "speedKph": 12.5, "timestamp": 0}"#,
            "\n\n",
            r#"{"vehicleId": "t2", "lat": 1.0, "lng": 1.0, "timestamp": 1000}"#,
            "\n"
        );
        let samples = read_samples(input.as_bytes()).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].speed_kph, Some(12.5));
        assert_eq!(samples[1].vehicle_id, "t2");

        assert!(read_samples("not json\n".as_bytes()).is_err());
    }

    #[test]
    fn test_load_geofences_file_missing() {
        let err = load_geofences_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, GeofenceError::Io(_)));
    }
}
