//! Geofence definitions and rule sets
//!
//! This module provides the `Geofence` struct: a named shape with attached rules
//! and a precomputed bounding box used by the evaluation pre-filter.

use crate::{GeofenceError, Result, geometry};
use geo::{Coord, Point, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which transitions of a fence produce events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Only ENTER is reported, EXIT is suppressed
    Enter,
    /// Only EXIT is reported, ENTER is suppressed
    Exit,
    /// Both transitions are reported
    #[default]
    Both,
}

impl Direction {
    /// Whether ENTER events pass this filter
    #[inline]
    pub fn allows_enter(self) -> bool {
        self != Direction::Exit
    }

    /// Whether EXIT events pass this filter
    #[inline]
    pub fn allows_exit(self) -> bool {
        self != Direction::Enter
    }
}

/// Behavioral rules attached to a fence
///
/// Every field is optional and an absent field disables its filter: no dwell
/// reporting, no speed checks, and both directions reported.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct RuleSet {
    /// Continuous inside time (seconds) after which a single DWELL is emitted
    pub dwell_seconds: Option<f64>,
    /// Speed (km/h) above which every inside sample emits SPEED
    pub speed_limit: Option<f64>,
    /// Direction filter applied when emitting ENTER/EXIT
    pub direction: Direction,
    /// Schedule payload as JSON text. Stored but never evaluated.
    ///
    /// Any JSON value is accepted on input and written back as that value.
    #[cfg_attr(feature = "serde", serde(with = "json_text"))]
    pub schedule: Option<String>,
}

/// (De)serializes an optional JSON value kept as its text
#[cfg(feature = "serde")]
mod json_text {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(text: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match text {
            None => serializer.serialize_none(),
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => value.serialize(serializer),
                Err(_) => serializer.serialize_str(text),
            },
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?
            .filter(|value| !value.is_null())
            .map(|value| value.to_string()))
    }
}

impl RuleSet {
    fn validate(&self, id: &str) -> Result<()> {
        if let Some(dwell) = self.dwell_seconds.filter(|d| !(d.is_finite() && *d >= 0.0)) {
            return Err(GeofenceError::InvalidRule {
                id: id.to_string(),
                reason: format!("dwellSeconds must be a non-negative number, got {dwell}"),
            });
        }
        if let Some(limit) = self.speed_limit.filter(|l| !(l.is_finite() && *l >= 0.0)) {
            return Err(GeofenceError::InvalidRule {
                id: id.to_string(),
                reason: format!("speedLimit must be a non-negative number, got {limit}"),
            });
        }
        Ok(())
    }
}

/// Display metadata carried through for collaborators; not used by evaluation
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FenceMeta {
    /// Overlay color, e.g. `#ff0000`
    pub color: Option<String>,
}

/// Shape discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ShapeKind {
    Circle,
    Polygon,
}

/// Geometry of a fence in WGS84 degrees (`x = lng`, `y = lat`)
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Circle { center: Point<f64>, radius_m: f64 },
    Polygon { vertices: Vec<Coord<f64>> },
}

impl Shape {
    /// The discriminator of this shape
    #[inline]
    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Circle { .. } => ShapeKind::Circle,
            Shape::Polygon { .. } => ShapeKind::Polygon,
        }
    }

    /// Axis-aligned bounding box, `None` for a polygon without vertices
    pub fn bbox(&self) -> Option<Rect<f64>> {
        match self {
            Shape::Circle { center, radius_m } => Some(geometry::circle_bbox(*center, *radius_m)),
            Shape::Polygon { vertices } => geometry::polygon_bbox(vertices),
        }
    }

    /// Exact containment test
    #[inline]
    pub fn contains(&self, p: Point<f64>) -> bool {
        match self {
            Shape::Circle { center, radius_m } => geometry::point_in_circle(p, *center, *radius_m),
            Shape::Polygon { vertices } => geometry::point_in_polygon(p, vertices),
        }
    }

    /// A polygon with fewer than 3 vertices can never contain a point
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        matches!(self, Shape::Polygon { vertices } if vertices.len() < 3)
    }

    fn validate(&self, id: &str) -> Result<()> {
        match self {
            Shape::Circle { center, radius_m } => {
                if !geometry::is_valid_wgs84(*center) {
                    return Err(GeofenceError::InvalidGeometry(format!(
                        "fence '{id}': center ({}, {}) is not a valid lat/lng",
                        center.y(),
                        center.x()
                    )));
                }
                if !(radius_m.is_finite() && *radius_m >= 0.0) {
                    return Err(GeofenceError::InvalidGeometry(format!(
                        "fence '{id}': radius must be a non-negative number, got {radius_m}"
                    )));
                }
            }
            Shape::Polygon { vertices } => {
                if let Some(bad) = vertices
                    .iter()
                    .find(|c| !geometry::is_valid_wgs84(Point::from(**c)))
                {
                    return Err(GeofenceError::InvalidGeometry(format!(
                        "fence '{id}': vertex ({}, {}) is not a valid lat/lng",
                        bad.y, bad.x
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A named geographic region with rules
///
/// The bounding box is computed once at construction; the shape cannot be
/// changed afterwards, so the cached box never goes stale. Replace the fence
/// in the registry to change its geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Geofence {
    id: String,
    name: String,
    shape: Shape,
    rules: RuleSet,
    meta: FenceMeta,
    active: bool,
    /// Precomputed pre-filter box (None = never matches)
    bbox: Option<Rect<f64>>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Geofence {
    /// Create an active fence with empty rules
    pub fn new(id: impl Into<String>, name: impl Into<String>, shape: Shape) -> Self {
        let bbox = shape.bbox();
        Self {
            id: id.into(),
            name: name.into(),
            shape,
            rules: RuleSet::default(),
            meta: FenceMeta::default(),
            active: true,
            bbox,
        }
    }

    /// Circle centered at (`lat`, `lng`) with the given radius in meters
    pub fn circle(id: impl Into<String>, lat: f64, lng: f64, radius_m: f64) -> Self {
        let id = id.into();
        Self::new(
            id.clone(),
            id,
            Shape::Circle {
                center: Point::new(lng, lat),
                radius_m,
            },
        )
    }

    /// Polygon from (`lat`, `lng`) vertex pairs
    pub fn polygon(id: impl Into<String>, vertices: &[(f64, f64)]) -> Self {
        let id = id.into();
        let vertices = vertices
            .iter()
            .map(|&(lat, lng)| Coord { x: lng, y: lat })
            .collect();
        Self::new(id.clone(), id, Shape::Polygon { vertices })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_meta(mut self, meta: FenceMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    #[inline]
    pub fn meta(&self) -> &FenceMeta {
        &self.meta
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Precomputed bounding box, `None` if the shape has no extent at all
    #[inline]
    pub fn bbox(&self) -> Option<Rect<f64>> {
        self.bbox
    }

    /// Cheap pre-filter: false means the exact test can be skipped
    #[inline]
    pub fn bbox_contains(&self, p: Point<f64>) -> bool {
        self.bbox
            .as_ref()
            .is_some_and(|bbox| geometry::bbox_contains(bbox, p))
    }

    /// Exact containment test for this fence's shape
    #[inline]
    pub fn contains(&self, p: Point<f64>) -> bool {
        self.shape.contains(p)
    }

    /// Check a fence before it enters the registry
    ///
    /// Degenerate polygons are accepted (they simply never match) but logged.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(GeofenceError::EmptyId);
        }
        self.shape.validate(&self.id)?;
        self.rules.validate(&self.id)?;

        if self.shape.is_degenerate() {
            tracing::warn!(
                fence = %self.id,
                "Polygon has fewer than 3 vertices and will never match"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "serde")]
    #[test]
    fn test_rule_set_accepts_any_schedule() {
        let rules: RuleSet = serde_json::from_str(
            r#"{"dwellSeconds": 30, "schedule": {"days": ["mon", "tue"], "from": "08:00"}}"#,
        )
        .unwrap();
        assert_eq!(rules.dwell_seconds, Some(30.0));
        let schedule = rules.schedule.as_deref().unwrap();
        let value: serde_json::Value = serde_json::from_str(schedule).unwrap();
        assert_eq!(value["days"][1], "tue");

        // Written back as the original value, not as a string
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json["schedule"]["from"], "08:00");

        let rules: RuleSet = serde_json::from_str(r#"{"schedule": null}"#).unwrap();
        assert!(rules.schedule.is_none());
        let rules: RuleSet = serde_json::from_str(r#"{"schedule": "weekdays"}"#).unwrap();
        assert_eq!(rules.schedule.as_deref(), Some(r#""weekdays""#));
    }

    #[test]
    fn test_circle_construction() {
        let fence = Geofence::circle("depot", 51.5, -0.12, 250.0);
        assert_eq!(fence.id(), "depot");
        assert_eq!(fence.name(), "depot");
        assert!(fence.is_active());
        assert_eq!(fence.rules(), &RuleSet::default());
        assert_eq!(fence.shape().kind(), ShapeKind::Circle);
        assert!(fence.bbox().is_some());
        assert!(fence.contains(Point::new(-0.12, 51.5)));
    }

    #[test]
    fn test_polygon_construction_uses_lat_lng_pairs() {
        let fence = Geofence::polygon("yard", &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]);
        match fence.shape() {
            Shape::Polygon { vertices } => {
                assert_eq!(vertices.len(), 4);
                assert_eq!(vertices[1], Coord { x: 1.0, y: 0.0 });
            }
            other => panic!("unexpected shape {other:?}"),
        }
        assert!(fence.contains(Point::new(0.5, 0.5)));
    }

    #[test]
    fn test_builders() {
        let rules = RuleSet {
            dwell_seconds: Some(30.0),
            direction: Direction::Exit,
            ..Default::default()
        };
        let fence = Geofence::circle("a", 0.0, 0.0, 10.0)
            .with_name("Alpha")
            .with_rules(rules.clone())
            .with_meta(FenceMeta {
                color: Some("#00ff00".into()),
            })
            .with_active(false);
        assert_eq!(fence.name(), "Alpha");
        assert_eq!(fence.rules(), &rules);
        assert_eq!(fence.meta().color.as_deref(), Some("#00ff00"));
        assert!(!fence.is_active());
    }

    #[test]
    fn test_direction_filters() {
        assert!(Direction::Both.allows_enter() && Direction::Both.allows_exit());
        assert!(Direction::Enter.allows_enter() && !Direction::Enter.allows_exit());
        assert!(!Direction::Exit.allows_enter() && Direction::Exit.allows_exit());
        assert_eq!(Direction::default(), Direction::Both);
    }

    #[test]
    fn test_bbox_prefilter() {
        let fence = Geofence::circle("c", 0.0, 0.0, 100.0);
        assert!(fence.bbox_contains(Point::new(0.0, 0.0)));
        assert!(!fence.bbox_contains(Point::new(0.002, 0.002)));

        let empty = Geofence::new("e", "e", Shape::Polygon { vertices: vec![] });
        assert!(empty.bbox().is_none());
        assert!(!empty.bbox_contains(Point::new(0.0, 0.0)));
    }

    #[test]
    fn test_validate_accepts_degenerate_polygon() {
        let fence = Geofence::polygon("line", &[(0.0, 0.0), (1.0, 1.0)]);
        assert!(fence.shape().is_degenerate());
        assert!(fence.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(matches!(
            Geofence::circle("  ", 0.0, 0.0, 1.0).validate(),
            Err(GeofenceError::EmptyId)
        ));
        assert!(matches!(
            Geofence::circle("r", 0.0, 0.0, -1.0).validate(),
            Err(GeofenceError::InvalidGeometry(_))
        ));
        assert!(matches!(
            Geofence::circle("lat", 91.0, 0.0, 1.0).validate(),
            Err(GeofenceError::InvalidGeometry(_))
        ));
        assert!(matches!(
            Geofence::polygon("p", &[(0.0, 0.0), (f64::NAN, 1.0), (1.0, 1.0)]).validate(),
            Err(GeofenceError::InvalidGeometry(_))
        ));

        let bad_rules = RuleSet {
            speed_limit: Some(-5.0),
            ..Default::default()
        };
        assert!(matches!(
            Geofence::circle("s", 0.0, 0.0, 1.0)
                .with_rules(bad_rules)
                .validate(),
            Err(GeofenceError::InvalidRule { .. })
        ));
    }
}
