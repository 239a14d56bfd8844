//! Geometry primitives for geofence tests
//!
//! All points are WGS84 degrees stored as `geo::Point` with `x = longitude` and
//! `y = latitude`, the same convention `geo` and `gpx` use.

use geo::{Coord, Intersects, Point, Rect};

/// Earth's mean radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Length of one degree of latitude on the same sphere, in meters
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Haversine great-circle distance between two points in meters
#[inline]
pub fn distance_m(a: Point<f64>, b: Point<f64>) -> f64 {
    let lat1 = a.y().to_radians();
    let lat2 = b.y().to_radians();
    let delta_lat = (b.y() - a.y()).to_radians();
    let delta_lon = (b.x() - a.x()).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// True iff `p` lies within `radius_m` meters of `center` (boundary included)
#[inline]
pub fn point_in_circle(p: Point<f64>, center: Point<f64>, radius_m: f64) -> bool {
    distance_m(p, center) <= radius_m
}

/// Even-odd ray casting test against an ordered vertex ring
///
/// The ring may be open or closed (first vertex repeated at the end). Rings
/// with fewer than 3 vertices are degenerate and never contain anything.
pub fn point_in_polygon(p: Point<f64>, ring: &[Coord<f64>]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }

    let (x, y) = (p.x(), p.y());
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i].x, ring[i].y);
        let (xj, yj) = (ring[j].x, ring[j].y);
        // Half-open rule on y so a vertex shared by two edges is counted once
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Bounding box of a circle on the haversine sphere
///
/// The box always covers every point `point_in_circle` accepts. When the
/// circle reaches a pole or crosses the antimeridian the box spans all
/// longitudes.
pub fn circle_bbox(center: Point<f64>, radius_m: f64) -> Rect<f64> {
    let angular = radius_m / EARTH_RADIUS_M;
    let d_lat = angular.to_degrees();
    let cos_lat = center.y().to_radians().cos().abs();
    let sin_angular = angular.min(std::f64::consts::FRAC_PI_2).sin();

    let (min_lng, max_lng) = if sin_angular >= cos_lat {
        (-180.0, 180.0)
    } else {
        let d_lng = (sin_angular / cos_lat).asin().to_degrees();
        let (min, max) = (center.x() - d_lng, center.x() + d_lng);
        if min < -180.0 || max > 180.0 {
            (-180.0, 180.0)
        } else {
            (min, max)
        }
    };

    Rect::new(
        Coord {
            x: min_lng,
            y: center.y() - d_lat,
        },
        Coord {
            x: max_lng,
            y: center.y() + d_lat,
        },
    )
}

/// Bounding box of a vertex list (min/max over all vertices)
///
/// Returns `None` for an empty list.
pub fn polygon_bbox(ring: &[Coord<f64>]) -> Option<Rect<f64>> {
    let first = ring.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for c in &ring[1..] {
        min_x = min_x.min(c.x);
        min_y = min_y.min(c.y);
        max_x = max_x.max(c.x);
        max_y = max_y.max(c.y);
    }
    Some(Rect::new(
        Coord { x: min_x, y: min_y },
        Coord { x: max_x, y: max_y },
    ))
}

/// Inclusive rectangular containment test
#[inline(always)]
pub fn bbox_contains(bbox: &Rect<f64>, p: Point<f64>) -> bool {
    bbox.intersects(&p.0)
}

/// Check that a point is finite and within WGS84 ranges
#[inline(always)]
pub fn is_valid_wgs84(p: Point<f64>) -> bool {
    p.x().is_finite()
        && p.y().is_finite()
        && (-180.0..=180.0).contains(&p.x())
        && (-90.0..=90.0).contains(&p.y())
}
