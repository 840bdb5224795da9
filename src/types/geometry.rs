//! Planar geometry primitives used for shard bounds and boundary expansion.
//!
//! Coordinates are WGS84 degrees. Distances use the equirectangular
//! approximation, which is accurate enough for buffer radii of a few
//! tens of kilometers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Coordinate quantization used by the complete flag form (1e-7 degrees).
const COORDINATE_QUANTUM: f64 = 10_000_000.0;

/// A distance in meters.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Distance(f64);

impl Distance {
    /// Zero distance.
    pub const ZERO: Distance = Distance(0.0);

    /// Create a distance from meters. Negative values clamp to zero.
    pub fn meters(meters: f64) -> Self {
        Self(meters.max(0.0))
    }

    /// Create a distance from kilometers.
    pub fn kilometers(kilometers: f64) -> Self {
        Self::meters(kilometers * 1000.0)
    }

    /// Value in meters.
    pub fn as_meters(&self) -> f64 {
        self.0
    }

    /// Value in kilometers.
    pub fn as_kilometers(&self) -> f64 {
        self.0 / 1000.0
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}km", self.as_kilometers())
    }
}

/// A point on the globe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

impl Location {
    /// Create a new location.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Snap to the 1e-7 degree grid.
    pub fn quantized(&self) -> Self {
        Self {
            lat: (self.lat * COORDINATE_QUANTUM).round() / COORDINATE_QUANTUM,
            lon: (self.lon * COORDINATE_QUANTUM).round() / COORDINATE_QUANTUM,
        }
    }

    /// Integer key on the 1e-7 grid, usable for ordering and hashing.
    pub fn grid_key(&self) -> (i64, i64) {
        (
            (self.lat * COORDINATE_QUANTUM).round() as i64,
            (self.lon * COORDINATE_QUANTUM).round() as i64,
        )
    }

    /// Degenerate rectangle around this point.
    pub fn bounds(&self) -> Rectangle {
        Rectangle::new(*self, *self)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.7}, {:.7})", self.lat, self.lon)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    /// South-west corner.
    pub lower_left: Location,
    /// North-east corner.
    pub upper_right: Location,
}

impl Rectangle {
    /// Create a rectangle from two corners in any order.
    pub fn new(a: Location, b: Location) -> Self {
        Self {
            lower_left: Location::new(a.lat.min(b.lat), a.lon.min(b.lon)),
            upper_right: Location::new(a.lat.max(b.lat), a.lon.max(b.lon)),
        }
    }

    /// Smallest rectangle covering all locations. `None` when empty.
    pub fn covering<'a, I>(locations: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Location>,
    {
        let mut iter = locations.into_iter();
        let first = iter.next()?;
        let mut rect = first.bounds();
        for location in iter {
            rect = rect.union(&location.bounds());
        }
        Some(rect)
    }

    /// Smallest rectangle covering all rectangles. `None` when empty.
    pub fn covering_all<'a, I>(rects: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Rectangle>,
    {
        rects.into_iter().fold(None, |acc: Option<Rectangle>, r| {
            Some(match acc {
                Some(a) => a.union(r),
                None => *r,
            })
        })
    }

    /// Union of two rectangles.
    pub fn union(&self, other: &Rectangle) -> Rectangle {
        Rectangle {
            lower_left: Location::new(
                self.lower_left.lat.min(other.lower_left.lat),
                self.lower_left.lon.min(other.lower_left.lon),
            ),
            upper_right: Location::new(
                self.upper_right.lat.max(other.upper_right.lat),
                self.upper_right.lon.max(other.upper_right.lon),
            ),
        }
    }

    /// Grow the rectangle by `distance` on every side.
    ///
    /// The result is clamped to the world box and does not wrap: a shard on
    /// the antimeridian gets no buffer on the far side.
    pub fn expand(&self, distance: Distance) -> Rectangle {
        let d_lat = distance.as_meters() / METERS_PER_DEGREE;
        // Use the latitude farthest from the equator so the buffer is never short.
        let lat_ref = self.lower_left.lat.abs().max(self.upper_right.lat.abs()).min(89.0);
        let d_lon = distance.as_meters() / (METERS_PER_DEGREE * lat_ref.to_radians().cos());
        Rectangle {
            lower_left: Location::new(
                (self.lower_left.lat - d_lat).max(-90.0),
                (self.lower_left.lon - d_lon).max(-180.0),
            ),
            upper_right: Location::new(
                (self.upper_right.lat + d_lat).min(90.0),
                (self.upper_right.lon + d_lon).min(180.0),
            ),
        }
    }

    /// Whether two rectangles share any point (closed intervals).
    pub fn overlaps(&self, other: &Rectangle) -> bool {
        self.lower_left.lat <= other.upper_right.lat
            && other.lower_left.lat <= self.upper_right.lat
            && self.lower_left.lon <= other.upper_right.lon
            && other.lower_left.lon <= self.upper_right.lon
    }

    /// Whether `location` lies inside (closed).
    pub fn contains(&self, location: &Location) -> bool {
        location.lat >= self.lower_left.lat
            && location.lat <= self.upper_right.lat
            && location.lon >= self.lower_left.lon
            && location.lon <= self.upper_right.lon
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn encloses(&self, other: &Rectangle) -> bool {
        self.contains(&other.lower_left) && self.contains(&other.upper_right)
    }

    /// Center point.
    pub fn center(&self) -> Location {
        Location::new(
            (self.lower_left.lat + self.upper_right.lat) / 2.0,
            (self.lower_left.lon + self.upper_right.lon) / 2.0,
        )
    }

    /// Gap between two rectangles; zero when they overlap.
    pub fn distance_to(&self, other: &Rectangle) -> Distance {
        let d_lat = (other.lower_left.lat - self.upper_right.lat)
            .max(self.lower_left.lat - other.upper_right.lat)
            .max(0.0);
        let d_lon = (other.lower_left.lon - self.upper_right.lon)
            .max(self.lower_left.lon - other.upper_right.lon)
            .max(0.0);
        let lat_ref = ((self.center().lat + other.center().lat) / 2.0).to_radians();
        let dy = d_lat * METERS_PER_DEGREE;
        let dx = d_lon * METERS_PER_DEGREE * lat_ref.cos();
        Distance::meters((dx * dx + dy * dy).sqrt())
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} -> {}]", self.lower_left, self.upper_right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_contains_original() {
        let rect = Rectangle::new(Location::new(10.0, 10.0), Location::new(11.0, 11.0));
        let expanded = rect.expand(Distance::kilometers(5.0));
        assert!(expanded.encloses(&rect));
        assert!(expanded.lower_left.lat < 10.0);
        assert!(expanded.upper_right.lon > 11.0);
    }

    #[test]
    fn test_expand_clamps_at_antimeridian() {
        let r = Rectangle::new(Location::new(0.0, 179.9), Location::new(0.1, 180.0));
        let e = r.expand(Distance::kilometers(50.0));
        assert_eq!(e.upper_right.lon, 180.0);
        assert!(e.lower_left.lon < 179.9);
        assert!(!e.overlaps(&Rectangle::new(
            Location::new(0.0, -180.0),
            Location::new(0.1, -179.9)
        )));
    }

    #[test]
    fn test_distance_between_adjacent_boxes_is_zero() {
        let a = Rectangle::new(Location::new(0.0, 0.0), Location::new(1.0, 1.0));
        let b = Rectangle::new(Location::new(0.0, 1.0), Location::new(1.0, 2.0));
        assert_eq!(a.distance_to(&b), Distance::ZERO);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn test_distance_matches_expansion() {
        let a = Rectangle::new(Location::new(0.0, 0.0), Location::new(1.0, 1.0));
        let b = Rectangle::new(Location::new(0.0, 1.1), Location::new(1.0, 2.0));
        let gap = a.distance_to(&b);
        // ~0.1 degree of longitude near the equator
        assert!(gap.as_kilometers() > 10.0 && gap.as_kilometers() < 12.0);
        assert!(!a.expand(Distance::kilometers(5.0)).overlaps(&b));
        assert!(a.expand(Distance::kilometers(12.0)).overlaps(&b));
    }

    #[test]
    fn test_covering() {
        let locations = [Location::new(1.0, 5.0), Location::new(-2.0, 3.0)];
        let rect = Rectangle::covering(&locations).unwrap();
        assert_eq!(rect.lower_left, Location::new(-2.0, 3.0));
        assert_eq!(rect.upper_right, Location::new(1.0, 5.0));
        assert!(Rectangle::covering(&[] as &[Location]).is_none());
    }

    #[test]
    fn test_quantized_grid() {
        let a = Location::new(1.000_000_01, 2.0);
        let b = Location::new(1.000_000_02, 2.0);
        assert_eq!(a.grid_key(), b.grid_key());
    }
}
