//! # Geographic Utilities
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_km`] | Great-circle distance between two trackpoints in kilometers |
//! | [`track_length_km`] | Sum of consecutive great-circle segments |
//! | [`RegionBox`] | Inclusive bounding box around a point of interest |
//!
//! All functions expect WGS84 coordinates in degrees. Distances assume a
//! spherical Earth with the mean radius used by the `geo` crate (6371.0088 km).

use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

use crate::Trackpoint;

/// Calculate the great-circle distance between two trackpoints, in kilometers.
///
/// # Example
///
/// ```rust
/// use chrono::NaiveDate;
/// use geolife_tracks::{geo_utils, Trackpoint};
///
/// let t = NaiveDate::from_ymd_opt(2008, 10, 23).unwrap().and_hms_opt(2, 53, 4).unwrap();
/// let a = Trackpoint { lat: 39.9840, lon: 116.3184, altitude: 492, date_days: 39744.12, date_time: t };
/// let b = Trackpoint { lat: 39.9847, lon: 116.3190, ..a };
/// assert!(geo_utils::haversine_km(&a, &b) < 0.1);
/// ```
#[inline]
pub fn haversine_km(p1: &Trackpoint, p2: &Trackpoint) -> f64 {
    let point1 = Point::new(p1.lon, p1.lat);
    let point2 = Point::new(p2.lon, p2.lat);
    Haversine::distance(point1, point2) / 1000.0
}

/// Total length of a track in kilometers. Empty or single-point tracks return 0.0.
pub fn track_length_km(points: &[Trackpoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_km(&w[0], &w[1]))
        .sum()
}

/// Axis-aligned box of `center ± tolerance` degrees around a point of interest.
///
/// Both edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBox {
    pub center_lat: f64,
    pub center_lon: f64,
    pub tolerance: f64,
}

impl RegionBox {
    pub fn new(center_lat: f64, center_lon: f64, tolerance: f64) -> Self {
        Self {
            center_lat,
            center_lon,
            tolerance,
        }
    }

    /// The Forbidden City, Beijing.
    pub fn forbidden_city() -> Self {
        Self::new(39.916, 116.397, 0.001)
    }

    pub fn min_lat(&self) -> f64 {
        self.center_lat - self.tolerance
    }

    pub fn max_lat(&self) -> f64 {
        self.center_lat + self.tolerance
    }

    pub fn min_lon(&self) -> f64 {
        self.center_lon - self.tolerance
    }

    pub fn max_lon(&self) -> f64 {
        self.center_lon + self.tolerance
    }

    #[inline]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat() && lat <= self.max_lat() && lon >= self.min_lon() && lon <= self.max_lon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, point};

    #[test]
    fn test_identical_points_zero_distance() {
        let a = point(39.9, 116.4, 100, at(10, 0, 0));
        let b = point(39.9, 116.4, 100, at(10, 0, 5));
        assert_eq!(haversine_km(&a, &b), 0.0);
    }

    #[test]
    fn test_one_km_along_meridian() {
        let delta_deg = (1000.0_f64 / 6_371_008.8).to_degrees();
        let a = point(39.9, 116.4, 100, at(10, 0, 0));
        let b = point(39.9 + delta_deg, 116.4, 100, at(10, 0, 5));
        assert!((haversine_km(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_track_length_sums_segments() {
        let delta_deg = (1000.0_f64 / 6_371_008.8).to_degrees();
        // Out and back: endpoint distance is zero but the track is 2 km
        let track = vec![
            point(10.0, 20.0, 0, at(10, 0, 0)),
            point(10.0 + delta_deg, 20.0, 0, at(10, 0, 5)),
            point(10.0, 20.0, 0, at(10, 0, 10)),
        ];
        assert!((track_length_km(&track) - 2.0).abs() < 1e-6);
        assert_eq!(track_length_km(&track[..1]), 0.0);
    }

    #[test]
    fn test_region_edges() {
        let region = RegionBox::forbidden_city();
        assert!(region.contains(39.916, 116.397));
        assert!(region.contains(region.max_lat(), region.min_lon()));
        assert!(!region.contains(region.max_lat() + 1e-9, 116.397));
        assert!(!region.contains(39.916, region.min_lon() - 1e-9));
    }
}
