use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

/// Mean Earth radius, used for every metric <-> degree conversion.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Convert a short metric distance to degrees of arc on the sphere.
#[inline]
pub fn local_m_to_deg(meters: f64) -> f64 {
    (meters / EARTH_RADIUS_M).to_degrees()
}

/// Immutable geographic extent in degrees.
///
/// Foundation for every cache key and metric conversion. Invariant:
/// `lon_min <= lon_max` and `lat_min <= lat_max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl Bounds {
    pub fn new(lon_min: f64, lon_max: f64, lat_min: f64, lat_max: f64) -> Self {
        debug_assert!(lon_min <= lon_max, "lon_min must not exceed lon_max");
        debug_assert!(lat_min <= lat_max, "lat_min must not exceed lat_max");
        Self { lon_min, lon_max, lat_min, lat_max }
    }

    /// Extent of a coordinate sequence, or `None` if the slice is empty.
    pub fn from_points(lonlat: &[(f64, f64)]) -> Option<Self> {
        let (&(lon0, lat0), rest) = lonlat.split_first()?;
        let mut bounds = Self::new(lon0, lon0, lat0, lat0);
        for &(lon, lat) in rest {
            bounds.lon_min = bounds.lon_min.min(lon);
            bounds.lon_max = bounds.lon_max.max(lon);
            bounds.lat_min = bounds.lat_min.min(lat);
            bounds.lat_max = bounds.lat_max.max(lat);
        }
        Some(bounds)
    }

    /// Inflate by a fraction of the current width/height. Only ever applied
    /// before a query is issued, never to an extent already used as a key.
    pub fn with_relative_margin(&self, rel_margin: f64) -> Self {
        let lon_margin = rel_margin * (self.lon_max - self.lon_min);
        let lat_margin = rel_margin * (self.lat_max - self.lat_min);
        Self::new(
            self.lon_min - lon_margin,
            self.lon_max + lon_margin,
            self.lat_min - lat_margin,
            self.lat_max + lat_margin,
        )
    }

    /// Round all four corners to `n_decimals` decimal places.
    pub fn round(&self, n_decimals: u32) -> Self {
        let f = 10_f64.powi(n_decimals as i32);
        let r = |v: f64| (v * f).round() / f;
        Self::new(r(self.lon_min), r(self.lon_max), r(self.lat_min), r(self.lat_max))
    }

    pub fn center(&self) -> (f64, f64) {
        (
            0.5 * (self.lon_min + self.lon_max),
            0.5 * (self.lat_min + self.lat_max),
        )
    }

    /// Corner-to-corner distance in meters; the characteristic length of
    /// the mapped region.
    pub fn diagonal_m(&self) -> f64 {
        Haversine.distance(
            Point::new(self.lon_min, self.lat_min),
            Point::new(self.lon_max, self.lat_max),
        )
    }

    /// Overpass bbox filter: `(south, west, north, east)`.
    pub fn overpass_bbox(&self) -> String {
        format!(
            "({:.7},{:.7},{:.7},{:.7})",
            self.lat_min, self.lon_min, self.lat_max, self.lon_max
        )
    }

    /// Stable textual identity for cache keys. Rounded so float noise from
    /// equivalent constructions resolves to the same key.
    pub fn key_string(&self) -> String {
        let b = self.round(5);
        format!(
            "{:.5}_{:.5}_{:.5}_{:.5}",
            b.lon_min, b.lon_max, b.lat_min, b.lat_max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_points_takes_extrema() {
        let b = Bounds::from_points(&[(2.3, 48.8), (2.5, 48.7), (2.4, 48.9)]).unwrap();
        assert_eq!(b.lon_min, 2.3);
        assert_eq!(b.lon_max, 2.5);
        assert_eq!(b.lat_min, 48.7);
        assert_eq!(b.lat_max, 48.9);
        assert!(Bounds::from_points(&[]).is_none());
    }

    #[test]
    fn diagonal_is_positive_and_symmetric() {
        let b = Bounds::new(2.3, 2.5, 48.7, 48.9);
        assert!(b.diagonal_m() > 0.0);

        // Swapping the two corner points must not change the diagonal.
        let swapped = Haversine.distance(
            Point::new(b.lon_max, b.lat_max),
            Point::new(b.lon_min, b.lat_min),
        );
        assert!((b.diagonal_m() - swapped).abs() < 1e-9);
    }

    #[test]
    fn relative_margin_inflates_both_axes() {
        let b = Bounds::new(0.0, 1.0, 10.0, 12.0).with_relative_margin(0.1);
        assert!((b.lon_min - -0.1).abs() < 1e-12);
        assert!((b.lon_max - 1.1).abs() < 1e-12);
        assert!((b.lat_min - 9.8).abs() < 1e-12);
        assert!((b.lat_max - 12.2).abs() < 1e-12);
    }

    #[test]
    fn key_string_is_deterministic() {
        let a = Bounds::new(2.300001, 2.5, 48.7, 48.9);
        let b = Bounds::new(2.300003, 2.5, 48.7, 48.9);
        // Differences below the rounding precision collapse to one key.
        assert_eq!(a.key_string(), b.key_string());
    }

    #[test]
    fn m_to_deg_roundtrip() {
        let one_deg_m = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        assert!((local_m_to_deg(one_deg_m) - 1.0).abs() < 1e-12);
    }
}
