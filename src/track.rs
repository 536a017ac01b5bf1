use geo::{Distance, Euclidean, Point};
use sha2::{Digest, Sha256};

use crate::bounds::Bounds;
use crate::geometry::{LocalProjection, LonLat};

/// A user track as a bare coordinate sequence.
///
/// Parsing, distance accumulation and elevation handling live upstream;
/// this crate only needs the geometry, a bounding extent and a stable
/// identity for cache keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    lonlat: Vec<LonLat>,
}

impl Track {
    pub fn new(lonlat: Vec<LonLat>) -> Self {
        debug_assert!(!lonlat.is_empty(), "track must carry at least one point");
        Self { lonlat }
    }

    #[inline]
    pub fn lonlat(&self) -> &[LonLat] {
        &self.lonlat
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lonlat.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lonlat.is_empty()
    }

    /// Extent of the track coordinates.
    pub fn bounds(&self) -> Bounds {
        Bounds::from_points(&self.lonlat).expect("track must carry at least one point")
    }

    /// Stable digest of the coordinate sequence, used to key caches by
    /// track identity. Coordinates are rounded to ~1 m precision so GPX
    /// re-exports with float noise map to the same entry.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for &(lon, lat) in &self.lonlat {
            hasher.update(format!("{lat:.5},{lon:.5};").as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Minimum distance in meters from each target to the track polyline.
    ///
    /// The track may be sparse along straight segments, so distances are
    /// computed against the projected polyline in a local planar frame
    /// rather than point-to-point in raw lon/lat.
    pub fn min_distances_m(&self, targets: &[LonLat]) -> Vec<f64> {
        let proj = LocalProjection::fit(&self.lonlat);
        let track_xy = proj.project_line(&self.lonlat);

        targets
            .iter()
            .map(|&target| {
                let p: Point<f64> = proj.project(target).into();
                if self.lonlat.len() < 2 {
                    let only: Point<f64> = track_xy.0[0].into();
                    Euclidean.distance(p, only)
                } else {
                    Euclidean.distance(&p, &track_xy)
                }
            })
            .collect()
    }
}
