use geo::{Coord, LineString, Polygon};

use crate::bounds::EARTH_RADIUS_M;

/// A lon/lat coordinate pair in degrees.
pub type LonLat = (f64, f64);

/// Local equirectangular projection fitted at the mean latitude of a point
/// set. Accurate enough for the short distances this crate deals with
/// (tracks and extents of a few tens of kilometers).
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    lon0: f64,
    lat0: f64,
    cos_lat: f64,
}

impl LocalProjection {
    /// Fit the projection origin at the mean coordinate of `lonlat`.
    pub fn fit(lonlat: &[LonLat]) -> Self {
        let n = lonlat.len().max(1) as f64;
        let (sum_lon, sum_lat) = lonlat
            .iter()
            .fold((0.0, 0.0), |(slon, slat), &(lon, lat)| (slon + lon, slat + lat));
        let lat0 = sum_lat / n;
        Self { lon0: sum_lon / n, lat0, cos_lat: lat0.to_radians().cos() }
    }

    /// Project a lon/lat point to planar x/y in meters.
    pub fn project(&self, (lon, lat): LonLat) -> Coord<f64> {
        Coord {
            x: (lon - self.lon0).to_radians() * self.cos_lat * EARTH_RADIUS_M,
            y: (lat - self.lat0).to_radians() * EARTH_RADIUS_M,
        }
    }

    pub fn project_line(&self, lonlat: &[LonLat]) -> LineString<f64> {
        LineString::from(lonlat.iter().map(|&p| self.project(p)).collect::<Vec<_>>())
    }
}

/// Mean coordinate of a non-empty point set.
pub fn mean_lonlat(lonlat: &[LonLat]) -> LonLat {
    debug_assert!(!lonlat.is_empty(), "mean of empty point set");
    let n = lonlat.len().max(1) as f64;
    let (sum_lon, sum_lat) = lonlat
        .iter()
        .fold((0.0, 0.0), |(slon, slat), &(lon, lat)| (slon + lon, slat + lat));
    (sum_lon / n, sum_lat / n)
}

/// Full pairwise distance matrix in meters, via one shared local projection.
pub fn pairwise_distances_m(lonlat: &[LonLat]) -> Vec<Vec<f64>> {
    let proj = LocalProjection::fit(lonlat);
    let xy: Vec<Coord<f64>> = lonlat.iter().map(|&p| proj.project(p)).collect();
    xy.iter()
        .map(|a| xy.iter().map(|b| (a.x - b.x).hypot(a.y - b.y)).collect())
        .collect()
}

/// Number of points used to approximate each semicircular end cap.
const CAP_STEPS: usize = 8;

/// Turn an open polyline into a filled ribbon polygon of the given total
/// width, in the same (degree) coordinate space as the input. Replaces a
/// round-join buffer: one offset pass per side plus semicircular end caps,
/// which is enough for filled rendering of waterway center-lines.
///
/// Returns `None` for degenerate inputs (fewer than two distinct points).
pub fn buffer_polyline(line: &[LonLat], width: f64) -> Option<Polygon<f64>> {
    let pts: Vec<Coord<f64>> = dedup_consecutive(line);
    if pts.len() < 2 || width <= 0.0 {
        return None;
    }
    let half = width / 2.0;

    // Unit normal per vertex, averaged over the adjacent segment normals.
    let normals: Vec<Coord<f64>> = (0..pts.len())
        .map(|i| {
            let before = if i > 0 { segment_normal(pts[i - 1], pts[i]) } else { Coord::zero() };
            let after = if i + 1 < pts.len() {
                segment_normal(pts[i], pts[i + 1])
            } else {
                Coord::zero()
            };
            normalize(Coord { x: before.x + after.x, y: before.y + after.y })
        })
        .collect();

    let mut ring: Vec<Coord<f64>> = Vec::with_capacity(2 * pts.len() + 2 * CAP_STEPS);

    // Left side, forward.
    for (p, n) in pts.iter().zip(&normals) {
        ring.push(Coord { x: p.x + n.x * half, y: p.y + n.y * half });
    }
    // End cap, sweeping from +normal to -normal around the last point.
    arc_around(&mut ring, *pts.last().unwrap(), *normals.last().unwrap(), half);
    // Right side, backward.
    for (p, n) in pts.iter().zip(&normals).rev() {
        ring.push(Coord { x: p.x - n.x * half, y: p.y - n.y * half });
    }
    // Start cap, sweeping from -normal back to +normal around the first point.
    let flipped = Coord { x: -normals[0].x, y: -normals[0].y };
    arc_around(&mut ring, pts[0], flipped, half);

    Some(Polygon::new(LineString::from(ring), vec![]))
}

fn dedup_consecutive(line: &[LonLat]) -> Vec<Coord<f64>> {
    let mut out: Vec<Coord<f64>> = Vec::with_capacity(line.len());
    for &(lon, lat) in line {
        let c = Coord { x: lon, y: lat };
        if out.last().is_none_or(|&last| last != c) {
            out.push(c);
        }
    }
    out
}

fn segment_normal(a: Coord<f64>, b: Coord<f64>) -> Coord<f64> {
    normalize(Coord { x: -(b.y - a.y), y: b.x - a.x })
}

fn normalize(v: Coord<f64>) -> Coord<f64> {
    let len = v.x.hypot(v.y);
    if len > 0.0 { Coord { x: v.x / len, y: v.y / len } } else { Coord { x: 0.0, y: 1.0 } }
}

/// Append an approximated semicircle around `center`, starting at
/// `center + normal*radius` and ending at the antipodal offset.
fn arc_around(ring: &mut Vec<Coord<f64>>, center: Coord<f64>, normal: Coord<f64>, radius: f64) {
    let start = normal.y.atan2(normal.x);
    for step in 1..CAP_STEPS {
        let angle = start - std::f64::consts::PI * (step as f64) / (CAP_STEPS as f64);
        ring.push(Coord {
            x: center.x + radius * angle.cos(),
            y: center.y + radius * angle.sin(),
        });
    }
}
