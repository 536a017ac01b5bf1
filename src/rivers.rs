use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bounds::{Bounds, local_m_to_deg};
use crate::cache::GeoCache;
use crate::error::Result;
use crate::overpass::{QueryBatcher, SubQuery};
use crate::processing::{
    SurfacePolygons, buffered_line_polygons, polygons_from_closed_ways, polygons_from_relations,
    surface_polygons,
};

pub const RIVERS_CACHE_NAME: &str = "rivers";

const RIVERS_RELATIONS_ARRAY_NAME: &str = "rivers_relations";
const RIVERS_WAYS_ARRAY_NAME: &str = "rivers_ways";
const RIVERS_LINE_WAYS_ARRAY_NAME: &str = "rivers_line_ways";
const STREAMS_LINE_WAYS_ARRAY_NAME: &str = "stream_line_ways";

/// Width given to river center-lines when synthesizing polygons.
const RIVER_LINE_WIDTH_M: f64 = 15.0;

const NATURAL_WATER: &[&str] =
    &["reservoir", "canal", "stream_pool", "lagoon", "oxbow", "river", "lake", "pond"];

/// Opacity-tagged polygon layer, created only as pipeline output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonAlpha {
    pub polygons: SurfacePolygons,
    pub alpha: f64,
}

/// Stream rendering characteristics as a pure function of region scale.
///
/// Returns `(width_deg, alpha)`:
/// - diagonal >= 10 km: no streams at all,
/// - diagonal <= 2 km: full width (4 m) and opacity,
/// - in between: quadratic ease-in, so streams appear abruptly-but-smoothly
///   only once the zoom is meaningfully tighter than the cut-off.
pub fn stream_visibility(diagonal_m: f64) -> (f64, f64) {
    const MAX_DISTANCE_M: f64 = 10_000.0;
    const MIN_DISTANCE_M: f64 = 2_000.0;
    const MAX_WIDTH_M: f64 = 4.0;
    const MIN_WIDTH_M: f64 = 2.0;

    if diagonal_m >= MAX_DISTANCE_M {
        return (0.0, 0.0);
    }
    if diagonal_m <= MIN_DISTANCE_M {
        return (local_m_to_deg(MAX_WIDTH_M), 1.0);
    }

    let factor = ((MAX_DISTANCE_M - diagonal_m) / (MAX_DISTANCE_M - MIN_DISTANCE_M)).powi(2);
    let width_m = MIN_WIDTH_M + (MAX_WIDTH_M - MIN_WIDTH_M) * factor;
    (local_m_to_deg(width_m), factor)
}

/// Register the river/stream sub-queries for `bounds`, unless a readable
/// cache entry already covers them.
pub fn prepare_rivers(batch: &mut QueryBatcher, cache: &GeoCache, bounds: &Bounds) -> Result<()> {
    let handle = cache.handle_for_bounds(RIVERS_CACHE_NAME, bounds);
    if cache.exists(&handle) && cache.read::<Vec<PolygonAlpha>>(&handle).is_ok() {
        batch.add_cached_result(RIVERS_CACHE_NAME, handle);
        return Ok(());
    }

    let diagonal_m = bounds.diagonal_m();
    let water = NATURAL_WATER.join("|");
    // Unnamed water ways below 1% of the region diagonal are noise;
    // Overpass `length()` is in meters.
    let min_len_m = diagonal_m * 0.01;

    batch.add_query(SubQuery {
        array_name: RIVERS_RELATIONS_ARRAY_NAME.to_string(),
        match_clauses: vec![
            format!("relation[\"natural\"=\"water\"][\"water\"~\"({water})\"]"),
            "relation[\"natural\"=\"wetland\"][\"wetland\"=\"tidal\"]".to_string(),
            "relation[\"natural\"=\"bay\"]".to_string(),
        ],
        bounds: *bounds,
        include_way_nodes: true,
        include_relation_members_nodes: true,
        return_geometry: true,
        relative_margin: None,
    })?;
    batch.add_query(SubQuery {
        array_name: RIVERS_WAYS_ARRAY_NAME.to_string(),
        match_clauses: vec![
            format!("way[\"natural\"=\"water\"][\"water\"~\"({water})\"]"),
            format!("way[\"natural\"=\"water\"][!\"water\"](if: length() > {min_len_m:.0})"),
            "way[\"natural\"=\"wetland\"][\"wetland\"=\"tidal\"]".to_string(),
            "way[\"natural\"=\"bay\"]".to_string(),
        ],
        bounds: *bounds,
        include_way_nodes: true,
        include_relation_members_nodes: false,
        return_geometry: true,
    relative_margin: None,
    })?;
    batch.add_query(SubQuery {
        array_name: RIVERS_LINE_WAYS_ARRAY_NAME.to_string(),
        match_clauses: vec!["way[\"waterway\"~\"(river|canal)\"][\"tunnel\"!~\".*\"]".to_string()],
        bounds: *bounds,
        include_way_nodes: true,
        include_relation_members_nodes: false,
        return_geometry: false,
        relative_margin: None,
    })?;

    if stream_visibility(diagonal_m).0 > 0.0 {
        batch.add_query(SubQuery {
            array_name: STREAMS_LINE_WAYS_ARRAY_NAME.to_string(),
            match_clauses: vec!["way[\"waterway\"~\"(stream)\"][\"tunnel\"!~\".*\"]".to_string()],
            bounds: *bounds,
            include_way_nodes: true,
            include_relation_members_nodes: false,
            return_geometry: false,
            relative_margin: None,
        })?;
    }
    Ok(())
}

/// Assemble the water polygon layers from the launched batch (or straight
/// from cache on a full hit): buffered river center-lines, closed water
/// ways and multipolygon relations concatenated into one opaque layer, plus
/// an optional translucent stream layer when the region is small enough.
pub fn process_rivers(
    batch: &mut QueryBatcher,
    cache: &GeoCache,
    bounds: &Bounds,
) -> Result<Vec<PolygonAlpha>> {
    if batch.is_cached(RIVERS_CACHE_NAME) {
        return cache.read(batch.get_cache_handle(RIVERS_CACHE_NAME)?);
    }

    let diagonal_m = bounds.diagonal_m();

    let relation_polygons =
        polygons_from_relations(batch.get_result(RIVERS_RELATIONS_ARRAY_NAME)?);
    let way_polygons = polygons_from_closed_ways(batch.get_result(RIVERS_WAYS_ARRAY_NAME)?);
    let line_polygons = buffered_line_polygons(
        batch.get_result(RIVERS_LINE_WAYS_ARRAY_NAME)?,
        local_m_to_deg(RIVER_LINE_WIDTH_M),
    );
    info!(
        from_relations = relation_polygons.len(),
        from_closed_ways = way_polygons.len(),
        from_center_lines = line_polygons.len(),
        "assembled river polygons"
    );

    // Concatenation order defines z-order downstream, nothing more.
    let mut rivers = line_polygons;
    rivers.extend(way_polygons);
    rivers.extend(relation_polygons);

    let mut layers = vec![PolygonAlpha { polygons: surface_polygons(&rivers), alpha: 1.0 }];

    let (stream_width_deg, stream_alpha) = stream_visibility(diagonal_m);
    if stream_width_deg > 0.0 {
        let stream_polygons = buffered_line_polygons(
            batch.get_result(STREAMS_LINE_WAYS_ARRAY_NAME)?,
            stream_width_deg,
        );
        debug!(count = stream_polygons.len(), alpha = stream_alpha, "stream layer synthesized");
        layers.push(PolygonAlpha {
            polygons: surface_polygons(&stream_polygons),
            alpha: stream_alpha,
        });
    }

    let handle = cache.handle_for_bounds(RIVERS_CACHE_NAME, bounds);
    cache.write(&handle, &layers)?;
    batch.add_cached_result(RIVERS_CACHE_NAME, handle);
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use crate::overpass::{Element, GeomPoint, QueryResult, Way};

    use super::*;

    #[test]
    fn ramp_boundary_values() {
        assert_eq!(stream_visibility(10_000.0), (0.0, 0.0));
        assert_eq!(stream_visibility(25_000.0), (0.0, 0.0));

        let (width, alpha) = stream_visibility(2_000.0);
        assert_eq!(width, local_m_to_deg(4.0));
        assert_eq!(alpha, 1.0);
        assert_eq!(stream_visibility(500.0), (width, alpha));
    }

    #[test]
    fn ramp_is_monotone_in_zoom() {
        let mut last = stream_visibility(10_000.0);
        let mut diagonal = 10_000.0;
        while diagonal >= 2_000.0 {
            let now = stream_visibility(diagonal);
            assert!(now.0 >= last.0, "width must not shrink as the region shrinks");
            assert!(now.1 >= last.1, "alpha must not shrink as the region shrinks");
            last = now;
            diagonal -= 250.0;
        }
    }

    #[test]
    fn ramp_eases_in_quadratically() {
        // Halfway through the transition the factor is 0.25, not 0.5.
        let (width, alpha) = stream_visibility(6_000.0);
        assert!((alpha - 0.25).abs() < 1e-12);
        assert!((width - local_m_to_deg(2.0 + 2.0 * 0.25)).abs() < 1e-15);
    }

    fn small_bounds() -> Bounds {
        // Diagonal well under 2 km, so the stream sub-query is required.
        Bounds::new(2.300, 2.310, 48.800, 48.805)
    }

    fn closed_way_result() -> QueryResult {
        QueryResult::new(vec![Element::Way(Way {
            id: 1,
            nodes: vec![],
            geometry: Some(
                [(2.301, 48.801), (2.302, 48.801), (2.302, 48.802), (2.301, 48.801)]
                    .iter()
                    .map(|&(lon, lat)| GeomPoint { lat, lon })
                    .collect(),
            ),
            tags: HashMap::new(),
        })])
    }

    fn line_way_result() -> QueryResult {
        QueryResult::new(vec![Element::Way(Way {
            id: 2,
            nodes: vec![],
            geometry: Some(
                [(2.301, 48.8), (2.303, 48.801), (2.305, 48.8015)]
                    .iter()
                    .map(|&(lon, lat)| GeomPoint { lat, lon })
                    .collect(),
            ),
            tags: HashMap::new(),
        })])
    }

    #[test]
    fn small_region_gets_a_translucent_stream_layer() {
        let dir = TempDir::new().unwrap();
        let cache = GeoCache::new(dir.path());
        let bounds = small_bounds();

        let mut batch = QueryBatcher::new();
        prepare_rivers(&mut batch, &cache, &bounds).unwrap();
        batch.insert_result(RIVERS_RELATIONS_ARRAY_NAME, QueryResult::new(vec![]));
        batch.insert_result(RIVERS_WAYS_ARRAY_NAME, closed_way_result());
        batch.insert_result(RIVERS_LINE_WAYS_ARRAY_NAME, line_way_result());
        batch.insert_result(STREAMS_LINE_WAYS_ARRAY_NAME, line_way_result());

        let layers = process_rivers(&mut batch, &cache, &bounds).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].alpha, 1.0);
        // One buffered center-line plus one closed way.
        assert_eq!(layers[0].polygons.exteriors.len(), 2);
        assert_eq!(layers[1].alpha, 1.0);
        assert_eq!(layers[1].polygons.exteriors.len(), 1);

        // The synthesized layers are cached post-processing, so a rebuild
        // is terminal without any result lookup.
        let mut batch = QueryBatcher::new();
        prepare_rivers(&mut batch, &cache, &bounds).unwrap();
        assert!(batch.is_cached(RIVERS_CACHE_NAME));
        let from_cache = process_rivers(&mut batch, &cache, &bounds).unwrap();
        assert_eq!(from_cache, layers);
    }
}
