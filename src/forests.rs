use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bounds::Bounds;
use crate::cache::GeoCache;
use crate::error::Result;
use crate::overpass::{QueryBatcher, SubQuery};
use crate::processing::{SurfacePolygons, polygons_from_relations, surface_polygons};

pub const FORESTS_CACHE_NAME: &str = "forests";

const FORESTS_ARRAY_NAME: &str = "forests_relations";
const FARMLAND_ARRAY_NAME: &str = "farmland_relations";

/// Green/agricultural polygon layers of a region.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LandCover {
    pub forests: SurfacePolygons,
    pub farmland: SurfacePolygons,
}

/// Register forest/park and farmland sub-queries for `bounds`, unless a
/// readable cache entry already covers them.
pub fn prepare_forests(batch: &mut QueryBatcher, cache: &GeoCache, bounds: &Bounds) -> Result<()> {
    let handle = cache.handle_for_bounds(FORESTS_CACHE_NAME, bounds);
    if cache.exists(&handle) && cache.read::<LandCover>(&handle).is_ok() {
        batch.add_cached_result(FORESTS_CACHE_NAME, handle);
        return Ok(());
    }

    batch.add_query(SubQuery {
        array_name: FORESTS_ARRAY_NAME.to_string(),
        match_clauses: vec![
            "relation[\"leisure\"=\"park\"][\"type\"!=\"site\"]".to_string(),
            "relation[\"landuse\"=\"forest\"][\"type\"!=\"site\"]".to_string(),
        ],
        bounds: *bounds,
        include_way_nodes: true,
        include_relation_members_nodes: true,
        return_geometry: true,
        relative_margin: None,
    })?;
    batch.add_query(SubQuery {
        array_name: FARMLAND_ARRAY_NAME.to_string(),
        match_clauses: vec!["relation[\"landuse\"=\"farmland\"]".to_string()],
        bounds: *bounds,
        include_way_nodes: true,
        include_relation_members_nodes: true,
        return_geometry: true,
        relative_margin: None,
    })?;
    Ok(())
}

/// Polygonize the forest/park and farmland relations (or serve the cached
/// layers on a full hit) and write the result back to cache.
pub fn process_forests(
    batch: &mut QueryBatcher,
    cache: &GeoCache,
    bounds: &Bounds,
) -> Result<LandCover> {
    if batch.is_cached(FORESTS_CACHE_NAME) {
        return cache.read(batch.get_cache_handle(FORESTS_CACHE_NAME)?);
    }

    let forests = polygons_from_relations(batch.get_result(FORESTS_ARRAY_NAME)?);
    let farmland = polygons_from_relations(batch.get_result(FARMLAND_ARRAY_NAME)?);
    info!(forests = forests.len(), farmland = farmland.len(), "assembled land cover polygons");

    let cover = LandCover {
        forests: surface_polygons(&forests),
        farmland: surface_polygons(&farmland),
    };

    let handle = cache.handle_for_bounds(FORESTS_CACHE_NAME, bounds);
    cache.write(&handle, &cover)?;
    batch.add_cached_result(FORESTS_CACHE_NAME, handle);
    Ok(cover)
}
