use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bounds::Bounds;
use crate::cache::GeoCache;
use crate::error::{GeodataError, Result};
use crate::geometry::LonLat;
use crate::overpass::{QueryBatcher, SubQuery};
use crate::processing::ways_coordinates;

pub const ROADS_CACHE_NAME: &str = "roads";

/// Road categories, most important first. `Ord` follows declaration order,
/// which equals ascending priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum RoadCategory {
    Highway,
    SecondaryRoad,
    Street,
    AccessRoad,
}

/// Static description of one road category: the OSM `highway` values it
/// covers, its priority (lower = more important) and its sub-query name.
#[derive(Debug, Clone, Copy)]
pub struct RoadTypeRecord {
    pub category: RoadCategory,
    pub tags: &'static [&'static str],
    pub priority: u8,
    pub query_name: &'static str,
}

/// Priority-ordered road taxonomy. Iteration order must equal ascending
/// priority; validated by `taxonomy_is_sorted_by_priority` below.
pub const ROAD_TYPES: [RoadTypeRecord; 4] = [
    RoadTypeRecord {
        category: RoadCategory::Highway,
        tags: &["motorway", "trunk", "primary"],
        priority: 0,
        query_name: "highway",
    },
    RoadTypeRecord {
        category: RoadCategory::SecondaryRoad,
        tags: &["tertiary", "secondary"],
        priority: 1,
        query_name: "secondary_roads",
    },
    RoadTypeRecord {
        category: RoadCategory::Street,
        tags: &["residential", "living_street"],
        priority: 2,
        query_name: "street",
    },
    RoadTypeRecord {
        category: RoadCategory::AccessRoad,
        tags: &["unclassified", "service"],
        priority: 3,
        query_name: "access_roads",
    },
];

fn record(category: RoadCategory) -> &'static RoadTypeRecord {
    ROAD_TYPES
        .iter()
        .find(|r| r.category == category)
        .expect("every category has a record")
}

/// How deep into the taxonomy a render wants to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoadPrecision {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl RoadPrecision {
    fn priority_threshold(self) -> u8 {
        match self {
            RoadPrecision::Low => 0,
            RoadPrecision::Medium => 1,
            RoadPrecision::High => 2,
            RoadPrecision::VeryHigh => 3,
        }
    }
}

/// Categories whose priority is at or above (numerically at most) the
/// requested precision threshold, in priority order.
pub fn categories_for_precision(precision: RoadPrecision) -> Vec<RoadCategory> {
    let threshold = precision.priority_threshold();
    ROAD_TYPES
        .iter()
        .filter(|r| r.priority <= threshold)
        .map(|r| r.category)
        .collect()
}

/// Classified polylines per road category.
pub type RoadMap = BTreeMap<RoadCategory, Vec<Vec<LonLat>>>;

/// Register sub-queries for every requested category that is not already
/// covered by the cache entry for `bounds`. Returns the categories that
/// will actually be fetched:
///
/// - full cache hit: nothing registered, empty vec (terminal without
///   network),
/// - partial hit: only the missing categories,
/// - miss (or corrupt entry): all requested categories.
pub fn prepare_roads(
    batch: &mut QueryBatcher,
    cache: &GeoCache,
    bounds: &Bounds,
    precision: RoadPrecision,
) -> Result<Vec<RoadCategory>> {
    let wanted = categories_for_precision(precision);
    info!(?precision, categories = wanted.len(), "preparing road download");

    let handle = cache.handle_for_bounds(ROADS_CACHE_NAME, bounds);
    let mut to_fetch = wanted;

    if cache.exists(&handle) {
        match cache.read::<RoadMap>(&handle) {
            Ok(cached) => {
                batch.add_cached_result(ROADS_CACHE_NAME, handle);
                to_fetch.retain(|category| !cached.contains_key(category));
                if to_fetch.is_empty() {
                    debug!("roads needed already downloaded");
                } else {
                    debug!(missing = to_fetch.len(), "downloading additional road categories");
                }
            }
            Err(err) => {
                // Treat as a miss and re-fetch everything.
                warn!(%err, "road cache entry unreadable, re-fetching");
            }
        }
    }

    for category in &to_fetch {
        let rec = record(*category);
        batch.add_query(SubQuery {
            array_name: rec.query_name.to_string(),
            match_clauses: vec![format!("way[\"highway\"~\"({})\"]", rec.tags.join("|"))],
            bounds: *bounds,
            include_way_nodes: true,
            include_relation_members_nodes: false,
            return_geometry: false,
            relative_margin: None,
        })?;
    }
    Ok(to_fetch)
}

/// Extract polylines for every freshly downloaded category, merge them into
/// whatever the cache already held (fresh wins; categories are disjoint
/// keys by construction), write the merged superset back, and return only
/// the categories the current request asked for.
pub fn process_roads(
    batch: &mut QueryBatcher,
    cache: &GeoCache,
    bounds: &Bounds,
    downloaded: &[RoadCategory],
    precision: RoadPrecision,
) -> Result<RoadMap> {
    let wanted = categories_for_precision(precision);

    if !downloaded.is_empty() {
        let mut roads: RoadMap = if batch.is_cached(ROADS_CACHE_NAME) {
            cache.read(batch.get_cache_handle(ROADS_CACHE_NAME)?)?
        } else {
            RoadMap::new()
        };

        for category in downloaded {
            let rec = record(*category);
            let result = batch.get_result(rec.query_name)?;
            let previous = roads.insert(*category, ways_coordinates(result));
            debug_assert!(
                previous.is_none(),
                "road categories are disjoint; {category:?} was both cached and fetched"
            );
        }

        let handle = cache.handle_for_bounds(ROADS_CACHE_NAME, bounds);
        cache.write(&handle, &roads)?;
        batch.add_cached_result(ROADS_CACHE_NAME, handle);

        return subset(roads, &wanted);
    }

    if batch.is_cached(ROADS_CACHE_NAME) {
        let roads: RoadMap = cache.read(batch.get_cache_handle(ROADS_CACHE_NAME)?)?;
        return subset(roads, &wanted);
    }

    // The pipeline believed everything was cached but nothing is.
    Err(GeodataError::MissingCache(ROADS_CACHE_NAME.to_string()))
}

fn subset(mut roads: RoadMap, wanted: &[RoadCategory]) -> Result<RoadMap> {
    let mut out = RoadMap::new();
    for category in wanted {
        let polylines = roads
            .remove(category)
            .ok_or_else(|| GeodataError::MissingCache(format!("roads/{category:?}")))?;
        out.insert(*category, polylines);
    }
    Ok(out)
}
