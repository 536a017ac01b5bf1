#![doc = "Batched OSM feature acquisition, caching and synthesis for GPX posters"]
mod bounds;
mod cache;
mod error;
mod forests;
mod geometry;
mod overpass;
mod poi;
mod processing;
mod rivers;
mod roads;
mod track;

#[doc(inline)]
pub use bounds::{Bounds, EARTH_RADIUS_M, local_m_to_deg};

#[doc(inline)]
pub use cache::{CacheHandle, GeoCache};

#[doc(inline)]
pub use error::{GeodataError, Result};

#[doc(inline)]
pub use geometry::{LocalProjection, LonLat};

#[doc(inline)]
pub use overpass::{Element, Member, Node, QueryBatcher, QueryResult, Relation, SubQuery, Way};

#[doc(inline)]
pub use processing::SurfacePolygons;

#[doc(inline)]
pub use track::Track;

#[doc(inline)]
pub use roads::{
    ROADS_CACHE_NAME, RoadCategory, RoadMap, RoadPrecision, RoadTypeRecord, ROAD_TYPES,
    categories_for_precision, prepare_roads, process_roads,
};

#[doc(inline)]
pub use rivers::{
    PolygonAlpha, RIVERS_CACHE_NAME, prepare_rivers, process_rivers, stream_visibility,
};

#[doc(inline)]
pub use forests::{FORESTS_CACHE_NAME, LandCover, prepare_forests, process_forests};

#[doc(inline)]
pub use poi::{
    CandidatePoi, POIS_CACHE_NAME, PoiCategory, ScatterPoint, filter_by_track_proximity,
    importance_score, non_maximum_suppression, prepare_pois, process_pois, take_top_n,
};
