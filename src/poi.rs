use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bounds::Bounds;
use crate::cache::GeoCache;
use crate::error::Result;
use crate::geometry::{self, LonLat};
use crate::overpass::{QueryBatcher, SubQuery};
use crate::processing::polygons_from_relation;
use crate::track::Track;

pub const POIS_CACHE_NAME: &str = "city_pois";

const POIS_WAYS_ARRAY_NAME: &str = "city_pois_ways";
const POIS_RELATIONS_ARRAY_NAME: &str = "city_pois_relations";

/// How many points of interest a poster keeps at most.
const MAX_POIS: usize = 6;

/// Tag keys whose mere presence is weak evidence that a feature matters.
static BASIC_EVIDENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "^(heritage|source|contact|architect|opening_hours|historic|phone|email|website|importance|image|wikimedia_commons)",
    )
    .expect("static pattern")
});

/// Tag keys that indicate a feature is named in several languages or
/// variants, stronger evidence of significance.
static NAMING_EVIDENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^(name:|alt_name|short_name)").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoiCategory {
    Attraction,
}

/// A candidate landmark before selection. The center is the mean of the
/// footprint coordinates, computed once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePoi {
    pub category: PoiCategory,
    pub name: String,
    pub importance: u32,
    pub footprint: Vec<LonLat>,
    pub center: LonLat,
}

impl CandidatePoi {
    pub fn new(category: PoiCategory, name: String, importance: u32, footprint: Vec<LonLat>) -> Self {
        debug_assert!(!footprint.is_empty(), "candidate needs a footprint");
        let center = geometry::mean_lonlat(&footprint);
        Self { category, name, importance, footprint, center }
    }
}

/// Selected point of interest, ready for label rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterPoint {
    pub name: String,
    pub lon: f64,
    pub lat: f64,
    pub category: PoiCategory,
}

/// Importance score from tag evidence: +1 per basic-evidence key, +2 per
/// naming-evidence key, plus fixed bonuses for specific landmark kinds.
/// Candidates scoring below 5 are discarded (`None`).
pub fn importance_score(tags: &HashMap<String, String>) -> Option<u32> {
    let mut count = 0;
    for key in tags.keys() {
        if BASIC_EVIDENCE.is_match(key) {
            count += 1;
        } else if NAMING_EVIDENCE.is_match(key) {
            count += 2;
        }
    }

    let building = tags.get("building").map(String::as_str);
    let amenity = tags.get("amenity").map(String::as_str);
    if building == Some("cathedral") {
        count += 5;
    } else if amenity == Some("theatre") {
        count += 5;
    } else if building == Some("palace") {
        count += 10;
    } else if building == Some("castle") {
        count += 3;
    }

    (count >= 5).then_some(count)
}

/// Shortest of the available display names, which tends to fit a poster
/// label best.
fn shortest_name(tags: &HashMap<String, String>) -> Option<&str> {
    ["name", "short_name", "alt_name"]
        .iter()
        .filter_map(|key| tags.get(*key))
        .map(String::as_str)
        .min_by_key(|name| name.len())
}

/// Keep candidates whose footprint comes close enough to the track. The
/// threshold decreases with importance: famous landmarks may sit farther
/// from the route than minor ones.
pub fn filter_by_track_proximity(
    candidates: Vec<CandidatePoi>,
    track: &Track,
) -> Vec<CandidatePoi> {
    candidates
        .into_iter()
        .filter(|poi| {
            let min_distance_m = track
                .min_distances_m(&poi.footprint)
                .into_iter()
                .fold(f64::INFINITY, f64::min);

            let threshold_m = if poi.importance > 70 {
                800.0
            } else if poi.importance > 30 {
                500.0
            } else {
                150.0
            };
            min_distance_m < threshold_m
        })
        .collect()
}

/// Greedy non-maximum suppression: sort by importance descending (stable,
/// so equal scores keep their incoming order), then keep a candidate only
/// if every already-kept candidate is at least 2% of the extent diagonal
/// away. The first candidate is always kept.
pub fn non_maximum_suppression(
    mut candidates: Vec<CandidatePoi>,
    bounds: &Bounds,
) -> Vec<CandidatePoi> {
    if candidates.is_empty() {
        return candidates;
    }

    let threshold_m = 0.02 * bounds.diagonal_m();
    candidates.sort_by(|a, b| b.importance.cmp(&a.importance));

    let centers: Vec<LonLat> = candidates.iter().map(|poi| poi.center).collect();
    let distances = geometry::pairwise_distances_m(&centers);

    let mut keep: Vec<usize> = Vec::with_capacity(candidates.len());
    for i in 0..candidates.len() {
        let suppressed =
            i != 0 && keep.iter().any(|&j| distances[i][j] < threshold_m);
        if !suppressed {
            keep.push(i);
        }
    }

    let mut keep_iter = keep.into_iter().peekable();
    candidates
        .into_iter()
        .enumerate()
        .filter_map(|(i, poi)| {
            if keep_iter.peek() == Some(&i) {
                keep_iter.next();
                Some(poi)
            } else {
                None
            }
        })
        .collect()
}

/// Re-sort by importance descending and truncate to the `n` best.
pub fn take_top_n(mut candidates: Vec<CandidatePoi>, n: usize) -> Vec<CandidatePoi> {
    candidates.sort_by(|a, b| b.importance.cmp(&a.importance));
    candidates.truncate(n);
    candidates
}

/// Register the POI sub-queries for a track, unless a readable cache entry
/// already covers it. Keyed by track identity, not extent: the proximity
/// filter makes the result track-specific.
pub fn prepare_pois(batch: &mut QueryBatcher, cache: &GeoCache, track: &Track) -> Result<()> {
    let handle = cache.handle_for_track(POIS_CACHE_NAME, track);
    if cache.exists(&handle) && cache.read::<Vec<ScatterPoint>>(&handle).is_ok() {
        batch.add_cached_result(POIS_CACHE_NAME, handle);
        return Ok(());
    }

    for (element, array_name) in
        [("way", POIS_WAYS_ARRAY_NAME), ("relation", POIS_RELATIONS_ARRAY_NAME)]
    {
        batch.add_query(SubQuery {
            array_name: array_name.to_string(),
            match_clauses: vec![format!(
                "{element}[\"wikipedia\"][\"name\"][\"man_made\"!=\"bridge\"][!\"bridge\"][\"tourism\"~\"attraction|museum\"]"
            )],
            bounds: track.bounds(),
            include_way_nodes: true,
            include_relation_members_nodes: true,
            return_geometry: true,
            relative_margin: Some(0.05),
        })?;
    }
    Ok(())
}

/// Score, filter, deduplicate and rank the landmark candidates around a
/// track. The pipeline order is significant: score -> proximity filter ->
/// NMS -> top-N.
pub fn process_pois(
    batch: &mut QueryBatcher,
    cache: &GeoCache,
    track: &Track,
) -> Result<Vec<ScatterPoint>> {
    if batch.is_cached(POIS_CACHE_NAME) {
        return cache.read(batch.get_cache_handle(POIS_CACHE_NAME)?);
    }

    let mut candidates: Vec<CandidatePoi> = Vec::new();

    let ways_result = batch.get_result(POIS_WAYS_ARRAY_NAME)?;
    for way in ways_result.ways() {
        let Some(importance) = importance_score(&way.tags) else { continue };
        let Some(name) = shortest_name(&way.tags) else { continue };
        let footprint = ways_result.way_lonlat(way);
        if !footprint.is_empty() {
            candidates.push(CandidatePoi::new(
                PoiCategory::Attraction,
                name.to_string(),
                importance,
                footprint,
            ));
        }
    }

    let relations_result = batch.get_result(POIS_RELATIONS_ARRAY_NAME)?;
    for rel in relations_result.relations() {
        let Some(importance) = importance_score(&rel.tags) else { continue };
        let Some(name) = shortest_name(&rel.tags) else { continue };
        let footprint: Vec<LonLat> = polygons_from_relation(rel, relations_result)
            .iter()
            .flat_map(|poly| poly.exterior().coords().map(|c| (c.x, c.y)).collect::<Vec<_>>())
            .collect();
        if !footprint.is_empty() {
            candidates.push(CandidatePoi::new(
                PoiCategory::Attraction,
                name.to_string(),
                importance,
                footprint,
            ));
        }
    }
    debug!(candidates = candidates.len(), "scored poi candidates");

    let candidates = filter_by_track_proximity(candidates, track);
    let candidates = non_maximum_suppression(candidates, &track.bounds());
    let candidates = take_top_n(candidates, MAX_POIS);
    info!(kept = candidates.len(), "selected points of interest");

    let pois: Vec<ScatterPoint> = candidates
        .into_iter()
        .map(|poi| ScatterPoint {
            name: poi.name,
            lon: poi.center.0,
            lat: poi.center.1,
            category: poi.category,
        })
        .collect();

    let handle = cache.handle_for_track(POIS_CACHE_NAME, track);
    cache.write(&handle, &pois)?;
    batch.add_cached_result(POIS_CACHE_NAME, handle);
    Ok(pois)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::overpass::{Element, GeomPoint, QueryResult, Way};

    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|&(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn palace_with_naming_evidence_scores_high() {
        let score = importance_score(&tags(&[
            ("building", "palace"),
            ("name:en", "Palace"),
            ("alt_name", "The Palace"),
        ]));
        assert!(score.is_some_and(|s| s >= 9));
    }

    #[test]
    fn unremarkable_tags_are_discarded() {
        assert_eq!(importance_score(&tags(&[("surface", "asphalt")])), None);
        // Some evidence, but below the keep threshold.
        assert_eq!(importance_score(&tags(&[("historic", "yes"), ("website", "x")])), None);
        // Exactly at the threshold.
        assert_eq!(
            importance_score(&tags(&[
                ("historic", "yes"),
                ("website", "x"),
                ("heritage", "2"),
                ("image", "y"),
                ("phone", "z"),
            ])),
            Some(5)
        );
    }

    #[test]
    fn castle_bonus_is_smaller_than_palace_bonus() {
        let base = &[("name:en", "X"), ("name:fr", "X")]; // +4
        let mut palace = tags(base);
        palace.insert("building".into(), "palace".into());
        let mut castle = tags(base);
        castle.insert("building".into(), "castle".into());
        assert_eq!(importance_score(&palace), Some(14));
        assert_eq!(importance_score(&castle), Some(7));
    }

    fn poi_at(lon: f64, lat: f64, importance: u32) -> CandidatePoi {
        CandidatePoi::new(PoiCategory::Attraction, format!("poi_{importance}"), importance, vec![(lon, lat)])
    }

    #[test]
    fn proximity_threshold_depends_on_importance() {
        // West-east track at latitude 48; candidate ~700 m north of it.
        let track = Track::new(vec![(2.00, 48.0), (2.03, 48.0)]);
        let candidate_lat = 48.0 + 700.0 / 111_195.0;

        let kept = filter_by_track_proximity(vec![poi_at(2.015, candidate_lat, 80)], &track);
        assert_eq!(kept.len(), 1, "importance 80 allows 800 m");

        let kept = filter_by_track_proximity(vec![poi_at(2.015, candidate_lat, 20)], &track);
        assert!(kept.is_empty(), "importance 20 only allows 150 m");
    }

    fn nms_bounds() -> Bounds {
        // Diagonal ~15.5 km, so the NMS threshold is ~310 m.
        Bounds::new(2.3, 2.45, 48.8, 48.88)
    }

    #[test]
    fn nms_clusters_keep_their_best_candidate() {
        let bounds = nms_bounds();
        let near_dup = 30.0 / 111_195.0; // ~30 m apart
        let kept = non_maximum_suppression(
            vec![
                poi_at(2.35, 48.85, 50),
                poi_at(2.35, 48.85 + near_dup, 90),
                poi_at(2.40, 48.82, 10),
            ],
            &bounds,
        );
        let names: Vec<&str> = kept.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["poi_90", "poi_10"]);
    }

    #[test]
    fn nms_is_idempotent_and_keeps_the_maximum() {
        let bounds = nms_bounds();
        let candidates = vec![
            poi_at(2.31, 48.81, 40),
            poi_at(2.312, 48.81, 35),
            poi_at(2.43, 48.87, 80),
        ];
        let once = non_maximum_suppression(candidates, &bounds);
        assert!(once.iter().any(|p| p.importance == 80));

        let twice = non_maximum_suppression(once.clone(), &bounds);
        assert_eq!(once, twice);

        assert!(non_maximum_suppression(vec![], &bounds).is_empty());
    }

    #[test]
    fn top_n_is_ranked_and_truncated() {
        let best = take_top_n(
            vec![poi_at(2.3, 48.8, 10), poi_at(2.4, 48.8, 90), poi_at(2.5, 48.8, 50)],
            2,
        );
        let scores: Vec<u32> = best.iter().map(|p| p.importance).collect();
        assert_eq!(scores, vec![90, 50]);
    }

    fn landmark_way(id: u64, lon: f64, lat: f64) -> Element {
        Element::Way(Way {
            id,
            nodes: vec![],
            geometry: Some(vec![
                GeomPoint { lat, lon },
                GeomPoint { lat, lon: lon + 0.001 },
                GeomPoint { lat: lat + 0.001, lon: lon + 0.001 },
            ]),
            tags: tags(&[
                ("building", "palace"),
                ("name", "Palais"),
                ("name:en", "Palace"),
                ("wikipedia", "fr:Palais"),
                ("tourism", "attraction"),
            ]),
        })
    }

    #[test]
    fn pipeline_selects_labels_and_caches_them_by_track() {
        let dir = TempDir::new().unwrap();
        let cache = GeoCache::new(dir.path());
        let track = Track::new(vec![(2.30, 48.85), (2.32, 48.85), (2.34, 48.852)]);

        let mut batch = QueryBatcher::new();
        prepare_pois(&mut batch, &cache, &track).unwrap();
        batch.insert_result(
            POIS_WAYS_ARRAY_NAME,
            QueryResult::new(vec![
                landmark_way(1, 2.31, 48.8505),
                // Far outside every proximity tier.
                landmark_way(2, 2.31, 48.95),
            ]),
        );
        batch.insert_result(POIS_RELATIONS_ARRAY_NAME, QueryResult::new(vec![]));

        let pois = process_pois(&mut batch, &cache, &track).unwrap();
        assert_eq!(pois.len(), 1);
        assert_eq!(pois[0].name, "Palais");
        assert_eq!(pois[0].category, PoiCategory::Attraction);

        // Rebuild: full cache hit, no sub-queries registered.
        let mut batch = QueryBatcher::new();
        prepare_pois(&mut batch, &cache, &track).unwrap();
        assert!(batch.is_cached(POIS_CACHE_NAME));
        assert_eq!(process_pois(&mut batch, &cache, &track).unwrap(), pois);
    }
}
