use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bounds::Bounds;
use crate::cache::CacheHandle;
use crate::error::{GeodataError, Result};
use crate::geometry::LonLat;

const DEFAULT_ENDPOINT: &str = "https://overpass-api.de/api/interpreter";
const USER_AGENT: &str = concat!("postergeo/", env!("CARGO_PKG_VERSION"));
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(500);

/// One named, independently addressable clause of a batched request.
///
/// Owned by the [`QueryBatcher`] for the lifetime of one batch and
/// consumed at launch.
#[derive(Debug, Clone)]
pub struct SubQuery {
    /// Unique key within the batch; also the Overpass set name, so it must
    /// be a valid identifier (`[A-Za-z0-9_]+`).
    pub array_name: String,
    /// Element filters without bbox, e.g. `way["highway"~"(motorway)"]`.
    pub match_clauses: Vec<String>,
    pub bounds: Bounds,
    /// Recurse down to child nodes so way coordinates can be resolved.
    pub include_way_nodes: bool,
    /// Recurse through relation members (including nested relations).
    pub include_relation_members_nodes: bool,
    /// Ask Overpass for embedded per-element geometry.
    pub return_geometry: bool,
    /// Expand `bounds` for this sub-query only; the shared extent is never
    /// mutated.
    pub relative_margin: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeomPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub id: u64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Way {
    pub id: u64,
    #[serde(default)]
    pub nodes: Vec<u64>,
    #[serde(default)]
    pub geometry: Option<Vec<GeomPoint>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Member {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub id: u64,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub geometry: Option<Vec<GeomPoint>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Relation {
    pub id: u64,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A `count`-mode output, used as a per-set separator in the merged
/// response.
#[derive(Debug, Clone, Deserialize)]
pub struct CountInfo {
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl CountInfo {
    fn total(&self) -> Option<usize> {
        self.tags.get("total").and_then(|v| v.parse().ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Element {
    Node(Node),
    Way(Way),
    Relation(Relation),
    Count(CountInfo),
}

/// Raw elements of one sub-query, immutable after creation.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    elements: Vec<Element>,
    node_coords: HashMap<u64, LonLat>,
    relation_index: HashMap<u64, usize>,
}

impl QueryResult {
    pub fn new(elements: Vec<Element>) -> Self {
        let mut node_coords = HashMap::new();
        let mut relation_index = HashMap::new();
        for (i, el) in elements.iter().enumerate() {
            match el {
                Element::Node(n) => {
                    node_coords.insert(n.id, (n.lon, n.lat));
                }
                Element::Relation(r) => {
                    relation_index.insert(r.id, i);
                }
                _ => {}
            }
        }
        Self { elements, node_coords, relation_index }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.elements.iter().filter_map(|el| match el {
            Element::Node(n) => Some(n),
            _ => None,
        })
    }

    pub fn ways(&self) -> impl Iterator<Item = &Way> {
        self.elements.iter().filter_map(|el| match el {
            Element::Way(w) => Some(w),
            _ => None,
        })
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.elements.iter().filter_map(|el| match el {
            Element::Relation(r) => Some(r),
            _ => None,
        })
    }

    pub fn relation_by_id(&self, id: u64) -> Option<&Relation> {
        self.relation_index.get(&id).and_then(|&i| match &self.elements[i] {
            Element::Relation(r) => Some(r),
            _ => None,
        })
    }

    /// Ordered lon/lat coordinates of a way. Embedded geometry wins;
    /// otherwise node refs are resolved against the result's own nodes.
    /// Unresolvable refs are skipped.
    pub fn way_lonlat(&self, way: &Way) -> Vec<LonLat> {
        if let Some(geom) = &way.geometry {
            return geom.iter().map(|p| (p.lon, p.lat)).collect();
        }
        way.nodes
            .iter()
            .filter_map(|id| self.node_coords.get(id).copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Accumulates named sub-queries and issues them as one merged Overpass
/// request, then serves per-name results. Names resolved from durable
/// storage can be registered too, so the contract is uniform whether data
/// came from the network or from cache.
#[derive(Debug)]
pub struct QueryBatcher {
    endpoint: String,
    sub_queries: Vec<SubQuery>,
    cached: HashMap<String, CacheHandle>,
    results: HashMap<String, QueryResult>,
    launched: bool,
}

impl Default for QueryBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBatcher {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            sub_queries: Vec::new(),
            cached: HashMap::new(),
            results: HashMap::new(),
            launched: false,
        }
    }

    /// Register one sub-query for the next launch.
    pub fn add_query(&mut self, sub: SubQuery) -> Result<()> {
        debug_assert!(
            sub.array_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "array_name must be a valid overpass set name"
        );
        if self.name_taken(&sub.array_name) {
            return Err(GeodataError::DuplicateName(sub.array_name));
        }
        debug!(name = %sub.array_name, clauses = sub.match_clauses.len(), "registered sub-query");
        self.sub_queries.push(sub);
        Ok(())
    }

    /// Mark `name` as already resolved from durable storage, excluding it
    /// from the network request. Re-registering the same name overwrites
    /// the handle (pipelines refresh it after a write-back).
    pub fn add_cached_result(&mut self, name: impl Into<String>, handle: CacheHandle) {
        self.cached.insert(name.into(), handle);
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cached.contains_key(name)
    }

    pub fn get_cache_handle(&self, name: &str) -> Result<&CacheHandle> {
        self.cached
            .get(name)
            .ok_or_else(|| GeodataError::UnknownName(name.to_string()))
    }

    /// Issue one composite request for all registered sub-queries and
    /// partition the response by name. A batch with zero non-cached
    /// sub-queries is a legal no-op. On failure the batch stays pending so
    /// the caller may call `launch` again.
    pub fn launch(&mut self) -> Result<()> {
        if self.launched {
            return Ok(());
        }

        if self.sub_queries.is_empty() {
            self.launched = true;
            debug!("no pending sub-queries, skipping network request");
            return Ok(());
        }

        let body = self.build_request();
        let names: Vec<String> =
            self.sub_queries.iter().map(|s| s.array_name.clone()).collect();
        info!(sub_queries = names.len(), endpoint = %self.endpoint, "launching merged overpass request");

        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        let text = client
            .post(&self.endpoint)
            .form(&[("data", body.as_str())])
            .send()?
            .error_for_status()?
            .text()?;

        self.results = partition_response(&text, &names)?;
        self.sub_queries.clear();
        self.launched = true;
        Ok(())
    }

    /// Result for a formerly registered sub-query name.
    pub fn get_result(&self, name: &str) -> Result<&QueryResult> {
        if let Some(result) = self.results.get(name) {
            return Ok(result);
        }
        if self.sub_queries.iter().any(|s| s.array_name == name) {
            return Err(GeodataError::NotLaunched(name.to_string()));
        }
        Err(GeodataError::UnknownName(name.to_string()))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.sub_queries.iter().any(|s| s.array_name == name)
            || self.results.contains_key(name)
            || self.cached.contains_key(name)
    }

    /// Compose the merged Overpass QL body. Each sub-query becomes a named
    /// set; a per-set `out count` acts as a separator so the flat element
    /// stream can be partitioned back by registration order.
    fn build_request(&self) -> String {
        let mut q = String::from("[out:json][timeout:500];\n");
        for sub in &self.sub_queries {
            let bounds = match sub.relative_margin {
                Some(margin) => sub.bounds.with_relative_margin(margin),
                None => sub.bounds,
            };
            let bbox = bounds.overpass_bbox();
            let name = &sub.array_name;

            q.push_str("(\n");
            for clause in &sub.match_clauses {
                let _ = writeln!(q, "  {clause}{bbox};");
            }
            let _ = writeln!(q, ")->.{name};");
            if sub.include_relation_members_nodes {
                let _ = writeln!(q, "(.{name}; .{name} >>;)->.{name};");
            } else if sub.include_way_nodes {
                let _ = writeln!(q, "(.{name}; .{name} >;)->.{name};");
            }
        }
        for sub in &self.sub_queries {
            let out = if sub.return_geometry { "out geom" } else { "out body" };
            let _ = writeln!(q, ".{} out count;", sub.array_name);
            let _ = writeln!(q, ".{} {out};", sub.array_name);
        }
        q
    }

    /// Test seam: register a pre-parsed result as if it came back from a
    /// launched batch.
    #[cfg(test)]
    pub(crate) fn insert_result(&mut self, name: &str, result: QueryResult) {
        self.launched = true;
        self.results.insert(name.to_string(), result);
    }
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

/// Split the flat element stream of a merged response into per-name
/// buckets. `out count` separators appear in registration order, one per
/// sub-query, each announcing the size of the set that follows.
fn partition_response(body: &str, names: &[String]) -> Result<HashMap<String, QueryResult>> {
    let resp: OverpassResponse = serde_json::from_str(body)
        .map_err(|e| GeodataError::Upstream(format!("invalid overpass response: {e}")))?;

    let mut buckets: Vec<Vec<Element>> = (0..names.len()).map(|_| Vec::new()).collect();
    let mut expected: Vec<Option<usize>> = vec![None; names.len()];
    let mut current: Option<usize> = None;

    for el in resp.elements {
        match el {
            Element::Count(count) => {
                let next = current.map_or(0, |i| i + 1);
                if next >= names.len() {
                    return Err(GeodataError::Upstream(
                        "more result sets than registered sub-queries".to_string(),
                    ));
                }
                expected[next] = count.total();
                current = Some(next);
            }
            other => {
                let Some(i) = current else {
                    return Err(GeodataError::Upstream(
                        "overpass response carries elements before the first separator".to_string(),
                    ));
                };
                buckets[i].push(other);
            }
        }
    }

    let seen = current.map_or(0, |i| i + 1);
    if seen != names.len() {
        return Err(GeodataError::Upstream(format!(
            "expected {} result sets, got {seen}",
            names.len()
        )));
    }
    for (i, exp) in expected.iter().enumerate() {
        match exp {
            Some(exp) if *exp != buckets[i].len() => warn!(
                name = %names[i],
                expected = exp,
                actual = buckets[i].len(),
                "result set size differs from its count separator"
            ),
            _ => {}
        }
    }

    Ok(names
        .iter()
        .cloned()
        .zip(buckets.into_iter().map(QueryResult::new))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> Bounds {
        Bounds::new(2.3, 2.5, 48.7, 48.9)
    }

    fn sub(name: &str) -> SubQuery {
        SubQuery {
            array_name: name.to_string(),
            match_clauses: vec![format!("way[\"highway\"~\"({name})\"]")],
            bounds: bounds(),
            include_way_nodes: true,
            include_relation_members_nodes: false,
            return_geometry: false,
            relative_margin: None,
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut batch = QueryBatcher::new();
        batch.add_query(sub("streets")).unwrap();
        let err = batch.add_query(sub("streets")).unwrap_err();
        assert!(matches!(err, GeodataError::DuplicateName(name) if name == "streets"));
    }

    #[test]
    fn get_result_error_paths() {
        let mut batch = QueryBatcher::new();
        batch.add_query(sub("streets")).unwrap();

        assert!(matches!(
            batch.get_result("streets"),
            Err(GeodataError::NotLaunched(_))
        ));
        assert!(matches!(
            batch.get_result("nowhere"),
            Err(GeodataError::UnknownName(_))
        ));
    }

    #[test]
    fn empty_batch_launch_is_a_no_op() {
        let mut batch = QueryBatcher::with_endpoint("http://127.0.0.1:1/unreachable");
        batch.launch().unwrap();
        // Repeated launch stays a no-op.
        batch.launch().unwrap();
    }

    #[test]
    fn failed_launch_stays_retryable() {
        let mut batch = QueryBatcher::with_endpoint("http://127.0.0.1:1/unreachable");
        batch.add_query(sub("streets")).unwrap();

        assert!(matches!(batch.launch(), Err(GeodataError::Upstream(_))));
        // The batch stays pending after an upstream failure, so a retry
        // re-issues the request instead of silently succeeding.
        assert!(matches!(batch.launch(), Err(GeodataError::Upstream(_))));
        assert!(matches!(
            batch.get_result("streets"),
            Err(GeodataError::NotLaunched(_))
        ));
    }

    #[test]
    fn request_body_contains_named_sets_and_separators() {
        let mut batch = QueryBatcher::new();
        batch.add_query(sub("highway")).unwrap();
        let mut rel = sub("water_relations");
        rel.include_relation_members_nodes = true;
        rel.return_geometry = true;
        rel.relative_margin = Some(0.1);
        batch.add_query(rel).unwrap();

        let body = batch.build_request();
        assert!(body.contains(")->.highway;"));
        assert!(body.contains("(.highway; .highway >;)->.highway;"));
        assert!(body.contains("(.water_relations; .water_relations >>;)->.water_relations;"));
        assert!(body.contains(".highway out count;"));
        assert!(body.contains(".highway out body;"));
        assert!(body.contains(".water_relations out geom;"));
        // The margin expands the second sub-query's bbox without touching
        // the shared extent used by the first.
        let shared = bounds().overpass_bbox();
        let inflated = bounds().with_relative_margin(0.1).overpass_bbox();
        assert_ne!(shared, inflated);
        assert!(body.contains(&shared));
        assert!(body.contains(&inflated));
    }

    #[test]
    fn partitions_a_composite_response() {
        let body = r#"{
            "elements": [
                {"type": "count", "id": 0, "tags": {"total": "3", "ways": "1", "nodes": "2"}},
                {"type": "node", "id": 1, "lat": 48.8, "lon": 2.35},
                {"type": "node", "id": 2, "lat": 48.81, "lon": 2.36},
                {"type": "way", "id": 10, "nodes": [1, 2], "tags": {"highway": "primary"}},
                {"type": "count", "id": 0, "tags": {"total": "1"}},
                {"type": "relation", "id": 20,
                 "members": [{"type": "way", "ref": 10, "role": "outer"}],
                 "tags": {"natural": "water"}}
            ]
        }"#;
        let names = vec!["roads".to_string(), "water".to_string()];
        let buckets = partition_response(body, &names).unwrap();

        let roads = &buckets["roads"];
        assert_eq!(roads.len(), 3);
        let way = roads.ways().next().unwrap();
        assert_eq!(roads.way_lonlat(way), vec![(2.35, 48.8), (2.36, 48.81)]);

        let water = &buckets["water"];
        assert_eq!(water.relations().count(), 1);
        assert!(water.relation_by_id(20).is_some());
    }

    #[test]
    fn partition_rejects_malformed_streams() {
        let names = vec!["a".to_string()];
        // Elements before any separator.
        let early = r#"{"elements": [{"type": "node", "id": 1, "lat": 0.0, "lon": 0.0}]}"#;
        assert!(matches!(
            partition_response(early, &names),
            Err(GeodataError::Upstream(_))
        ));
        // Fewer sets than sub-queries.
        assert!(matches!(
            partition_response(r#"{"elements": []}"#, &names),
            Err(GeodataError::Upstream(_))
        ));
        // Not JSON at all.
        assert!(matches!(
            partition_response("<html>rate limited</html>", &names),
            Err(GeodataError::Upstream(_))
        ));
    }

    #[test]
    fn embedded_geometry_wins_over_node_refs() {
        let result = QueryResult::new(vec![Element::Way(Way {
            id: 1,
            nodes: vec![99],
            geometry: Some(vec![
                GeomPoint { lat: 48.8, lon: 2.35 },
                GeomPoint { lat: 48.9, lon: 2.36 },
            ]),
            tags: HashMap::new(),
        })]);
        let way = result.ways().next().unwrap();
        assert_eq!(result.way_lonlat(way), vec![(2.35, 48.8), (2.36, 48.9)]);
    }
}
