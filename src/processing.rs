use std::collections::{HashMap, HashSet};

use geo::{Contains, Coord, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bounds::local_m_to_deg;
use crate::geometry::{self, LonLat};
use crate::overpass::{QueryResult, Relation};

/// Rendering-ready polygon set, split into exterior shells and interior
/// holes so the drawing layer can fill and punch independently.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SurfacePolygons {
    pub exteriors: Vec<Vec<LonLat>>,
    pub interiors: Vec<Vec<LonLat>>,
}

/// Ordered coordinate sequences of every way in a result, one polyline per
/// way. Empty ways are dropped.
pub fn ways_coordinates(result: &QueryResult) -> Vec<Vec<LonLat>> {
    result
        .ways()
        .map(|way| result.way_lonlat(way))
        .filter(|coords| !coords.is_empty())
        .collect()
}

/// Areas described by single closed ways instead of relations (common for
/// rivers). Ways whose first and last coordinates differ are skipped.
pub fn polygons_from_closed_ways(result: &QueryResult) -> Vec<Polygon<f64>> {
    let mut polygons = Vec::new();
    for way in result.ways() {
        let coords = result.way_lonlat(way);
        let Some((&first, rest)) = coords.split_first() else { continue };
        let Some(&last) = rest.last() else { continue };
        if first == last {
            polygons.push(ring_to_polygon(&coords, vec![]));
        } else {
            warn!(way = way.id, "found a shape not closed, skipped");
        }
    }
    polygons
}

/// Polygons assembled from every multipolygon relation in a result.
pub fn polygons_from_relations(result: &QueryResult) -> Vec<Polygon<f64>> {
    result
        .relations()
        .flat_map(|rel| polygons_from_relation(rel, result))
        .collect()
}

/// Assemble the polygons of a single relation: collect member ways by
/// role (recursing through nested relations), merge split ways into closed
/// rings, then pair each inner ring with the outer shell that contains it.
pub fn polygons_from_relation(rel: &Relation, result: &QueryResult) -> Vec<Polygon<f64>> {
    let mut visited = HashSet::new();
    let (outer, inner) = relation_member_rings(rel, result, &mut visited);

    // Merge tolerance of ~2 m around each ring endpoint.
    let eps = local_m_to_deg(2.0);
    let outer = merge_ways_closed_shapes(outer, eps, 4);
    let inner = merge_ways_closed_shapes(inner, eps, 4);

    polygons_from_rings(outer, inner)
}

fn relation_member_rings(
    rel: &Relation,
    result: &QueryResult,
    visited: &mut HashSet<u64>,
) -> (Vec<Vec<LonLat>>, Vec<Vec<LonLat>>) {
    let mut outer = Vec::new();
    let mut inner = Vec::new();
    if !visited.insert(rel.id) {
        return (outer, inner);
    }

    for member in &rel.members {
        match member.kind.as_str() {
            "relation" => {
                // A relation nested in the members of a relation.
                match result.relation_by_id(member.id) {
                    Some(sub) => {
                        let (sub_outer, sub_inner) = relation_member_rings(sub, result, visited);
                        outer.extend(sub_outer);
                        inner.extend(sub_inner);
                    }
                    None => debug!(relation = member.id, "nested relation not present in result"),
                }
            }
            "way" => {
                let Some(geom) = &member.geometry else { continue };
                let ring: Vec<LonLat> = geom.iter().map(|p| (p.lon, p.lat)).collect();
                match member.role.as_str() {
                    "outer" => outer.push(ring),
                    "inner" => inner.push(ring),
                    role => warn!(
                        relation = rel.id,
                        way = member.id,
                        role,
                        "unexpected member role in relation"
                    ),
                }
            }
            _ => {}
        }
    }
    (outer, inner)
}

#[derive(Clone, Copy)]
enum EndKind {
    Start,
    End,
}

struct Segment {
    start: LonLat,
    end: LonLat,
    geom: Vec<LonLat>,
    merged: bool,
}

fn hash_point((x, y): LonLat, eps: f64) -> (i64, i64) {
    ((x / eps) as i64, (y / eps) as i64)
}

fn points_are_close(a: LonLat, b: LonLat, eps: f64) -> bool {
    (a.0 - b.0).abs() < eps && (a.1 - b.1).abs() < eps
}

fn is_closed_shape(geom: &[LonLat], eps: f64) -> bool {
    match (geom.first(), geom.last()) {
        (Some(&first), Some(&last)) => points_are_close(first, last, eps),
        _ => false,
    }
}

/// Merge connected way fragments into longer chains. Endpoints are bucketed
/// on an eps-grid; each chain greedily consumes the next unmerged fragment
/// whose start or end falls within eps of the chain's current end (probing
/// the four adjacent grid cells to dodge bucket-boundary misses).
pub(crate) fn merge_ways(geoms: Vec<Vec<LonLat>>, eps: f64) -> Vec<Vec<LonLat>> {
    let input_len = geoms.len();
    let mut segments: Vec<Segment> = geoms
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|g| Segment { start: g[0], end: *g.last().unwrap(), geom: g, merged: false })
        .collect();

    let mut table: HashMap<(i64, i64), Vec<(usize, EndKind)>> = HashMap::new();
    for (i, seg) in segments.iter().enumerate() {
        table.entry(hash_point(seg.start, eps)).or_default().push((i, EndKind::Start));
        table.entry(hash_point(seg.end, eps)).or_default().push((i, EndKind::End));
    }

    let mut merged_out: Vec<Vec<LonLat>> = Vec::new();
    for i in 0..segments.len() {
        if segments[i].merged {
            continue;
        }
        segments[i].merged = true;
        let mut chain = std::mem::take(&mut segments[i].geom);
        let mut chain_end = segments[i].end;

        loop {
            let (hx, hy) = hash_point(chain_end, eps);
            let neighbors =
                [(hx, hy), (hx - 1, hy), (hx + 1, hy), (hx, hy - 1), (hx, hy + 1)];

            let mut found = None;
            'probe: for cell in neighbors {
                let Some(entries) = table.get(&cell) else { continue };
                for &(j, kind) in entries {
                    if segments[j].merged {
                        continue;
                    }
                    let endpoint = match kind {
                        EndKind::Start => segments[j].start,
                        EndKind::End => segments[j].end,
                    };
                    if points_are_close(chain_end, endpoint, eps) {
                        found = Some((j, kind));
                        break 'probe;
                    }
                }
            }

            let Some((j, kind)) = found else { break };
            segments[j].merged = true;
            let mut next = std::mem::take(&mut segments[j].geom);
            if matches!(kind, EndKind::End) {
                next.reverse();
            }
            chain.extend(next.into_iter().skip(1));
            chain_end = *chain.last().unwrap();
        }

        merged_out.push(chain);
    }

    let n_merged = input_len.saturating_sub(merged_out.len());
    if n_merged > 0 {
        info!(n_merged, "segments merged");
    }
    merged_out
}

/// Merge until every chain is a closed ring or `max_depth` is reached.
/// A single pass can miss rings that reconnect through the same point in
/// different directions, so closed shapes get a bounded retry instead of a
/// quadratic merge.
fn merge_ways_closed_shapes(
    mut segments: Vec<Vec<LonLat>>,
    eps: f64,
    max_depth: u32,
) -> Vec<Vec<LonLat>> {
    let mut depth = 0;
    let mut all_closed = false;
    while depth < max_depth && !all_closed {
        segments = merge_ways(segments, eps);
        all_closed = segments.iter().all(|s| is_closed_shape(s, eps));
        depth += 1;
    }
    if depth > 1 {
        info!(tries = depth, "merging closed shapes required multiple passes");
    }
    if !all_closed {
        warn!("despite multiple retries, there are still unclosed ring geometries");
    }
    segments
}

/// Build polygons from merged outer shells and inner holes of a single
/// relation. Multiple outer shells become multiple polygons; each hole is
/// attached to the first shell that contains its leading point.
fn polygons_from_rings(
    outer_rings: Vec<Vec<LonLat>>,
    inner_rings: Vec<Vec<LonLat>>,
) -> Vec<Polygon<f64>> {
    let mut polygons = Vec::new();
    let mut remaining = inner_rings;
    let mut not_closed = 0usize;

    for ring in outer_rings {
        if ring.len() <= 4 {
            continue;
        }
        if ring.first() != ring.last() {
            not_closed += 1;
        }
        let shell = ring_to_polygon(&ring, vec![]);

        let (holes, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|hole| {
            hole.first()
                .is_some_and(|&(lon, lat)| shell.contains(&Point::new(lon, lat)))
        });
        remaining = rest;

        polygons.push(ring_to_polygon(&ring, holes));
    }

    if !remaining.is_empty() {
        warn!(
            unused = remaining.len(),
            "could not find an outer shell for all inner ring geometries"
        );
    }
    if not_closed > 0 {
        warn!(not_closed, "shapes not closed");
    }
    polygons
}

fn ring_to_polygon(ring: &[LonLat], holes: Vec<Vec<LonLat>>) -> Polygon<f64> {
    let to_line = |pts: &[LonLat]| {
        LineString::from(pts.iter().map(|&(x, y)| Coord { x, y }).collect::<Vec<_>>())
    };
    Polygon::new(to_line(ring), holes.iter().map(|h| to_line(h)).collect())
}

/// Synthesize polygons from open waterway center-lines by buffering each
/// line to a fixed width (in degrees). Lines with two or fewer points are
/// skipped.
pub fn buffered_line_polygons(result: &QueryResult, width_deg: f64) -> Vec<Polygon<f64>> {
    result
        .ways()
        .filter_map(|way| {
            let coords = result.way_lonlat(way);
            if coords.len() <= 2 {
                return None;
            }
            geometry::buffer_polyline(&coords, width_deg)
        })
        .collect()
}

/// Split polygons into the exterior/interior ring bundle the renderer
/// consumes.
pub fn surface_polygons(polygons: &[Polygon<f64>]) -> SurfacePolygons {
    let mut surface = SurfacePolygons::default();
    for poly in polygons {
        surface
            .exteriors
            .push(poly.exterior().coords().map(|c| (c.x, c.y)).collect());
        for hole in poly.interiors() {
            surface.interiors.push(hole.coords().map(|c| (c.x, c.y)).collect());
        }
    }
    surface
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::overpass::{Element, GeomPoint, Member, Way};

    use super::*;

    fn way(id: u64, pts: &[(f64, f64)]) -> Element {
        Element::Way(Way {
            id,
            nodes: vec![],
            geometry: Some(pts.iter().map(|&(lon, lat)| GeomPoint { lat, lon }).collect()),
            tags: HashMap::new(),
        })
    }

    fn ring_member(id: u64, role: &str, pts: &[(f64, f64)]) -> Member {
        Member {
            kind: "way".to_string(),
            id,
            role: role.to_string(),
            geometry: Some(pts.iter().map(|&(lon, lat)| GeomPoint { lat, lon }).collect()),
        }
    }

    #[test]
    fn closed_ways_become_polygons_and_open_ways_are_skipped() {
        let result = QueryResult::new(vec![
            way(1, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]),
            way(2, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]),
        ]);
        let polygons = polygons_from_closed_ways(&result);
        assert_eq!(polygons.len(), 1);
        assert_eq!(polygons[0].exterior().coords().count(), 4);
    }

    #[test]
    fn merge_ways_chains_fragments_in_both_directions() {
        let merged = merge_ways(
            vec![
                vec![(0.0, 0.0), (1.0, 0.0)],
                // Reversed fragment: its end touches the first fragment's end.
                vec![(2.0, 0.0), (1.0, 0.0)],
                // Disconnected fragment stays separate.
                vec![(5.0, 5.0), (6.0, 5.0)],
            ],
            1e-4,
        );
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&vec![(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]));
    }

    #[test]
    fn relation_assembly_merges_split_outers_and_assigns_holes() {
        // Outer square split into two halves, plus one hole inside it.
        let rel = Relation {
            id: 7,
            members: vec![
                ring_member(1, "outer", &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0)]),
                ring_member(2, "outer", &[(4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]),
                ring_member(3, "inner", &[(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 1.0)]),
            ],
            tags: HashMap::new(),
        };
        let result = QueryResult::new(vec![]);
        let polygons = polygons_from_relation(&rel, &result);
        assert_eq!(polygons.len(), 1);
        assert_eq!(polygons[0].interiors().len(), 1);

        let surface = surface_polygons(&polygons);
        assert_eq!(surface.exteriors.len(), 1);
        assert_eq!(surface.interiors.len(), 1);
    }

    #[test]
    fn unexpected_member_role_is_skipped() {
        let rel = Relation {
            id: 9,
            members: vec![
                ring_member(1, "outer", &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]),
                ring_member(2, "subarea", &[(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 1.0)]),
            ],
            tags: HashMap::new(),
        };
        let polygons = polygons_from_relation(&rel, &QueryResult::new(vec![]));
        assert_eq!(polygons.len(), 1);
        assert!(polygons[0].interiors().is_empty());
    }

    #[test]
    fn hole_outside_every_shell_is_dropped() {
        let rel = Relation {
            id: 8,
            members: vec![
                ring_member(1, "outer", &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]),
                ring_member(2, "inner", &[(10.0, 10.0), (11.0, 10.0), (11.0, 11.0), (10.0, 10.0)]),
            ],
            tags: HashMap::new(),
        };
        let polygons = polygons_from_relation(&rel, &QueryResult::new(vec![]));
        assert_eq!(polygons.len(), 1);
        assert!(polygons[0].interiors().is_empty());
    }

    #[test]
    fn short_line_ways_are_not_buffered() {
        let result = QueryResult::new(vec![
            way(1, &[(0.0, 0.0), (0.001, 0.0)]),
            way(2, &[(0.0, 0.0), (0.001, 0.0), (0.002, 0.0)]),
        ]);
        let polygons = buffered_line_polygons(&result, 0.0001);
        assert_eq!(polygons.len(), 1);
    }
}
