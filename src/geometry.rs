// ===========================================================================
// Planar line geometry helpers
// ===========================================================================
//
// All tolerances in this crate are planar distances in the units of the input
// coordinates. Datasets in lon/lat should be projected before cleansing.
// ===========================================================================

use ahash::AHashMap;
use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{
    BoundingRect, Closest, ClosestPoint, Coord, Distance, Euclidean, InterpolateLine, Intersects, Length,
    Line, LineLocatePoint, LineString, Point, Rect, Simplify,
};

const EPSILON: f64 = 1e-9;

/// Position of a point projected onto a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearLocation {
    pub segment: usize,
    /// Fraction along `segment`, clamped to [0, 1]
    pub fraction: f64,
    pub coord: Coord,
    /// Distance between the query point and `coord`
    pub distance: f64,
}

pub fn coord_distance(a: Coord, b: Coord) -> f64 {
    Euclidean.distance(a, b)
}

pub fn is_closed(line: &LineString<f64>) -> bool {
    line.0.len() > 1 && line.is_closed()
}

pub fn envelope(line: &LineString<f64>) -> Option<Rect<f64>> {
    line.bounding_rect()
}

pub fn square_around(point: Coord, half_width: f64) -> Rect<f64> {
    Rect::new(
        Coord { x: point.x - half_width, y: point.y - half_width },
        Coord { x: point.x + half_width, y: point.y + half_width },
    )
}

pub fn expand_rect(rect: Rect<f64>, by: f64) -> Rect<f64> {
    Rect::new(
        Coord { x: rect.min().x - by, y: rect.min().y - by },
        Coord { x: rect.max().x + by, y: rect.max().y + by },
    )
}

fn closest_coord(closest: Closest<f64>) -> Option<Coord> {
    match closest {
        Closest::Intersection(p) | Closest::SinglePoint(p) => Some(p.0),
        Closest::Indeterminate => None,
    }
}

/// Project `point` onto the closest segment of `line`. Ties resolve to the
/// earliest segment.
pub fn locate(point: Coord, line: &LineString<f64>) -> Option<LinearLocation> {
    if let [only] = line.0.as_slice() {
        return Some(LinearLocation {
            segment: 0,
            fraction: 0.0,
            coord: *only,
            distance: coord_distance(point, *only),
        });
    }

    let p = Point::from(point);
    let mut best: Option<LinearLocation> = None;
    for (segment, piece) in line.lines().enumerate() {
        let Some(fraction) = piece.line_locate_point(&p) else {
            continue;
        };
        // zero-length segments have no single closest point
        let coord = closest_coord(piece.closest_point(&p)).unwrap_or(piece.start);
        let distance = coord_distance(point, coord);
        if best.is_none_or(|b| distance < b.distance) {
            best = Some(LinearLocation { segment, fraction, coord, distance });
        }
    }
    best
}

/// Distance from `point` to `line` together with the closest point on the line.
pub fn distance_to_line(point: Coord, line: &LineString<f64>) -> Option<(f64, Coord)> {
    match line.0.as_slice() {
        [] => None,
        [only] => Some((coord_distance(point, *only), *only)),
        _ => {
            let closest = closest_coord(line.closest_point(&Point::from(point)))
                .or_else(|| line.0.first().copied())?;
            Some((coord_distance(point, closest), closest))
        }
    }
}

/// Search radius for a proximity test at `distance`. Never below the rounding
/// noise a projected coordinate carries.
pub fn near_radius(distance: f64) -> f64 {
    distance.max(EPSILON)
}

/// Whether `point` lies within `distance` of `line`. At distance zero this is
/// an exact on-the-line test that still accepts rounding noise from
/// coordinates computed by projection.
pub fn within_distance(point: Coord, line: &LineString<f64>, distance: f64) -> bool {
    if line.0.len() > 1 && line.intersects(&point) {
        return true;
    }
    distance_to_line(point, line).is_some_and(|(d, _)| d <= near_radius(distance))
}

/// Ramer-Douglas-Peucker simplification. The first and last coordinate are
/// always kept bit-for-bit.
pub fn simplify_preserving_ends(line: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    if line.0.len() < 3 {
        return line.clone();
    }
    line.simplify(&tolerance)
}

/// Chain two lines that meet at `at` into one line running through it.
///
/// Returns `None` when either line has no endpoint within `tolerance` of `at`.
/// The junction keeps `a`'s coordinate.
pub fn merge_at(
    a: &LineString<f64>,
    b: &LineString<f64>,
    at: Coord,
    tolerance: f64,
) -> Option<LineString<f64>> {
    if a.0.len() < 2 || b.0.len() < 2 {
        return None;
    }
    let near = |c: &Coord| coord_distance(*c, at) <= tolerance;

    let mut head: Vec<Coord> = a.0.clone();
    if !near(head.last()?) {
        if near(head.first()?) {
            head.reverse();
        } else {
            return None;
        }
    }

    let mut tail: Vec<Coord> = b.0.clone();
    if !near(tail.first()?) {
        if near(tail.last()?) {
            tail.reverse();
        } else {
            return None;
        }
    }

    head.extend(tail.into_iter().skip(1));
    Some(LineString::from(head))
}

fn without_repeats(line: &LineString<f64>) -> Vec<Coord> {
    let mut out: Vec<Coord> = Vec::with_capacity(line.0.len());
    for c in &line.0 {
        if out.last() != Some(c) {
            out.push(*c);
        }
    }
    out
}

/// Whether the line crosses or touches itself anywhere other than between
/// consecutive segments (and the closing vertex of a ring).
pub fn is_simple(line: &LineString<f64>) -> bool {
    let coords = without_repeats(line);
    if coords.len() < 3 {
        return true;
    }
    let closed = coords.first() == coords.last();
    let segments: Vec<Line<f64>> = coords.windows(2).map(|w| Line::new(w[0], w[1])).collect();
    let n = segments.len();

    for i in 0..n {
        for j in (i + 1)..n {
            let Some(hit) = line_intersection(segments[i], segments[j]) else {
                continue;
            };
            let adjacent = j == i + 1;
            let ring_closure = closed && i == 0 && j == n - 1;
            match hit {
                LineIntersection::Collinear { .. } => return false,
                LineIntersection::SinglePoint { intersection, .. } => {
                    if adjacent && intersection == segments[i].end {
                        continue;
                    }
                    if ring_closure && intersection == segments[i].start {
                        continue;
                    }
                    return false;
                }
            }
        }
    }
    true
}

/// Subdivide `line` at the given coordinates. Coordinates are projected onto
/// the line; ones that fall on the line's own endpoints or repeat an earlier
/// cut are ignored. Returns the consecutive pieces in order; a line with fewer
/// than two coordinates yields nothing.
pub fn split_at(line: &LineString<f64>, cuts: &[Coord]) -> Vec<LineString<f64>> {
    let coords = &line.0;
    if coords.len() < 2 {
        return Vec::new();
    }
    let last_segment = coords.len() - 2;

    let mut located: Vec<(usize, f64, Coord)> = cuts
        .iter()
        .filter_map(|c| locate(*c, line))
        .map(|loc| {
            if loc.fraction >= 1.0 - EPSILON && loc.segment < last_segment {
                (loc.segment + 1, 0.0, coords[loc.segment + 1])
            } else {
                (loc.segment, loc.fraction, loc.coord)
            }
        })
        .filter(|(seg, t, _)| !(*seg == 0 && *t <= EPSILON) && !(*seg == last_segment && *t >= 1.0 - EPSILON))
        .collect();
    located.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    located.dedup_by(|a, b| a.0 == b.0 && (a.1 - b.1).abs() <= EPSILON);

    let mut pieces: Vec<LineString<f64>> = Vec::with_capacity(located.len() + 1);
    let mut current: Vec<Coord> = vec![coords[0]];
    let mut cut_iter = located.into_iter().peekable();

    for i in 0..=last_segment {
        while let Some(&(seg, t, at)) = cut_iter.peek() {
            if seg != i {
                break;
            }
            cut_iter.next();
            if t <= EPSILON {
                // cut on vertex i, which already closes `current`
                if current.len() >= 2 {
                    pieces.push(LineString::from(std::mem::replace(&mut current, vec![coords[i]])));
                }
                continue;
            }
            current.push(at);
            pieces.push(LineString::from(std::mem::replace(&mut current, vec![at])));
        }
        current.push(coords[i + 1]);
    }
    pieces.push(LineString::from(current));
    pieces
}

/// Points spaced `spacing` apart along the line, always including both ends.
pub fn sample_along(line: &LineString<f64>, spacing: f64) -> Vec<Coord> {
    let (Some(&first), Some(&last)) = (line.0.first(), line.0.last()) else {
        return Vec::new();
    };
    if line.0.len() < 2 {
        return vec![first];
    }

    let total = Euclidean.length(line);
    let mut samples = vec![first];
    if spacing > 0.0 {
        let mut along = spacing;
        while along < total - EPSILON {
            if let Some(p) = Euclidean.point_at_distance_from_start(line, along) {
                samples.push(p.0);
            }
            along += spacing;
        }
    }
    samples.push(last);
    samples
}

/// Mean distance from points sampled along `from` to the line `to`.
/// Lower is more similar; the score is not symmetric.
pub fn mean_deviation(from: &LineString<f64>, to: &LineString<f64>, spacing: f64) -> f64 {
    let samples = sample_along(from, spacing);
    if samples.is_empty() || to.0.is_empty() {
        return f64::INFINITY;
    }
    let total: f64 = samples
        .iter()
        .filter_map(|p| distance_to_line(*p, to).map(|(d, _)| d))
        .sum();
    total / samples.len() as f64
}

/// Same coordinate sequence, in either direction.
pub fn equal_exact(a: &LineString<f64>, b: &LineString<f64>) -> bool {
    a.0.len() == b.0.len() && (a.0 == b.0 || a.0.iter().eq(b.0.iter().rev()))
}

/// Both lines connect the same pair of end coordinates, in either direction.
pub fn same_endpoints(a: &LineString<f64>, b: &LineString<f64>, tolerance: f64) -> bool {
    let (Some(a0), Some(a1), Some(b0), Some(b1)) = (a.0.first(), a.0.last(), b.0.first(), b.0.last()) else {
        return false;
    };
    let close = |p: &Coord, q: &Coord| coord_distance(*p, *q) <= tolerance;
    (close(a0, b0) && close(a1, b1)) || (close(a0, b1) && close(a1, b0))
}

pub type CoordKey = (u64, u64);

pub fn coord_key(c: Coord) -> CoordKey {
    // +0.0 so that -0.0 and 0.0 land on the same node
    ((c.x + 0.0).to_bits(), (c.y + 0.0).to_bits())
}

/// A run of input lines joined end to end.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub line: LineString<f64>,
    /// Positions of the joined lines in the input slice, in walking order
    pub members: Vec<usize>,
}

/// Join lines that meet end-to-end at degree-2 nodes into maximal chains.
/// Lines are only joined at bit-identical endpoints.
pub fn merge_into_chains(lines: &[LineString<f64>]) -> Vec<Chain> {
    let lines: Vec<(usize, &LineString<f64>)> = lines.iter().enumerate().filter(|(_, l)| l.0.len() >= 2).collect();
    let mut incidence: AHashMap<CoordKey, Vec<usize>> = AHashMap::new();
    for (idx, (_, line)) in lines.iter().enumerate() {
        incidence.entry(coord_key(line.0[0])).or_default().push(idx);
        incidence.entry(coord_key(line.0[line.0.len() - 1])).or_default().push(idx);
    }
    let degree = |c: Coord| incidence.get(&coord_key(c)).map_or(0, Vec::len);

    let mut used = vec![false; lines.len()];
    let mut chains = Vec::new();

    let walk = |seed: usize, from: Coord, used: &mut Vec<bool>| -> Chain {
        let mut coords: Vec<Coord> = Vec::new();
        let mut members = Vec::new();
        let mut current = seed;
        let mut at = from;
        loop {
            used[current] = true;
            let (position, line) = lines[current];
            members.push(position);
            let mut piece = line.0.clone();
            if coord_key(piece[0]) != coord_key(at) {
                piece.reverse();
            }
            if coords.is_empty() {
                coords.extend(piece.iter().copied());
            } else {
                coords.extend(piece.iter().skip(1).copied());
            }
            at = piece[piece.len() - 1];
            if degree(at) != 2 {
                break;
            }
            let next = incidence
                .get(&coord_key(at))
                .and_then(|ends| ends.iter().copied().find(|&m| !used[m]));
            match next {
                Some(n) => current = n,
                None => break,
            }
        }
        Chain {
            line: LineString::from(coords),
            members,
        }
    };

    // open chains start at nodes that are not degree 2
    for idx in 0..lines.len() {
        if used[idx] {
            continue;
        }
        let line = lines[idx].1;
        let start = line.0[0];
        let end = line.0[line.0.len() - 1];
        if degree(start) != 2 {
            chains.push(walk(idx, start, &mut used));
        } else if degree(end) != 2 {
            chains.push(walk(idx, end, &mut used));
        }
    }
    // whatever is left forms closed rings
    for idx in 0..lines.len() {
        if !used[idx] {
            let line = lines[idx].1;
            chains.push(walk(idx, line.0[0], &mut used));
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::line_string;

    #[test]
    fn simplify_keeps_endpoints_and_drops_flat_vertices() {
        let line = line_string![
            (x: 0.0, y: 0.0),
            (x: 5.0, y: 0.5),
            (x: 10.0, y: 0.0),
            (x: 15.0, y: 8.0),
            (x: 20.0, y: 0.0),
        ];
        let simple = simplify_preserving_ends(&line, 1.0);
        assert_eq!(simple.0.first(), line.0.first());
        assert_eq!(simple.0.last(), line.0.last());
        assert_eq!(simple.0.len(), 4);
        // second run is a no-op
        assert_eq!(simplify_preserving_ends(&simple, 1.0), simple);
    }

    #[test]
    fn merge_at_orients_both_lines() {
        let a = line_string![(x: 5.0, y: 0.0), (x: 2.0, y: 1.0), (x: 0.0, y: 0.0)];
        let b = line_string![(x: 10.0, y: 0.0), (x: 7.0, y: 1.0), (x: 5.0, y: 0.0)];
        let merged = merge_at(&a, &b, Coord { x: 5.0, y: 0.0 }, 0.0).unwrap();
        assert_eq!(merged.0.len(), 5);
        assert_eq!(merged.0[0], Coord { x: 0.0, y: 0.0 });
        assert_eq!(merged.0[2], Coord { x: 5.0, y: 0.0 });
        assert_eq!(merged.0[4], Coord { x: 10.0, y: 0.0 });
    }

    #[test]
    fn merge_at_rejects_lines_not_touching_the_point() {
        let a = line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)];
        let b = line_string![(x: 3.0, y: 0.0), (x: 4.0, y: 0.0)];
        assert!(merge_at(&a, &b, Coord { x: 1.0, y: 0.0 }, 0.0).is_none());
    }

    #[test]
    fn simplicity_detects_crossings_but_allows_rings() {
        let crossing = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 10.0), (x: 10.0, y: 0.0), (x: 0.0, y: 10.0)];
        assert!(!is_simple(&crossing));
        let ring = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 0.0)];
        assert!(is_simple(&ring));
        let zigzag = line_string![(x: 0.0, y: 0.0), (x: 5.0, y: 5.0), (x: 10.0, y: 0.0)];
        assert!(is_simple(&zigzag));
    }

    #[test]
    fn split_at_interior_points_and_vertices() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 20.0, y: 0.0)];
        let pieces = split_at(
            &line,
            &[Coord { x: 15.0, y: 0.2 }, Coord { x: 10.0, y: 0.0 }, Coord { x: 0.0, y: 0.0 }],
        );
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].0, vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 0.0 }]);
        assert_eq!(pieces[1].0, vec![Coord { x: 10.0, y: 0.0 }, Coord { x: 15.0, y: 0.0 }]);
        assert_eq!(pieces[2].0, vec![Coord { x: 15.0, y: 0.0 }, Coord { x: 20.0, y: 0.0 }]);
    }

    #[test]
    fn split_without_cuts_returns_original() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)];
        assert_eq!(split_at(&line, &[]), vec![line.clone()]);
        assert!(split_at(&LineString::new(vec![]), &[Coord { x: 1.0, y: 1.0 }]).is_empty());
    }

    #[test]
    fn sampling_includes_both_ends() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)];
        let samples = sample_along(&line, 4.0);
        assert_eq!(samples.len(), 4);
        assert_relative_eq!(samples[1].x, 4.0);
        assert_relative_eq!(samples[2].x, 8.0);
        assert_relative_eq!(samples[3].x, 10.0);
    }

    #[test]
    fn mean_deviation_of_parallel_offset() {
        let a = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)];
        let b = line_string![(x: 0.0, y: 2.0), (x: 10.0, y: 2.0)];
        assert_relative_eq!(mean_deviation(&a, &b, 1.0), 2.0);
    }

    #[test]
    fn chains_join_degree_two_nodes_only() {
        let lines = vec![
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)],
            line_string![(x: 2.0, y: 0.0), (x: 1.0, y: 0.0)],
            line_string![(x: 2.0, y: 0.0), (x: 3.0, y: 0.0)],
            // branch at (3, 0)
            line_string![(x: 3.0, y: 0.0), (x: 4.0, y: 0.0)],
            line_string![(x: 3.0, y: 0.0), (x: 3.0, y: 1.0)],
        ];
        let chains = merge_into_chains(&lines);
        assert_eq!(chains.len(), 3);
        assert_eq!(chains[0].line.0.len(), 4);
        assert_eq!(chains[0].members, vec![0, 1, 2]);
        assert_relative_eq!(Euclidean.length(&chains[0].line), 3.0);
    }

    #[test]
    fn endpoint_comparison_ignores_direction() {
        let a = line_string![(x: 0.0, y: 0.0), (x: 5.0, y: 1.0), (x: 10.0, y: 0.0)];
        let b = line_string![(x: 10.0, y: 0.0), (x: 0.0, y: 0.0)];
        assert!(same_endpoints(&a, &b, 0.0));
        assert!(!equal_exact(&a, &b));
        let reversed: LineString<f64> = a.0.iter().rev().copied().collect::<Vec<_>>().into();
        assert!(equal_exact(&a, &reversed));
    }
}
