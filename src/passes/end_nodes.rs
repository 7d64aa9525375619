// ===========================================================================
// End-node clustering
// ===========================================================================
//
// Groups line endpoints that lie within `distance_tolerance` of each other and
// snaps every group onto its centroid so the lines share one exact junction.
//
// Grouping is a union over proximity edges:
//
//   a ── b        c ── d          a, b, c, d, e end up in one collection
//         \      /                once e is found near both b and c.
//            e
//
// A collection whose bounding box is larger than `area_tolerance` is too
// spread out to be a single junction; it is flagged and nothing moves.
// ===========================================================================

use super::{Stage, StageContext, StageReport};
use crate::error::Result;
use crate::feature::{EndpointRole, Filter, Node, Projection};
use ahash::AHashSet;
use geo::{BoundingRect, Centroid, MultiPoint};
use itertools::Itertools;
use log::{debug, info};
use rstar::RTree;
use rstar::primitives::GeomWithData;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct EndNodeClusteringPass {
    pub distance_tolerance: f64,
    /// Collections with a larger envelope area are flagged instead of snapped.
    /// 0 or less disables the check.
    pub area_tolerance: f64,
}

impl Default for EndNodeClusteringPass {
    fn default() -> Self {
        Self {
            distance_tolerance: 5.0,
            area_tolerance: 25.0,
        }
    }
}

type CollectionId = usize;

#[derive(Debug, Default)]
struct NodeCollection {
    /// Indices into the scanned node list
    members: Vec<usize>,
    flagged: bool,
}

/// Node -> collection ownership. Merging re-points every member of the
/// absorbed collection, so lookups never chase parents.
#[derive(Debug)]
struct ClusterIndex {
    owner: Vec<Option<CollectionId>>,
    collections: BTreeMap<CollectionId, NodeCollection>,
    next_id: CollectionId,
}

impl ClusterIndex {
    fn new(node_count: usize) -> Self {
        Self {
            owner: vec![None; node_count],
            collections: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn collection_of(&self, node: usize) -> Option<CollectionId> {
        self.owner[node]
    }

    fn create(&mut self, a: usize, b: usize) -> CollectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.collections.insert(
            id,
            NodeCollection {
                members: vec![a, b],
                flagged: false,
            },
        );
        self.owner[a] = Some(id);
        self.owner[b] = Some(id);
        id
    }

    fn add(&mut self, collection: CollectionId, node: usize) {
        if let Some(c) = self.collections.get_mut(&collection) {
            c.members.push(node);
            self.owner[node] = Some(collection);
        }
    }

    fn absorb(&mut self, into: CollectionId, from: CollectionId) {
        let Some(absorbed) = self.collections.remove(&from) else {
            return;
        };
        for &node in &absorbed.members {
            self.owner[node] = Some(into);
        }
        if let Some(target) = self.collections.get_mut(&into) {
            target.members.extend(absorbed.members);
        }
    }

    /// Link `a` with its neighbour `b`. Returns the collection `a` belongs to
    /// afterwards.
    fn link(&mut self, a: usize, b: usize) -> CollectionId {
        match (self.collection_of(a), self.collection_of(b)) {
            (Some(ca), Some(cb)) if ca != cb => {
                self.absorb(ca, cb);
                ca
            }
            (Some(ca), Some(_)) => ca,
            (Some(ca), None) => {
                self.add(ca, b);
                ca
            }
            (None, Some(cb)) => {
                self.add(cb, a);
                cb
            }
            (None, None) => self.create(a, b),
        }
    }
}

impl Stage for EndNodeClusteringPass {
    fn name(&self) -> &'static str {
        "end-node-clustering"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());

        // one unit per feature read, then one per endpoint clustered
        let total = ctx.store.count(&Filter::All)?;
        ctx.progress.begin_task("Clustering end nodes", total as u64 * 3);

        let mut nodes: Vec<Node> = Vec::new();
        let mut iter = ctx.iterate(Filter::All, Projection::GeometryOnly);
        while let Some(feature) = iter.next(ctx.store)? {
            if ctx.token.checkpoint() {
                report.canceled = true;
                ctx.progress.done();
                return Ok(report);
            }
            report.processed += 1;
            ctx.progress.worked(1);
            for role in [EndpointRole::Start, EndpointRole::End] {
                if let Some(coord) = role.coord_of(&feature.geometry) {
                    nodes.push(Node {
                        coord,
                        owner: feature.id.clone(),
                        role,
                    });
                }
            }
        }
        ctx.progress.sub_task(&format!("Clustering {} end nodes", nodes.len()));

        let tree: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
            nodes
                .iter()
                .enumerate()
                .map(|(i, n)| GeomWithData::new([n.coord.x, n.coord.y], i))
                .collect(),
        );
        let radius_sq = self.distance_tolerance * self.distance_tolerance;

        let mut index = ClusterIndex::new(nodes.len());
        for (a, node) in nodes.iter().enumerate() {
            if ctx.token.checkpoint() {
                report.canceled = true;
                ctx.progress.done();
                return Ok(report);
            }
            ctx.progress.worked(1);

            let mut neighbours: Vec<usize> = tree
                .locate_within_distance([node.coord.x, node.coord.y], radius_sq)
                .map(|entry| entry.data)
                .filter(|&b| b != a)
                .collect();
            neighbours.sort_unstable();
            for b in neighbours {
                index.link(a, b);
            }
        }

        let mut touched = AHashSet::new();
        for collection in index.collections.values_mut() {
            if ctx.token.checkpoint() {
                report.canceled = true;
                break;
            }
            let points: MultiPoint<f64> = collection.members.iter().map(|&m| nodes[m].coord).collect();
            let Some(center) = points.centroid().map(|p| p.0) else {
                continue;
            };
            let area = points.bounding_rect().map_or(0.0, |r| r.width() * r.height());
            if self.area_tolerance > 0.0 && area > self.area_tolerance {
                collection.flagged = true;
                let owners: Vec<_> = collection
                    .members
                    .iter()
                    .map(|&m| nodes[m].owner.clone())
                    .sorted()
                    .dedup()
                    .collect();
                info!(
                    "Leaving {} end nodes near ({:.3}, {:.3}) for review: envelope area {:.3} exceeds {}",
                    collection.members.len(),
                    center.x,
                    center.y,
                    area,
                    self.area_tolerance
                );
                report.flag(
                    owners,
                    center,
                    format!("end-node cluster envelope area {area:.3} exceeds tolerance"),
                );
                continue;
            }

            for &member in &collection.members {
                let node = &nodes[member];
                // re-read: an earlier member may already have moved the other end
                let Some(current) = ctx.store.get(&node.owner, Projection::GeometryOnly)? else {
                    debug!("{} disappeared before snapping", node.owner);
                    continue;
                };
                let mut line = current.geometry;
                let slot = match node.role {
                    EndpointRole::Start => line.0.first_mut(),
                    EndpointRole::End => line.0.last_mut(),
                };
                let Some(slot) = slot else {
                    continue;
                };
                if *slot == center {
                    continue;
                }
                *slot = center;
                ctx.store.modify_geometry(&node.owner, line)?;
                touched.insert(node.owner.clone());
            }
        }
        report.modified = touched.len();

        ctx.progress.done();
        info!(
            "Snapped {} features across {} end-node clusters, {} flagged",
            report.modified,
            index.collections.len(),
            index.collections.values().filter(|c| c.flagged).count()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::memory_iter::HeapGauge;
    use crate::passes::test_support::{PLENTY, run_stage, run_stage_with};
    use crate::progress::CancelToken;
    use crate::store::InMemoryStore;
    use approx::assert_relative_eq;
    use geo::{Coord, line_string};

    /// Cancels the run the first time the iterator checks for memory.
    struct CancelWhileReading {
        token: CancelToken,
    }

    impl HeapGauge for CancelWhileReading {
        fn available_bytes(&self) -> u64 {
            self.token.cancel();
            u64::MAX
        }
    }

    /// Three features whose start points are 1, 1.5 and 2 apart.
    fn triangle_store() -> InMemoryStore {
        let c_x = 1.375;
        let c_y = (4.0f64 - c_x * c_x).sqrt();
        InMemoryStore::from_features(vec![
            Feature::new("a", line_string![(x: 0.0, y: 0.0), (x: -50.0, y: 0.0)]),
            Feature::new("b", line_string![(x: 1.0, y: 0.0), (x: 50.0, y: 0.0)]),
            Feature::new("c", line_string![(x: c_x, y: c_y), (x: 0.0, y: 50.0)]),
        ])
        .unwrap()
    }

    #[test]
    fn close_endpoints_snap_to_their_centroid() {
        let mut store = triangle_store();
        let c_y = (4.0f64 - 1.375 * 1.375).sqrt();
        let mut pass = EndNodeClusteringPass {
            distance_tolerance: 3.0,
            area_tolerance: 100.0,
        };
        let report = run_stage(&mut pass, &mut store);
        assert!(report.flagged.is_empty());
        assert_eq!(report.modified, 3);

        let starts: Vec<Coord> = store.features().map(|f| f.start().unwrap()).collect();
        assert_relative_eq!(starts[0].x, (0.0 + 1.0 + 1.375) / 3.0);
        assert_relative_eq!(starts[0].y, c_y / 3.0);
        assert!(starts.iter().all(|s| s.x.to_bits() == starts[0].x.to_bits()));
        assert!(starts.iter().all(|s| s.y.to_bits() == starts[0].y.to_bits()));

        // far ends stay put
        assert_eq!(store.feature("a").unwrap().end(), Some(Coord { x: -50.0, y: 0.0 }));
    }

    #[test]
    fn oversized_cluster_is_flagged_and_left_alone() {
        let mut store = triangle_store();
        let before: Vec<Feature> = store.features().cloned().collect();
        let mut pass = EndNodeClusteringPass {
            distance_tolerance: 3.0,
            area_tolerance: 0.5,
        };
        let report = run_stage(&mut pass, &mut store);
        assert_eq!(report.modified, 0);
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].features.len(), 3);
        let after: Vec<Feature> = store.features().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn collections_found_separately_are_merged() {
        // n4 joins {n0, n1} before {n2, n3} exists, so n2's scan merges the two
        let mut store = InMemoryStore::from_features(vec![
            Feature::new("n0", line_string![(x: 0.0, y: 0.0), (x: 0.0, y: 100.0)]),
            Feature::new("n1", line_string![(x: 4.0, y: 0.0), (x: 4.0, y: 150.0)]),
            Feature::new("n2", line_string![(x: 12.0, y: 0.0), (x: 12.0, y: 200.0)]),
            Feature::new("n3", line_string![(x: 16.0, y: 0.0), (x: 16.0, y: 250.0)]),
            Feature::new("n4", line_string![(x: 8.0, y: 0.0), (x: 8.0, y: 300.0)]),
        ])
        .unwrap();
        let report = run_stage(&mut EndNodeClusteringPass::default(), &mut store);
        assert!(report.flagged.is_empty());
        assert_eq!(report.modified, 4);
        for feature in store.features() {
            assert_eq!(feature.start(), Some(Coord { x: 8.0, y: 0.0 }));
        }
    }

    #[test]
    fn isolated_endpoints_are_untouched() {
        let mut store = InMemoryStore::from_features(vec![
            Feature::new("a", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]),
            Feature::new("b", line_string![(x: 0.0, y: 50.0), (x: 100.0, y: 50.0)]),
        ])
        .unwrap();
        let report = run_stage(&mut EndNodeClusteringPass::default(), &mut store);
        assert_eq!(report.modified, 0);
        assert!(report.flagged.is_empty());
    }

    #[test]
    fn cancel_while_reading_endpoints_stops_before_snapping() {
        let mut store = triangle_store();
        let before: Vec<Feature> = store.features().cloned().collect();
        let token = CancelToken::new();
        let heap = CancelWhileReading { token: token.clone() };
        let mut pass = EndNodeClusteringPass {
            distance_tolerance: 3.0,
            area_tolerance: 100.0,
        };
        let report = run_stage_with(&mut pass, &mut store, &token, &heap);
        assert!(report.canceled);
        assert_eq!(report.processed, 1);
        assert_eq!(report.modified, 0);
        let after: Vec<Feature> = store.features().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn canceled_token_leaves_the_store_alone() {
        let mut store = triangle_store();
        let token = CancelToken::new();
        token.cancel();
        let report = run_stage_with(&mut EndNodeClusteringPass::default(), &mut store, &token, &PLENTY);
        assert!(report.canceled);
        assert_eq!(report.processed, 0);
        assert_eq!(store.feature("b").unwrap().start(), Some(Coord { x: 1.0, y: 0.0 }));
    }

    #[test]
    fn index_merge_repoints_every_member() {
        let mut index = ClusterIndex::new(5);
        let first = index.link(0, 1);
        let second = index.link(2, 3);
        assert_ne!(first, second);
        index.link(4, 1);
        let merged = index.link(4, 2);
        assert_eq!(index.collections.len(), 1);
        for node in 0..5 {
            assert_eq!(index.collection_of(node), Some(merged));
        }
        assert_eq!(index.collections[&merged].members.len(), 5);
    }
}
