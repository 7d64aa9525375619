// ===========================================================================
// Node insertion
// ===========================================================================
//
// Endpoints that dangle next to another line are projected onto that line and
// the line is cut there, so the dangling end and the new vertex can later be
// snapped into a real junction by end-node clustering.
//
//   1. Scan:   every endpoint searches for other features inside a tolerance box
//              and records the closest point on each hit as a cut.
//   2. Commit: each feature with cuts is split; the first piece keeps the
//              feature's id, the rest become new features with its attributes.
// ===========================================================================

use super::{Stage, StageContext, StageReport};
use crate::error::Result;
use crate::feature::{EndpointRole, FeatureDraft, FeatureId, Filter, Projection};
use crate::geometry;
use crate::store::{FeatureStore, fetch_all};
use geo::Coord;
use log::{debug, info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct NodeInsertionPass {
    pub distance_tolerance: f64,
}

impl Default for NodeInsertionPass {
    fn default() -> Self {
        Self {
            distance_tolerance: 5.0,
        }
    }
}

/// Cut coordinates per feature, in first-seen order, unique by bit pattern.
#[derive(Debug, Default)]
struct PendingCuts {
    by_feature: BTreeMap<FeatureId, Vec<Coord>>,
}

impl PendingCuts {
    fn record(&mut self, id: &FeatureId, at: Coord) -> bool {
        let cuts = self.by_feature.entry(id.clone()).or_default();
        if cuts.iter().any(|c| geometry::coord_key(*c) == geometry::coord_key(at)) {
            return false;
        }
        cuts.push(at);
        true
    }

    fn len(&self) -> usize {
        self.by_feature.len()
    }
}

impl NodeInsertionPass {
    fn scan_node(
        &self,
        store: &dyn FeatureStore,
        owner: &FeatureId,
        node: Coord,
        pending: &mut PendingCuts,
    ) -> Result<()> {
        let window = Filter::Envelope(geometry::square_around(node, self.distance_tolerance));
        for candidate in fetch_all(store, &window, Projection::GeometryOnly)? {
            if &candidate.id == owner {
                continue;
            }
            let Some((distance, closest)) = geometry::distance_to_line(node, &candidate.geometry) else {
                continue;
            };
            if distance > self.distance_tolerance {
                continue;
            }
            if Some(closest) == candidate.start() || Some(closest) == candidate.end() {
                continue;
            }
            if pending.record(&candidate.id, closest) {
                debug!(
                    "Endpoint of {} at ({}, {}) cuts {} at ({}, {})",
                    owner, node.x, node.y, candidate.id, closest.x, closest.y
                );
            }
        }
        Ok(())
    }
}

impl NodeInsertionPass {
    /// Cut one feature at its pending coordinates. The first piece keeps the
    /// id; the rest are added with copies of its attributes.
    fn split_feature(
        &self,
        store: &mut dyn FeatureStore,
        id: &FeatureId,
        cuts: &[Coord],
        report: &mut StageReport,
    ) -> Result<()> {
        let Some(feature) = store.get(id, Projection::Full)? else {
            return Ok(());
        };
        let mut pieces = geometry::split_at(&feature.geometry, cuts).into_iter();
        let Some(first) = pieces.next() else {
            warn!("Splitting {} at {} points produced no lines, skipping", id, cuts.len());
            if let Some(&at) = cuts.first() {
                report.flag(vec![id.clone()], at, "node insertion produced no lines");
            }
            return Ok(());
        };
        let rest: Vec<FeatureDraft> = pieces
            .map(|geometry| FeatureDraft {
                geometry,
                attributes: feature.attributes.clone(),
            })
            .collect();
        if rest.is_empty() {
            return Ok(());
        }

        store.modify_geometry(id, first)?;
        let created = store.add_features(rest)?;
        debug!("Split {} into {} pieces", id, created.len() + 1);
        report.modified += 1;
        report.added += created.len();
        Ok(())
    }
}

impl Stage for NodeInsertionPass {
    fn name(&self) -> &'static str {
        "node-insertion"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());
        let total = ctx.store.count(&Filter::All)?;
        ctx.progress.begin_task("Inserting nodes", total as u64);

        let mut pending = PendingCuts::default();
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
                if let Some(node) = role.coord_of(&feature.geometry) {
                    self.scan_node(ctx.store, &feature.id, node, &mut pending)?;
                }
            }
        }

        ctx.progress.sub_task(&format!("Splitting {} features", pending.len()));
        for (id, cuts) in std::mem::take(&mut pending.by_feature) {
            if ctx.token.checkpoint() {
                report.canceled = true;
                break;
            }
            self.split_feature(ctx.store, &id, &cuts, &mut report)?;
        }

        ctx.progress.done();
        info!(
            "Inserted nodes into {} features, creating {} new features",
            report.modified, report.added
        );
        Ok(report)
    }
}
