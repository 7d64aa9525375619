// ===========================================================================
// Pseudo-node merging
// ===========================================================================
//
// A pseudo-node is a point where exactly two lines meet end-to-end with no
// real branching. Each sweep fuses such pairs into one feature: the surviving
// feature takes the merged geometry, the other is deleted. Merges change the
// endpoints later checks look at, so full convergence needs another sweep.
// ===========================================================================

use super::{Stage, StageContext, StageReport};
use crate::error::Result;
use crate::feature::{EndpointRole, Feature, FeatureId, Filter, Projection};
use crate::geometry;
use crate::store::{FeatureStore, fetch_all};
use ahash::AHashSet;
use geo::Coord;
use log::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct PseudoNodeMergePass {
    /// 0 means lines must touch exactly
    pub intersection_tolerance: f64,
}

/// How a feature touches the tested point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Endpoint,
    Interior,
}

/// Pairs already found unmergeable, smaller id first.
type Rejected = AHashSet<(FeatureId, FeatureId)>;

impl PseudoNodeMergePass {
    fn touches_at(&self, store: &dyn FeatureStore, at: Coord) -> Result<Vec<(Touch, Feature)>> {
        let filter = Filter::NearPoint {
            point: at,
            distance: self.intersection_tolerance,
        };
        let near = |c: Option<Coord>| c.is_some_and(|c| geometry::coord_distance(c, at) <= self.intersection_tolerance);

        let mut touches = Vec::new();
        for feature in fetch_all(store, &filter, Projection::GeometryOnly)? {
            let at_start = near(feature.start());
            let at_end = near(feature.end());
            if at_start {
                touches.push((Touch::Endpoint, feature.clone()));
            }
            if at_end {
                touches.push((Touch::Endpoint, feature.clone()));
            }
            if !at_start && !at_end {
                touches.push((Touch::Interior, feature));
            }
        }
        Ok(touches)
    }

    /// Try to dissolve the node at `at`. Returns the id of the deleted
    /// feature when a merge happened.
    fn merge_at_node(
        &self,
        store: &mut dyn FeatureStore,
        at: Coord,
        rejected: &mut Rejected,
        report: &mut StageReport,
    ) -> Result<Option<FeatureId>> {
        let touches = self.touches_at(store, at)?;
        if touches.len() != 2 {
            return Ok(None);
        }
        let (first_touch, first) = &touches[0];
        let (second_touch, second) = &touches[1];

        if first.id == second.id {
            debug!("{} loops back onto itself at ({}, {}), leaving it to the cycle pass", first.id, at.x, at.y);
            return Ok(None);
        }
        if *first_touch == Touch::Interior || *second_touch == Touch::Interior {
            return Ok(None);
        }
        let pair = if first.id < second.id {
            (first.id.clone(), second.id.clone())
        } else {
            (second.id.clone(), first.id.clone())
        };
        if rejected.contains(&pair) {
            return Ok(None);
        }

        let Some(merged) = geometry::merge_at(&first.geometry, &second.geometry, at, self.intersection_tolerance) else {
            debug!("{} and {} do not chain into a single line, skipping", first.id, second.id);
            report.flag(
                vec![first.id.clone(), second.id.clone()],
                at,
                "pseudo-node merge did not produce a single line",
            );
            rejected.insert(pair);
            return Ok(None);
        };
        if !geometry::is_simple(&merged) {
            debug!("Merging {} and {} self-intersects, skipping", first.id, second.id);
            report.flag(
                vec![first.id.clone(), second.id.clone()],
                at,
                "pseudo-node merge would self-intersect",
            );
            rejected.insert(pair);
            return Ok(None);
        }

        store.modify_geometry(&first.id, merged)?;
        store.remove_features(&Filter::Ids([second.id.clone()].into_iter().collect()))?;
        report.modified += 1;
        report.deleted += 1;
        Ok(Some(second.id.clone()))
    }
}

impl Stage for PseudoNodeMergePass {
    fn name(&self) -> &'static str {
        "pseudo-node-merge"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());
        let total = ctx.store.count(&Filter::All)?;
        ctx.progress.begin_task("Merging pseudo-nodes", total as u64);

        let mut rejected = Rejected::new();
        let mut iter = ctx.iterate(Filter::All, Projection::GeometryOnly);
        while let Some(feature) = iter.next(ctx.store)? {
            if ctx.token.checkpoint() {
                report.canceled = true;
                break;
            }
            report.processed += 1;
            ctx.progress.worked(1);

            for role in [EndpointRole::Start, EndpointRole::End] {
                // geometry may have changed after merging at the other end
                let Some(current) = ctx.store.get(&feature.id, Projection::GeometryOnly)? else {
                    break;
                };
                let Some(at) = role.coord_of(&current.geometry) else {
                    break;
                };
                self.merge_at_node(ctx.store, at, &mut rejected, &mut report)?;
            }
        }

        ctx.progress.done();
        info!("Merged {} pseudo-nodes", report.deleted);
        Ok(report)
    }
}
