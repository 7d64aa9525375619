use super::{Stage, StageContext, StageReport};
use crate::error::Result;
use crate::feature::{FeatureId, Filter, Projection};
use crate::geometry;
use ahash::AHashSet;
use log::{debug, info};

/// Removes closed features (first coordinate == last coordinate).
///
/// With `length_tolerance <= 0` every cycle goes. Otherwise only cycles shorter
/// than the tolerance are deleted; longer ones (roundabouts, ring roads) are
/// kept and flagged.
#[derive(Debug, Clone)]
pub struct CyclePass {
    pub length_tolerance: f64,
}

impl Default for CyclePass {
    fn default() -> Self {
        Self {
            length_tolerance: -1.0,
        }
    }
}

impl Stage for CyclePass {
    fn name(&self) -> &'static str {
        "cycles"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());
        let total = ctx.store.count(&Filter::All)?;
        ctx.progress.begin_task("Removing cycles", total as u64);

        let mut doomed: AHashSet<FeatureId> = AHashSet::new();
        let mut iter = ctx.iterate(Filter::All, Projection::GeometryOnly);
        while let Some(feature) = iter.next(ctx.store)? {
            if ctx.token.checkpoint() {
                report.canceled = true;
                break;
            }
            report.processed += 1;
            ctx.progress.worked(1);

            if !geometry::is_closed(&feature.geometry) {
                continue;
            }
            let length = feature.length();
            if self.length_tolerance <= 0.0 || length < self.length_tolerance {
                debug!("Deleting cycle {} (length {:.3})", feature.id, length);
                doomed.insert(feature.id);
            } else {
                debug!("Keeping cycle {} (length {:.3})", feature.id, length);
                let at = feature.geometry.0[0];
                report.flag(
                    vec![feature.id],
                    at,
                    format!("closed line of length {length:.3} kept for review"),
                );
            }
        }

        if !doomed.is_empty() {
            report.deleted = ctx.store.remove_features(&Filter::Ids(doomed))?;
        }
        ctx.progress.done();
        info!(
            "Deleted {} cycles, kept {} for review",
            report.deleted,
            report.flagged.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::passes::test_support::run_stage;
    use crate::store::InMemoryStore;
    use geo::line_string;

    /// Closed square with the given side length.
    fn square(id: &str, side: f64) -> Feature {
        Feature::new(
            id,
            line_string![
                (x: 0.0, y: 0.0),
                (x: side, y: 0.0),
                (x: side, y: side),
                (x: 0.0, y: side),
                (x: 0.0, y: 0.0),
            ],
        )
    }

    fn store() -> InMemoryStore {
        InMemoryStore::from_features(vec![
            square("ring-40", 10.0),
            square("ring-60", 15.0),
            Feature::new("open", line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 0.0)]),
        ])
        .unwrap()
    }

    #[test]
    fn negative_tolerance_deletes_every_cycle() {
        let mut store = store();
        let report = run_stage(&mut CyclePass::default(), &mut store);
        assert_eq!(report.deleted, 2);
        assert_eq!(store.len(), 1);
        assert!(store.feature("open").is_some());
    }

    #[test]
    fn positive_tolerance_keeps_long_cycles() {
        let mut store = store();
        let report = run_stage(&mut CyclePass { length_tolerance: 50.0 }, &mut store);
        assert_eq!(report.deleted, 1);
        assert!(store.feature("ring-40").is_none());
        assert!(store.feature("ring-60").is_some());
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].features[0].as_str(), "ring-60");
    }

    #[test]
    fn second_run_changes_nothing() {
        let mut store = store();
        let mut pass = CyclePass { length_tolerance: 50.0 };
        run_stage(&mut pass, &mut store);
        let report = run_stage(&mut pass, &mut store);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.len(), 2);
    }
}
