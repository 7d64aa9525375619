use super::{Stage, StageContext, StageReport};
use crate::error::Result;
use crate::feature::{Filter, Projection};
use crate::geometry;
use log::{info, warn};

/// Douglas-Peucker point reduction per feature. Endpoints never move and no
/// feature is ever deleted here.
#[derive(Debug, Clone)]
pub struct CurveSimplificationPass {
    pub distance_tolerance: f64,
}

impl Default for CurveSimplificationPass {
    fn default() -> Self {
        Self {
            distance_tolerance: 5.0,
        }
    }
}

impl Stage for CurveSimplificationPass {
    fn name(&self) -> &'static str {
        "curve-simplification"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());
        let total = ctx.store.count(&Filter::All)?;
        ctx.progress.begin_task("Simplifying curves", total as u64);

        let mut iter = ctx.iterate(Filter::All, Projection::GeometryOnly);
        while let Some(feature) = iter.next(ctx.store)? {
            if ctx.token.checkpoint() {
                report.canceled = true;
                break;
            }
            report.processed += 1;
            ctx.progress.worked(1);

            let simplified = geometry::simplify_preserving_ends(&feature.geometry, self.distance_tolerance);
            if simplified.0.len() == feature.geometry.0.len() {
                continue;
            }
            if simplified.0.len() < 2 {
                warn!("Simplifying {} would leave fewer than 2 points, keeping it", feature.id);
                continue;
            }
            ctx.store.modify_geometry(&feature.id, simplified)?;
            report.modified += 1;
        }

        ctx.progress.done();
        info!(
            "Simplified {} of {} features (tolerance {})",
            report.modified, report.processed, self.distance_tolerance
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
    use geo::{Coord, line_string};

    fn store() -> InMemoryStore {
        InMemoryStore::from_features(vec![
            Feature::new(
                "wiggly",
                line_string![
                    (x: 0.1, y: 0.3),
                    (x: 10.0, y: 1.0),
                    (x: 20.0, y: -1.0),
                    (x: 30.0, y: 0.5),
                    (x: 40.0, y: 30.0),
                    (x: 50.7, y: 0.2),
                ],
            ),
            Feature::new("straight", line_string![(x: 0.0, y: 50.0), (x: 100.0, y: 50.0)]),
        ])
        .unwrap()
    }

    #[test]
    fn keeps_endpoints_bit_identical() {
        let mut store = store();
        let report = run_stage(&mut CurveSimplificationPass::default(), &mut store);
        assert_eq!(report.modified, 1);
        let wiggly = store.feature("wiggly").unwrap();
        assert_eq!(wiggly.geometry.0.first(), Some(&Coord { x: 0.1, y: 0.3 }));
        assert_eq!(wiggly.geometry.0.last(), Some(&Coord { x: 50.7, y: 0.2 }));
        assert!(wiggly.geometry.0.len() < 6);
    }

    #[test]
    fn second_run_changes_nothing() {
        let mut store = store();
        run_stage(&mut CurveSimplificationPass::default(), &mut store);
        let before: Vec<_> = store.features().cloned().collect();
        let report = run_stage(&mut CurveSimplificationPass::default(), &mut store);
        assert_eq!(report.modified, 0);
        let after: Vec<_> = store.features().cloned().collect();
        assert_eq!(before, after);
    }
}
