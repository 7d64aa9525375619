use super::{Stage, StageContext, StageReport};
use crate::error::Result;
use crate::feature::Filter;
use log::info;

/// Deletes every feature no longer than `min_length` in a single bulk delete.
#[derive(Debug, Clone)]
pub struct MinimumLengthPass {
    pub min_length: f64,
}

impl Default for MinimumLengthPass {
    fn default() -> Self {
        Self { min_length: 10.0 }
    }
}

impl Stage for MinimumLengthPass {
    fn name(&self) -> &'static str {
        "minimum-length"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());
        let total = ctx.store.count(&Filter::All)?;
        ctx.progress.begin_task("Removing short lines", total as u64);

        if ctx.token.checkpoint() {
            report.canceled = true;
            return Ok(report);
        }

        report.deleted = ctx
            .store
            .remove_features(&Filter::LengthAtMost(self.min_length))?;
        report.processed = total;
        ctx.progress.worked(total as u64);
        ctx.progress.done();

        info!(
            "Removed {} of {} features no longer than {}",
            report.deleted, total, self.min_length
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

    fn store() -> InMemoryStore {
        InMemoryStore::from_features(vec![
            Feature::new("short", line_string![(x: 0.0, y: 0.0), (x: 3.0, y: 4.0)]),
            Feature::new("exact", line_string![(x: 0.0, y: 10.0), (x: 10.0, y: 10.0)]),
            Feature::new("long", line_string![(x: 0.0, y: 20.0), (x: 10.5, y: 20.0)]),
            Feature::new("degenerate", line_string![(x: 5.0, y: 5.0), (x: 5.0, y: 5.0)]),
        ])
        .unwrap()
    }

    #[test]
    fn removes_lines_at_or_below_threshold() {
        let mut store = store();
        let report = run_stage(&mut MinimumLengthPass::default(), &mut store);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.processed, 4);
        assert_eq!(store.len(), 1);
        assert!(store.feature("long").is_some());
    }

    #[test]
    fn second_run_changes_nothing() {
        let mut store = store();
        run_stage(&mut MinimumLengthPass::default(), &mut store);
        let report = run_stage(&mut MinimumLengthPass::default(), &mut store);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.len(), 1);
    }
}
