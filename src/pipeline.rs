// ===========================================================================
// Cleansing pipeline
// ===========================================================================
//
// Fixed schedule:
//
//   min length -> pseudo nodes -> simplify -> cycles -> node insertion
//     -> end nodes -> pseudo nodes -> cycles [-> similar lines]
//
// The store is committed after every stage. Cancellation is checked before
// each stage and inside every stage; whatever was committed stays.
// ===========================================================================

use crate::config::CleanseConfig;
use crate::error::Result;
use crate::memory_iter::HeapGauge;
use crate::passes::{Stage, StageContext, StageReport};
use crate::progress::{CancelToken, ProgressSink, ScaledProgress};
use crate::store::FeatureStore;
use log::info;
use serde::Serialize;

/// One slot in the schedule.
pub struct ScheduledStage {
    pub stage: Box<dyn Stage>,
    pub weight: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    pub canceled: bool,
}

impl PipelineReport {
    pub fn deleted(&self) -> usize {
        self.stages.iter().map(|s| s.deleted).sum()
    }

    pub fn modified(&self) -> usize {
        self.stages.iter().map(|s| s.modified).sum()
    }

    pub fn added(&self) -> usize {
        self.stages.iter().map(|s| s.added).sum()
    }

    pub fn flagged(&self) -> usize {
        self.stages.iter().map(|s| s.flagged.len()).sum()
    }
}

pub struct Pipeline {
    config: CleanseConfig,
}

impl Pipeline {
    pub fn new(config: CleanseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CleanseConfig {
        &self.config
    }

    pub fn schedule(&self) -> Vec<ScheduledStage> {
        let c = &self.config;
        let w = &c.weights;
        let slot = |stage: Box<dyn Stage>, weight: u64, enabled: bool| ScheduledStage { stage, weight, enabled };

        let mut stages = vec![
            slot(Box::new(c.min_length_pass()), w.min_length, c.min_length.enabled),
            slot(Box::new(c.pseudo_node_pass()), w.pseudo_nodes, c.pseudo_nodes.enabled),
            slot(Box::new(c.simplify_pass()), w.simplify, c.simplify.enabled),
            slot(Box::new(c.cycle_pass()), w.cycles, c.cycles.enabled),
            slot(Box::new(c.node_insertion_pass()), w.node_insertion, c.node_insertion.enabled),
            slot(Box::new(c.end_node_pass()), w.end_nodes, c.end_nodes.enabled),
            slot(Box::new(c.pseudo_node_pass()), w.pseudo_nodes_again, c.pseudo_nodes.enabled),
            slot(Box::new(c.cycle_pass()), w.cycles_again, c.cycles.enabled),
        ];
        if c.similar_lines.enabled {
            stages.push(slot(Box::new(c.similar_line_pass()), w.similar_lines, true));
        }
        stages
    }

    pub fn run(
        &self,
        store: &mut dyn FeatureStore,
        progress: &mut dyn ProgressSink,
        token: &CancelToken,
        gauge: &dyn HeapGauge,
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        let schedule = self.schedule();
        progress.begin_task("Cleansing line network", self.config.total_weight());

        for (position, mut scheduled) in schedule.into_iter().enumerate() {
            if token.checkpoint() {
                info!("Canceled before stage {}", position + 1);
                report.canceled = true;
                break;
            }
            let name = scheduled.stage.name();
            if !scheduled.enabled {
                info!("Skipping disabled stage {}", name);
                progress.worked(scheduled.weight);
                continue;
            }

            info!("Stage {}: {}", position + 1, name);
            let stage_report = {
                let mut scaled = ScaledProgress::new(&mut *progress, scheduled.weight);
                let mut ctx = StageContext {
                    store: &mut *store,
                    progress: &mut scaled,
                    token,
                    gauge,
                    memory: self.config.memory,
                };
                let stage_report = scheduled.stage.run(&mut ctx)?;
                scaled.finish();
                stage_report
            };
            store.commit()?;
            info!("{}", stage_report.summary());

            let canceled = stage_report.canceled;
            report.stages.push(stage_report);
            if canceled {
                info!("Canceled during {}, skipping remaining stages", name);
                report.canceled = true;
                break;
            }
        }

        progress.done();
        info!(
            "Cleansing finished: {} deleted, {} modified, {} added, {} flagged{}",
            report.deleted(),
            report.modified(),
            report.added(),
            report.flagged(),
            if report.canceled { " (canceled)" } else { "" }
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::memory_iter::FixedHeapGauge;
    use crate::progress::NullProgress;
    use crate::store::InMemoryStore;
    use geo::line_string;

    /// Records every call and cancels the token when a given label shows up.
    #[derive(Default)]
    struct Recorder {
        total: u64,
        worked: u64,
        labels: Vec<String>,
        cancel_on: Option<(String, CancelToken)>,
    }

    impl ProgressSink for Recorder {
        fn begin_task(&mut self, _label: &str, total: u64) {
            self.total = total;
        }

        fn worked(&mut self, units: u64) {
            self.worked += units;
        }

        fn sub_task(&mut self, label: &str) {
            self.labels.push(label.to_string());
            if let Some((trigger, token)) = &self.cancel_on {
                if label == trigger {
                    token.cancel();
                }
            }
        }

        fn done(&mut self) {}
    }

    fn network() -> InMemoryStore {
        InMemoryStore::from_features(vec![
            Feature::new("a", line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 0.0)]),
            Feature::new("b", line_string![(x: 50.0, y: 0.0), (x: 100.0, y: 0.0)]),
            Feature::new("stub", line_string![(x: 200.0, y: 0.0), (x: 203.0, y: 0.0)]),
        ])
        .unwrap()
    }

    fn names(pipeline: &Pipeline) -> Vec<&'static str> {
        pipeline.schedule().iter().map(|s| s.stage.name()).collect()
    }

    #[test]
    fn schedule_follows_the_fixed_order() {
        let pipeline = Pipeline::new(CleanseConfig::default()).unwrap();
        assert_eq!(
            names(&pipeline),
            vec![
                "minimum-length",
                "pseudo-node-merge",
                "curve-simplification",
                "cycles",
                "node-insertion",
                "end-node-clustering",
                "pseudo-node-merge",
                "cycles",
            ]
        );
    }

    #[test]
    fn similar_lines_is_appended_when_enabled() {
        let mut config = CleanseConfig::default();
        config.similar_lines.enabled = true;
        let pipeline = Pipeline::new(config).unwrap();
        assert_eq!(names(&pipeline).last(), Some(&"similar-lines"));
        assert_eq!(pipeline.schedule().len(), 9);
    }

    #[test]
    fn full_run_reports_every_stage_and_fills_the_progress_bar() {
        let pipeline = Pipeline::new(CleanseConfig::default()).unwrap();
        let mut store = network();
        let mut progress = Recorder::default();
        let report = pipeline
            .run(&mut store, &mut progress, &CancelToken::new(), &FixedHeapGauge(u64::MAX))
            .unwrap();

        assert!(!report.canceled);
        assert_eq!(report.stages.len(), 8);
        assert_eq!(progress.total, 201);
        assert_eq!(progress.worked, 201);
        assert_eq!(store.len(), 1);
        assert_eq!(store.commit_count(), 8);
    }

    #[test]
    fn disabled_stage_is_skipped_but_keeps_its_weight() {
        let mut config = CleanseConfig::default();
        config.min_length.enabled = false;
        let pipeline = Pipeline::new(config).unwrap();
        let mut store = network();
        let mut progress = Recorder::default();
        let report = pipeline
            .run(&mut store, &mut progress, &CancelToken::new(), &FixedHeapGauge(u64::MAX))
            .unwrap();

        assert_eq!(report.stages.len(), 7);
        assert_eq!(report.stages[0].stage, "pseudo-node-merge");
        assert_eq!(progress.worked, 201);
        assert!(store.feature("stub").is_some());
    }

    #[test]
    fn canceled_token_runs_nothing() {
        let pipeline = Pipeline::new(CleanseConfig::default()).unwrap();
        let mut store = network();
        let token = CancelToken::new();
        token.cancel();
        let report = pipeline
            .run(&mut store, &mut NullProgress, &token, &FixedHeapGauge(u64::MAX))
            .unwrap();
        assert!(report.canceled);
        assert!(report.stages.is_empty());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn cancel_mid_run_keeps_committed_stages() {
        let pipeline = Pipeline::new(CleanseConfig::default()).unwrap();
        let mut store = network();
        let token = CancelToken::new();
        let mut progress = Recorder {
            cancel_on: Some(("Simplifying curves".to_string(), token.clone())),
            ..Default::default()
        };
        let report = pipeline
            .run(&mut store, &mut progress, &token, &FixedHeapGauge(u64::MAX))
            .unwrap();

        assert!(report.canceled);
        assert_eq!(report.stages.len(), 3);
        assert!(report.stages[2].canceled);
        // min length and pseudo-node merge already happened
        assert_eq!(store.len(), 1);
        assert_eq!(store.commit_count(), 3);
    }

    #[test]
    fn cancel_during_clustering_stops_before_the_second_sweep() {
        let pipeline = Pipeline::new(CleanseConfig::default()).unwrap();
        let mut store = network();
        let token = CancelToken::new();
        let mut progress = Recorder {
            cancel_on: Some(("Clustering end nodes".to_string(), token.clone())),
            ..Default::default()
        };
        let report = pipeline
            .run(&mut store, &mut progress, &token, &FixedHeapGauge(u64::MAX))
            .unwrap();

        assert!(report.canceled);
        assert_eq!(report.stages.len(), 6);
        assert_eq!(report.stages[5].stage, "end-node-clustering");
        assert!(report.stages[5].canceled);
        assert_eq!(report.stages[5].processed, 0);
        assert_eq!(store.commit_count(), 6);
    }
}
