//! The cleansing passes. Each pass is a [`Stage`] that reads features through
//! the memory-adaptive iterator, decides locally, and mutates the store.

pub mod cycles;
pub mod end_nodes;
pub mod min_length;
pub mod node_insertion;
pub mod pseudo_nodes;
pub mod similar_lines;
pub mod simplify;

use crate::error::Result;
use crate::feature::{FeatureId, Filter, Projection};
use crate::memory_iter::{HeapGauge, MemoryAdaptiveIter, MemorySettings};
use crate::progress::{CancelToken, ProgressSink};
use crate::store::FeatureStore;
use serde::Serialize;

pub use cycles::CyclePass;
pub use end_nodes::EndNodeClusteringPass;
pub use min_length::MinimumLengthPass;
pub use node_insertion::NodeInsertionPass;
pub use pseudo_nodes::PseudoNodeMergePass;
pub use similar_lines::SimilarLinePass;
pub use simplify::CurveSimplificationPass;

/// Everything a stage needs from the outside world for one run.
pub struct StageContext<'a> {
    pub store: &'a mut dyn FeatureStore,
    pub progress: &'a mut dyn ProgressSink,
    pub token: &'a CancelToken,
    pub gauge: &'a dyn HeapGauge,
    pub memory: MemorySettings,
}

impl<'a> StageContext<'a> {
    /// A memory-adaptive walk over `filter`, bound to this context's gauge.
    pub fn iterate(&self, filter: Filter, projection: Projection) -> MemoryAdaptiveIter<'a> {
        MemoryAdaptiveIter::new(filter, projection, self.memory, self.gauge)
    }
}

/// One unit of cleansing work over the store.
pub trait Stage {
    fn name(&self) -> &'static str;

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport>;
}

/// Something left for manual review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flag {
    pub features: Vec<FeatureId>,
    pub location: [f64; 2],
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimilarityCategory {
    Identical,
    VerySimilar,
    Similar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimilarityAction {
    Deleted,
    Flagged,
}

/// Outcome of the similar-line pass for one feature. Report-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityRecord {
    pub fid: FeatureId,
    pub category: SimilarityCategory,
    /// Larger of the two directed mean deviations
    pub metric: f64,
    pub action: SimilarityAction,
    /// The feature(s) it was found to duplicate
    pub matched: Vec<FeatureId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub processed: usize,
    pub deleted: usize,
    pub modified: usize,
    pub added: usize,
    pub flagged: Vec<Flag>,
    pub similarity: Vec<SimilarityRecord>,
    pub canceled: bool,
}

impl StageReport {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    pub fn flag(&mut self, features: Vec<FeatureId>, location: geo::Coord, reason: impl Into<String>) {
        self.flagged.push(Flag {
            features,
            location: [location.x, location.y],
            reason: reason.into(),
        });
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: processed {}, deleted {}, modified {}, added {}, flagged {}{}",
            self.stage,
            self.processed,
            self.deleted,
            self.modified,
            self.added,
            self.flagged.len(),
            if self.canceled { " (canceled)" } else { "" }
        )
    }
}
