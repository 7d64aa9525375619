//! Run configuration. Every field has a default, so an empty JSON object is a
//! valid config file.

use crate::error::{CleanseError, Result};
use crate::memory_iter::MemorySettings;
use crate::passes::{
    CurveSimplificationPass, CyclePass, EndNodeClusteringPass, MinimumLengthPass, NodeInsertionPass,
    PseudoNodeMergePass, SimilarLinePass,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinLengthConfig {
    pub enabled: bool,
    pub min_length: f64,
}

impl Default for MinLengthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudoNodeConfig {
    pub enabled: bool,
    pub intersection_tolerance: f64,
}

impl Default for PseudoNodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            intersection_tolerance: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimplifyConfig {
    pub enabled: bool,
    pub distance_tolerance: f64,
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_tolerance: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub enabled: bool,
    /// -1 removes every cycle
    pub length_tolerance: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            length_tolerance: -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInsertionConfig {
    pub enabled: bool,
    pub distance_tolerance: f64,
}

impl Default for NodeInsertionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_tolerance: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndNodeConfig {
    pub enabled: bool,
    pub distance_tolerance: f64,
    pub area_tolerance: f64,
}

impl Default for EndNodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_tolerance: 5.0,
            area_tolerance: 25.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarLineConfig {
    /// Off unless asked for: runs after the standard stages.
    pub enabled: bool,
    pub search_distance: f64,
    pub sampling_distance: f64,
    pub very_similar_tolerance: f64,
    pub similar_tolerance: f64,
    pub endpoint_tolerance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_attribute: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_priority: Vec<String>,
}

impl Default for SimilarLineConfig {
    fn default() -> Self {
        let pass = SimilarLinePass::default();
        Self {
            enabled: false,
            search_distance: pass.search_distance,
            sampling_distance: pass.sampling_distance,
            very_similar_tolerance: pass.very_similar_tolerance,
            similar_tolerance: pass.similar_tolerance,
            endpoint_tolerance: pass.endpoint_tolerance,
            source_attribute: None,
            source_priority: Vec::new(),
        }
    }
}

/// Share of the overall progress bar each stage gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageWeights {
    pub min_length: u64,
    pub pseudo_nodes: u64,
    pub simplify: u64,
    pub cycles: u64,
    pub node_insertion: u64,
    pub end_nodes: u64,
    pub pseudo_nodes_again: u64,
    pub cycles_again: u64,
    pub similar_lines: u64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            min_length: 1,
            pseudo_nodes: 38,
            simplify: 10,
            cycles: 2,
            node_insertion: 54,
            end_nodes: 64,
            pseudo_nodes_again: 30,
            cycles_again: 2,
            similar_lines: 40,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanseConfig {
    pub min_length: MinLengthConfig,
    pub pseudo_nodes: PseudoNodeConfig,
    pub simplify: SimplifyConfig,
    pub cycles: CycleConfig,
    pub node_insertion: NodeInsertionConfig,
    pub end_nodes: EndNodeConfig,
    pub similar_lines: SimilarLineConfig,
    pub memory: MemorySettings,
    pub weights: StageWeights,
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CleanseError::Config(format!("{name} must be a non-negative number, got {value}")))
    }
}

impl CleanseConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: CleanseConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CleanseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        non_negative("min_length.min_length", self.min_length.min_length)?;
        non_negative("pseudo_nodes.intersection_tolerance", self.pseudo_nodes.intersection_tolerance)?;
        non_negative("simplify.distance_tolerance", self.simplify.distance_tolerance)?;
        if self.cycles.length_tolerance.is_nan() {
            return Err(CleanseError::Config("cycles.length_tolerance is not a number".into()));
        }
        non_negative("node_insertion.distance_tolerance", self.node_insertion.distance_tolerance)?;
        non_negative("end_nodes.distance_tolerance", self.end_nodes.distance_tolerance)?;
        if self.end_nodes.area_tolerance.is_nan() {
            return Err(CleanseError::Config("end_nodes.area_tolerance is not a number".into()));
        }

        let similar = &self.similar_lines;
        non_negative("similar_lines.search_distance", similar.search_distance)?;
        non_negative("similar_lines.very_similar_tolerance", similar.very_similar_tolerance)?;
        non_negative("similar_lines.similar_tolerance", similar.similar_tolerance)?;
        non_negative("similar_lines.endpoint_tolerance", similar.endpoint_tolerance)?;
        if !(similar.sampling_distance.is_finite() && similar.sampling_distance > 0.0) {
            return Err(CleanseError::Config(format!(
                "similar_lines.sampling_distance must be positive, got {}",
                similar.sampling_distance
            )));
        }
        if !similar.source_priority.is_empty() && similar.source_attribute.is_none() {
            return Err(CleanseError::Config(
                "similar_lines.source_priority needs similar_lines.source_attribute".into(),
            ));
        }

        if self.total_weight() == 0 {
            return Err(CleanseError::Config("stage weights add up to zero".into()));
        }
        Ok(())
    }

    /// Sum of the weights of every stage in the schedule, disabled ones included.
    pub fn total_weight(&self) -> u64 {
        let w = &self.weights;
        let standard = w.min_length
            + w.pseudo_nodes
            + w.simplify
            + w.cycles
            + w.node_insertion
            + w.end_nodes
            + w.pseudo_nodes_again
            + w.cycles_again;
        if self.similar_lines.enabled {
            standard + w.similar_lines
        } else {
            standard
        }
    }

    pub fn min_length_pass(&self) -> MinimumLengthPass {
        MinimumLengthPass {
            min_length: self.min_length.min_length,
        }
    }

    pub fn pseudo_node_pass(&self) -> PseudoNodeMergePass {
        PseudoNodeMergePass {
            intersection_tolerance: self.pseudo_nodes.intersection_tolerance,
        }
    }

    pub fn simplify_pass(&self) -> CurveSimplificationPass {
        CurveSimplificationPass {
            distance_tolerance: self.simplify.distance_tolerance,
        }
    }

    pub fn cycle_pass(&self) -> CyclePass {
        CyclePass {
            length_tolerance: self.cycles.length_tolerance,
        }
    }

    pub fn node_insertion_pass(&self) -> NodeInsertionPass {
        NodeInsertionPass {
            distance_tolerance: self.node_insertion.distance_tolerance,
        }
    }

    pub fn end_node_pass(&self) -> EndNodeClusteringPass {
        EndNodeClusteringPass {
            distance_tolerance: self.end_nodes.distance_tolerance,
            area_tolerance: self.end_nodes.area_tolerance,
        }
    }

    pub fn similar_line_pass(&self) -> SimilarLinePass {
        let s = &self.similar_lines;
        SimilarLinePass {
            search_distance: s.search_distance,
            sampling_distance: s.sampling_distance,
            very_similar_tolerance: s.very_similar_tolerance,
            similar_tolerance: s.similar_tolerance,
            endpoint_tolerance: s.endpoint_tolerance,
            source_attribute: s.source_attribute.clone(),
            source_priority: s.source_priority.clone(),
        }
    }
}
