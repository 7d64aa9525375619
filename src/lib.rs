#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::suspicious_map,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::cmp_owned,
    clippy::op_ref
)]

//! Topology cleansing for line networks.
//!
//! A [`pipeline::Pipeline`] runs a fixed sequence of tolerance-driven passes
//! over a [`store::FeatureStore`]: short-line pruning, pseudo-node merging,
//! curve simplification, cycle removal, node insertion, end-node snapping and
//! optionally similar-line deduplication. Every pass walks the store through a
//! [`memory_iter::MemoryAdaptiveIter`] so datasets larger than memory can be
//! processed.

pub mod config;
pub mod error;
pub mod feature;
pub mod geometry;
pub mod memory_iter;
pub mod passes;
pub mod pipeline;
pub mod progress;
pub mod store;

pub use config::CleanseConfig;
pub use error::{CleanseError, Result};
pub use feature::{Feature, FeatureDraft, FeatureId, Filter, Projection};
pub use pipeline::{Pipeline, PipelineReport};
pub use progress::{CancelToken, LogProgress, NullProgress, ProgressSink};
pub use store::{FeatureStore, InMemoryStore};
