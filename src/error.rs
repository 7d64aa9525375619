use crate::feature::FeatureId;
use thiserror::Error;

/// Errors that abort a cleansing run.
///
/// Per-feature geometric anomalies are never reported through this type; passes
/// log and flag those and carry on.
#[derive(Error, Debug)]
pub enum CleanseError {
    #[error("feature store failure: {0}")]
    Store(String),
    #[error("feature '{0}' vanished from the store mid-pass")]
    MissingFeature(FeatureId),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error accessing '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),
}

pub type Result<T> = std::result::Result<T, CleanseError>;
