pub mod geojson_io;
pub mod memory;

use crate::error::Result;
use crate::feature::{Feature, FeatureDraft, FeatureId, Filter, Projection};
use geo::LineString;
use std::collections::VecDeque;

pub use memory::InMemoryStore;

/// Mutable, queryable collection of line features.
///
/// Stores are single-writer for the duration of a cleansing run. Reads observe
/// uncommitted writes; `commit` makes pending mutations durable.
pub trait FeatureStore {
    /// Ids matching `filter`, in ascending id order.
    fn select_ids(&self, filter: &Filter) -> Result<Vec<FeatureId>>;

    fn get(&self, id: &FeatureId, projection: Projection) -> Result<Option<Feature>>;

    fn count(&self, filter: &Filter) -> Result<usize> {
        Ok(self.select_ids(filter)?.len())
    }

    fn query(&self, filter: &Filter, projection: Projection) -> Result<Cursor> {
        Ok(Cursor::new(self.select_ids(filter)?, projection))
    }

    fn add_features(&mut self, drafts: Vec<FeatureDraft>) -> Result<Vec<FeatureId>>;

    /// Delete every feature matching `filter`, returning how many went.
    fn remove_features(&mut self, filter: &Filter) -> Result<usize>;

    fn modify_geometry(&mut self, id: &FeatureId, geometry: LineString<f64>) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    /// Drop caches and buffers ahead of a cursor restart.
    fn release_memory(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forward-only result set of a query.
///
/// The cursor owns the ids matched when it was opened and loads each feature
/// on demand, so the store may be mutated between calls to [`Cursor::next`].
/// Ids deleted in the meantime are skipped.
#[derive(Debug)]
pub struct Cursor {
    ids: VecDeque<FeatureId>,
    projection: Projection,
}

impl Cursor {
    pub fn new(ids: Vec<FeatureId>, projection: Projection) -> Self {
        Self {
            ids: ids.into(),
            projection,
        }
    }

    pub fn remaining(&self) -> usize {
        self.ids.len()
    }

    pub fn next(&mut self, store: &dyn FeatureStore) -> Result<Option<Feature>> {
        while let Some(id) = self.ids.pop_front() {
            if let Some(feature) = store.get(&id, self.projection)? {
                return Ok(Some(feature));
            }
        }
        Ok(None)
    }
}

/// Load every feature matching `filter`. Only for small result sets such as
/// the candidates of a spatial query.
pub fn fetch_all(
    store: &dyn FeatureStore,
    filter: &Filter,
    projection: Projection,
) -> Result<Vec<Feature>> {
    let mut cursor = store.query(filter, projection)?;
    let mut out = Vec::with_capacity(cursor.remaining());
    while let Some(feature) = cursor.next(store)? {
        out.push(feature);
    }
    Ok(out)
}
