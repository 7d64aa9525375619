use super::FeatureStore;
use crate::error::{CleanseError, Result};
use crate::feature::{Feature, FeatureDraft, FeatureId, Filter, Projection};
use crate::geometry;
use ahash::AHashMap;
use geo::LineString;
use log::debug;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use std::collections::BTreeMap;

type EnvelopeEntry = GeomWithData<Rectangle<[f64; 2]>, FeatureId>;

/// Feature store held entirely in memory, with an R-tree over feature
/// envelopes for spatial filters.
#[derive(Debug)]
pub struct InMemoryStore {
    features: BTreeMap<FeatureId, Feature>,
    rtree: RTree<EnvelopeEntry>,
    envelopes: AHashMap<FeatureId, Rectangle<[f64; 2]>>,
    id_prefix: String,
    next_generated: u64,
    pending: usize,
    commits: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            features: BTreeMap::new(),
            rtree: RTree::new(),
            envelopes: AHashMap::new(),
            id_prefix: "new-".to_string(),
            next_generated: 1,
            pending: 0,
            commits: 0,
        }
    }

    /// Bulk-load a store. Later features replace earlier ones with the same id.
    pub fn from_features(features: impl IntoIterator<Item = Feature>) -> Result<Self> {
        let mut store = Self::new();
        for feature in features {
            let rect = Self::envelope_of(&feature)?;
            store.envelopes.insert(feature.id.clone(), rect);
            store.features.insert(feature.id.clone(), feature);
        }
        let entries: Vec<EnvelopeEntry> = store
            .envelopes
            .iter()
            .map(|(id, rect)| GeomWithData::new(*rect, id.clone()))
            .collect();
        store.rtree = RTree::bulk_load(entries);
        Ok(store)
    }

    /// Prefix used for ids the store assigns to new features.
    pub fn with_id_prefix(mut self, prefix: &str) -> Self {
        self.id_prefix = prefix.to_string();
        self
    }

    /// Insert or replace a feature under its own id.
    pub fn insert(&mut self, feature: Feature) -> Result<()> {
        let rect = Self::envelope_of(&feature)?;
        self.unindex(&feature.id);
        self.rtree.insert(GeomWithData::new(rect, feature.id.clone()));
        self.envelopes.insert(feature.id.clone(), rect);
        self.features.insert(feature.id.clone(), feature);
        self.pending += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.get(&FeatureId::from(id))
    }

    /// Mutations not yet committed.
    pub fn pending_changes(&self) -> usize {
        self.pending
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    fn envelope_of(feature: &Feature) -> Result<Rectangle<[f64; 2]>> {
        geometry::envelope(&feature.geometry)
            .map(|env| Rectangle::from_corners([env.min().x, env.min().y], [env.max().x, env.max().y]))
            .ok_or_else(|| {
                CleanseError::Store(format!("feature '{}' has an empty geometry", feature.id))
            })
    }

    fn index(&mut self, id: &FeatureId, geometry: &LineString<f64>) {
        if let Some(env) = geometry::envelope(geometry) {
            let rect = Rectangle::from_corners([env.min().x, env.min().y], [env.max().x, env.max().y]);
            self.rtree.insert(GeomWithData::new(rect, id.clone()));
            self.envelopes.insert(id.clone(), rect);
        }
    }

    fn unindex(&mut self, id: &FeatureId) {
        if let Some(rect) = self.envelopes.remove(id) {
            self.rtree.remove(&GeomWithData::new(rect, id.clone()));
        }
    }

    fn generate_id(&mut self) -> FeatureId {
        loop {
            let candidate = FeatureId(format!("{}{}", self.id_prefix, self.next_generated));
            self.next_generated += 1;
            if !self.features.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

impl FeatureStore for InMemoryStore {
    fn select_ids(&self, filter: &Filter) -> Result<Vec<FeatureId>> {
        let mut ids: Vec<FeatureId> = match filter.search_window() {
            Some(window) => {
                let aabb = AABB::from_corners(
                    [window.min().x, window.min().y],
                    [window.max().x, window.max().y],
                );
                self.rtree
                    .locate_in_envelope_intersecting(&aabb)
                    .filter_map(|entry| self.features.get(&entry.data))
                    .filter(|f| filter.matches(f))
                    .map(|f| f.id.clone())
                    .collect()
            }
            None => self
                .features
                .values()
                .filter(|f| filter.matches(f))
                .map(|f| f.id.clone())
                .collect(),
        };
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn get(&self, id: &FeatureId, projection: Projection) -> Result<Option<Feature>> {
        Ok(self.features.get(id).map(|f| match projection {
            Projection::Full => f.clone(),
            Projection::GeometryOnly => Feature {
                id: f.id.clone(),
                geometry: f.geometry.clone(),
                attributes: Default::default(),
            },
        }))
    }

    fn add_features(&mut self, drafts: Vec<FeatureDraft>) -> Result<Vec<FeatureId>> {
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = self.generate_id();
            self.insert(Feature {
                id: id.clone(),
                geometry: draft.geometry,
                attributes: draft.attributes,
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn remove_features(&mut self, filter: &Filter) -> Result<usize> {
        let ids = self.select_ids(filter)?;
        for id in &ids {
            self.unindex(id);
            self.features.remove(id);
        }
        self.pending += ids.len();
        Ok(ids.len())
    }

    fn modify_geometry(&mut self, id: &FeatureId, geometry: LineString<f64>) -> Result<()> {
        if geometry.0.is_empty() {
            return Err(CleanseError::Store(format!(
                "refusing to give feature '{id}' an empty geometry"
            )));
        }
        if !self.features.contains_key(id) {
            return Err(CleanseError::MissingFeature(id.clone()));
        }
        self.unindex(id);
        self.index(id, &geometry);
        if let Some(feature) = self.features.get_mut(id) {
            feature.geometry = geometry;
        }
        self.pending += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending > 0 {
            debug!("Committing {} pending changes", self.pending);
        }
        self.pending = 0;
        self.commits += 1;
        Ok(())
    }

    fn release_memory(&mut self) -> Result<()> {
        self.envelopes.shrink_to_fit();
        Ok(())
    }
}
