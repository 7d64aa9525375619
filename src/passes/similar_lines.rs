// ===========================================================================
// Similar-line deduplication
// ===========================================================================
//
// Two sieves over the network:
//
//   1. Pairwise: every feature is compared with its spatial neighbours using
//      the sampled mean deviation in both directions. Exact copies go, near
//      copies with the same endpoints lose the weaker of the two, near copies
//      with different endpoints are flagged.
//
//   2. Aggregation: a feature that was never a near copy of any single line
//      may still duplicate a sequence of shorter ones. The pairwise scores say
//      which lines lie along it; those are chained together and the feature
//      is tested against each chain with the same thresholds.
//
// Geometry is never edited here. Features are deleted or left alone.
// ===========================================================================

use super::{SimilarityAction, SimilarityCategory, SimilarityRecord, Stage, StageContext, StageReport};
use crate::error::Result;
use crate::feature::{Feature, FeatureId, Filter, Projection};
use crate::geometry;
use crate::store::{FeatureStore, fetch_all};
use ahash::{AHashMap, AHashSet};
use geo::LineString;
use log::{debug, info};
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct SimilarLinePass {
    /// How far around a feature's envelope to look for candidates
    pub search_distance: f64,
    pub sampling_distance: f64,
    pub very_similar_tolerance: f64,
    pub similar_tolerance: f64,
    /// 0 means endpoints have to match exactly
    pub endpoint_tolerance: f64,
    /// Attribute naming where a feature came from
    pub source_attribute: Option<String>,
    /// Highest priority first. Sources not listed rank below all listed ones.
    pub source_priority: Vec<String>,
}

impl Default for SimilarLinePass {
    fn default() -> Self {
        Self {
            search_distance: 10.0,
            sampling_distance: 5.0,
            very_similar_tolerance: 1.0,
            similar_tolerance: 5.0,
            endpoint_tolerance: 0.0,
            source_attribute: None,
            source_priority: Vec::new(),
        }
    }
}

/// Memoized directed scores plus who-is-similar-to-whom in both directions.
#[derive(Debug, Default)]
struct SimilarityIndex {
    scores: AHashMap<(FeatureId, FeatureId), f64>,
    similar_to: AHashMap<FeatureId, BTreeSet<FeatureId>>,
    similar_from: AHashMap<FeatureId, BTreeSet<FeatureId>>,
}

impl SimilarityIndex {
    fn score(&mut self, from: &Feature, to: &Feature, spacing: f64) -> f64 {
        *self
            .scores
            .entry((from.id.clone(), to.id.clone()))
            .or_insert_with(|| geometry::mean_deviation(&from.geometry, &to.geometry, spacing))
    }

    fn link(&mut self, from: &FeatureId, to: &FeatureId) {
        self.similar_to.entry(from.clone()).or_default().insert(to.clone());
        self.similar_from.entry(to.clone()).or_default().insert(from.clone());
    }

    /// Every feature that lies along `target`, directly or through another
    /// such feature.
    fn lying_along(&self, target: &FeatureId) -> BTreeSet<FeatureId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&FeatureId> = VecDeque::from([target]);
        while let Some(current) = queue.pop_front() {
            let Some(sources) = self.similar_from.get(current) else {
                continue;
            };
            for source in sources {
                if source != target && seen.insert(source.clone()) {
                    queue.push_back(source);
                }
            }
        }
        seen
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Verdict {
    category: SimilarityCategory,
    metric: f64,
}

/// A chain that `feature` resembles, with the ids it was built from.
#[derive(Debug)]
struct ChainMatch {
    verdict: Verdict,
    members: Vec<FeatureId>,
}

impl SimilarLinePass {
    fn classify(&self, a: &LineString<f64>, b: &LineString<f64>, forward: f64, backward: f64) -> Option<Verdict> {
        if geometry::equal_exact(a, b) {
            return Some(Verdict {
                category: SimilarityCategory::Identical,
                metric: 0.0,
            });
        }
        let metric = forward.max(backward);
        let category = if metric < self.very_similar_tolerance {
            SimilarityCategory::VerySimilar
        } else if metric < self.similar_tolerance {
            SimilarityCategory::Similar
        } else {
            return None;
        };
        Some(Verdict { category, metric })
    }

    fn source_rank(&self, feature: &Feature) -> usize {
        let Some(attribute) = &self.source_attribute else {
            return 0;
        };
        feature
            .attributes
            .get(attribute)
            .and_then(|v| v.as_str())
            .and_then(|source| self.source_priority.iter().position(|p| p == source))
            .unwrap_or(self.source_priority.len())
    }

    /// The feature to delete out of a near-duplicate pair.
    fn loser<'f>(&self, a: &'f Feature, b: &'f Feature) -> &'f Feature {
        let by_source = self.source_rank(a).cmp(&self.source_rank(b));
        let by_length = OrderedFloat(b.length()).cmp(&OrderedFloat(a.length()));
        match by_source.then(by_length).then_with(|| a.id.cmp(&b.id)) {
            Ordering::Greater => a,
            _ => b,
        }
    }

    fn delete(store: &mut dyn FeatureStore, id: &FeatureId) -> Result<()> {
        store.remove_features(&Filter::Ids([id.clone()].into_iter().collect()))?;
        Ok(())
    }

    /// Compare `feature` with its neighbours. Returns false once `feature`
    /// itself has been deleted.
    fn pairwise(
        &self,
        store: &mut dyn FeatureStore,
        feature: &Feature,
        index: &mut SimilarityIndex,
        compared: &mut AHashSet<(FeatureId, FeatureId)>,
        report: &mut StageReport,
    ) -> Result<bool> {
        let Some(env) = geometry::envelope(&feature.geometry) else {
            return Ok(true);
        };
        let window = Filter::Envelope(geometry::expand_rect(env, self.search_distance));
        let candidates = fetch_all(store, &window, Projection::Full)?;

        for candidate in &candidates {
            if candidate.id == feature.id {
                continue;
            }
            let pair = if feature.id < candidate.id {
                (feature.id.clone(), candidate.id.clone())
            } else {
                (candidate.id.clone(), feature.id.clone())
            };
            if !compared.insert(pair) {
                continue;
            }
            if store.get(&candidate.id, Projection::GeometryOnly)?.is_none() {
                continue;
            }

            let forward = index.score(feature, candidate, self.sampling_distance);
            let backward = index.score(candidate, feature, self.sampling_distance);
            if backward < self.similar_tolerance {
                index.link(&candidate.id, &feature.id);
            }
            if forward < self.similar_tolerance {
                index.link(&feature.id, &candidate.id);
            }

            let Some(verdict) = self.classify(&feature.geometry, &candidate.geometry, forward, backward) else {
                continue;
            };

            let doomed = match verdict.category {
                SimilarityCategory::Identical => Some(candidate),
                _ if geometry::same_endpoints(&feature.geometry, &candidate.geometry, self.endpoint_tolerance) => {
                    Some(self.loser(feature, candidate))
                }
                _ => None,
            };

            match doomed {
                Some(loser) => {
                    let keeper = if loser.id == feature.id { candidate } else { feature };
                    debug!(
                        "{} duplicates {} ({:?}, {:.3}), deleting it",
                        loser.id, keeper.id, verdict.category, verdict.metric
                    );
                    Self::delete(store, &loser.id)?;
                    report.deleted += 1;
                    report.similarity.push(SimilarityRecord {
                        fid: loser.id.clone(),
                        category: verdict.category,
                        metric: verdict.metric,
                        action: SimilarityAction::Deleted,
                        matched: vec![keeper.id.clone()],
                    });
                    if loser.id == feature.id {
                        return Ok(false);
                    }
                }
                None => {
                    report.similarity.push(SimilarityRecord {
                        fid: candidate.id.clone(),
                        category: verdict.category,
                        metric: verdict.metric,
                        action: SimilarityAction::Flagged,
                        matched: vec![feature.id.clone()],
                    });
                    if let Some(at) = candidate.start() {
                        report.flag(
                            vec![feature.id.clone(), candidate.id.clone()],
                            at,
                            format!("{:?} lines with different endpoints", verdict.category),
                        );
                    }
                }
            }
        }
        Ok(true)
    }

    /// Test `feature` against every chain built from the lines lying along it.
    /// A chain sharing its endpoints wins over one that only runs alongside.
    fn aggregate(
        &self,
        store: &mut dyn FeatureStore,
        feature: &Feature,
        index: &SimilarityIndex,
        report: &mut StageReport,
    ) -> Result<()> {
        let mut ids = Vec::new();
        let mut pieces = Vec::new();
        for id in index.lying_along(&feature.id) {
            if let Some(found) = store.get(&id, Projection::GeometryOnly)? {
                ids.push(found.id);
                pieces.push(found.geometry);
            }
        }
        if pieces.len() < 2 {
            return Ok(());
        }

        let mut deletable: Option<ChainMatch> = None;
        let mut flaggable: Option<ChainMatch> = None;
        for chain in geometry::merge_into_chains(&pieces) {
            // single lines were already judged pairwise
            if chain.members.len() < 2 {
                continue;
            }
            let forward = geometry::mean_deviation(&feature.geometry, &chain.line, self.sampling_distance);
            let backward = geometry::mean_deviation(&chain.line, &feature.geometry, self.sampling_distance);
            let Some(verdict) = self.classify(&feature.geometry, &chain.line, forward, backward) else {
                continue;
            };
            let found = ChainMatch {
                verdict,
                members: chain.members.iter().map(|&m| ids[m].clone()).collect(),
            };
            let slot = if geometry::same_endpoints(&feature.geometry, &chain.line, self.endpoint_tolerance) {
                &mut deletable
            } else {
                &mut flaggable
            };
            if slot.as_ref().is_none_or(|best| verdict.metric < best.verdict.metric) {
                *slot = Some(found);
            }
        }

        if let Some(best) = deletable {
            debug!(
                "{} duplicates a chain of {} lines ({:?}, {:.3}), deleting it",
                feature.id,
                best.members.len(),
                best.verdict.category,
                best.verdict.metric
            );
            Self::delete(store, &feature.id)?;
            report.deleted += 1;
            report.similarity.push(SimilarityRecord {
                fid: feature.id.clone(),
                category: best.verdict.category,
                metric: best.verdict.metric,
                action: SimilarityAction::Deleted,
                matched: best.members,
            });
        } else if let Some(best) = flaggable {
            if let Some(at) = feature.start() {
                let mut involved = vec![feature.id.clone()];
                involved.extend(best.members.iter().cloned());
                report.flag(
                    involved,
                    at,
                    format!("{:?} to a chain with different endpoints", best.verdict.category),
                );
            }
            report.similarity.push(SimilarityRecord {
                fid: feature.id.clone(),
                category: best.verdict.category,
                metric: best.verdict.metric,
                action: SimilarityAction::Flagged,
                matched: best.members,
            });
        }
        Ok(())
    }
}

impl Stage for SimilarLinePass {
    fn name(&self) -> &'static str {
        "similar-lines"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());
        let total = ctx.store.count(&Filter::All)?;
        ctx.progress.begin_task("Removing similar lines", 2 * total as u64);

        let mut index = SimilarityIndex::default();
        let mut compared = AHashSet::new();

        ctx.progress.sub_task("Comparing neighbouring lines");
        let mut iter = ctx.iterate(Filter::All, Projection::Full);
        while let Some(feature) = iter.next(ctx.store)? {
            if ctx.token.checkpoint() {
                report.canceled = true;
                ctx.progress.done();
                return Ok(report);
            }
            report.processed += 1;
            ctx.progress.worked(1);
            self.pairwise(ctx.store, &feature, &mut index, &mut compared, &mut report)?;
        }

        debug!(
            "{} similarity links after the pairwise sieve",
            index.similar_to.values().map(BTreeSet::len).sum::<usize>()
        );
        ctx.progress.sub_task("Comparing lines with merged chains");
        let mut iter = ctx.iterate(Filter::All, Projection::GeometryOnly);
        while let Some(feature) = iter.next(ctx.store)? {
            if ctx.token.checkpoint() {
                report.canceled = true;
                break;
            }
            ctx.progress.worked(1);
            self.aggregate(ctx.store, &feature, &index, &mut report)?;
        }

        ctx.progress.done();
        info!(
            "Deleted {} similar lines, flagged {}",
            report.deleted,
            report
                .similarity
                .iter()
                .filter(|r| r.action == SimilarityAction::Flagged)
                .count()
        );
        Ok(report)
    }
}
