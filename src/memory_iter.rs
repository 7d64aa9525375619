// ===========================================================================
// Memory-adaptive feature iteration
// ===========================================================================
//
// Wraps a store query so that a pass can walk a dataset larger than the heap.
// Whenever headroom drops below the configured floor, the open cursor is
// dropped, pending mutations are committed, the store is asked to release
// memory, and the query is reissued excluding everything already yielded.
// ===========================================================================

use crate::error::Result;
use crate::feature::{Feature, FeatureId, Filter, Projection};
use crate::store::{Cursor, FeatureStore};
use ahash::AHashSet;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::System;

/// Reports how much heap the process can still use.
pub trait HeapGauge: Send + Sync {
    fn available_bytes(&self) -> u64;

    /// Give memory back to the system before a restart.
    fn reclaim(&self) {}
}

/// Gauge backed by the operating system's view of available memory.
pub struct SystemHeapGauge {
    system: Mutex<System>,
}

impl Default for SystemHeapGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHeapGauge {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl HeapGauge for SystemHeapGauge {
    fn available_bytes(&self) -> u64 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            // a poisoned gauge must not stall the pipeline
            Err(_) => u64::MAX,
        }
    }
}

/// Always reports the same headroom.
#[derive(Debug, Clone, Copy)]
pub struct FixedHeapGauge(pub u64);

impl HeapGauge for FixedHeapGauge {
    fn available_bytes(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Restart the cursor when available memory drops below this many bytes.
    pub floor_bytes: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            floor_bytes: 150 * 1024 * 1024,
        }
    }
}

/// Lazy, restartable, forward-only walk over the features matching a filter.
///
/// Every id is yielded at most once, however many restarts happen. The store
/// is handed in on each step so the caller can mutate it between steps.
pub struct MemoryAdaptiveIter<'p> {
    filter: Filter,
    projection: Projection,
    settings: MemorySettings,
    gauge: &'p dyn HeapGauge,
    cursor: Option<Cursor>,
    visited: AHashSet<FeatureId>,
    yielded_since_restart: usize,
    restarts: usize,
}

impl<'p> MemoryAdaptiveIter<'p> {
    pub fn new(
        filter: Filter,
        projection: Projection,
        settings: MemorySettings,
        gauge: &'p dyn HeapGauge,
    ) -> Self {
        Self {
            filter,
            projection,
            settings,
            gauge,
            cursor: None,
            visited: AHashSet::new(),
            yielded_since_restart: 0,
            restarts: 0,
        }
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn visited(&self) -> usize {
        self.visited.len()
    }

    fn low_on_memory(&self) -> bool {
        self.gauge.available_bytes() < self.settings.floor_bytes
    }

    fn open(&mut self, store: &dyn FeatureStore) -> Result<()> {
        let filter = self.filter.clone().excluding(&self.visited);
        self.cursor = Some(store.query(&filter, self.projection)?);
        Ok(())
    }

    fn restart(&mut self, store: &mut dyn FeatureStore) -> Result<()> {
        self.cursor = None;
        store.commit()?;
        store.release_memory()?;
        self.gauge.reclaim();
        self.restarts += 1;
        self.yielded_since_restart = 0;
        info!(
            "Low memory: restarted feature cursor ({} restarts, {} features already visited)",
            self.restarts,
            self.visited.len()
        );
        self.open(store)
    }

    pub fn next(&mut self, store: &mut dyn FeatureStore) -> Result<Option<Feature>> {
        if self.cursor.is_none() {
            self.open(store)?;
        } else if self.yielded_since_restart > 0 && self.low_on_memory() {
            self.restart(store)?;
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        loop {
            match cursor.next(store)? {
                Some(feature) => {
                    // ids created after the cursor opened are never in its snapshot,
                    // but a restart could surface one we already handed out
                    if !self.visited.insert(feature.id.clone()) {
                        debug!("Skipping already visited feature {}", feature.id);
                        continue;
                    }
                    self.yielded_since_restart += 1;
                    return Ok(Some(feature));
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use geo::line_string;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports low memory on every `period`-th call.
    struct PeriodicGauge {
        calls: AtomicUsize,
        period: usize,
    }

    impl HeapGauge for PeriodicGauge {
        fn available_bytes(&self) -> u64 {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n % self.period == 0 { 0 } else { u64::MAX }
        }
    }

    fn store_of(n: usize) -> InMemoryStore {
        InMemoryStore::from_features((0..n).map(|i| {
            let x = i as f64;
            Feature::new(format!("f{i:04}"), line_string![(x: x, y: 0.0), (x: x, y: 1.0)])
        }))
        .unwrap()
    }

    fn drain(iter: &mut MemoryAdaptiveIter<'_>, store: &mut InMemoryStore) -> Vec<FeatureId> {
        let mut ids = Vec::new();
        while let Some(f) = iter.next(store).unwrap() {
            ids.push(f.id);
        }
        ids
    }

    #[test]
    fn yields_each_id_once_across_restarts() {
        for period in [1, 2, 3, 7] {
            let mut store = store_of(25);
            let gauge = PeriodicGauge { calls: AtomicUsize::new(0), period };
            let settings = MemorySettings { floor_bytes: 1 };
            let mut iter = MemoryAdaptiveIter::new(Filter::All, Projection::Full, settings, &gauge);
            let ids = drain(&mut iter, &mut store);

            let unique: AHashSet<_> = ids.iter().cloned().collect();
            assert_eq!(ids.len(), 25, "period {period}");
            assert_eq!(unique.len(), 25, "period {period}");
            assert!(iter.restarts() > 0, "period {period}");
        }
    }

    #[test]
    fn restart_commits_pending_mutations() {
        let mut store = store_of(3);
        let gauge = FixedHeapGauge(0);
        let settings = MemorySettings { floor_bytes: 10 };
        let mut iter = MemoryAdaptiveIter::new(Filter::All, Projection::GeometryOnly, settings, &gauge);

        let first = iter.next(&mut store).unwrap().unwrap();
        store
            .remove_features(&Filter::Ids([first.id].into_iter().collect()))
            .unwrap();
        assert_eq!(store.pending_changes(), 1);
        iter.next(&mut store).unwrap().unwrap();
        assert_eq!(store.pending_changes(), 0);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn features_deleted_mid_walk_are_not_yielded() {
        let mut store = store_of(4);
        let gauge = FixedHeapGauge(u64::MAX);
        let mut iter = MemoryAdaptiveIter::new(Filter::All, Projection::Full, MemorySettings::default(), &gauge);
        let first = iter.next(&mut store).unwrap().unwrap();
        assert_eq!(first.id.as_str(), "f0000");
        store
            .remove_features(&Filter::Ids([FeatureId::from("f0002")].into_iter().collect()))
            .unwrap();
        let rest = drain(&mut iter, &mut store);
        assert_eq!(rest, vec![FeatureId::from("f0001"), FeatureId::from("f0003")]);
        assert_eq!(iter.restarts(), 0);
    }
}
