use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Receiver of progress updates from the cleansing worker.
pub trait ProgressSink {
    fn begin_task(&mut self, label: &str, total: u64);
    fn worked(&mut self, units: u64);
    fn sub_task(&mut self, label: &str);
    fn done(&mut self);
}

#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin_task(&mut self, _label: &str, _total: u64) {}
    fn worked(&mut self, _units: u64) {}
    fn sub_task(&mut self, _label: &str) {}
    fn done(&mut self) {}
}

/// Logs progress through the `log` facade every 10%.
#[derive(Debug, Default)]
pub struct LogProgress {
    label: String,
    total: u64,
    current: u64,
    last_decile: u64,
}

impl ProgressSink for LogProgress {
    fn begin_task(&mut self, label: &str, total: u64) {
        self.label = label.to_string();
        self.total = total;
        self.current = 0;
        self.last_decile = 0;
        info!("{}: starting ({} units)", label, total);
    }

    fn worked(&mut self, units: u64) {
        self.current = (self.current + units).min(self.total);
        if self.total == 0 {
            return;
        }
        let decile = self.current * 10 / self.total;
        if decile > self.last_decile {
            self.last_decile = decile;
            info!("{}: {}%", self.label, decile * 10);
        }
    }

    fn sub_task(&mut self, label: &str) {
        info!("{} > {}", self.label, label);
    }

    fn done(&mut self) {
        info!("{}: done", self.label);
    }
}

/// Maps a stage's own unit count onto `weight` units of the parent sink.
///
/// The parent never receives more than `weight` units in total, whatever the
/// stage reports.
pub struct ScaledProgress<'a> {
    parent: &'a mut dyn ProgressSink,
    weight: u64,
    total: u64,
    worked: u64,
    forwarded: u64,
}

impl<'a> ScaledProgress<'a> {
    pub fn new(parent: &'a mut dyn ProgressSink, weight: u64) -> Self {
        Self {
            parent,
            weight,
            total: 0,
            worked: 0,
            forwarded: 0,
        }
    }

    fn forward_up_to(&mut self, target: u64) {
        let target = target.min(self.weight);
        if target > self.forwarded {
            self.parent.worked(target - self.forwarded);
            self.forwarded = target;
        }
    }

    /// Hand over whatever part of the weight was not reported yet.
    pub fn finish(&mut self) {
        self.forward_up_to(self.weight);
    }
}

impl ProgressSink for ScaledProgress<'_> {
    fn begin_task(&mut self, label: &str, total: u64) {
        self.total = total;
        self.worked = 0;
        self.parent.sub_task(label);
    }

    fn worked(&mut self, units: u64) {
        self.worked = self.worked.saturating_add(units);
        if self.total == 0 {
            return;
        }
        let scaled = (u128::from(self.worked.min(self.total)) * u128::from(self.weight)
            / u128::from(self.total)) as u64;
        self.forward_up_to(scaled);
    }

    fn sub_task(&mut self, label: &str) {
        self.parent.sub_task(label);
    }

    fn done(&mut self) {
        self.finish();
    }
}

#[derive(Debug, Default)]
struct TokenState {
    canceled: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
}

/// Cooperative cancellation and pause flag shared between the worker and
/// whoever controls it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also wakes a paused worker so it can observe the cancellation.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
        let _guard = self.state.paused.lock().unwrap_or_else(PoisonError::into_inner);
        self.state.resumed.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        *self.state.paused.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn resume(&self) {
        *self.state.paused.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.state.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.state.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block while paused, then report whether the run has been canceled.
    ///
    /// Workers call this once per feature (or node) processed.
    pub fn checkpoint(&self) -> bool {
        let mut paused = self.state.paused.lock().unwrap_or_else(PoisonError::into_inner);
        if *paused && !self.is_canceled() {
            debug!("Worker paused");
            while *paused && !self.is_canceled() {
                paused = self
                    .state
                    .resumed
                    .wait(paused)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            debug!("Worker resumed");
        }
        self.is_canceled()
    }
}
