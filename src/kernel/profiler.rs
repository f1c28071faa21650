//! Launch events and the process-wide profiling aggregator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

static RECORDING: AtomicBool = AtomicBool::new(false);

lazy_static::lazy_static! {
    static ref STATS: Mutex<BTreeMap<String, KernelStat>> = Mutex::new(BTreeMap::new());
}

/// Turns event recording on or off for every subsequent launch.
pub fn set_recording(on: bool) {
    RECORDING.store(on, Ordering::Release);
}

pub fn is_recording() -> bool {
    RECORDING.load(Ordering::Acquire)
}

/// One kernel launch.
#[derive(Debug, Clone)]
pub struct Event {
    kernel: String,
    queued: Instant,
    completed: Option<Instant>,
}

impl Event {
    pub fn begin(kernel: &str) -> Self {
        Self {
            kernel: kernel.to_string(),
            queued: Instant::now(),
            completed: None,
        }
    }

    /// Marks the launch complete. Only known after a wait.
    pub fn complete(&mut self) {
        self.completed = Some(Instant::now());
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn elapsed_ms(&self) -> Option<f64> {
        self.completed
            .map(|end| end.duration_since(self.queued).as_secs_f64() * 1e3)
    }
}

/// Accumulated numbers for one kernel name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KernelStat {
    pub kernel: String,
    pub launches: usize,
    /// Launches that were waited on and therefore have a duration.
    pub timed: usize,
    pub total_ms: f64,
}

/// Folds a list of events into the aggregator.
pub fn add_events(events: Vec<Event>) {
    let mut stats = STATS.lock().unwrap_or_else(PoisonError::into_inner);
    for event in events {
        let ms = event.elapsed_ms();
        let entry = stats.entry(event.kernel.clone()).or_insert_with(|| KernelStat {
            kernel: event.kernel,
            ..KernelStat::default()
        });
        entry.launches += 1;
        if let Some(ms) = ms {
            entry.timed += 1;
            entry.total_ms += ms;
        }
    }
}

/// Snapshot of all stats, sorted by kernel name.
pub fn summary() -> Vec<KernelStat> {
    STATS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect()
}

pub fn reset() {
    STATS.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fold_into_stats() {
        let mut timed = Event::begin("profiler_test_kernel");
        timed.complete();
        let untimed = Event::begin("profiler_test_kernel");
        assert!(untimed.elapsed_ms().is_none());
        add_events(vec![timed, untimed]);

        let stat = summary()
            .into_iter()
            .find(|s| s.kernel == "profiler_test_kernel")
            .unwrap();
        assert_eq!(stat.launches, 2);
        assert_eq!(stat.timed, 1);
        assert!(stat.total_ms >= 0.0);
    }
}
