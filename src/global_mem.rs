//! Level-scheduled access to graph-global memory.
//!
//! Weights are shared across operators, so rewriting them must be serialized.
//! [`GlobalMem`] keeps one lock per scheduling level; work applied at the same
//! level never overlaps. [`GlobalMem::apply_once`] additionally guards a
//! one-time transform with the flag stored on the weight buffer, so the
//! transform runs at most once no matter how many helpers share the weight
//! or how often they are re-initialized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Scheduling level. Lower levels are applied before higher ones by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Level {
    L0 = 0,
    L1,
    L2,
}

/// Process-wide scheduler over shared memory.
pub struct GlobalMem {
    levels: [Mutex<()>; 3],
}

lazy_static::lazy_static! {
    static ref GLOBAL_MEM: GlobalMem = GlobalMem::new();
}

impl GlobalMem {
    fn new() -> Self {
        Self {
            levels: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    /// The singleton.
    pub fn global() -> &'static GlobalMem {
        &GLOBAL_MEM
    }

    /// Runs `f` while holding the lock of `level`.
    pub fn apply<R>(&self, level: Level, f: impl FnOnce() -> R) -> R {
        let _guard = self.levels[level as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Runs `f` under the level lock unless `done` is already set, then sets
    /// it. Returns `None` when the work had already been done.
    pub fn apply_once<R>(&self, level: Level, done: &AtomicBool, f: impl FnOnce() -> R) -> Option<R> {
        if done.load(Ordering::Acquire) {
            return None;
        }
        self.apply(level, || {
            if done.load(Ordering::Acquire) {
                return None;
            }
            let r = f();
            done.store(true, Ordering::Release);
            Some(r)
        })
    }
}
