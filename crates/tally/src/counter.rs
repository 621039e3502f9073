//! Counter handles.
//!
//! A [`Counter`] is a named handle that caches a slot: a mapping plus the
//! offset of an atomic 64-bit value inside it. The hot path is one atomic
//! flag load, one lock-free cache load, and one fetch-add; everything else
//! (registration, resolution, rebinding after rotation or growth) happens on
//! the cold path. Increments never fail: a counter that cannot resolve stays
//! a silent no-op.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::mapped::MappedFile;
use crate::registry::{CounterRegistry, DEFAULT};

/// A resolved slot: the mapping keeps the bytes alive, the offset names the
/// record. Holding the `Arc` is what lets a superseded mapping survive until
/// every handle has rebound.
pub(crate) struct CounterSlot {
    file: Arc<MappedFile>,
    off: u32,
}

impl CounterSlot {
    pub(crate) fn new(file: Arc<MappedFile>, off: u32) -> CounterSlot {
        CounterSlot { file, off }
    }

    fn value(&self) -> &AtomicU64 {
        self.file.value_at(self.off)
    }

    pub(crate) fn add(&self, n: u64) {
        self.value().fetch_add(n, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn load(&self) -> u64 {
        self.value().load(Ordering::Relaxed)
    }
}

/// A named counter.
///
/// Counters are cheap to declare and live for the rest of the process; the
/// usual shape is a static:
///
/// ```
/// static PARSE_ERRORS: tally::Counter = tally::Counter::new("parse/errors");
///
/// PARSE_ERRORS.inc();
/// ```
///
/// Names are at most 256 bytes. A counter whose name is too long, or whose
/// registry has no open file, counts nothing.
pub struct Counter {
    name: &'static str,
    /// Owning registry. `None` only for list sentinels, which are never
    /// incremented.
    registry: Option<&'static CounterRegistry>,
    slot: ArcSwapOption<CounterSlot>,
    invalid: AtomicBool,
    /// Intrusive link in the registry's handle list. Null means not yet
    /// registered; the registry's sentinel marks the tail, so the two states
    /// are never confused.
    pub(crate) next: AtomicPtr<Counter>,
}

impl Counter {
    /// A counter on the process-wide registry.
    pub const fn new(name: &'static str) -> Counter {
        Counter::bound(name, &DEFAULT)
    }

    /// A counter on a specific registry.
    pub const fn bound(name: &'static str, registry: &'static CounterRegistry) -> Counter {
        Counter {
            name,
            registry: Some(registry),
            slot: ArcSwapOption::const_empty(),
            invalid: AtomicBool::new(false),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Tail sentinel for handle lists. Only its address is meaningful.
    pub(crate) const fn sentinel() -> Counter {
        Counter {
            name: "",
            registry: None,
            slot: ArcSwapOption::const_empty(),
            invalid: AtomicBool::new(false),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Add 1.
    pub fn inc(&'static self) {
        self.add(1);
    }

    /// Add `n`. Never blocks on the hot path and never fails; increments
    /// that cannot be recorded are dropped.
    pub fn add(&'static self, n: u64) {
        if n == 0 {
            return;
        }
        let Some(registry) = self.registry else {
            return;
        };
        if !self.invalid.load(Ordering::Acquire) {
            if let Some(slot) = &*self.slot.load() {
                slot.add(n);
                return;
            }
        }
        self.add_slow(registry, n);
    }

    #[cold]
    fn add_slow(&'static self, registry: &'static CounterRegistry, n: u64) {
        registry.register(self);
        self.refresh();
        if let Some(slot) = &*self.slot.load() {
            slot.add(n);
        }
    }

    /// Mark the cached slot stale. The next `add` re-resolves.
    pub(crate) fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    /// Re-resolve against the registry's current mapping. Clears the stale
    /// flag even when resolution fails, so a no-op counter does not spin.
    pub(crate) fn refresh(&'static self) {
        if let Some(registry) = self.registry {
            let slot = registry.lookup(self.name);
            self.slot.store(slot.map(Arc::new));
        }
        self.invalid.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter").field("name", &self.name).finish()
    }
}
