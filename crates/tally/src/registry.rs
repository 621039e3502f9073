//! The process-wide counter registry.
//!
//! One registry coordinates one counter file at a time: it owns the active
//! mapping, the lock-free list of every handle ever used in this process,
//! and the mutex that serialises rotation and new-name allocation. The hot
//! path (`add` on a resolved handle) never touches the mutex.

use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::counter::{Counter, CounterSlot};
use crate::error::CounterError;
use crate::ident::Identity;
use crate::mapped::MappedFile;

/// The registry behind [`Counter::new`](crate::Counter::new) and the
/// top-level [`open`](crate::open)/[`inc`](crate::inc) functions.
pub(crate) static DEFAULT: CounterRegistry = CounterRegistry::new();

/// Coordinates counter handles and the active mapped file.
///
/// Most programs never name this type: the process-wide instance behind
/// [`Counter::new`](crate::Counter::new) is all they need. A separate
/// registry is for programs (and tests) that must keep counter files apart
/// from the default telemetry directory.
pub struct CounterRegistry {
    /// Head of the intrusive handle list; handles are spliced in with a CAS
    /// and never removed.
    counters: AtomicPtr<Counter>,
    /// List tail sentinel, so a handle's null `next` unambiguously means
    /// "not registered".
    end: Counter,
    opened: AtomicBool,
    state: Mutex<RegistryState>,
    /// The active mapping. Readable without the mutex.
    current: ArcSwapOption<MappedFile>,
}

pub(crate) struct RegistryState {
    pub(crate) identity: Option<Identity>,
    pub(crate) config: Option<Config>,
    pub(crate) local_dir: Option<PathBuf>,
    pub(crate) prefix: Option<String>,
    pub(crate) err: Option<CounterError>,
}

impl CounterRegistry {
    /// An empty registry. Counters bound to it no-op until
    /// [`open`](CounterRegistry::open) is called.
    pub const fn new() -> CounterRegistry {
        CounterRegistry {
            counters: AtomicPtr::new(ptr::null_mut()),
            end: Counter::sentinel(),
            opened: AtomicBool::new(false),
            state: Mutex::new(RegistryState {
                identity: None,
                config: None,
                local_dir: None,
                prefix: None,
                err: None,
            }),
            current: ArcSwapOption::const_empty(),
        }
    }

    /// Record the program identity, open today's counter file, arm the
    /// rotation timer, and count the start in `counter/main`.
    ///
    /// Only the first call does anything. Failures are recorded (see
    /// [`init_error`](CounterRegistry::init_error)) and leave every counter
    /// on this registry a silent no-op.
    pub fn open(&'static self, identity: Identity, config: Config) {
        if self.opened.swap(true, Ordering::AcqRel) {
            debug!("registry already opened");
            return;
        }
        {
            let mut state = self.state.lock();
            state.identity = Some(identity);
            state.config = Some(config);
        }
        self.rotate();
        if let Some(slot) = self.lookup("counter/main") {
            slot.add(1);
        }
    }

    /// Why initialisation declined to record anything, if it did.
    pub fn init_error(&self) -> Option<String> {
        self.state.lock().err.as_ref().map(|e| e.to_string())
    }

    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    pub(crate) fn current_mapping(&self) -> Option<Arc<MappedFile>> {
        self.current.load_full()
    }

    pub(crate) fn set_current(&self, m: Option<Arc<MappedFile>>) {
        self.current.store(m);
    }

    /// Splice `c` into the handle list if it is not there yet.
    ///
    /// Two CASes: first claim the handle's `next` pointer (null → successor)
    /// so only one thread splices a given handle, then push it as the list
    /// head. Handles are never removed, which is what makes the unversioned
    /// head CAS safe.
    pub(crate) fn register(&'static self, c: &'static Counter) {
        let end = &self.end as *const Counter as *mut Counter;
        let c_ptr = c as *const Counter as *mut Counter;
        let mut wrote_next = false;
        while wrote_next || c.next.load(Ordering::Acquire).is_null() {
            let head = self.counters.load(Ordering::Acquire);
            let next = if head.is_null() { end } else { head };
            if !wrote_next {
                if c.next
                    .compare_exchange(ptr::null_mut(), next, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Another thread is registering this same handle.
                    continue;
                }
                wrote_next = true;
            } else {
                c.next.store(next, Ordering::Release);
            }
            if self
                .counters
                .compare_exchange(head, c_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(name = c.name(), "registered counter");
                return;
            }
        }
    }

    /// Resolve `name` to a slot in the active mapping, allocating the record
    /// if needed. `None` when there is no active mapping or the name cannot
    /// be allocated.
    pub(crate) fn lookup(&'static self, name: &str) -> Option<CounterSlot> {
        if self.current.load().is_none() {
            debug!(name, "lookup: no mapped file");
            return None;
        }
        self.new_counter(name)
    }

    fn new_counter(&'static self, name: &str) -> Option<CounterSlot> {
        let slot;
        let mut invalidate = false;
        {
            let _state = self.state.lock();
            let current = self.current.load_full()?;
            match MappedFile::new_counter(&current, name) {
                Err(err) => {
                    debug!(name, %err, "new counter failed");
                    return None;
                }
                Ok((m, off)) => {
                    if !Arc::ptr_eq(&m, &current) {
                        // The file grew; switch everyone to the fresh
                        // mapping once the lock is released.
                        debug!(file = %m.path().display(), "mapping replaced during allocation");
                        self.current.store(Some(Arc::clone(&m)));
                        invalidate = true;
                    }
                    slot = CounterSlot::new(m, off);
                }
            }
        }
        if invalidate {
            self.invalidate_counters();
        }
        Some(slot)
    }

    /// Rebind every handle in this process to the current mapping.
    ///
    /// Two passes, first marking everything stale and then refreshing, so
    /// no handle can observe a slot belonging to a superseded mapping once
    /// this returns. Must not be called with the state mutex held: refresh
    /// re-enters `lookup`.
    pub(crate) fn invalidate_counters(&'static self) {
        let head = self.counters.load(Ordering::Acquire);
        if head.is_null() {
            return;
        }
        let end = &self.end as *const Counter;
        // SAFETY: list nodes are 'static and never unlinked, so every
        // pointer reached from the head remains valid.
        unsafe {
            let mut c = head as *const Counter;
            while c != end {
                (*c).invalidate();
                c = (*c).next.load(Ordering::Acquire);
            }
            let mut c = head as *const Counter;
            while c != end {
                (*c).refresh();
                c = (*c).next.load(Ordering::Acquire);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::Counter;

    fn leaked_registry_with(dir: &std::path::Path) -> &'static CounterRegistry {
        let reg: &'static CounterRegistry = Box::leak(Box::new(CounterRegistry::new()));
        reg.open(
            Identity::new("t", "v1.0", "tc1.0"),
            Config::new(dir.to_path_buf()),
        );
        reg
    }

    #[test]
    fn counters_resolve_and_accumulate() {
        let dir = tempfile::TempDir::new().unwrap();
        let reg = leaked_registry_with(dir.path());
        assert!(reg.init_error().is_none());

        let c: &'static Counter = Box::leak(Box::new(Counter::bound("x", reg)));
        c.inc();
        c.add(2);

        let slot = reg.lookup("x").unwrap();
        assert_eq!(slot.load(), 3);
    }

    #[test]
    fn lookup_without_open_is_none() {
        let reg: &'static CounterRegistry = Box::leak(Box::new(CounterRegistry::new()));
        assert!(reg.lookup("x").is_none());

        // And a counter bound to it silently no-ops.
        let c: &'static Counter = Box::leak(Box::new(Counter::bound("x", reg)));
        c.inc();
        assert!(reg.lookup("x").is_none());
    }

    #[test]
    fn register_is_idempotent_and_threadsafe() {
        use std::thread;

        let dir = tempfile::TempDir::new().unwrap();
        let reg = leaked_registry_with(dir.path());

        let mut counters = Vec::new();
        for i in 0..16 {
            let name: &'static str = Box::leak(format!("c{i}").into_boxed_str());
            counters.push(&*Box::leak(Box::new(Counter::bound(name, reg))));
        }

        let mut joins = Vec::new();
        for &c in &counters {
            for _ in 0..4 {
                joins.push(thread::spawn(move || reg.register(c)));
            }
        }
        for j in joins {
            j.join().unwrap();
        }

        // Every counter appears exactly once in the list.
        let mut seen = std::collections::HashSet::new();
        let end = &reg.end as *const Counter;
        let mut p = reg.counters.load(Ordering::Acquire) as *const Counter;
        while p != end && !p.is_null() {
            assert!(seen.insert(p), "duplicate list node");
            p = unsafe { (*p).next.load(Ordering::Acquire) } as *const Counter;
        }
        assert_eq!(seen.len(), counters.len());
    }

    #[test]
    fn main_counter_recorded_on_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let reg = leaked_registry_with(dir.path());
        let slot = reg.lookup("counter/main").unwrap();
        assert_eq!(slot.load(), 1);
    }

    #[test]
    fn second_open_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let reg = leaked_registry_with(dir.path());
        let first = reg.current_mapping().unwrap();
        reg.open(
            Identity::new("other", "v9", "tc9"),
            Config::new(dir.path().to_path_buf()),
        );
        let second = reg.current_mapping().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn overlong_names_never_resolve() {
        let dir = tempfile::TempDir::new().unwrap();
        let reg = leaked_registry_with(dir.path());

        let name: &'static str = Box::leak("n".repeat(257).into_boxed_str());
        let c: &'static Counter = Box::leak(Box::new(Counter::bound(name, reg)));
        c.inc();
        assert!(reg.lookup(name).is_none());

        // Other counters are unaffected.
        let ok: &'static Counter = Box::leak(Box::new(Counter::bound("fine", reg)));
        ok.inc();
        assert_eq!(reg.lookup("fine").unwrap().load(), 1);
    }
}
