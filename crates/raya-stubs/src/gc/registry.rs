//! Live-stub registry
//!
//! Every GC-aware stub is registered here from construction until the
//! collector deletes it. Once per collection cycle the collector runs one
//! pass over the registry:
//!
//! 1. **Clear**: reset `may_be_executing` on every stub
//! 2. **Mark**: set it on every stub whose code contains a conservative root
//! 3. **Trace**: report every stub's embedded objects to the tracer
//! 4. **Delete**: free stubs that are jettisoned, unmarked and unreferenced
//!
//! The registry is only mutated by stub construction (under its lock) and by
//! the collector during a pause, so mutators never race with a pass.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::StubHeapConfig;
use crate::error::{fatal, StubError};
use crate::stub::{LifecycleState, StubHandle, StubRef, StubRoutine};

use super::roots::ConservativeRoots;
use super::tracer::Tracer;

/// Counters from one registry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Stubs registered when the pass started
    pub registered: usize,
    /// Conservative roots examined
    pub roots_scanned: usize,
    /// Roots rejected by the range filter
    pub roots_filtered: usize,
    /// Stubs found on a frame
    pub executing: usize,
    /// Stubs that reported embedded objects
    pub traced_stubs: usize,
    /// Stubs deleted by this pass
    pub deleted: usize,
    /// Jettisoned stubs kept alive because they may be executing
    pub deferred: usize,
}

struct RegistryInner {
    stubs: FxHashSet<StubHandle>,
    /// Lowest start and highest end over all registered code
    bounds: Option<(usize, usize)>,
}

/// Heap-owned set of all GC-aware stubs
pub struct StubRegistry {
    inner: Mutex<RegistryInner>,
    range_filter: bool,
    verify: bool,
}

impl StubRegistry {
    /// Create an empty registry
    pub fn new(capacity: usize, range_filter: bool, verify: bool) -> Self {
        let mut stubs = FxHashSet::default();
        stubs.reserve(capacity);
        Self {
            inner: Mutex::new(RegistryInner {
                stubs,
                bounds: None,
            }),
            range_filter,
            verify,
        }
    }

    /// Create a registry from heap configuration
    pub fn from_config(config: &StubHeapConfig) -> Self {
        Self::new(
            config.initial_registry_capacity,
            config.range_filter,
            config.verify_registry,
        )
    }

    pub(crate) fn register(&self, handle: StubHandle) {
        let mut inner = self.inner.lock();
        if !inner.stubs.insert(handle) {
            fatal(StubError::DuplicateRegistration(handle.id()));
        }

        // Safety: just registered, so still allocated
        let code = unsafe { handle.as_ref() }.code();
        let (start, end) = (code.start(), code.end());
        inner.bounds = Some(match inner.bounds {
            Some((low, high)) => (low.min(start), high.max(end)),
            None => (start, end),
        });
        tracing::trace!(stub = %handle.id(), start, end, "stub registered");
    }

    /// Number of registered stubs
    pub fn len(&self) -> usize {
        self.inner.lock().stubs.len()
    }

    /// Whether no stub is registered
    pub fn is_empty(&self) -> bool {
        self.inner.lock().stubs.is_empty()
    }

    /// Whether `stub` is registered
    pub fn contains(&self, stub: &StubRef) -> bool {
        self.contains_handle(stub.handle())
    }

    pub(crate) fn contains_handle(&self, handle: StubHandle) -> bool {
        self.inner.lock().stubs.contains(&handle)
    }

    /// Registered stubs whose ref count already reached zero
    pub fn jettisoned_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .stubs
            .iter()
            .filter(|h| unsafe { h.as_ref() }.is_jettisoned())
            .count()
    }

    /// Code address bounds used by the range filter
    pub fn bounds(&self) -> Option<(usize, usize)> {
        self.inner.lock().bounds
    }

    /// Reset `may_be_executing` on every stub
    pub fn clear_marks(&self) {
        self.inner.lock().clear_marks();
    }

    /// Mark the stub containing `address` as possibly executing
    ///
    /// Returns true if a stub was marked.
    pub fn mark_executing(&self, address: usize) -> bool {
        let inner = self.inner.lock();
        if self.range_filter && !inner.in_bounds(address) {
            return false;
        }
        let found = inner
            .stubs
            .iter()
            .copied()
            .find(|h| unsafe { h.as_ref() }.code().contains(address));
        match found {
            Some(handle) => {
                unsafe { handle.as_ref() }.set_may_be_executing(true);
                true
            }
            None => false,
        }
    }

    /// Report embedded objects of every registered stub
    ///
    /// Returns the number of stubs that reported objects.
    pub fn trace_registered(&self, tracer: &mut dyn Tracer) -> usize {
        self.inner.lock().trace(tracer)
    }

    /// Delete every jettisoned, unmarked, unreferenced stub
    ///
    /// Returns the number of stubs deleted.
    pub fn delete_unmarked_jettisoned(&self) -> usize {
        self.inner.lock().delete_eligible()
    }

    /// Run one full pass: clear, mark from `roots`, trace, delete
    pub fn scan_for_live_stubs(
        &self,
        roots: &ConservativeRoots,
        tracer: &mut dyn Tracer,
    ) -> ScanStats {
        let mut inner = self.inner.lock();
        let mut stats = ScanStats {
            registered: inner.stubs.len(),
            ..ScanStats::default()
        };

        if self.verify {
            inner.verify();
        }

        inner.clear_marks();

        let ranges = inner.sorted_ranges();
        for address in roots.iter() {
            stats.roots_scanned += 1;
            if self.range_filter && !inner.in_bounds(address) {
                stats.roots_filtered += 1;
                continue;
            }
            if let Some(handle) = find_range(&ranges, address) {
                let stub = unsafe { handle.as_ref() };
                if !stub.may_be_executing() {
                    stub.set_may_be_executing(true);
                    stats.executing += 1;
                }
            }
        }

        stats.traced_stubs = inner.trace(tracer);
        stats.deleted = inner.delete_eligible();
        stats.deferred = inner
            .stubs
            .iter()
            .filter(|h| unsafe { h.as_ref() }.is_jettisoned())
            .count();
        stats
    }

    /// Heap teardown: delete unreferenced stubs, jettison the rest so their
    /// last release frees them
    fn shutdown(&mut self) {
        let inner = self.inner.get_mut();
        let stubs = std::mem::take(&mut inner.stubs);
        inner.bounds = None;

        let (mut deleted, mut deferred) = (0usize, 0usize);
        for handle in stubs {
            let stub = unsafe { handle.as_ref() };
            if stub.ref_count() == 0 {
                unsafe { StubRoutine::delete_at_shutdown(handle.as_non_null()) };
                deleted += 1;
            } else {
                stub.jettison_for_shutdown();
                deferred += 1;
            }
        }

        if deleted + deferred > 0 {
            tracing::debug!(deleted, deferred, "live-stub registry shut down");
        }
    }
}

impl Drop for StubRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for StubRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StubRegistry")
            .field("stubs", &inner.stubs.len())
            .field("bounds", &inner.bounds)
            .field("range_filter", &self.range_filter)
            .finish()
    }
}

// Registered handles always point to allocated stubs: removal from the set
// precedes every deletion.
impl RegistryInner {
    #[inline]
    fn in_bounds(&self, address: usize) -> bool {
        self.bounds
            .is_some_and(|(low, high)| address >= low && address < high)
    }

    fn clear_marks(&self) {
        for handle in &self.stubs {
            unsafe { handle.as_ref() }.set_may_be_executing(false);
        }
    }

    fn sorted_ranges(&self) -> Vec<(usize, usize, StubHandle)> {
        let mut ranges: Vec<_> = self
            .stubs
            .iter()
            .map(|&h| {
                let code = unsafe { h.as_ref() }.code();
                (code.start(), code.end(), h)
            })
            .collect();
        ranges.sort_unstable_by_key(|&(start, _, _)| start);
        ranges
    }

    fn trace(&self, tracer: &mut dyn Tracer) -> usize {
        let mut traced = 0;
        for handle in &self.stubs {
            let stub = unsafe { handle.as_ref() };
            if stub.embedded_objects().is_some() {
                stub.mark_required_objects(tracer);
                traced += 1;
            }
        }
        traced
    }

    fn delete_eligible(&mut self) -> usize {
        let doomed: Vec<StubHandle> = self
            .stubs
            .iter()
            .copied()
            .filter(|h| unsafe { h.as_ref() }.is_eligible_for_deletion())
            .collect();

        for &handle in &doomed {
            self.unregister(handle);
            unsafe { StubRoutine::delete_from_gc(handle.as_non_null()) };
        }

        if !doomed.is_empty() {
            self.recompute_bounds();
        }
        doomed.len()
    }

    fn unregister(&mut self, handle: StubHandle) {
        if !self.stubs.remove(&handle) {
            fatal(StubError::NotRegistered(handle.id()));
        }
    }

    fn recompute_bounds(&mut self) {
        self.bounds = self.stubs.iter().fold(None, |bounds, h| {
            let code = unsafe { h.as_ref() }.code();
            let (start, end) = (code.start(), code.end());
            Some(match bounds {
                Some((low, high)) => (start.min(low), end.max(high)),
                None => (start, end),
            })
        });
    }

    fn verify(&self) {
        for handle in &self.stubs {
            let stub = unsafe { handle.as_ref() };
            match stub.lifecycle_state() {
                Some(LifecycleState::Live) | Some(LifecycleState::Jettisoned) => {}
                _ => fatal(StubError::UseAfterJettison(handle.id())),
            }
        }
    }
}

/// Stub whose code contains `address`, by binary search over sorted ranges
fn find_range(ranges: &[(usize, usize, StubHandle)], address: usize) -> Option<StubHandle> {
    let idx = ranges.partition_point(|&(start, _, _)| start <= address);
    let &(_, end, handle) = ranges.get(idx.checked_sub(1)?)?;
    (address < end).then_some(handle)
}
