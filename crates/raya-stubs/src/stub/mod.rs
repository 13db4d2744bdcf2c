//! Stub routines
//!
//! A [`StubRoutine`] wraps one [`CodeBlob`] with a reference count. Call
//! sites hold it through [`StubRef`] handles: cloning retains, dropping
//! releases.
//!
//! ## Lifecycle
//!
//! ```text
//!  plain:     Live ──(count 0)──────────────────────────────▶ freed
//!
//!  GC-aware:  Live ──(count 0)──▶ Jettisoned ──(collector: not
//!                                              executing)──▶ Deleted
//! ```
//!
//! A GC-aware stub is registered in the live-stub registry for its whole
//! life. Reaching a zero count only jettisons it: a frame may still be about
//! to return into its code even though nothing references it anymore. The
//! collector performs the final deletion once a stack scan shows the code is
//! not on any frame. The one exception is heap shutdown, which jettisons the
//! survivors so the last release frees them directly.

mod exception;
mod factory;
mod marking;

pub use exception::{CallSiteIndex, CodeUnit, ExceptionHandlerLink, JitTier};
pub use factory::{create_stub_routine, select_variant, StubRequest, StubVariant};
pub use marking::EmbeddedObjects;

use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::code::CodeBlob;
use crate::error::{fatal, StubError};
use crate::gc::{StubRegistry, Tracer};

/// Identity of a stub (its address), for logs and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubId(usize);

impl StubId {
    /// Raw address
    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lifecycle of a GC-aware stub
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Referenced by at least one call site
    Live = 0,
    /// Ref count reached zero; waiting for the collector
    Jettisoned = 1,
    /// Final deletion in progress
    Deleted = 2,
}

impl LifecycleState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Live,
            1 => LifecycleState::Jettisoned,
            _ => LifecycleState::Deleted,
        }
    }
}

/// What a GC-aware stub carries besides its code
#[derive(Debug)]
pub enum StubPayload {
    /// Nothing to trace, nothing to unregister
    None,
    /// Managed objects kept alive while registered
    EmbeddedObjects(EmbeddedObjects),
    /// Handler entry owned in a compiled code unit
    ExceptionHandler(ExceptionHandlerLink),
}

/// Collector-facing state of a GC-aware stub
#[derive(Debug)]
pub(crate) struct GcAwareState {
    state: AtomicU8,
    /// Written only by the collector's stack scan
    may_be_executing: AtomicBool,
    payload: StubPayload,
}

#[derive(Debug)]
enum StubKind {
    Plain,
    GcAware(GcAwareState),
}

/// Reference-counted routine of generated machine code
pub struct StubRoutine {
    code: CodeBlob,
    ref_count: AtomicU32,
    kind: StubKind,
}

impl StubRoutine {
    /// Plain routine: freed as soon as the count reaches zero
    pub(crate) fn new_plain(code: CodeBlob) -> StubRef {
        let stub = Box::new(StubRoutine {
            code,
            ref_count: AtomicU32::new(1),
            kind: StubKind::Plain,
        });
        StubRef::adopt(stub)
    }

    /// GC-aware routine, registered before the first handle is returned
    pub(crate) fn new_gc_aware(
        code: CodeBlob,
        payload: StubPayload,
        registry: &StubRegistry,
    ) -> StubRef {
        let stub = Box::new(StubRoutine {
            code,
            ref_count: AtomicU32::new(1),
            kind: StubKind::GcAware(GcAwareState {
                state: AtomicU8::new(LifecycleState::Live as u8),
                may_be_executing: AtomicBool::new(false),
                payload,
            }),
        });
        let stub = StubRef::adopt(stub);
        registry.register(stub.handle());
        stub
    }

    /// Stub identity
    #[inline]
    pub fn id(&self) -> StubId {
        StubId(self as *const StubRoutine as usize)
    }

    /// The stub's machine code
    #[inline]
    pub fn code(&self) -> &CodeBlob {
        &self.code
    }

    /// Current number of call-site references
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether the collector tracks this stub
    #[inline]
    pub fn is_gc_aware(&self) -> bool {
        matches!(self.kind, StubKind::GcAware(_))
    }

    /// Lifecycle state; `None` for plain stubs
    pub fn lifecycle_state(&self) -> Option<LifecycleState> {
        self.gc_state()
            .map(|gc| LifecycleState::from_u8(gc.state.load(Ordering::Acquire)))
    }

    /// Whether the ref count has reached zero at least once
    #[inline]
    pub fn is_jettisoned(&self) -> bool {
        self.lifecycle_state()
            .is_some_and(|state| state != LifecycleState::Live)
    }

    /// Whether the last stack scan found this stub's code on a frame
    #[inline]
    pub fn may_be_executing(&self) -> bool {
        self.gc_state()
            .is_some_and(|gc| gc.may_be_executing.load(Ordering::Acquire))
    }

    /// Payload of a GC-aware stub
    pub fn payload(&self) -> Option<&StubPayload> {
        self.gc_state().map(|gc| &gc.payload)
    }

    /// Embedded objects of a marking stub
    pub fn embedded_objects(&self) -> Option<&EmbeddedObjects> {
        match self.payload()? {
            StubPayload::EmbeddedObjects(objects) => Some(objects),
            _ => None,
        }
    }

    /// Handler link of an exception-handling stub
    pub fn exception_handler(&self) -> Option<&ExceptionHandlerLink> {
        match self.payload()? {
            StubPayload::ExceptionHandler(link) => Some(link),
            _ => None,
        }
    }

    /// Which variant this stub is
    pub fn variant(&self) -> StubVariant {
        match self.payload() {
            None => StubVariant::Plain,
            Some(StubPayload::None) => StubVariant::GcAware,
            Some(StubPayload::EmbeddedObjects(_)) => StubVariant::Marking,
            Some(StubPayload::ExceptionHandler(_)) => StubVariant::ExceptionHandling,
        }
    }

    /// Report the managed objects this stub keeps alive
    pub fn mark_required_objects(&self, tracer: &mut dyn Tracer) {
        if let Some(StubPayload::EmbeddedObjects(objects)) = self.payload() {
            objects.trace(tracer);
        }
    }

    #[inline]
    fn gc_state(&self) -> Option<&GcAwareState> {
        match &self.kind {
            StubKind::GcAware(gc) => Some(gc),
            StubKind::Plain => None,
        }
    }

    #[inline]
    pub(crate) fn set_may_be_executing(&self, value: bool) {
        if let Some(gc) = self.gc_state() {
            gc.may_be_executing.store(value, Ordering::Release);
        }
    }

    /// Whether the collector may delete this stub now
    #[inline]
    pub(crate) fn is_eligible_for_deletion(&self) -> bool {
        self.lifecycle_state() == Some(LifecycleState::Jettisoned)
            && !self.may_be_executing()
            && self.ref_count() == 0
    }

    /// Heap shutdown: the remaining references will never be used to run
    /// this code again, so the last release frees the stub directly
    pub(crate) fn jettison_for_shutdown(&self) {
        if let Some(gc) = self.gc_state() {
            let _ = gc.state.compare_exchange(
                LifecycleState::Live as u8,
                LifecycleState::Jettisoned as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// First transition of the ref count to zero
    ///
    /// # Safety
    ///
    /// `stub` must be a live GC-aware stub whose count just reached zero.
    /// The stub may be freed before this returns.
    unsafe fn observe_zero_ref_count(stub: NonNull<StubRoutine>) {
        let this = unsafe { stub.as_ref() };
        let Some(gc) = this.gc_state() else {
            return;
        };

        if let StubPayload::ExceptionHandler(link) = &gc.payload {
            link.unlink_on_zero_ref_count();
        }

        if this.is_jettisoned() {
            // Jettisoned by the shutdown sweep: nobody else will free us
            tracing::debug!(stub = %this.id(), "deleting stub released after shutdown");
            unsafe { StubRoutine::destroy(stub) };
            return;
        }

        let count = this.ref_count();
        if count != 0 {
            fatal(StubError::RefCountUnderflow {
                stub: this.id(),
                count,
            });
        }

        gc.state
            .store(LifecycleState::Jettisoned as u8, Ordering::Release);
        tracing::trace!(stub = %this.id(), variant = ?this.variant(), "stub jettisoned");
    }

    /// Final deletion, driven by the collector
    ///
    /// # Safety
    ///
    /// `stub` must point to a GC-aware stub that the caller has just removed
    /// from the live-stub registry.
    pub(crate) unsafe fn delete_from_gc(stub: NonNull<StubRoutine>) {
        let this = unsafe { stub.as_ref() };
        let Some(gc) = this.gc_state() else {
            fatal(StubError::UseAfterJettison(this.id()));
        };

        if this.ref_count() != 0 || this.may_be_executing() {
            fatal(StubError::UseAfterJettison(this.id()));
        }
        if gc
            .state
            .compare_exchange(
                LifecycleState::Jettisoned as u8,
                LifecycleState::Deleted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            fatal(StubError::UseAfterJettison(this.id()));
        }

        tracing::trace!(stub = %this.id(), "stub deleted by collector");
        unsafe { StubRoutine::destroy(stub) };
    }

    /// Shutdown sweep: delete a jettisoned, unreferenced stub without
    /// consulting `may_be_executing`
    ///
    /// # Safety
    ///
    /// Same as [`StubRoutine::delete_from_gc`]; additionally no mutator may
    /// run again.
    pub(crate) unsafe fn delete_at_shutdown(stub: NonNull<StubRoutine>) {
        let this = unsafe { stub.as_ref() };
        if this.ref_count() != 0 {
            fatal(StubError::UseAfterJettison(this.id()));
        }
        if let Some(gc) = this.gc_state() {
            gc.state
                .store(LifecycleState::Deleted as u8, Ordering::Release);
        }
        unsafe { StubRoutine::destroy(stub) };
    }

    /// Free the stub, its payload and its code
    unsafe fn destroy(stub: NonNull<StubRoutine>) {
        drop(unsafe { Box::from_raw(stub.as_ptr()) });
    }
}

impl fmt::Debug for StubRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubRoutine")
            .field("id", &self.id())
            .field("variant", &self.variant())
            .field("ref_count", &self.ref_count())
            .field("state", &self.lifecycle_state())
            .field("may_be_executing", &self.may_be_executing())
            .field("code", &self.code)
            .finish()
    }
}

/// Counted reference to a stub routine held by a call site
pub struct StubRef {
    ptr: NonNull<StubRoutine>,
}

// Safety: the count is atomic and the stub's shared state is atomics or
// behind locks; mutation of the registry is confined to collection pauses.
unsafe impl Send for StubRef {}
unsafe impl Sync for StubRef {}

impl StubRef {
    fn adopt(stub: Box<StubRoutine>) -> Self {
        // Safety: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(stub)) };
        StubRef { ptr }
    }

    /// Whether two handles refer to the same stub
    #[inline]
    pub fn ptr_eq(a: &StubRef, b: &StubRef) -> bool {
        a.ptr == b.ptr
    }

    #[inline]
    pub(crate) fn handle(&self) -> StubHandle {
        StubHandle(self.ptr)
    }
}

impl Clone for StubRef {
    fn clone(&self) -> Self {
        let old = self.ref_count.fetch_add(1, Ordering::Relaxed);
        if old == u32::MAX {
            std::process::abort();
        }
        StubRef { ptr: self.ptr }
    }
}

impl Drop for StubRef {
    fn drop(&mut self) {
        let stub = unsafe { self.ptr.as_ref() };
        if stub.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        if stub.is_gc_aware() {
            unsafe { StubRoutine::observe_zero_ref_count(self.ptr) };
        } else {
            tracing::trace!(stub = %stub.id(), "plain stub freed");
            unsafe { StubRoutine::destroy(self.ptr) };
        }
    }
}

impl Deref for StubRef {
    type Target = StubRoutine;

    #[inline]
    fn deref(&self) -> &StubRoutine {
        // Safety: a counted handle keeps the stub allocated
        unsafe { self.ptr.as_ref() }
    }
}

impl fmt::Debug for StubRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Uncounted pointer to a GC-aware stub, as stored in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StubHandle(NonNull<StubRoutine>);

// Safety: handles are only dereferenced by the registry under its lock
unsafe impl Send for StubHandle {}
unsafe impl Sync for StubHandle {}

impl StubHandle {
    #[inline]
    pub(crate) fn id(self) -> StubId {
        StubId(self.0.as_ptr() as usize)
    }

    #[inline]
    pub(crate) fn as_non_null(self) -> NonNull<StubRoutine> {
        self.0
    }

    /// # Safety
    ///
    /// The stub must still be registered (and therefore allocated).
    #[inline]
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a StubRoutine {
        unsafe { self.0.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{ExecutableAllocator, MmapAllocator};
    use crate::gc::{MarkSet, ObjectRef};
    use std::sync::Arc;

    fn setup() -> (Arc<MmapAllocator>, Arc<dyn ExecutableAllocator>, StubRegistry) {
        let mmap = Arc::new(MmapAllocator::new());
        let alloc: Arc<dyn ExecutableAllocator> = mmap.clone();
        (mmap, alloc, StubRegistry::new(8, true, true))
    }

    fn blob(alloc: &Arc<dyn ExecutableAllocator>) -> CodeBlob {
        CodeBlob::install(alloc, &[0xCC, 0xC3]).unwrap()
    }

    #[test]
    fn test_plain_stub_freed_at_zero() {
        let (mmap, alloc, registry) = setup();
        let stub = StubRoutine::new_plain(blob(&alloc));

        assert!(!stub.is_gc_aware());
        assert_eq!(stub.lifecycle_state(), None);
        assert_eq!(stub.ref_count(), 1);
        assert_eq!(registry.len(), 0);

        drop(stub);
        assert_eq!(mmap.live_regions(), 0);
    }

    #[test]
    fn test_retain_release_round_trip() {
        let (_, alloc, registry) = setup();
        let stub = StubRoutine::new_gc_aware(blob(&alloc), StubPayload::None, &registry);

        for _ in 0..3 {
            let extra = stub.clone();
            assert_eq!(stub.ref_count(), 2);
            drop(extra);
            assert_eq!(stub.ref_count(), 1);
            assert_eq!(stub.lifecycle_state(), Some(LifecycleState::Live));
        }
    }

    #[test]
    fn test_gc_aware_stub_jettisoned_not_freed() {
        let (mmap, alloc, registry) = setup();
        let stub = StubRoutine::new_gc_aware(blob(&alloc), StubPayload::None, &registry);
        let handle = stub.handle();
        assert!(registry.contains_handle(handle));

        drop(stub);

        // Still allocated and registered
        assert_eq!(mmap.live_regions(), 1);
        assert!(registry.contains_handle(handle));
        let state = unsafe { handle.as_ref() }.lifecycle_state();
        assert_eq!(state, Some(LifecycleState::Jettisoned));

        assert_eq!(registry.delete_unmarked_jettisoned(), 1);
        assert_eq!(mmap.live_regions(), 0);
    }

    #[test]
    fn test_mark_required_objects() {
        let (_, alloc, registry) = setup();
        let owner = ObjectRef::from_addr(0x100).unwrap();
        let object = ObjectRef::from_addr(0x200).unwrap();
        let stub = StubRoutine::new_gc_aware(
            blob(&alloc),
            StubPayload::EmbeddedObjects(EmbeddedObjects::one(owner, object)),
            &registry,
        );

        let mut marks = MarkSet::new();
        stub.mark_required_objects(&mut marks);
        assert!(marks.is_marked(object));
        assert_eq!(stub.variant(), StubVariant::Marking);

        let plain = StubRoutine::new_plain(blob(&alloc));
        let mut marks = MarkSet::new();
        plain.mark_required_objects(&mut marks);
        assert!(marks.is_empty());
    }

    #[test]
    #[should_panic(expected = "Use after jettison")]
    fn test_delete_live_stub_is_fatal() {
        let (_, alloc, registry) = setup();
        let stub = StubRoutine::new_gc_aware(blob(&alloc), StubPayload::None, &registry);
        unsafe { StubRoutine::delete_from_gc(stub.handle().as_non_null()) };
    }

    #[test]
    #[should_panic(expected = "Use after jettison")]
    fn test_delete_executing_stub_is_fatal() {
        let (_, alloc, registry) = setup();
        let stub = StubRoutine::new_gc_aware(blob(&alloc), StubPayload::None, &registry);
        let handle = stub.handle();
        drop(stub);
        let jettisoned = unsafe { handle.as_ref() };
        jettisoned.set_may_be_executing(true);
        unsafe { StubRoutine::delete_from_gc(handle.as_non_null()) };
    }

    #[test]
    #[should_panic(expected = "Ref count underflow")]
    fn test_observe_zero_with_references_is_fatal() {
        let (_, alloc, registry) = setup();
        let stub = StubRoutine::new_gc_aware(blob(&alloc), StubPayload::None, &registry);
        unsafe { StubRoutine::observe_zero_ref_count(stub.handle().as_non_null()) };
    }

    #[test]
    fn test_shutdown_jettison_frees_on_release() {
        let (mmap, alloc, registry) = setup();
        let stub = StubRoutine::new_gc_aware(blob(&alloc), StubPayload::None, &registry);

        drop(registry);
        assert!(stub.is_jettisoned());
        assert_eq!(mmap.live_regions(), 1);

        drop(stub);
        assert_eq!(mmap.live_regions(), 0);
    }
}
