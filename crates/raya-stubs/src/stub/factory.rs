//! Stub factory
//!
//! The only way into the stub hierarchy. The backend describes what the
//! stub needs and the factory picks exactly one variant.

use std::sync::Arc;

use crate::code::CodeBlob;
use crate::error::{StubError, StubResult};
use crate::gc::{ObjectRef, StubRegistry};

use super::exception::{CallSiteIndex, CodeUnit, ExceptionHandlerLink};
use super::marking::EmbeddedObjects;
use super::{StubPayload, StubRef, StubRoutine};

/// Which kind of stub routine gets built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubVariant {
    /// Ref-counted only; freed at count zero
    Plain,
    /// Registered with the collector, nothing to trace
    GcAware,
    /// Registered, keeps embedded objects alive
    Marking,
    /// Registered, owns an exception handler entry
    ExceptionHandling,
}

/// Pick the variant for a stub
///
/// A stub that makes no calls cannot be on a frame once its caller moves on,
/// so it never needs the collector.
pub fn select_variant(
    makes_calls: bool,
    has_objects: bool,
    has_code_unit: bool,
) -> StubResult<StubVariant> {
    if !makes_calls {
        return Ok(StubVariant::Plain);
    }
    match (has_objects, has_code_unit) {
        (true, true) => Err(StubError::DoubleOwnershipRequest),
        (false, true) => Ok(StubVariant::ExceptionHandling),
        (true, false) => Ok(StubVariant::Marking),
        (false, false) => Ok(StubVariant::GcAware),
    }
}

/// Everything the backend knows about a stub it just generated
pub struct StubRequest {
    code: CodeBlob,
    owner: ObjectRef,
    makes_calls: bool,
    objects: Vec<ObjectRef>,
    code_unit: Option<(Arc<dyn CodeUnit>, CallSiteIndex)>,
}

impl StubRequest {
    /// Request a stub for `code`, compiled on behalf of `owner`
    pub fn new(code: CodeBlob, owner: ObjectRef) -> Self {
        Self {
            code,
            owner,
            makes_calls: false,
            objects: Vec::new(),
            code_unit: None,
        }
    }

    /// Whether the stub calls out (and so may be on a frame later)
    pub fn makes_calls(mut self, makes_calls: bool) -> Self {
        self.makes_calls = makes_calls;
        self
    }

    /// Embed a managed object in the stub
    pub fn with_object(mut self, object: ObjectRef) -> Self {
        self.objects.push(object);
        self
    }

    /// Embed several managed objects in the stub
    pub fn with_objects(mut self, objects: impl IntoIterator<Item = ObjectRef>) -> Self {
        self.objects.extend(objects);
        self
    }

    /// Give the stub ownership of `unit`'s handler for `call_site`
    pub fn with_exception_handler(
        mut self,
        unit: Arc<dyn CodeUnit>,
        call_site: CallSiteIndex,
    ) -> Self {
        self.code_unit = Some((unit, call_site));
        self
    }

    /// Variant this request would produce
    pub fn variant(&self) -> StubResult<StubVariant> {
        select_variant(
            self.makes_calls,
            !self.objects.is_empty(),
            self.code_unit.is_some(),
        )
    }
}

/// Build the stub routine described by `request`
///
/// GC-aware variants are registered in `registry` before the handle is
/// returned. On error nothing is registered and the code is freed.
pub fn create_stub_routine(request: StubRequest, registry: &StubRegistry) -> StubResult<StubRef> {
    let variant = request.variant()?;
    let StubRequest {
        code,
        owner,
        objects,
        code_unit,
        ..
    } = request;
    let size = code.size();

    let stub = match (variant, code_unit) {
        (StubVariant::Plain, _) => StubRoutine::new_plain(code),
        (StubVariant::ExceptionHandling, Some((unit, call_site))) => {
            let link = ExceptionHandlerLink::new(&unit, call_site)?;
            StubRoutine::new_gc_aware(code, StubPayload::ExceptionHandler(link), registry)
        }
        (StubVariant::Marking, _) => {
            let payload = match EmbeddedObjects::new(owner, objects) {
                Some(embedded) => StubPayload::EmbeddedObjects(embedded),
                None => StubPayload::None,
            };
            StubRoutine::new_gc_aware(code, payload, registry)
        }
        _ => StubRoutine::new_gc_aware(code, StubPayload::None, registry),
    };

    tracing::debug!(stub = %stub.id(), ?variant, size, "created stub routine");
    Ok(stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{ExecutableAllocator, MmapAllocator};
    use crate::code_unit::CompiledCodeUnit;
    use crate::stub::JitTier;

    fn setup() -> (Arc<MmapAllocator>, Arc<dyn ExecutableAllocator>, StubRegistry) {
        let mmap = Arc::new(MmapAllocator::new());
        let alloc: Arc<dyn ExecutableAllocator> = mmap.clone();
        (mmap, alloc, StubRegistry::new(8, true, false))
    }

    fn code(alloc: &Arc<dyn ExecutableAllocator>) -> CodeBlob {
        CodeBlob::install(alloc, &[0xC3]).unwrap()
    }

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).unwrap()
    }

    #[test]
    fn test_select_variant_table() {
        use StubVariant::*;
        assert_eq!(select_variant(false, false, false), Ok(Plain));
        assert_eq!(select_variant(false, true, true), Ok(Plain));
        assert_eq!(select_variant(true, false, false), Ok(GcAware));
        assert_eq!(select_variant(true, true, false), Ok(Marking));
        assert_eq!(select_variant(true, false, true), Ok(ExceptionHandling));
        assert_eq!(
            select_variant(true, true, true),
            Err(StubError::DoubleOwnershipRequest)
        );
    }

    #[test]
    fn test_plain_stub_skips_registry() {
        let (_, alloc, registry) = setup();
        let stub = create_stub_routine(StubRequest::new(code(&alloc), obj(0x8)), &registry).unwrap();
        assert_eq!(stub.variant(), StubVariant::Plain);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_marking_stub_registered() {
        let (_, alloc, registry) = setup();
        let request = StubRequest::new(code(&alloc), obj(0x8))
            .makes_calls(true)
            .with_object(obj(0x10));
        let stub = create_stub_routine(request, &registry).unwrap();

        assert_eq!(stub.variant(), StubVariant::Marking);
        assert_eq!(registry.len(), 1);
        let embedded = stub.embedded_objects().unwrap();
        assert_eq!(embedded.owner(), obj(0x8));
        assert!(embedded.contains(obj(0x10)));
    }

    #[test]
    fn test_double_ownership_builds_nothing() {
        let (mmap, alloc, registry) = setup();
        let unit = CompiledCodeUnit::new("f", JitTier::Optimizing);
        unit.add_handler(CallSiteIndex::new(7), 0x4000);

        let request = StubRequest::new(code(&alloc), obj(0x8))
            .makes_calls(true)
            .with_object(obj(0x10))
            .with_exception_handler(unit.clone(), CallSiteIndex::new(7));
        let err = create_stub_routine(request, &registry).unwrap_err();

        assert_eq!(err, StubError::DoubleOwnershipRequest);
        assert!(registry.is_empty());
        assert_eq!(mmap.live_regions(), 0);
    }

    #[test]
    fn test_missing_handler_builds_nothing() {
        let (mmap, alloc, registry) = setup();
        let unit = CompiledCodeUnit::new("f", JitTier::Optimizing);

        let request = StubRequest::new(code(&alloc), obj(0x8))
            .makes_calls(true)
            .with_exception_handler(unit, CallSiteIndex::new(7));
        let err = create_stub_routine(request, &registry).unwrap_err();

        assert_eq!(err, StubError::MissingHandlerEntry(CallSiteIndex::new(7)));
        assert!(registry.is_empty());
        assert_eq!(mmap.live_regions(), 0);
    }

    #[test]
    fn test_exception_stub_for_baseline_rejected() {
        let (_, alloc, registry) = setup();
        let unit = CompiledCodeUnit::new("f", JitTier::Baseline);
        unit.add_handler(CallSiteIndex::new(1), 0x4000);

        let request = StubRequest::new(code(&alloc), obj(0x8))
            .makes_calls(true)
            .with_exception_handler(unit, CallSiteIndex::new(1));
        let err = create_stub_routine(request, &registry).unwrap_err();
        assert_eq!(err, StubError::NotOptimizingTier(JitTier::Baseline));
    }
}
