//! Raya JIT Stub Routines
//!
//! This crate manages the lifetime of machine-code stubs emitted by the
//! optimizing JIT tiers. A stub can be held from two sides at once:
//! - **Call sites**, through ordinary reference counting (`StubRef`)
//! - **The collector**, which needs to know whether the stub may still be
//!   executing and which managed objects the stub embeds
//!
//! Stubs that never call out (`makes_calls == false`) are plain ref-counted
//! code. Every other stub is registered in the heap's live-stub registry and
//! goes through a two-phase teardown: the last release only *jettisons* the
//! stub, and the collector frees it once a stack scan proves no frame can
//! resume into its code.
//!
//! # Example
//!
//! ```rust,ignore
//! use raya_stubs::{ConservativeRoots, MarkSet, ObjectRef, StubHeap, StubRequest};
//!
//! let heap = StubHeap::with_defaults();
//! let code = heap.install_code(&[0xC3])?;
//! let owner = ObjectRef::from_addr(0x1000).unwrap();
//! let stub = heap.create_stub(StubRequest::new(code, owner).makes_calls(true))?;
//!
//! drop(stub); // jettisoned, still registered
//!
//! let mut marks = MarkSet::new();
//! let pass = heap.collect(&ConservativeRoots::new(), &mut marks);
//! assert_eq!(pass.deleted, 1);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::derivable_impls)]

// ============================================================================
// Modules
// ============================================================================

/// Executable memory regions and their allocator
pub mod code;

/// Owning compiled-code units and their exception handler tables
pub mod code_unit;

/// Heap configuration
pub mod config;

/// Default constants for stub heap configuration
pub mod defaults;

/// Stub lifecycle errors
pub mod error;

/// Collector side: live-stub registry, conservative roots, tracing
pub mod gc;

/// Stub routines, their variants, and the factory
pub mod stub;

// ============================================================================
// Re-exports
// ============================================================================

pub use code::{CodeBlob, CodeRegion, ExecutableAllocator, MmapAllocator};
pub use code_unit::{CompiledCodeUnit, HandlerEntry};
pub use config::StubHeapConfig;
pub use error::{StubError, StubResult};
pub use gc::{
    ConservativeRoots, MarkSet, ObjectRef, ScanStats, StubGcStats, StubHeap, StubRegistry, Tracer,
};
pub use stub::{
    create_stub_routine, select_variant, CallSiteIndex, CodeUnit, EmbeddedObjects,
    ExceptionHandlerLink, JitTier, LifecycleState, StubId, StubPayload, StubRef, StubRequest,
    StubRoutine, StubVariant,
};
