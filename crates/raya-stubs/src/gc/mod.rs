//! Collector side of the stub lifecycle
//!
//! The [`StubHeap`] owns the live-stub registry and the executable memory
//! allocator. The collector drives it once per cycle with the conservative
//! roots from its stack scan and its own [`Tracer`].

mod heap;
mod registry;
mod roots;
mod tracer;

pub use heap::{StubGcStats, StubHeap};
pub use registry::{ScanStats, StubRegistry};
pub use roots::ConservativeRoots;
pub use tracer::{MarkSet, ObjectRef, Tracer};
