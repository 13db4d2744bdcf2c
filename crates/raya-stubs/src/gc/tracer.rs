//! Managed object references and the tracer interface
//!
//! Stubs never look inside managed objects. They only hand the addresses
//! they embed to the collector's tracer so those objects survive the cycle.

use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use rustc_hash::FxHashSet;

/// Opaque, non-null reference to a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wrap an object address; `None` for null
    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(ObjectRef)
    }

    /// Wrap a pointer to an object
    #[inline]
    pub fn from_ptr<T>(ptr: NonNull<T>) -> Self {
        // Safety: NonNull is never zero
        ObjectRef(unsafe { NonZeroUsize::new_unchecked(ptr.as_ptr() as usize) })
    }

    /// Object address
    #[inline]
    pub fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Receives the managed objects a stub keeps alive
pub trait Tracer {
    /// Report `object` as reachable for this cycle
    fn trace(&mut self, object: ObjectRef);
}

impl<F: FnMut(ObjectRef)> Tracer for F {
    fn trace(&mut self, object: ObjectRef) {
        self(object)
    }
}

/// Tracer that records every reached object
#[derive(Debug, Default)]
pub struct MarkSet {
    marked: FxHashSet<ObjectRef>,
    visits: usize,
}

impl MarkSet {
    /// Create an empty mark set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `object` was traced
    pub fn is_marked(&self, object: ObjectRef) -> bool {
        self.marked.contains(&object)
    }

    /// Number of distinct objects traced
    pub fn len(&self) -> usize {
        self.marked.len()
    }

    /// Whether nothing was traced
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    /// Total trace calls, counting repeats
    pub fn visits(&self) -> usize {
        self.visits
    }

    /// Forget all marks (start of the next cycle)
    pub fn clear(&mut self) {
        self.marked.clear();
        self.visits = 0;
    }

    /// Iterate over marked objects
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.marked.iter().copied()
    }
}

impl Tracer for MarkSet {
    fn trace(&mut self, object: ObjectRef) {
        self.visits += 1;
        self.marked.insert(object);
    }
}
