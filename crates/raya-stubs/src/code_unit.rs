//! Compiled code units
//!
//! An optimized function body owns a handler table (call site → handler
//! entry point) and the dispatch metadata the unwinder uses to find it. Stubs
//! patched into its call sites may own entries in those tables. The unit
//! owns its stubs through `StubRef`s and tells each exception-handling stub
//! it is about to die before its tables are torn down.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{fatal, StubError};
use crate::stub::{CallSiteIndex, CodeUnit, JitTier, StubRef};

/// One entry in a unit's exception handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    /// Call site covered by the handler
    pub call_site: CallSiteIndex,
    /// Machine address of the handler
    pub target: usize,
}

/// Compiled function body with an exception handler table
pub struct CompiledCodeUnit {
    name: String,
    tier: JitTier,
    handlers: Mutex<FxHashMap<CallSiteIndex, HandlerEntry>>,
    /// Call sites with live unwinder metadata
    dispatch_metadata: Mutex<FxHashSet<CallSiteIndex>>,
    stubs: Mutex<Vec<StubRef>>,
}

impl CompiledCodeUnit {
    /// Create an empty unit
    pub fn new(name: impl Into<String>, tier: JitTier) -> Arc<Self> {
        Arc::new(CompiledCodeUnit {
            name: name.into(),
            tier,
            handlers: Mutex::new(FxHashMap::default()),
            dispatch_metadata: Mutex::new(FxHashSet::default()),
            stubs: Mutex::new(Vec::new()),
        })
    }

    /// Function name (for diagnostics)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler and its dispatch metadata for `call_site`
    pub fn add_handler(&self, call_site: CallSiteIndex, target: usize) {
        self.handlers
            .lock()
            .insert(call_site, HandlerEntry { call_site, target });
        self.dispatch_metadata.lock().insert(call_site);
    }

    /// Handler for `call_site`, if any
    pub fn handler_for(&self, call_site: CallSiteIndex) -> Option<HandlerEntry> {
        self.handlers.lock().get(&call_site).copied()
    }

    /// Number of handler entries
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Whether unwinder metadata exists for `call_site`
    pub fn has_dispatch_metadata(&self, call_site: CallSiteIndex) -> bool {
        self.dispatch_metadata.lock().contains(&call_site)
    }

    /// Keep `stub` alive for as long as this unit
    pub fn adopt_stub(&self, stub: StubRef) {
        self.stubs.lock().push(stub);
    }

    /// Number of stubs owned by this unit
    pub fn stub_count(&self) -> usize {
        self.stubs.lock().len()
    }
}

impl CodeUnit for CompiledCodeUnit {
    fn tier(&self) -> JitTier {
        self.tier
    }

    fn has_handler(&self, call_site: CallSiteIndex) -> bool {
        self.handlers.lock().contains_key(&call_site)
    }

    fn remove_dispatch_metadata(&self, call_site: CallSiteIndex) {
        self.dispatch_metadata.lock().remove(&call_site);
    }

    fn remove_handler_entry(&self, call_site: CallSiteIndex) {
        if self.handlers.lock().remove(&call_site).is_none() {
            fatal(StubError::MissingHandlerEntry(call_site));
        }
    }
}

impl Drop for CompiledCodeUnit {
    fn drop(&mut self) {
        let stubs = std::mem::take(self.stubs.get_mut());
        for stub in &stubs {
            if let Some(link) = stub.exception_handler() {
                link.about_to_die();
            }
        }
        tracing::trace!(unit = %self.name, stubs = stubs.len(), "code unit destroyed");
        drop(stubs);
    }
}

impl std::fmt::Debug for CompiledCodeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCodeUnit")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("handlers", &self.handler_count())
            .field("stubs", &self.stub_count())
            .finish()
    }
}
