//! Exception-handler payload
//!
//! Stubs emitted for a call site inside optimized code may own an entry in
//! that code unit's exception handler table. The stub keeps a non-owning
//! link back to the unit and removes its entry exactly once: either when its
//! ref count reaches zero, or never, if the unit dies first and calls
//! [`ExceptionHandlerLink::about_to_die`].

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{StubError, StubResult};

/// Identifies a call site inside a compiled code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteIndex(u32);

impl CallSiteIndex {
    /// Create a call site index
    #[inline]
    pub const fn new(bits: u32) -> Self {
        CallSiteIndex(bits)
    }

    /// Raw index
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallSiteIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compilation tier that produced a code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JitTier {
    /// Bytecode interpreter (no machine code)
    Interpreter,
    /// Template baseline JIT
    Baseline,
    /// Speculative optimizing JIT
    Optimizing,
    /// Highest tier, longest compile times
    FullOptimizing,
}

impl JitTier {
    /// Whether the tier emits exception handler tables for stubs
    #[inline]
    pub fn is_optimizing(self) -> bool {
        matches!(self, JitTier::Optimizing | JitTier::FullOptimizing)
    }
}

/// Owning compiled-code unit, as seen from an exception-handling stub
///
/// A unit that owns such stubs must call
/// [`ExceptionHandlerLink::about_to_die`] on each of them before it destroys
/// its own tables.
pub trait CodeUnit: Send + Sync {
    /// Tier that produced this unit
    fn tier(&self) -> JitTier;

    /// Whether a handler is registered for `call_site`
    fn has_handler(&self, call_site: CallSiteIndex) -> bool;

    /// Drop the exception dispatch metadata for `call_site`
    fn remove_dispatch_metadata(&self, call_site: CallSiteIndex);

    /// Drop the handler table entry for `call_site`
    fn remove_handler_entry(&self, call_site: CallSiteIndex);
}

/// Non-owning back-reference from a stub to its code unit
pub struct ExceptionHandlerLink {
    /// `None` once cleared; never set again
    unit: Mutex<Option<Weak<dyn CodeUnit>>>,
    call_site: CallSiteIndex,
}

impl ExceptionHandlerLink {
    /// Link to `unit` at `call_site`, checking the unit can own the entry
    pub(crate) fn new(unit: &Arc<dyn CodeUnit>, call_site: CallSiteIndex) -> StubResult<Self> {
        let tier = unit.tier();
        if !tier.is_optimizing() {
            return Err(StubError::NotOptimizingTier(tier));
        }
        if !unit.has_handler(call_site) {
            return Err(StubError::MissingHandlerEntry(call_site));
        }

        Ok(Self {
            unit: Mutex::new(Some(Arc::downgrade(unit))),
            call_site,
        })
    }

    /// Call site whose handler this stub owns
    pub fn call_site(&self) -> CallSiteIndex {
        self.call_site
    }

    /// Whether the back-reference is still present
    pub fn is_linked(&self) -> bool {
        self.unit.lock().is_some()
    }

    /// The owning unit is being destroyed: forget it without touching its
    /// tables, which are going away anyway
    pub fn about_to_die(&self) {
        if self.unit.lock().take().is_some() {
            tracing::trace!(call_site = %self.call_site, "code unit died before its stub");
        }
    }

    /// Ref count reached zero: remove dispatch metadata, then the handler
    /// entry, then clear the link
    pub(crate) fn unlink_on_zero_ref_count(&self) {
        // The upgraded unit is dropped after the lock is released; dropping
        // the last strong reference runs the unit's teardown, which calls
        // back into `about_to_die` on its other stubs.
        let unit = {
            let mut link = self.unit.lock();
            let unit = link.as_ref().and_then(Weak::upgrade);
            if let Some(unit) = &unit {
                unit.remove_dispatch_metadata(self.call_site);
                unit.remove_handler_entry(self.call_site);
                tracing::trace!(call_site = %self.call_site, "removed stub exception handler");
            }
            *link = None;
            unit
        };
        drop(unit);
    }
}

impl fmt::Debug for ExceptionHandlerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandlerLink")
            .field("call_site", &self.call_site)
            .field("linked", &self.is_linked())
            .finish()
    }
}
