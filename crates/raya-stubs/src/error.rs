//! Stub lifecycle errors
//!
//! Nearly everything here is an invariant violation between the JIT, the
//! call sites and the collector. Construction-time violations are returned
//! as `Err` so the compiler backend can abort with context; violations
//! detected inside a release or a collection pause go through [`fatal`],
//! since nothing up the stack could recover from them.

use crate::stub::{CallSiteIndex, JitTier, StubId};

/// Errors raised by the stub routine lifecycle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StubError {
    /// Final deletion requested for a stub that is not jettisoned, is still
    /// referenced or executing, or was already deleted
    #[error("Use after jettison: stub {0} is not eligible for deletion")]
    UseAfterJettison(StubId),

    /// Zero ref count observed while references remain
    #[error("Ref count underflow: stub {stub} observed zero with {count} references left")]
    RefCountUnderflow {
        /// Stub being torn down
        stub: StubId,
        /// References still outstanding
        count: u32,
    },

    /// The owning unit has no handler for the call site
    #[error("No exception handler registered for call site {0}")]
    MissingHandlerEntry(CallSiteIndex),

    /// Both an embedded object and an owning code unit were requested
    #[error("A stub cannot both embed an object and own an exception handler")]
    DoubleOwnershipRequest,

    /// Exception handler stubs are only emitted by the optimizing tiers
    #[error("Exception handler stubs require optimizing-tier code, got {0:?}")]
    NotOptimizingTier(JitTier),

    /// A stub was registered twice
    #[error("Stub {0} is already registered")]
    DuplicateRegistration(StubId),

    /// A stub was unregistered without being registered
    #[error("Stub {0} is not registered")]
    NotRegistered(StubId),

    /// Executable memory could not be mapped
    #[error("Failed to allocate {0} bytes of executable memory")]
    AllocationFailed(usize),

    /// Executable memory could not be re-protected
    #[error("Failed to change protection of code region at {0:#x}")]
    ProtectionFailed(usize),

    /// Nothing to install
    #[error("Cannot install an empty code buffer")]
    EmptyCode,

    /// Configuration could not be parsed or is out of range
    #[error("Invalid stub heap configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for stub operations
pub type StubResult<T> = Result<T, StubError>;

/// Abort on a broken lifecycle invariant
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn fatal(error: StubError) -> ! {
    tracing::error!(%error, "stub lifecycle invariant violated");
    panic!("{error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = StubError::MissingHandlerEntry(CallSiteIndex::new(7));
        assert_eq!(err.to_string(), "No exception handler registered for call site 7");

        let err = StubError::AllocationFailed(4096);
        assert_eq!(err.to_string(), "Failed to allocate 4096 bytes of executable memory");
    }

    #[test]
    #[should_panic(expected = "cannot both embed")]
    fn test_fatal_panics_with_message() {
        fatal(StubError::DoubleOwnershipRequest);
    }
}
