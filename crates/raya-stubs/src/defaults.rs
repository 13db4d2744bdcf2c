//! Default constants for stub heap configuration.

/// Initial capacity of the live-stub registry.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 64;

/// Upper bound accepted for `initial_registry_capacity`.
pub const MAX_REGISTRY_CAPACITY: usize = 1 << 20;

/// Reject conservative roots outside the registered code bounds before the
/// per-stub lookup.
pub const DEFAULT_RANGE_FILTER: bool = true;

/// Cross-check registry entries on every collection pass.
pub const DEFAULT_VERIFY_REGISTRY: bool = false;

/// Emit a debug summary after every collection pass.
pub const DEFAULT_LOG_CYCLES: bool = true;

/// Page granularity for executable mappings.
pub const CODE_PAGE_SIZE: usize = 4096;
