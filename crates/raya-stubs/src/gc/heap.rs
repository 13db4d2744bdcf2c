//! Stub heap
//!
//! Ties the executable allocator, the live-stub registry and per-pass
//! statistics together. The collector calls [`StubHeap::collect`] once per
//! cycle, after its stack scan and before it sweeps managed objects, so the
//! objects embedded in surviving stubs are marked in time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::code::{CodeBlob, ExecutableAllocator, MmapAllocator};
use crate::config::StubHeapConfig;
use crate::error::StubResult;
use crate::stub::{create_stub_routine, StubRef, StubRequest};

use super::registry::{ScanStats, StubRegistry};
use super::roots::ConservativeRoots;
use super::tracer::Tracer;

/// Cumulative statistics over all stub passes
#[derive(Debug, Clone)]
pub struct StubGcStats {
    /// Number of passes run
    pub cycles: usize,

    /// Stubs deleted across all passes
    pub total_deleted: usize,

    /// Stubs that reported embedded objects, across all passes
    pub total_traced: usize,

    /// Total time spent in stub passes
    pub total_pause_time: Duration,

    /// Duration of the last pass
    pub last_pause_time: Duration,

    /// Longest pass
    pub max_pause_time: Duration,

    /// Counters from the last pass
    pub last_pass: ScanStats,
}

impl Default for StubGcStats {
    fn default() -> Self {
        Self {
            cycles: 0,
            total_deleted: 0,
            total_traced: 0,
            total_pause_time: Duration::ZERO,
            last_pause_time: Duration::ZERO,
            max_pause_time: Duration::ZERO,
            last_pass: ScanStats::default(),
        }
    }
}

impl StubGcStats {
    fn update(&mut self, pause_time: Duration, pass: ScanStats) {
        self.cycles += 1;
        self.total_deleted += pass.deleted;
        self.total_traced += pass.traced_stubs;
        self.total_pause_time += pause_time;
        self.last_pause_time = pause_time;
        if pause_time > self.max_pause_time {
            self.max_pause_time = pause_time;
        }
        self.last_pass = pass;
    }

    /// Mean pass duration
    pub fn avg_pause_time(&self) -> Duration {
        if self.cycles == 0 {
            Duration::ZERO
        } else {
            self.total_pause_time / self.cycles as u32
        }
    }
}

/// Owner of all GC-aware stubs of one VM heap
pub struct StubHeap {
    config: StubHeapConfig,
    allocator: Arc<dyn ExecutableAllocator>,
    registry: StubRegistry,
    stats: Mutex<StubGcStats>,
}

impl StubHeap {
    /// Create a heap with the given configuration and allocator
    pub fn new(config: StubHeapConfig, allocator: Arc<dyn ExecutableAllocator>) -> StubResult<Self> {
        config.validate()?;
        let registry = StubRegistry::from_config(&config);
        Ok(Self {
            config,
            allocator,
            registry,
            stats: Mutex::new(StubGcStats::default()),
        })
    }

    /// Create a heap with default configuration over anonymous mappings
    pub fn with_defaults() -> Self {
        let config = StubHeapConfig::default();
        Self {
            registry: StubRegistry::from_config(&config),
            config,
            allocator: Arc::new(MmapAllocator::new()),
            stats: Mutex::new(StubGcStats::default()),
        }
    }

    /// Copy `code` into fresh executable memory
    pub fn install_code(&self, code: &[u8]) -> StubResult<CodeBlob> {
        CodeBlob::install(&self.allocator, code)
    }

    /// Build a stub, registering it here if it is GC-aware
    pub fn create_stub(&self, request: StubRequest) -> StubResult<StubRef> {
        create_stub_routine(request, &self.registry)
    }

    /// Run the stub pass of one collection cycle
    ///
    /// Marks stubs whose code contains one of `roots`, reports embedded
    /// objects of every registered stub to `tracer`, then deletes jettisoned
    /// stubs that are not on any frame.
    pub fn collect(&self, roots: &ConservativeRoots, tracer: &mut dyn Tracer) -> ScanStats {
        let start = Instant::now();
        let pass = self.registry.scan_for_live_stubs(roots, tracer);
        let pause_time = start.elapsed();

        self.stats.lock().update(pause_time, pass);

        if self.config.log_cycles {
            tracing::debug!(
                registered = pass.registered,
                roots = pass.roots_scanned,
                filtered = pass.roots_filtered,
                executing = pass.executing,
                traced = pass.traced_stubs,
                deleted = pass.deleted,
                deferred = pass.deferred,
                pause_us = pause_time.as_micros() as u64,
                "stub pass complete"
            );
        }
        pass
    }

    /// Snapshot of cumulative statistics
    pub fn stats(&self) -> StubGcStats {
        self.stats.lock().clone()
    }

    /// The live-stub registry
    pub fn registry(&self) -> &StubRegistry {
        &self.registry
    }

    /// Heap configuration
    pub fn config(&self) -> &StubHeapConfig {
        &self.config
    }

    /// Executable memory allocator
    pub fn allocator(&self) -> &Arc<dyn ExecutableAllocator> {
        &self.allocator
    }
}

impl std::fmt::Debug for StubHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubHeap")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StubError;
    use crate::gc::{MarkSet, ObjectRef};

    fn owner() -> ObjectRef {
        ObjectRef::from_addr(0x1000).unwrap()
    }

    fn heap() -> (Arc<MmapAllocator>, StubHeap) {
        let mmap = Arc::new(MmapAllocator::new());
        let heap = StubHeap::new(StubHeapConfig::default(), mmap.clone()).unwrap();
        (mmap, heap)
    }

    #[test]
    fn test_new_validates_config() {
        let config = StubHeapConfig {
            initial_registry_capacity: usize::MAX,
            ..StubHeapConfig::default()
        };
        let err = StubHeap::new(config, Arc::new(MmapAllocator::new())).unwrap_err();
        assert!(matches!(err, StubError::InvalidConfig(_)));
    }

    #[test]
    fn test_collect_updates_stats() {
        let (mmap, heap) = heap();
        let code = heap.install_code(&[0x90, 0xC3]).unwrap();
        let object = ObjectRef::from_addr(0x2000).unwrap();
        let stub = heap
            .create_stub(StubRequest::new(code, owner()).makes_calls(true).with_object(object))
            .unwrap();

        let mut marks = MarkSet::new();
        let pass = heap.collect(&ConservativeRoots::new(), &mut marks);
        assert_eq!(pass.registered, 1);
        assert_eq!(pass.traced_stubs, 1);
        assert_eq!(pass.deleted, 0);
        assert!(marks.is_marked(object));

        drop(stub);
        let pass = heap.collect(&ConservativeRoots::new(), &mut MarkSet::new());
        assert_eq!(pass.deleted, 1);
        assert_eq!(mmap.live_regions(), 0);

        let stats = heap.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.total_deleted, 1);
        assert_eq!(stats.total_traced, 2);
        assert_eq!(stats.last_pass.deleted, 1);
        assert!(stats.max_pause_time >= stats.last_pause_time);
    }

    #[test]
    fn test_avg_pause_time_empty() {
        assert_eq!(StubGcStats::default().avg_pause_time(), Duration::ZERO);
    }

    #[test]
    fn test_plain_stub_not_registered() {
        let (_, heap) = heap();
        let code = heap.install_code(&[0xC3]).unwrap();
        let stub = heap.create_stub(StubRequest::new(code, owner())).unwrap();
        assert!(!stub.is_gc_aware());
        assert!(heap.registry().is_empty());
    }
}
