//! Executable memory for stub routines
//!
//! A [`CodeBlob`] owns one region of generated machine code. The region is
//! written while read-write, flipped to read+execute, and handed back to its
//! [`ExecutableAllocator`] when the blob is dropped. Dropping a blob whose
//! code is still on a machine frame is undefined behavior; the stub
//! lifecycle exists to make sure that never happens.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::defaults::CODE_PAGE_SIZE;
use crate::error::{StubError, StubResult};

#[cfg(unix)]
mod platform {
    use std::ptr;

    /// Map anonymous read-write memory.
    pub unsafe fn map_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Make memory executable (and read-only).
    pub unsafe fn protect_rx(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }
}

// Heap-backed fallback: regions stay read-write and are never executed.
#[cfg(not(unix))]
mod platform {
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ptr;

    use crate::defaults::CODE_PAGE_SIZE;

    pub unsafe fn map_rw(size: usize) -> *mut u8 {
        match Layout::from_size_align(size, CODE_PAGE_SIZE) {
            Ok(layout) => unsafe { alloc_zeroed(layout) },
            Err(_) => ptr::null_mut(),
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, CODE_PAGE_SIZE) {
            unsafe { dealloc(ptr, layout) }
        }
    }

    pub unsafe fn protect_rx(_ptr: *mut u8, _size: usize) -> bool {
        true
    }
}

/// A region of code memory: `len` bytes of code inside a mapping of
/// `capacity` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRegion {
    start: NonNull<u8>,
    len: usize,
    capacity: usize,
}

// Safety: a region is just an address range; ownership is tracked by CodeBlob.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Describe a region starting at `start`
    ///
    /// # Panics
    ///
    /// Panics if `len > capacity`.
    pub fn new(start: NonNull<u8>, len: usize, capacity: usize) -> Self {
        assert!(len <= capacity, "code length {len} exceeds mapping of {capacity} bytes");
        Self {
            start,
            len,
            capacity,
        }
    }

    /// Raw pointer to the first byte
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    /// Start address
    #[inline]
    pub fn start(&self) -> usize {
        self.start.as_ptr() as usize
    }

    /// One past the last code byte
    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    /// Number of code bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region holds no code
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying mapping
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `address` falls inside the code bytes
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start() && address < self.end()
    }
}

/// Source of executable memory for stub code
pub trait ExecutableAllocator: Send + Sync {
    /// Map a writable region able to hold `len` bytes of code
    fn allocate(&self, len: usize) -> StubResult<CodeRegion>;

    /// Flip a region to read+execute once its code has been written
    fn make_executable(&self, region: &CodeRegion) -> StubResult<()>;

    /// Release a region
    ///
    /// # Safety
    ///
    /// `region` must have come from `allocate` on this allocator, must not be
    /// freed twice, and no frame may be executing inside it.
    unsafe fn free(&self, region: CodeRegion);
}

/// Page-granular allocator backed by anonymous mappings
#[derive(Debug, Default)]
pub struct MmapAllocator {
    live_regions: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl MmapAllocator {
    /// Create a new allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions currently mapped
    pub fn live_regions(&self) -> usize {
        self.live_regions.load(Ordering::Relaxed)
    }

    /// Bytes currently mapped (page-rounded)
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    fn round_to_page(len: usize) -> Option<usize> {
        let len = len.max(1);
        len.checked_add(CODE_PAGE_SIZE - 1)
            .map(|n| n & !(CODE_PAGE_SIZE - 1))
    }
}

impl ExecutableAllocator for MmapAllocator {
    fn allocate(&self, len: usize) -> StubResult<CodeRegion> {
        let capacity = Self::round_to_page(len).ok_or(StubError::AllocationFailed(len))?;
        let ptr = unsafe { platform::map_rw(capacity) };
        let start = NonNull::new(ptr).ok_or(StubError::AllocationFailed(len))?;

        self.live_regions.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(capacity, Ordering::Relaxed);
        Ok(CodeRegion::new(start, len, capacity))
    }

    fn make_executable(&self, region: &CodeRegion) -> StubResult<()> {
        if unsafe { platform::protect_rx(region.as_ptr(), region.capacity()) } {
            Ok(())
        } else {
            Err(StubError::ProtectionFailed(region.start()))
        }
    }

    unsafe fn free(&self, region: CodeRegion) {
        unsafe { platform::unmap(region.as_ptr(), region.capacity()) };
        self.live_regions.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(region.capacity(), Ordering::Relaxed);
    }
}

/// Owned, immutable region of generated machine code
pub struct CodeBlob {
    region: CodeRegion,
    allocator: Arc<dyn ExecutableAllocator>,
}

impl CodeBlob {
    /// Copy `code` into fresh executable memory
    pub fn install(allocator: &Arc<dyn ExecutableAllocator>, code: &[u8]) -> StubResult<Self> {
        if code.is_empty() {
            return Err(StubError::EmptyCode);
        }

        let region = allocator.allocate(code.len())?;
        // Safety: the region was just mapped read-write with room for `code`
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), region.as_ptr(), code.len());
        }

        if let Err(e) = allocator.make_executable(&region) {
            tracing::warn!(start = region.start(), error = %e, "failed to protect stub code");
            unsafe { allocator.free(region) };
            return Err(e);
        }

        tracing::trace!(start = region.start(), len = code.len(), "installed stub code");
        Ok(Self {
            region,
            allocator: Arc::clone(allocator),
        })
    }

    /// Take ownership of a region that already holds finished code
    ///
    /// # Safety
    ///
    /// `region` must have been allocated by `allocator` and must not be
    /// owned by anything else.
    pub unsafe fn from_region(region: CodeRegion, allocator: Arc<dyn ExecutableAllocator>) -> Self {
        Self { region, allocator }
    }

    /// The underlying region
    #[inline]
    pub fn region(&self) -> &CodeRegion {
        &self.region
    }

    /// Start address of the code
    #[inline]
    pub fn start(&self) -> usize {
        self.region.start()
    }

    /// One past the last code byte
    #[inline]
    pub fn end(&self) -> usize {
        self.region.end()
    }

    /// Code size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Whether `address` points into this code
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        self.region.contains(address)
    }

    /// The code bytes
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: the region stays mapped and readable for the blob's lifetime
        unsafe { std::slice::from_raw_parts(self.region.as_ptr(), self.region.len()) }
    }
}

impl Drop for CodeBlob {
    fn drop(&mut self) {
        // Safety: the blob is the region's only owner, and the stub lifecycle
        // guarantees nothing executes here once the owning stub is destroyed
        unsafe { self.allocator.free(self.region) };
    }
}

impl fmt::Debug for CodeBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlob")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> (Arc<MmapAllocator>, Arc<dyn ExecutableAllocator>) {
        let concrete = Arc::new(MmapAllocator::new());
        let dynamic: Arc<dyn ExecutableAllocator> = concrete.clone();
        (concrete, dynamic)
    }

    #[test]
    fn test_install_and_free() {
        let (mmap, alloc) = allocator();
        let blob = CodeBlob::install(&alloc, &[0x90, 0x90, 0xC3]).unwrap();

        assert_eq!(blob.size(), 3);
        assert_eq!(blob.as_bytes(), &[0x90, 0x90, 0xC3]);
        assert_eq!(mmap.live_regions(), 1);
        assert_eq!(mmap.live_bytes(), CODE_PAGE_SIZE);

        drop(blob);
        assert_eq!(mmap.live_regions(), 0);
        assert_eq!(mmap.live_bytes(), 0);
    }

    #[test]
    fn test_install_empty_code() {
        let (mmap, alloc) = allocator();
        let err = CodeBlob::install(&alloc, &[]).unwrap_err();
        assert_eq!(err, StubError::EmptyCode);
        assert_eq!(mmap.live_regions(), 0);
    }

    #[test]
    fn test_contains() {
        let (_, alloc) = allocator();
        let blob = CodeBlob::install(&alloc, &[0xCC; 16]).unwrap();

        assert!(blob.contains(blob.start()));
        assert!(blob.contains(blob.start() + 15));
        assert!(!blob.contains(blob.end()));
        assert!(!blob.contains(blob.start().wrapping_sub(1)));
    }

    #[test]
    fn test_multi_page_region() {
        let (mmap, alloc) = allocator();
        let code = vec![0xCC; CODE_PAGE_SIZE + 1];
        let blob = CodeBlob::install(&alloc, &code).unwrap();

        assert_eq!(blob.region().capacity(), 2 * CODE_PAGE_SIZE);
        assert_eq!(mmap.live_bytes(), 2 * CODE_PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "exceeds mapping")]
    fn test_region_len_checked() {
        let start = NonNull::<u8>::dangling();
        let _ = CodeRegion::new(start, 10, 4);
    }
}
