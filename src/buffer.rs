//! Backing buffers and the slab allocator that recycles them.
//!
//! The allocator maps anonymous regions (hugepages when the kernel grants
//! them) and carves them into power-of-two size classes. A `Buffer` is an
//! exclusively-owned handle into one class; dropping it returns the memory
//! to the class free list rather than unmapping.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

/// Smallest buffer class.
pub const MIN_CLASS_SIZE: usize = 64;

/// Largest buffer class.
pub const MAX_CLASS_SIZE: usize = 8 * 1024 * 1024;

/// Number of power-of-two classes between MIN and MAX inclusive.
const NUM_CLASSES: usize = MAX_CLASS_SIZE.trailing_zeros() as usize
    - MIN_CLASS_SIZE.trailing_zeros() as usize
    + 1;

/// Bytes mapped per free-list refill. Classes larger than this take one
/// mapping per buffer.
const REGION_SIZE: usize = 2 * 1024 * 1024;

/// An exclusively-owned handle to a contiguous region of registered
/// memory. The distinguished invalid value has a null base pointer; the
/// allocator returns it on failure.
pub struct Buffer {
    ptr: *mut u8,
    class_size: usize,
    owner: Option<SlabAllocator>,
}

unsafe impl Send for Buffer {}

impl Buffer {
    /// The invalid Buffer.
    pub fn invalid() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            class_size: 0,
            owner: None,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Base address. Null for the invalid Buffer.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the class this Buffer was allocated from.
    #[inline]
    pub fn class_size(&self) -> usize {
        self.class_size
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ptr.is_null() {
            write!(f, "[Invalid]")
        } else {
            write!(f, "[buf {:p}, class_size {}]", self.ptr, self.class_size)
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(self.ptr, self.class_size);
        }
    }
}

struct Inner {
    free: [Vec<*mut u8>; NUM_CLASSES],
    regions: Vec<(NonNull<c_void>, usize)>,
    hugepage_regions: usize,
}

unsafe impl Send for Inner {}

/// Slab allocator with power-of-two classes. Handles are cheap clones
/// sharing one pool; an outstanding `Buffer` keeps the pool alive through
/// the owner handle it carries.
#[derive(Clone)]
pub struct SlabAllocator {
    inner: Arc<Mutex<Inner>>,
}

impl SlabAllocator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                free: std::array::from_fn(|_| Vec::new()),
                regions: Vec::new(),
                hugepage_regions: 0,
            })),
        }
    }

    /// Allocate a buffer of at least `size` bytes, rounded up to its
    /// class. Returns the invalid Buffer on failure.
    pub fn alloc(&self, size: usize) -> Buffer {
        let Some(class) = class_index(size) else {
            return Buffer::invalid();
        };
        let class_size = MIN_CLASS_SIZE << class;

        let mut inner = self.inner.lock().unwrap();
        if inner.free[class].is_empty() && !refill(&mut inner, class) {
            return Buffer::invalid();
        }

        let ptr = inner.free[class].pop().unwrap();
        Buffer {
            ptr,
            class_size,
            owner: Some(self.clone()),
        }
    }

    fn release(&self, ptr: *mut u8, class_size: usize) {
        let class = class_size.trailing_zeros() as usize - MIN_CLASS_SIZE.trailing_zeros() as usize;
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.free[class].contains(&ptr));
        inner.free[class].push(ptr);
    }

    /// Total bytes currently mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.inner.lock().unwrap().regions.iter().map(|r| r.1).sum()
    }

    /// Number of regions that got hugepage backing.
    pub fn hugepage_regions(&self) -> usize {
        self.inner.lock().unwrap().hugepage_regions
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (ptr, len) in self.regions.drain(..) {
            unsafe {
                let _ = munmap(ptr, len);
            }
        }
    }
}

/// Class index for `size`, or None if it exceeds the largest class.
fn class_index(size: usize) -> Option<usize> {
    if size > MAX_CLASS_SIZE {
        return None;
    }
    let rounded = size.max(MIN_CLASS_SIZE).next_power_of_two();
    Some(rounded.trailing_zeros() as usize - MIN_CLASS_SIZE.trailing_zeros() as usize)
}

/// Map a fresh region and carve it into the class free list.
fn refill(inner: &mut Inner, class: usize) -> bool {
    let class_size = MIN_CLASS_SIZE << class;
    let region_len = REGION_SIZE.max(class_size);

    let (region, huge) = match map_region(region_len) {
        Some(r) => r,
        None => return false,
    };

    inner.regions.push((region, region_len));
    if huge {
        inner.hugepage_regions += 1;
    }

    let base = region.as_ptr() as *mut u8;
    for i in 0..region_len / class_size {
        inner.free[class].push(unsafe { base.add(i * class_size) });
    }
    true
}

/// Anonymous mapping, hugepage-backed when the kernel allows it.
fn map_region(len: usize) -> Option<(NonNull<c_void>, bool)> {
    let len = NonZeroUsize::new(len)?;
    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;

    let huge_flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
    if let Ok(ptr) = unsafe { mmap_anonymous(None, len, prot, huge_flags) } {
        return Some((ptr, true));
    }

    let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
    match unsafe { mmap_anonymous(None, len, prot, flags) } {
        Ok(ptr) => Some((ptr, false)),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_buffer() {
        let buf = Buffer::invalid();
        assert!(!buf.is_valid());
        assert_eq!(buf.class_size(), 0);
        assert_eq!(format!("{}", buf), "[Invalid]");
    }

    #[test]
    fn test_class_rounding() {
        let alloc = SlabAllocator::new();

        let buf = alloc.alloc(1);
        assert!(buf.is_valid());
        assert_eq!(buf.class_size(), MIN_CLASS_SIZE);

        let buf = alloc.alloc(65);
        assert_eq!(buf.class_size(), 128);

        let buf = alloc.alloc(4096);
        assert_eq!(buf.class_size(), 4096);
    }

    #[test]
    fn test_oversize_alloc_fails() {
        let alloc = SlabAllocator::new();
        let buf = alloc.alloc(MAX_CLASS_SIZE + 1);
        assert!(!buf.is_valid());
    }

    #[test]
    fn test_recycle_on_drop() {
        let alloc = SlabAllocator::new();

        let buf = alloc.alloc(4096);
        let ptr = buf.as_ptr();
        drop(buf);

        // The free list is LIFO, so the next allocation of the same class
        // reuses the released buffer.
        let buf2 = alloc.alloc(4096);
        assert_eq!(buf2.as_ptr(), ptr);
    }

    #[test]
    fn test_region_mapped_once_per_refill() {
        let alloc = SlabAllocator::new();
        let a = alloc.alloc(4096);
        let before = alloc.mapped_bytes();
        let b = alloc.alloc(4096);
        assert_eq!(alloc.mapped_bytes(), before);
        drop(a);
        drop(b);
    }

    #[test]
    fn test_buffers_are_writable() {
        let alloc = SlabAllocator::new();
        let buf = alloc.alloc(1024);
        assert!(buf.is_valid());
        unsafe {
            std::ptr::write_bytes(buf.as_ptr(), 0xAB, 1024);
            assert_eq!(*buf.as_ptr(), 0xAB);
        }
    }
}
