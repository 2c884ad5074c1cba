//! Slab and page-region heap allocator for the kernel.
//!
//! Small requests are served from slab pages: a page whose first 64 bytes
//! are a [`SlabHeader`] and whose remaining 4032 bytes are split into
//! equally sized objects. Seven size classes cover requests up to
//! [`MAX_SLAB_SIZE`] bytes:
//!
//! | class | object size | objects per page |
//! |-------|-------------|------------------|
//! | 0     | 32          | 64               |
//! | 1     | 64          | 63               |
//! | 2     | 192         | 21               |
//! | 3     | 448         | 9                |
//! | 4     | 1008        | 4                |
//! | 5     | 2016        | 2                |
//! | 6     | 4032        | 1                |
//!
//! Larger requests get a run of whole pages prefixed by a 16-byte
//! [`RegionHeader`]. Both headers start with a `u32` size field; a value of
//! at most [`MAX_SLAB_SIZE`] marks a slab page, anything larger a region.
//!
//! # Integrity checks
//!
//! Every slab header carries a signature and a checksum over the rest of the
//! header. Both are verified before the allocator trusts a slab, and the
//! checksum is refreshed after every change. Freed objects are overwritten
//! with [`POISON_BYTE`]. A detected inconsistency, an invalid or double free,
//! an entry from interrupt context or a re-entered allocator are all fatal:
//! the fallible `try_*` entry points return a [`MallocError`] and the plain
//! ones pass it to [`error::report`], which panics.
//!
//! # Platform services
//!
//! The allocator does not touch hardware itself. Pages come from a
//! [`PageSource`] and interrupt state is managed through an [`Interrupts`]
//! implementation, both supplied by the kernel.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kmalloc::{GlobalMalloc, Interrupts, PageSource};
//!
//! #[global_allocator]
//! static ALLOCATOR: GlobalMalloc<KernelPages, Hart> = GlobalMalloc::new();
//!
//! pub fn init(pages: KernelPages) {
//!     if let Err(err) = ALLOCATOR.init(pages, Hart) {
//!         kmalloc::error::report(&err);
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::ptr::NonNull;

use platform_cast::CastFrom as _;
use snafu::ensure;

pub use self::{
    error::MallocError,
    global::{GlobalMalloc, MIN_ALIGN},
    platform::{Interrupts, PageSource},
    region::{REGION_HEADER_SIZE, RegionHeader},
    size_class::{MAX_SLAB_SIZE, SIZE_CLASS_COUNT, SIZE_CLASSES, SizeClass},
    slab::{ClassStats, SIGNATURE, SLAB_HEADER_SIZE, SlabHeader, SlabPage},
};
use self::{
    error::{InterruptContextSnafu, TooLargeSnafu},
    lock::{MallocLock, MallocLockGuard},
    platform::InterruptGuard,
    slab::{Slab, SlabPool},
};

pub mod error;
mod global;
mod lock;
pub mod platform;
pub mod region;
pub mod size_class;
pub mod slab;
#[cfg(test)]
mod testing;

/// Size of a page handed out by the [`PageSource`].
pub const PAGE_SIZE: usize = 4096;

/// Mask of the offset bits within a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Byte written over every freed slab object.
pub const POISON_BYTE: u8 = 0xaa;

/// Largest request accepted by [`Malloc::allocate`].
pub const MAX_REQUEST_SIZE: u32 = u32::MAX - REGION_HEADER_SIZE as u32;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_SLAB_SIZE == PAGE_SIZE - SLAB_HEADER_SIZE);
const _: () = assert!(REGION_HEADER_SIZE == 16);

struct Heap<S> {
    slabs: SlabPool,
    pages: S,
}

/// State held while an entry point runs.
///
/// Fields drop in declaration order: the lock is released before interrupts
/// are restored.
struct CriticalSection<'a, S, I>
where
    I: Interrupts,
{
    heap: MallocLockGuard<'a, Heap<S>>,
    _interrupts: InterruptGuard<'a, I>,
}

/// The kernel heap.
pub struct Malloc<S, I>
where
    S: PageSource,
    I: Interrupts,
{
    interrupts: I,
    heap: MallocLock<Heap<S>>,
}

impl<S, I> Malloc<S, I>
where
    S: PageSource,
    I: Interrupts,
{
    /// Creates the heap and seeds one empty slab per size class.
    #[track_caller]
    pub fn new(mut pages: S, interrupts: I) -> Result<Self, MallocError> {
        slab::check_layout()?;
        let slabs = SlabPool::new(&mut pages)?;
        Ok(Self {
            interrupts,
            heap: MallocLock::new(Heap { slabs, pages }),
        })
    }

    #[track_caller]
    fn check_context(&self, operation: &'static str) -> Result<(), MallocError> {
        slab::check_layout()?;
        let depth = self.interrupts.nesting_depth();
        ensure!(depth == 0, InterruptContextSnafu { operation, depth });
        Ok(())
    }

    #[track_caller]
    fn enter(&self, operation: &'static str) -> Result<CriticalSection<'_, S, I>, MallocError> {
        let interrupts = InterruptGuard::disable(&self.interrupts);
        let heap = self.heap.try_lock(operation)?;
        Ok(CriticalSection {
            heap,
            _interrupts: interrupts,
        })
    }

    /// Allocates `size` bytes, aligned to 16 bytes.
    ///
    /// Requests up to [`MAX_SLAB_SIZE`] bytes come from a slab; larger ones
    /// get their own page region.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, MallocError> {
        self.check_context("malloc")?;
        ensure!(
            size <= usize::cast_from(MAX_REQUEST_SIZE),
            TooLargeSnafu { size }
        );

        let mut cs = self.enter("malloc")?;
        let Heap { slabs, pages } = &mut *cs.heap;
        if size > MAX_SLAB_SIZE {
            region::allocate(pages, size)
        } else {
            let class = size_class::class_index(size)?;
            slabs.allocate(class, pages)
        }
    }

    /// Frees memory returned by [`try_allocate`](Self::try_allocate).
    ///
    /// A null pointer is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator that has
    /// not been freed yet. Pointers that do not meet this requirement are
    /// detected on a best-effort basis only.
    pub unsafe fn try_release(&self, ptr: *mut u8) -> Result<(), MallocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        self.check_context("free")?;

        let mut cs = self.enter("free")?;
        let Heap { slabs, pages } = &mut *cs.heap;
        if unsafe { holds_slab(ptr) }? {
            unsafe { slabs.free(ptr) }?;
        } else {
            unsafe { region::free(pages, ptr) }?;
        }
        Ok(())
    }

    /// Number of bytes usable through `ptr`; 0 for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn try_usable_size(&self, ptr: *mut u8) -> Result<usize, MallocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(0);
        };
        self.check_context("malloc_usable_size")?;

        let _cs = self.enter("malloc_usable_size")?;
        if unsafe { holds_slab(ptr) }? {
            unsafe { SlabPool::usable_size(ptr) }
        } else {
            unsafe { region::usable_size(ptr) }
        }
    }

    /// Per-class usage counters.
    pub fn stats(&self) -> Result<[ClassStats; SIZE_CLASS_COUNT], MallocError> {
        self.check_context("stats")?;
        let cs = self.enter("stats")?;
        cs.heap.slabs.stats()
    }

    /// Like [`try_allocate`](Self::try_allocate), but halts on error.
    #[must_use]
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.try_allocate(size)
            .unwrap_or_else(|err| error::report(&err))
    }

    /// Like [`try_release`](Self::try_release), but halts on error.
    ///
    /// # Safety
    ///
    /// See [`try_release`](Self::try_release).
    pub unsafe fn release(&self, ptr: *mut u8) {
        if let Err(err) = unsafe { self.try_release(ptr) } {
            error::report(&err);
        }
    }

    /// Like [`try_usable_size`](Self::try_usable_size), but halts on error.
    ///
    /// # Safety
    ///
    /// See [`try_usable_size`](Self::try_usable_size).
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        unsafe { self.try_usable_size(ptr) }.unwrap_or_else(|err| error::report(&err))
    }
}

/// Tells whether `ptr` lies in a slab page rather than a page region.
///
/// # Safety
///
/// `ptr` must point into a page owned by the allocator.
#[track_caller]
unsafe fn holds_slab(ptr: NonNull<u8>) -> Result<bool, MallocError> {
    let page = unsafe { Slab::containing(ptr) }?;
    Ok(usize::cast_from(page.leading_size()) <= MAX_SLAB_SIZE)
}
