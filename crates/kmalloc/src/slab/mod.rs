//! Slab pool: per-class lists of slab pages.
//!
//! Each size class owns a singly-linked list of slab pages, newest first.
//! Allocation only ever looks at the head of the list; when the head is
//! full a fresh slab is pushed in front of it. Slab pages are never given
//! back to the page source, only their objects are recycled.
//!
//! Inside a slab, object `i` lives at `page + SLAB_HEADER_SIZE + i *
//! slab_size` and is allocated exactly when bit `i` of the first bitmap word
//! is set.

use core::{ptr, ptr::NonNull, slice};

use dataview::DataView;
use log::{debug, trace};
use platform_cast::{CastFrom as _, CastInto as _};
use snafu::{OptionExt as _, ensure};

pub use self::header::{SIGNATURE, SLAB_HEADER_SIZE, SlabHeader, SlabPage};
pub(crate) use self::header::check_layout;
use crate::{
    PAGE_MASK, POISON_BYTE,
    error::{
        BadSignatureSnafu, MallocError, MisalignedSnafu, NotAllocatedSnafu, OffsetTooSmallSnafu,
        OutOfPagesSnafu, SlabFullSnafu, SlotOutOfRangeSnafu, UnknownSlabSizeSnafu,
    },
    platform::PageSource,
    size_class::{SIZE_CLASS_COUNT, SIZE_CLASSES, SizeClass},
};

mod header;

/// Returns the index of the lowest slot that is inside `mask` and not set in
/// `bitmap`.
#[must_use]
pub fn lowest_free_slot(bitmap: u64, mask: u64) -> Option<usize> {
    let free = (bitmap ^ mask) & mask;
    (free != 0).then(|| free.trailing_zeros().cast_into())
}

/// Handle to a slab page owned by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slab {
    page: NonNull<u8>,
}

impl Slab {
    /// # Safety
    ///
    /// `page` must be a page-aligned, readable and writable page that the
    /// allocator owns for as long as the handle is used.
    unsafe fn new(page: NonNull<u8>) -> Self {
        debug_assert_eq!(page.addr().get() & PAGE_MASK, 0);
        Self { page }
    }

    /// Returns the slab page containing `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a page handed out by the allocator.
    #[track_caller]
    pub(crate) unsafe fn containing(ptr: NonNull<u8>) -> Result<Self, MallocError> {
        let page = NonNull::new(ptr.as_ptr().map_addr(|addr| addr & !PAGE_MASK))
            .context(BadSignatureSnafu { slab: 0_usize })?;
        Ok(unsafe { Self::new(page) })
    }

    pub(crate) fn addr(self) -> usize {
        self.page.addr().get()
    }

    /// First `u32` of the page, before any validation.
    ///
    /// Slabs store their object size there and page regions their region
    /// size, so the value tells the two apart.
    pub(crate) fn leading_size(self) -> u32 {
        unsafe { self.page.cast::<u32>().read() }
    }

    fn link_value(self) -> u64 {
        u64::cast_from(self.page.as_ptr().expose_provenance())
    }

    fn from_link_value(next: u64) -> Option<Self> {
        let page = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(next.cast_into()))?;
        Some(unsafe { Self::new(page) })
    }

    pub(crate) fn header(&self) -> &SlabHeader {
        let bytes = unsafe { slice::from_raw_parts(self.page.as_ptr(), SLAB_HEADER_SIZE) };
        DataView::from(bytes).get(0)
    }

    fn header_mut(&mut self) -> &mut SlabHeader {
        let bytes = unsafe { slice::from_raw_parts_mut(self.page.as_ptr(), SLAB_HEADER_SIZE) };
        DataView::from_mut(bytes).get_mut(0)
    }

    /// Validated header.
    #[track_caller]
    pub(crate) fn checked_header(&self) -> Result<&SlabHeader, MallocError> {
        let header = self.header();
        header.validate(self.addr())?;
        Ok(header)
    }

    fn object(self, class: &SizeClass, index: usize) -> NonNull<u8> {
        unsafe { self.page.add(SLAB_HEADER_SIZE + index * class.size()) }
    }

    fn next(&self) -> Option<Self> {
        Self::from_link_value(self.header().next)
    }
}

/// Usage counters of one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Object size of the class.
    pub slab_size: u32,
    /// Slab pages owned by the class.
    pub slabs: usize,
    /// Objects currently allocated.
    pub allocated: usize,
    /// Allocations served since initialization.
    pub malloc_count: u64,
    /// Frees since initialization.
    pub free_count: u64,
}

/// List heads of every size class.
pub(crate) struct SlabPool {
    heads: [Option<Slab>; SIZE_CLASS_COUNT],
}

// Only reachable through the allocator lock.
unsafe impl Send for SlabPool {}

impl SlabPool {
    /// Creates a pool with one empty slab per class.
    pub(crate) fn new<S>(pages: &mut S) -> Result<Self, MallocError>
    where
        S: PageSource,
    {
        let mut pool = Self {
            heads: [None; SIZE_CLASS_COUNT],
        };
        for class in 0..SIZE_CLASS_COUNT {
            pool.add_new_slab(class, pages)?;
        }
        Ok(pool)
    }

    /// Converts a fresh page into an empty slab at the head of `class`.
    #[track_caller]
    pub(crate) fn add_new_slab<S>(&mut self, class: usize, pages: &mut S) -> Result<Slab, MallocError>
    where
        S: PageSource,
    {
        let page = pages
            .acquire_pages(1)
            .context(OutOfPagesSnafu { pages: 1_usize })?;
        let mut slab = unsafe { Slab::new(page) };
        let next = self.heads[class].map_or(0, Slab::link_value);
        slab.header_mut().init(&SIZE_CLASSES[class], next);
        self.heads[class] = Some(slab);
        Ok(slab)
    }

    /// Allocates one object of `class`.
    pub(crate) fn allocate<S>(&mut self, class: usize, pages: &mut S) -> Result<NonNull<u8>, MallocError>
    where
        S: PageSource,
    {
        let size_class = &SIZE_CLASSES[class];
        let mask = size_class.bitmap_mask();

        let mut slab = match self.heads[class] {
            Some(slab) => slab,
            None => self.add_new_slab(class, pages)?,
        };
        let header = slab.checked_header()?;

        let index = if let Some(index) = lowest_free_slot(header.allocation_bitmap[0], mask) {
            index
        } else {
            slab = self.add_new_slab(class, pages)?;
            debug!("got new slab @ {:#x} for size {}", slab.addr(), size_class.slab_size);
            let header = slab.header();
            lowest_free_slot(header.allocation_bitmap[0], mask).context(SlabFullSnafu {
                class,
                malloc_count: header.malloc_count,
                free_count: header.free_count,
                bitmap: header.allocation_bitmap[0],
            })?
        };

        let object = slab.object(size_class, index);
        let slab_addr = slab.addr();
        let header = slab.header_mut();
        header.allocation_bitmap[0] |= 1 << index;
        header.malloc_count += 1;
        header.update_checksum();

        trace!(
            "slab={slab_addr:#x} index={index} object={object:p} [{}/{}]",
            header.malloc_count,
            header.free_count
        );
        Ok(object)
    }

    /// Frees an object, poisoning its bytes. Returns the object size.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a slab page of this pool.
    #[track_caller]
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<usize, MallocError> {
        let mut slab = unsafe { Slab::containing(ptr) }?;
        let header = slab.checked_header()?;

        let addr = ptr.addr().get();
        let offset = addr - slab.addr();
        ensure!(
            offset >= SLAB_HEADER_SIZE,
            OffsetTooSmallSnafu { ptr: addr, offset }
        );

        let slab_size = header.slab_size;
        let class = SizeClass::index_of_slab_size(slab_size).context(UnknownSlabSizeSnafu {
            slab: slab.addr(),
            slab_size,
        })?;
        let size_class = &SIZE_CLASSES[class];

        let offset = offset - SLAB_HEADER_SIZE;
        ensure!(
            offset.is_multiple_of(size_class.size()),
            MisalignedSnafu {
                ptr: addr,
                slab_size,
                offset,
            }
        );
        let index = offset / size_class.size();
        ensure!(
            index < usize::cast_from(size_class.slab_count),
            SlotOutOfRangeSnafu {
                ptr: addr,
                index,
                slab_count: size_class.slab_count,
            }
        );

        let bit = 1_u64 << index;
        let bitmap = header.allocation_bitmap[0];
        ensure!(
            bitmap & bit != 0,
            NotAllocatedSnafu {
                ptr: addr,
                bitmap,
                mask: bit,
            }
        );

        let slab_addr = slab.addr();
        let header = slab.header_mut();
        header.allocation_bitmap[0] &= !bit;
        header.free_count += 1;
        unsafe { ptr.write_bytes(POISON_BYTE, size_class.size()) };
        header.update_checksum();

        trace!(
            "slab={slab_addr:#x} index={index} freed [{}/{}]",
            header.malloc_count,
            header.free_count
        );
        Ok(size_class.size())
    }

    /// Object size of the slab containing `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a slab page of this pool.
    #[track_caller]
    pub(crate) unsafe fn usable_size(ptr: NonNull<u8>) -> Result<usize, MallocError> {
        let slab = unsafe { Slab::containing(ptr) }?;
        let header = slab.checked_header()?;
        Ok(usize::cast_from(header.slab_size))
    }

    /// Walks every slab of every class and sums up its counters.
    pub(crate) fn stats(&self) -> Result<[ClassStats; SIZE_CLASS_COUNT], MallocError> {
        let mut stats = [ClassStats::default(); SIZE_CLASS_COUNT];
        for ((class_stats, size_class), head) in stats.iter_mut().zip(&SIZE_CLASSES).zip(&self.heads) {
            class_stats.slab_size = size_class.slab_size;
            let mut cursor = *head;
            while let Some(slab) = cursor {
                let header = slab.checked_header()?;
                class_stats.slabs += 1;
                class_stats.allocated += usize::cast_from(header.allocation_bitmap[0].count_ones());
                class_stats.malloc_count += header.malloc_count;
                class_stats.free_count += header.free_count;
                cursor = slab.next();
            }
        }
        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) fn head(&self, class: usize) -> Option<Slab> {
        self.heads[class]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPages;

    fn with_pool<F>(test_fn: F)
    where
        F: FnOnce(&mut SlabPool, &mut TestPages),
    {
        let mut pages = TestPages::new();
        let mut pool = SlabPool::new(&mut pages).unwrap();
        test_fn(&mut pool, &mut pages);
    }

    #[test]
    fn test_lowest_free_slot() {
        assert_eq!(lowest_free_slot(0, 0b1111), Some(0));
        assert_eq!(lowest_free_slot(0b0111, 0b1111), Some(3));
        assert_eq!(lowest_free_slot(0b1011, 0b1111), Some(2));
        assert_eq!(lowest_free_slot(0b1111, 0b1111), None);
        assert_eq!(lowest_free_slot(u64::MAX, u64::MAX), None);
        assert_eq!(lowest_free_slot(u64::MAX >> 1, u64::MAX), Some(63));
        // bits beyond the mask are never free
        assert_eq!(lowest_free_slot(0b0001, 0b0001), None);
    }

    #[test]
    fn test_new_pool_has_one_slab_per_class() {
        with_pool(|pool, pages| {
            assert_eq!(pages.live_pages(), SIZE_CLASS_COUNT);
            for (class, size_class) in SIZE_CLASSES.iter().enumerate() {
                let slab = pool.head(class).unwrap();
                let header = slab.checked_header().unwrap();
                assert_eq!(header.slab_size, size_class.slab_size);
                assert_eq!(header.allocation_bitmap, [0, 0]);
                assert_eq!(header.next, 0);
                assert_eq!(header.lock, 0);
            }
        });
    }

    #[test]
    fn test_allocate_first_fit() {
        with_pool(|pool, pages| {
            let slab = pool.head(2).unwrap();
            let a = pool.allocate(2, pages).unwrap();
            let b = pool.allocate(2, pages).unwrap();
            assert_eq!(a.addr().get(), slab.addr() + SLAB_HEADER_SIZE);
            assert_eq!(b.addr().get(), slab.addr() + SLAB_HEADER_SIZE + 192);
            assert_eq!(slab.header().allocation_bitmap[0], 0b11);
            assert_eq!(slab.header().malloc_count, 2);

            unsafe { pool.free(a).unwrap() };
            let c = pool.allocate(2, pages).unwrap();
            assert_eq!(c, a);
        });
    }

    #[test]
    fn test_free_poisons_and_counts() {
        with_pool(|pool, pages| {
            let ptr = pool.allocate(1, pages).unwrap();
            unsafe {
                ptr.write_bytes(0x33, 64);
                assert_eq!(pool.free(ptr).unwrap(), 64);
                for i in 0..64 {
                    assert_eq!(ptr.add(i).read(), POISON_BYTE);
                }
            }
            let slab = pool.head(1).unwrap();
            let header = slab.checked_header().unwrap();
            assert_eq!(header.allocation_bitmap[0], 0);
            assert_eq!(header.malloc_count, 1);
            assert_eq!(header.free_count, 1);
        });
    }

    #[test]
    fn test_full_slab_grows_pool() {
        with_pool(|pool, pages| {
            let first = pool.head(5).unwrap();
            let a = pool.allocate(5, pages).unwrap();
            let _b = pool.allocate(5, pages).unwrap();
            assert_eq!(pool.head(5), Some(first));
            let c = pool.allocate(5, pages).unwrap();

            let second = pool.head(5).unwrap();
            assert_ne!(second, first);
            assert_eq!(second.header().next, first.link_value());
            assert_eq!(c.addr().get(), second.addr() + SLAB_HEADER_SIZE);
            assert_eq!(pages.live_pages(), SIZE_CLASS_COUNT + 1);

            // freeing into the old slab does not make it the head again
            unsafe { pool.free(a).unwrap() };
            let d = pool.allocate(5, pages).unwrap();
            let owner = unsafe { Slab::containing(d) }.unwrap();
            assert_eq!(owner, second);
            assert_ne!(d, a);
        });
    }

    #[test]
    fn test_free_rejects_header_offset() {
        with_pool(|pool, pages| {
            let ptr = pool.allocate(0, pages).unwrap();
            let inside_header = unsafe { ptr.sub(8) };
            let err = unsafe { pool.free(inside_header) }.unwrap_err();
            assert!(matches!(err, MallocError::OffsetTooSmall { offset: 56, .. }));
        });
    }

    #[test]
    fn test_free_rejects_misaligned_pointer() {
        with_pool(|pool, pages| {
            let ptr = pool.allocate(3, pages).unwrap();
            let err = unsafe { pool.free(ptr.add(16)) }.unwrap_err();
            assert!(matches!(
                err,
                MallocError::Misaligned {
                    slab_size: 448,
                    offset: 16,
                    ..
                }
            ));
            // still allocated after the rejected free
            assert_eq!(pool.head(3).unwrap().header().allocation_bitmap[0], 1);
        });
    }

    #[test]
    fn test_free_rejects_slot_beyond_bitmap() {
        with_pool(|pool, pages| {
            let ptr = pool.allocate(0, pages).unwrap();
            // 32-byte slot 64 lies inside the page but past the bitmap word
            let beyond = unsafe { ptr.add(64 * 32) };
            let err = unsafe { pool.free(beyond) }.unwrap_err();
            assert!(matches!(
                err,
                MallocError::SlotOutOfRange {
                    index: 64,
                    slab_count: 64,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_double_free_detected() {
        with_pool(|pool, pages| {
            let ptr = pool.allocate(4, pages).unwrap();
            unsafe { pool.free(ptr).unwrap() };
            let err = unsafe { pool.free(ptr) }.unwrap_err();
            assert!(matches!(
                err,
                MallocError::NotAllocated {
                    bitmap: 0,
                    mask: 1,
                    ..
                }
            ));
            let slab = pool.head(4).unwrap();
            let header = slab.checked_header().unwrap();
            assert_eq!(header.free_count, 1);
        });
    }

    #[test]
    fn test_corrupted_head_is_rejected() {
        with_pool(|pool, pages| {
            let mut slab = pool.head(1).unwrap();
            slab.header_mut().allocation_bitmap[0] |= 1 << 7;
            let err = pool.allocate(1, pages).unwrap_err();
            assert!(matches!(err, MallocError::BadChecksum { .. }));
        });
    }

    #[test]
    fn test_out_of_pages() {
        let mut pages = TestPages::with_limit(SIZE_CLASS_COUNT);
        let mut pool = SlabPool::new(&mut pages).unwrap();
        pool.allocate(6, &mut pages).unwrap();
        let err = pool.allocate(6, &mut pages).unwrap_err();
        assert!(matches!(err, MallocError::OutOfPages { pages: 1, .. }));
    }

    #[test]
    fn test_stats() {
        with_pool(|pool, pages| {
            let ptrs = (0..3)
                .map(|_| pool.allocate(6, pages).unwrap())
                .collect::<Vec<_>>();
            unsafe { pool.free(ptrs[1]).unwrap() };

            let stats = pool.stats().unwrap();
            assert_eq!(
                stats[6],
                ClassStats {
                    slab_size: 4032,
                    slabs: 3,
                    allocated: 2,
                    malloc_count: 3,
                    free_count: 1,
                }
            );
            assert_eq!(stats[0].slabs, 1);
            assert_eq!(stats[0].allocated, 0);
        });
    }
}
