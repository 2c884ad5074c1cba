//! Slab size classes.
//!
//! Every class is a multiple of 16 bytes and, apart from the 32-byte class,
//! exactly fills the data area of a slab page behind the 64-byte header. The
//! 32-byte class is limited to 64 objects by the single bitmap word, so half
//! of its page stays unused.

use platform_cast::CastFrom as _;
use snafu::OptionExt as _;

use crate::{
    PAGE_SIZE,
    error::{MallocError, NoSizeClassSnafu},
    slab::SLAB_HEADER_SIZE,
};

/// Largest request served from a slab. Anything bigger gets whole pages.
pub const MAX_SLAB_SIZE: usize = 4032;

/// Number of size classes.
pub const SIZE_CLASS_COUNT: usize = 7;

/// Object size and objects-per-page of one slab class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub slab_size: u32,
    pub slab_count: u32,
}

/// The supported size classes, in ascending size order.
pub const SIZE_CLASSES: [SizeClass; SIZE_CLASS_COUNT] = [
    SizeClass::new(32, 64),
    SizeClass::new(64, 63),
    SizeClass::new(192, 21),
    SizeClass::new(448, 9),
    SizeClass::new(1008, 4),
    SizeClass::new(2016, 2),
    SizeClass::new(4032, 1),
];

const _: () = {
    let mut i = 0;
    while i < SIZE_CLASS_COUNT {
        let class = SIZE_CLASSES[i];
        assert!(class.slab_size % 16 == 0);
        assert!(class.slab_count >= 1 && class.slab_count <= u64::BITS);
        assert!(class.object_bytes() <= PAGE_SIZE - SLAB_HEADER_SIZE);
        if i > 0 {
            assert!(SIZE_CLASSES[i - 1].slab_size < class.slab_size);
        }
        i += 1;
    }
    assert!(SIZE_CLASSES[SIZE_CLASS_COUNT - 1].slab_size as usize == MAX_SLAB_SIZE);
};

impl SizeClass {
    const fn new(slab_size: u32, slab_count: u32) -> Self {
        Self {
            slab_size,
            slab_count,
        }
    }

    /// Bytes of the page covered by this class's objects.
    #[must_use]
    pub const fn object_bytes(&self) -> usize {
        self.slab_size as usize * self.slab_count as usize
    }

    /// Allocation bitmap bits in use by this class: the low `slab_count` bits.
    #[must_use]
    pub const fn bitmap_mask(&self) -> u64 {
        u64::MAX >> (u64::BITS - self.slab_count)
    }

    /// Object size as a byte count.
    #[must_use]
    pub fn size(&self) -> usize {
        usize::cast_from(self.slab_size)
    }

    /// Returns the index of the class whose object size is exactly
    /// `slab_size`.
    #[must_use]
    pub fn index_of_slab_size(slab_size: u32) -> Option<usize> {
        SIZE_CLASSES
            .iter()
            .position(|class| class.slab_size == slab_size)
    }
}

/// Maps a request size to the index of the smallest class that holds it.
///
/// Requests above [`MAX_SLAB_SIZE`] are served by page regions and never
/// reach this function through the allocator; they fail with
/// [`MallocError::NoSizeClass`].
#[track_caller]
pub fn class_index(size: usize) -> Result<usize, MallocError> {
    SIZE_CLASSES
        .iter()
        .position(|class| size <= class.size())
        .context(NoSizeClassSnafu { size })
}
