//! Slab page header layout and its integrity check.
//!
//! ```text
//! offset  field
//!      0  slab_size          u32
//!      4  lock               u32      reserved, always 0
//!      8  next               u64      address of the next slab of the class
//!     16  malloc_count       u64
//!     24  free_count         u64
//!     32  allocation_bitmap  [u64; 2] only word 0 is used
//!     48  signature          [u8; 8]  b"MALLOC\0\0"
//!     56  checksum           u64      XOR of the seven words above
//!     64  data               4032 bytes of objects
//! ```

use core::mem::offset_of;

use dataview::{DataView, Pod};
use snafu::ensure;

use crate::{
    PAGE_SIZE,
    error::{BadChecksumSnafu, BadSignatureSnafu, LayoutSnafu, MallocError},
    size_class::{MAX_SLAB_SIZE, SizeClass},
};

/// Tag written into every slab header.
pub const SIGNATURE: [u8; 8] = *b"MALLOC\0\0";

/// Size of the header at the start of every slab page.
pub const SLAB_HEADER_SIZE: usize = size_of::<SlabHeader>();

/// Number of leading 64-bit words folded into the checksum.
const CHECKSUM_WORDS: usize = offset_of!(SlabHeader, checksum) / size_of::<u64>();

/// Header of a slab page.
#[repr(C)]
#[derive(custom_debug_derive::Debug, Pod)]
pub struct SlabHeader {
    pub slab_size: u32,
    pub lock: u32,
    #[debug(format = "{:#x}")]
    pub next: u64,
    pub malloc_count: u64,
    pub free_count: u64,
    #[debug(format = "{:x?}")]
    pub allocation_bitmap: [u64; 2],
    pub signature: [u8; 8],
    #[debug(format = "{:#018x}")]
    pub checksum: u64,
}

const _: () = assert!(SLAB_HEADER_SIZE == 64);
const _: () = assert!(offset_of!(SlabHeader, signature) == 48);
const _: () = assert!(CHECKSUM_WORDS == 7);

/// A whole slab page: header followed by the object area.
#[repr(C, align(4096))]
pub struct SlabPage {
    pub header: SlabHeader,
    pub data: [u8; MAX_SLAB_SIZE],
}

const _: () = assert!(size_of::<SlabPage>() == PAGE_SIZE);
const _: () = assert!(offset_of!(SlabPage, data) == SLAB_HEADER_SIZE);

/// Checks that a slab page is exactly one page.
#[track_caller]
pub(crate) fn check_layout() -> Result<(), MallocError> {
    let size = size_of::<SlabPage>();
    ensure!(size == PAGE_SIZE, LayoutSnafu { size });
    Ok(())
}

impl SlabHeader {
    /// Turns the header into the head of an empty slab of `class`, linked in
    /// front of the slab at address `next`.
    pub(crate) fn init(&mut self, class: &SizeClass, next: u64) {
        self.slab_size = class.slab_size;
        self.lock = 0;
        self.next = next;
        self.malloc_count = 0;
        self.free_count = 0;
        self.allocation_bitmap = [0; 2];
        self.signature = SIGNATURE;
        self.update_checksum();
    }

    /// XOR of the first seven native-endian words of the header image.
    #[must_use]
    pub fn compute_checksum(&self) -> u64 {
        let view = DataView::from(self);
        (0..CHECKSUM_WORDS)
            .map(|i| view.read::<u64>(i * size_of::<u64>()))
            .fold(0, |checksum, word| checksum ^ word)
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Rejects a header whose signature or checksum is wrong.
    ///
    /// `slab` is the header's address, used for the diagnostic.
    #[track_caller]
    pub fn validate(&self, slab: usize) -> Result<(), MallocError> {
        ensure!(self.signature == SIGNATURE, BadSignatureSnafu { slab });
        let computed = self.compute_checksum();
        ensure!(
            computed == self.checksum,
            BadChecksumSnafu {
                slab,
                stored: self.checksum,
                computed,
            }
        );
        Ok(())
    }
}
