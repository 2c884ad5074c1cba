//! Fatal allocator errors.
//!
//! Nothing in this crate recovers from a [`MallocError`]: every variant
//! describes a broken invariant (a corrupted heap, an invalid free, an entry
//! from the wrong context). Internally errors are plain values so that `?`
//! unwinds the critical section and restores the lock and interrupt state;
//! the infallible entry points then hand the error to [`report`], which
//! halts.

use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

use crate::PAGE_SIZE;

/// Source location where an error was raised.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors raised by the allocator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MallocError {
    #[snafu(display("slab page is {size} bytes, expected {PAGE_SIZE}"))]
    Layout {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{operation} called in interrupt handler (nesting depth {depth})"))]
    InterruptContext {
        operation: &'static str,
        depth: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("({operation}) malloc lock != 0 on entry (state {state})"))]
    LockHeld {
        operation: &'static str,
        state: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("trying to allocate {size} bytes"))]
    TooLarge {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no size class can hold {size} bytes"))]
    NoSizeClass {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("slab @ {slab:#x} is not a slab"))]
    BadSignature {
        slab: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "slab @ {slab:#x} has invalid checksum (stored {stored:#018x}, computed {computed:#018x})"
    ))]
    BadChecksum {
        slab: usize,
        stored: u64,
        computed: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("slab @ {slab:#x} has unknown slab size {slab_size}"))]
    UnknownSlabSize {
        slab: usize,
        slab_size: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free({ptr:#x}) offset = {offset}"))]
    OffsetTooSmall {
        ptr: usize,
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "free({ptr:#x}) is not on a valid boundary for slab size of {slab_size} ({offset:#x})"
    ))]
    Misaligned {
        ptr: usize,
        slab_size: u32,
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free({ptr:#x}) is slot {index} of a slab holding {slab_count} objects"))]
    SlotOutOfRange {
        ptr: usize,
        index: usize,
        slab_count: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{ptr:#x} is not allocated, alloc={bitmap:#x} mask={mask:#x}"))]
    NotAllocated {
        ptr: usize,
        bitmap: u64,
        mask: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "new slab for idx:{class} has filled up [{malloc_count}/{free_count}/{bitmap:#x}]"
    ))]
    SlabFull {
        class: usize,
        malloc_count: u64,
        free_count: u64,
        bitmap: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page source cannot provide {pages} pages"))]
    OutOfPages {
        pages: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free({ptr:#x}) does not point at the start of a page region"))]
    InvalidRegionFree {
        ptr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region @ {region:#x} has corrupted size {region_size}"))]
    CorruptRegion {
        region: usize,
        region_size: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocator used before initialization"))]
    NotInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocator initialized twice"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
}

impl MallocError {
    /// Returns where the error was raised.
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::Layout { location, .. }
            | Self::InterruptContext { location, .. }
            | Self::LockHeld { location, .. }
            | Self::TooLarge { location, .. }
            | Self::NoSizeClass { location, .. }
            | Self::BadSignature { location, .. }
            | Self::BadChecksum { location, .. }
            | Self::UnknownSlabSize { location, .. }
            | Self::OffsetTooSmall { location, .. }
            | Self::Misaligned { location, .. }
            | Self::SlotOutOfRange { location, .. }
            | Self::NotAllocated { location, .. }
            | Self::SlabFull { location, .. }
            | Self::OutOfPages { location, .. }
            | Self::InvalidRegionFree { location, .. }
            | Self::CorruptRegion { location, .. }
            | Self::NotInitialized { location }
            | Self::AlreadyInitialized { location } => location,
        }
    }
}

/// Formats an error together with the location it was raised at.
pub struct Report<'a> {
    error: &'a MallocError,
}

impl fmt::Debug for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        writeln!(f, "  at {}", self.error.location())
    }
}

impl<'a> Report<'a> {
    #[must_use]
    pub fn new(error: &'a MallocError) -> Self {
        Self { error }
    }
}

/// Halts with a report of `err`.
///
/// The workspace is built with `panic = "abort"`; the kernel's panic handler
/// prints the message and stops the machine.
#[track_caller]
pub fn report(err: &MallocError) -> ! {
    panic!("malloc: critical error occurred\n\n{}", Report::new(err));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_names_pointer_and_location() {
        let err = NotAllocatedSnafu {
            ptr: 0x8000_0040_usize,
            bitmap: 0_u64,
            mask: 1_u64,
        }
        .build();
        let text = Report::new(&err).to_string();
        assert!(text.contains("0x80000040 is not allocated"));
        assert!(text.contains("error.rs"));
    }

    #[test]
    #[should_panic(expected = "slab @ 0x1000 is not a slab")]
    fn test_report_halts() {
        let err = BadSignatureSnafu { slab: 0x1000_usize }.build();
        report(&err);
    }
}
