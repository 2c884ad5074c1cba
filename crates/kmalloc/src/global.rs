use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use snafu::{OptionExt as _, ensure};
use spin::Once;

use crate::{
    Malloc,
    error::{self, AlreadyInitializedSnafu, MallocError, NotInitializedSnafu},
    platform::{Interrupts, PageSource},
};

/// Alignment of every pointer returned by the allocator.
pub const MIN_ALIGN: usize = 16;

/// A [`Malloc`] usable as `#[global_allocator]`.
///
/// The static is created empty and must be initialized once with
/// [`init`](Self::init) before the first allocation.
pub struct GlobalMalloc<S, I>
where
    S: PageSource,
    I: Interrupts,
{
    malloc: Once<Malloc<S, I>>,
}

impl<S, I> GlobalMalloc<S, I>
where
    S: PageSource,
    I: Interrupts,
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            malloc: Once::new(),
        }
    }

    /// Creates the heap.
    #[track_caller]
    pub fn init(&self, pages: S, interrupts: I) -> Result<(), MallocError> {
        let mut fresh = false;
        self.malloc.try_call_once(|| {
            fresh = true;
            Malloc::new(pages, interrupts)
        })?;
        ensure!(fresh, AlreadyInitializedSnafu);
        Ok(())
    }

    #[track_caller]
    pub fn get(&self) -> Result<&Malloc<S, I>, MallocError> {
        self.malloc.get().context(NotInitializedSnafu)
    }

    fn malloc(&self) -> &Malloc<S, I> {
        self.get().unwrap_or_else(|err| error::report(&err))
    }
}

impl<S, I> Default for GlobalMalloc<S, I>
where
    S: PageSource,
    I: Interrupts,
{
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<S, I> GlobalAlloc for GlobalMalloc<S, I>
where
    S: PageSource,
    I: Interrupts,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return ptr::null_mut();
        }
        self.malloc().allocate(layout.size()).as_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.malloc().release(ptr) }
    }
}
