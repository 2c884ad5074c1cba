//! Services the allocator consumes from the kernel it runs in.

use core::ptr::NonNull;

/// Supplier of physical pages.
///
/// Slab pages are acquired one at a time and kept forever; page regions are
/// acquired as a contiguous run and released again when the region is freed.
pub trait PageSource {
    /// Acquires `count` contiguous pages, aligned to [`PAGE_SIZE`].
    ///
    /// Returns `None` when the request cannot be satisfied.
    ///
    /// [`PAGE_SIZE`]: crate::PAGE_SIZE
    fn acquire_pages(&mut self, count: usize) -> Option<NonNull<u8>>;

    /// Returns a run of pages to the source.
    ///
    /// # Safety
    ///
    /// `pages` and `count` must describe a run previously returned by
    /// [`acquire_pages`](Self::acquire_pages) that has not been released
    /// yet, and no live reference into it may remain.
    unsafe fn release_pages(&mut self, pages: NonNull<u8>, count: usize);
}

/// Interrupt state of the current hardware thread.
pub trait Interrupts {
    /// Saved interrupt-enable state.
    type State;

    /// Number of interrupt handlers currently executing on this hardware
    /// thread; non-zero means the caller runs in interrupt context.
    fn nesting_depth(&self) -> usize;

    /// Disables interrupts and returns the previous state.
    fn disable_and_save(&self) -> Self::State;

    /// Restores a state returned by
    /// [`disable_and_save`](Self::disable_and_save).
    fn restore(&self, state: Self::State);
}

/// Keeps interrupts disabled until dropped.
pub(crate) struct InterruptGuard<'a, I>
where
    I: Interrupts,
{
    interrupts: &'a I,
    state: Option<I::State>,
}

impl<'a, I> InterruptGuard<'a, I>
where
    I: Interrupts,
{
    pub(crate) fn disable(interrupts: &'a I) -> Self {
        let state = interrupts.disable_and_save();
        Self {
            interrupts,
            state: Some(state),
        }
    }
}

impl<I> Drop for InterruptGuard<'_, I>
where
    I: Interrupts,
{
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.interrupts.restore(state);
        }
    }
}
