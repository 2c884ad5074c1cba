//! Host-side stand-ins for the kernel services used in unit tests.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    vec::Vec,
};

use crate::{
    PAGE_SIZE,
    platform::{Interrupts, PageSource},
};

#[derive(Default)]
struct PageState {
    live: Vec<(NonNull<u8>, usize)>,
    acquire_calls: usize,
    limit: Option<usize>,
}

impl PageState {
    fn live_pages(&self) -> usize {
        self.live.iter().map(|&(_, count)| count).sum()
    }
}

impl Drop for PageState {
    fn drop(&mut self) {
        for (pages, count) in self.live.drain(..) {
            unsafe { alloc::dealloc(pages.as_ptr(), run_layout(count)) };
        }
    }
}

unsafe impl Send for PageState {}

fn run_layout(count: usize) -> Layout {
    Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// Page source backed by the host allocator.
///
/// Clones share the same state, so a test can keep a handle after moving
/// one into the allocator.
#[derive(Clone, Default)]
pub(crate) struct TestPages {
    state: Arc<Mutex<PageState>>,
}

impl TestPages {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a source that hands out at most `limit` pages at a time.
    pub(crate) fn with_limit(limit: usize) -> Self {
        let pages = Self::new();
        pages.state().limit = Some(limit);
        pages
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap()
    }

    /// Pages currently handed out.
    pub(crate) fn live_pages(&self) -> usize {
        self.state().live_pages()
    }

    /// Number of successful `acquire_pages` calls.
    pub(crate) fn acquire_calls(&self) -> usize {
        self.state().acquire_calls
    }
}

impl PageSource for TestPages {
    fn acquire_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        let mut state = self.state();
        if state
            .limit
            .is_some_and(|limit| state.live_pages() + count > limit)
        {
            return None;
        }
        let pages = NonNull::new(unsafe { alloc::alloc(run_layout(count)) })?;
        // garbage, so nothing relies on zeroed pages
        unsafe { pages.as_ptr().write_bytes(0x11, count * PAGE_SIZE) };
        state.live.push((pages, count));
        state.acquire_calls += 1;
        Some(pages)
    }

    unsafe fn release_pages(&mut self, pages: NonNull<u8>, count: usize) {
        let mut state = self.state();
        let index = state
            .live
            .iter()
            .position(|&(p, _)| p == pages)
            .expect("released pages were never acquired");
        let (_, acquired) = state.live.swap_remove(index);
        assert_eq!(acquired, count, "released page count differs");
        unsafe { alloc::dealloc(pages.as_ptr(), run_layout(count)) };
    }
}

/// Interrupt controller model with an adjustable nesting depth.
#[derive(Debug)]
pub(crate) struct TestInterrupts {
    depth: AtomicUsize,
    enabled: AtomicBool,
    restores: AtomicUsize,
}

impl TestInterrupts {
    pub(crate) fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
            restores: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_nesting_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn restore_count(&self) -> usize {
        self.restores.load(Ordering::Relaxed)
    }
}

impl Interrupts for TestInterrupts {
    type State = bool;

    fn nesting_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn disable_and_save(&self) -> bool {
        self.enabled.swap(false, Ordering::Relaxed)
    }

    fn restore(&self, state: bool) {
        assert!(!self.is_enabled(), "restoring while interrupts are enabled");
        self.enabled.store(state, Ordering::Relaxed);
        self.restores.fetch_add(1, Ordering::Relaxed);
    }
}
