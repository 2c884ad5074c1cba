//! Page regions: requests too large for any slab.
//!
//! A region is a run of contiguous pages whose first 16 bytes hold a
//! [`RegionHeader`]. The caller's pointer starts right after the header.
//! Because every region is larger than [`MAX_SLAB_SIZE`], the `region_size`
//! field overlays a slab's `slab_size` field and tells the two page kinds
//! apart.

use core::{ptr::NonNull, slice};

use dataview::{DataView, Pod};
use log::debug;
use platform_cast::CastFrom as _;
use snafu::{OptionExt as _, ensure};

use crate::{
    PAGE_MASK, PAGE_SIZE,
    error::{
        CorruptRegionSnafu, InvalidRegionFreeSnafu, MallocError, OutOfPagesSnafu, TooLargeSnafu,
    },
    platform::PageSource,
    size_class::MAX_SLAB_SIZE,
};

/// Size of the header in front of every page region.
pub const REGION_HEADER_SIZE: usize = size_of::<RegionHeader>();

/// Header of a page region.
#[repr(C)]
#[derive(Debug, Pod)]
pub struct RegionHeader {
    /// Pages spanned by the region, times [`PAGE_SIZE`], minus the header.
    pub region_size: u32,
    _padding: [u8; 12],
}

const _: () = assert!(REGION_HEADER_SIZE == 16);

/// Number of pages needed to hold `size` bytes behind a region header.
#[must_use]
pub fn pages_for(size: usize) -> usize {
    (size + REGION_HEADER_SIZE).div_ceil(PAGE_SIZE)
}

/// # Safety
///
/// `page` must be the first page of a live region.
unsafe fn header_mut<'a>(page: NonNull<u8>) -> &'a mut RegionHeader {
    let bytes = unsafe { slice::from_raw_parts_mut(page.as_ptr(), REGION_HEADER_SIZE) };
    DataView::from_mut(bytes).get_mut(0)
}

/// # Safety
///
/// `page` must be the first page of a live region.
unsafe fn header<'a>(page: NonNull<u8>) -> &'a RegionHeader {
    let bytes = unsafe { slice::from_raw_parts(page.as_ptr(), REGION_HEADER_SIZE) };
    DataView::from(bytes).get(0)
}

/// Page holding the header of the region `ptr` was returned for.
#[track_caller]
fn region_page(ptr: NonNull<u8>) -> Result<NonNull<u8>, MallocError> {
    let addr = ptr.addr().get();
    ensure!(
        addr & PAGE_MASK == REGION_HEADER_SIZE,
        InvalidRegionFreeSnafu { ptr: addr }
    );
    Ok(unsafe { ptr.sub(REGION_HEADER_SIZE) })
}

/// Page count recorded in a region header.
#[track_caller]
fn region_pages(page: NonNull<u8>) -> Result<usize, MallocError> {
    let region_size = unsafe { header(page) }.region_size;
    let total = usize::cast_from(region_size) + REGION_HEADER_SIZE;
    ensure!(
        usize::cast_from(region_size) > MAX_SLAB_SIZE && total.is_multiple_of(PAGE_SIZE),
        CorruptRegionSnafu {
            region: page.addr().get(),
            region_size,
        }
    );
    Ok(total / PAGE_SIZE)
}

/// Allocates a page region with room for at least `size` bytes.
#[track_caller]
pub(crate) fn allocate<S>(pages: &mut S, size: usize) -> Result<NonNull<u8>, MallocError>
where
    S: PageSource,
{
    let count = pages_for(size);
    let region_size = (count * PAGE_SIZE - REGION_HEADER_SIZE)
        .try_into()
        .ok()
        .context(TooLargeSnafu { size })?;
    let page = pages
        .acquire_pages(count)
        .context(OutOfPagesSnafu { pages: count })?;

    let header = unsafe { header_mut(page) };
    header.region_size = region_size;
    header._padding = [0; 12];
    debug!("region @ {page:p}: {count} pages for {size} bytes");
    Ok(unsafe { page.add(REGION_HEADER_SIZE) })
}

/// Returns the pages of the region `ptr` points into.
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] with the same page source
/// and not freed since.
#[track_caller]
pub(crate) unsafe fn free<S>(pages: &mut S, ptr: NonNull<u8>) -> Result<usize, MallocError>
where
    S: PageSource,
{
    let page = region_page(ptr)?;
    let count = region_pages(page)?;
    debug!("region @ {page:p}: releasing {count} pages");
    unsafe { pages.release_pages(page, count) };
    Ok(count)
}

/// Bytes usable through `ptr`.
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] and not freed since.
#[track_caller]
pub(crate) unsafe fn usable_size(ptr: NonNull<u8>) -> Result<usize, MallocError> {
    let page = region_page(ptr)?;
    region_pages(page)?;
    Ok(usize::cast_from(unsafe { header(page) }.region_size))
}
