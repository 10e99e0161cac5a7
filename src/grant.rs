//! Two-level encoding of grant references through directory pages.
//!
//! The store bounds an advertised value to about a kilobyte, far too small
//! for a per-page grant list that can run to thousands of entries. The
//! backend therefore writes the full list into a short run of directory
//! pages, grants those pages too, and advertises only the directory
//! references. The frontend maps the directory, copies the data references
//! back out, unmaps the directory, and finally maps the data pages.

use alloc::vec::Vec;
use core::{mem, ptr::NonNull};

use arrayvec::ArrayVec;

use crate::{
    error::{Error, Result},
    platform::{DomainId, GrantTable, MapFlags, PAGE_SIZE, PageFrames},
};

/// Opaque handle issued when one domain grants another read access to a
/// single page of its memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GrantRef(pub u32);

/// Grant references carried by one directory page.
pub const GRANTS_PER_PAGE: usize = PAGE_SIZE / mem::size_of::<GrantRef>();

/// Hard cap on directory pages per session. Keeps the advertised list
/// within the store's value limit while still covering
/// `MAX_DIR_PAGES * GRANTS_PER_PAGE` data pages.
pub const MAX_DIR_PAGES: usize = 128;

/// Directory pages needed to carry references for `total_pages` data pages.
pub fn dir_pages_for(total_pages: usize) -> usize {
    (total_pages * mem::size_of::<GrantRef>()).div_ceil(PAGE_SIZE)
}

/// Allocation order for a run of at least `pages` contiguous pages.
pub fn alloc_order(pages: usize) -> u32 {
    pages.next_power_of_two().trailing_zeros()
}

/// Writes `grants` into the directory pages at `dir` and grants each
/// directory page to `to`, returning the directory references in order.
///
/// `dir` must point at `dir_pages` contiguous writable pages owned by the
/// calling domain, where `dir_pages` matches [`dir_pages_for`] the grant
/// count and is at most [`MAX_DIR_PAGES`]. A mismatch is a caller bug and
/// panics.
pub fn encode<P>(
    platform: &P,
    to: DomainId,
    grants: &[GrantRef],
    dir: NonNull<u8>,
    dir_pages: usize,
) -> ArrayVec<GrantRef, MAX_DIR_PAGES>
where
    P: PageFrames + GrantTable,
{
    assert_eq!(dir_pages, dir_pages_for(grants.len()));
    assert!(dir_pages <= MAX_DIR_PAGES);

    // Slot i is page i / GRANTS_PER_PAGE, index i % GRANTS_PER_PAGE, which
    // over a contiguous run is plain offset i.
    let slots = dir.cast::<GrantRef>();
    for (i, gref) in grants.iter().enumerate() {
        unsafe { slots.add(i).write(*gref) };
    }

    let mut directory = ArrayVec::new();
    for page in 0..dir_pages {
        let virt = unsafe { dir.add(page * PAGE_SIZE) };
        directory.push(platform.grant_read(to, platform.virt_to_mfn(virt)));
    }
    directory
}

/// Maps the directory pages read-only, copies out the first `expected`
/// data-page references, and unmaps the directory again.
pub fn decode<P>(
    platform: &P,
    from: DomainId,
    directory: &[GrantRef],
    expected: usize,
) -> Result<Vec<GrantRef>>
where
    P: GrantTable,
{
    if directory.len() * GRANTS_PER_PAGE < expected {
        return Err(Error::Truncated);
    }

    let base = platform
        .map_batch(from, directory, MapFlags::READ)
        .ok_or(Error::MapFailed)?;

    let slots = base.cast::<GrantRef>();
    let mut grants = Vec::with_capacity(expected);
    for i in 0..expected {
        grants.push(unsafe { slots.add(i).read() });
    }

    platform.unmap(base, directory.len());
    Ok(grants)
}
