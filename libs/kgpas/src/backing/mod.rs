// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod contiguous;
#[cfg(feature = "emulate")]
mod emulate;

use core::ops::Range;

pub use contiguous::ContiguousBacking;
#[cfg(feature = "emulate")]
pub use emulate::EmulatedBacking;

use crate::{Error, HostPhysicalAddress, PAGE_SIZE, PageFaultFlags};

/// A memory object owning the host pages that make up a guest's RAM.
///
/// Backing objects are shared between the guest's memory allocator and its
/// [`GuestPhysicalAddressSpace`][crate::GuestPhysicalAddressSpace]. Only the backing object itself
/// may materialize or free its pages, the address space merely installs translations pointing at
/// them.
pub trait BackingMemory {
    /// The size of the object in bytes, always a multiple of [`PAGE_SIZE`].
    fn size(&self) -> usize;

    /// Resolves the pages covering the object offsets in `range`.
    ///
    /// `f` is called once per page, in ascending order, with the byte offset of the page within
    /// the object, the index of the page within `range` and the host page backing it. If `f`
    /// returns an error, resolution stops and the error is returned.
    ///
    /// `flags` describes the access the pages are resolved for. A write access forces the object
    /// to materialize pages that are not yet backed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `range` is not page aligned or exceeds the object, if a page cannot be
    /// materialized, or if `f` fails.
    fn lookup(
        &self,
        range: Range<usize>,
        flags: PageFaultFlags,
        f: &mut dyn FnMut(usize, usize, HostPhysicalAddress) -> crate::Result<()>,
    ) -> crate::Result<()>;
}

/// Checks that `range` is a page aligned range of offsets inside an object of `size` bytes.
pub(crate) fn check_offsets(range: &Range<usize>, size: usize) -> crate::Result<()> {
    crate::ensure!(
        range.start % PAGE_SIZE == 0 && range.end % PAGE_SIZE == 0,
        Error::InvalidArgument
    );
    crate::ensure!(
        range.start <= range.end && range.end <= size,
        Error::OutOfRange {
            start: range.start,
            end: range.end,
            limit: size,
        }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets() {
        assert_eq!(check_offsets(&(0..PAGE_SIZE), PAGE_SIZE), Ok(()));
        assert_eq!(check_offsets(&(PAGE_SIZE..PAGE_SIZE), PAGE_SIZE), Ok(()));
        assert_eq!(
            check_offsets(&(0..PAGE_SIZE + 1), 2 * PAGE_SIZE),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            check_offsets(&(0..2 * PAGE_SIZE), PAGE_SIZE),
            Err(Error::OutOfRange {
                start: 0,
                end: 2 * PAGE_SIZE,
                limit: PAGE_SIZE,
            })
        );
    }
}
