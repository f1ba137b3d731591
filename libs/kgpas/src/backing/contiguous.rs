// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use crate::backing::{BackingMemory, check_offsets};
use crate::{AddressRangeExt, Error, HostPhysicalAddress, PAGE_SIZE, PageFaultFlags};

/// A backing object over one physically contiguous, already pinned range of host memory.
///
/// Every page is resident for the entire lifetime of the object, so the fault flags passed to
/// [`lookup`][BackingMemory::lookup] are irrelevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousBacking {
    range: Range<HostPhysicalAddress>,
}

impl ContiguousBacking {
    /// # Errors
    ///
    /// Returns `Err(Error::InvalidArgument)` if `range` is empty or not page aligned.
    pub fn new(range: Range<HostPhysicalAddress>) -> crate::Result<Self> {
        crate::ensure!(
            !range.is_empty()
                && range.start.is_aligned_to(PAGE_SIZE)
                && range.end.is_aligned_to(PAGE_SIZE),
            Error::InvalidArgument
        );

        Ok(Self { range })
    }
}

impl BackingMemory for ContiguousBacking {
    fn size(&self) -> usize {
        self.range.len()
    }

    fn lookup(
        &self,
        range: Range<usize>,
        _flags: PageFaultFlags,
        f: &mut dyn FnMut(usize, usize, HostPhysicalAddress) -> crate::Result<()>,
    ) -> crate::Result<()> {
        check_offsets(&range, self.size())?;

        for (index, offset) in range.step_by(PAGE_SIZE).enumerate() {
            f(offset, index, self.range.start.add(offset))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn backing() -> ContiguousBacking {
        ContiguousBacking::new(Range::<HostPhysicalAddress>::from_start_len(
            HostPhysicalAddress::new(0x8000_0000),
            4 * PAGE_SIZE,
        ))
        .unwrap()
    }

    #[test_log::test]
    fn resolves_every_page() {
        let backing = backing();
        let mut pages = Vec::new();

        backing
            .lookup(
                PAGE_SIZE..3 * PAGE_SIZE,
                PageFaultFlags::new(),
                &mut |offset, index, host| {
                    pages.push((offset, index, host));
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(
            pages,
            [
                (PAGE_SIZE, 0, HostPhysicalAddress::new(0x8000_1000)),
                (2 * PAGE_SIZE, 1, HostPhysicalAddress::new(0x8000_2000)),
            ]
        );
    }

    #[test_log::test]
    fn callback_error_aborts() {
        let backing = backing();
        let mut calls = 0;

        let res = backing.lookup(0..4 * PAGE_SIZE, PageFaultFlags::new(), &mut |offset, _, _| {
            calls += 1;
            if offset == PAGE_SIZE {
                Err(Error::OutOfMemory)
            } else {
                Ok(())
            }
        });

        assert_eq!(res, Err(Error::OutOfMemory));
        assert_eq!(calls, 2);
    }

    #[test]
    fn rejects_unaligned() {
        assert_eq!(
            ContiguousBacking::new(
                HostPhysicalAddress::new(0x1000)..HostPhysicalAddress::new(0x1800)
            ),
            Err(Error::InvalidArgument)
        );
    }
}
