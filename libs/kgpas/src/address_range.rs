// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use crate::{GuestPhysicalAddress, HostPhysicalAddress};

pub trait AddressRangeExt {
    type Address;

    fn from_start_len(start: Self::Address, len: usize) -> Self;

    /// Returns `true` if the range contains no addresses.
    fn is_empty(&self) -> bool;

    /// Returns the length of the address range, in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if there exists an address present in both ranges.
    fn overlaps(&self, other: &Self) -> bool;

    /// Returns an iterator over the start addresses of all `page_size` pages in this range.
    fn pages(&self, page_size: usize) -> Pages<Self::Address>;
}

/// Iterator over the page-sized steps of an address range, see [`AddressRangeExt::pages`].
#[derive(Debug, Clone)]
pub struct Pages<A> {
    range: Range<A>,
    page_size: usize,
}

macro_rules! impl_address_range {
    ($address_ty:ident) => {
        impl AddressRangeExt for Range<$address_ty> {
            type Address = $address_ty;

            fn from_start_len(start: Self::Address, len: usize) -> Self {
                let end = start.add(len);

                Self { start, end }
            }

            fn is_empty(&self) -> bool {
                self.start >= self.end
            }

            fn len(&self) -> usize {
                self.end.offset_from_unsigned(self.start)
            }

            fn overlaps(&self, other: &Self) -> bool {
                self.start < other.end && other.start < self.end
            }

            fn pages(&self, page_size: usize) -> Pages<Self::Address> {
                debug_assert!(self.start.is_aligned_to(page_size));

                Pages {
                    range: self.clone(),
                    page_size,
                }
            }
        }

        impl Iterator for Pages<$address_ty> {
            type Item = $address_ty;

            fn next(&mut self) -> Option<Self::Item> {
                if self.range.start >= self.range.end {
                    return None;
                }

                let page = self.range.start;
                self.range.start = page
                    .checked_add(self.page_size)
                    .unwrap_or(self.range.end);

                Some(page)
            }

            fn size_hint(&self) -> (usize, Option<usize>) {
                let remaining = self
                    .range
                    .end
                    .get()
                    .saturating_sub(self.range.start.get())
                    .div_ceil(self.page_size);

                (remaining, Some(remaining))
            }
        }
    };
}

impl_address_range!(GuestPhysicalAddress);
impl_address_range!(HostPhysicalAddress);

#[cfg(test)]
mod tests {
    use core::ops::Range;

    use super::*;
    use crate::PAGE_SIZE;

    proptest::proptest! {
        #[test]
        fn len(len: usize) {
            let r: Range<GuestPhysicalAddress> = Range::from_start_len(GuestPhysicalAddress::new(0), len);

            proptest::prop_assert_eq!(len, AddressRangeExt::len(&r));
        }

        #[test]
        fn pages_cover_range(start in 0usize..0x10_0000, npages in 0usize..64) {
            let start = GuestPhysicalAddress::new(start).align_down(PAGE_SIZE);
            let r: Range<GuestPhysicalAddress> = Range::from_start_len(start, npages * PAGE_SIZE);

            let pages: Vec<_> = r.pages(PAGE_SIZE).collect();

            proptest::prop_assert_eq!(pages.len(), npages);
            for (i, page) in pages.into_iter().enumerate() {
                proptest::prop_assert_eq!(page, start.add(i * PAGE_SIZE));
            }
        }
    }

    #[test]
    fn overlaps() {
        let a: Range<GuestPhysicalAddress> = Range::from_start_len(GuestPhysicalAddress::new(0), 2 * PAGE_SIZE);
        let b: Range<GuestPhysicalAddress> = Range::from_start_len(GuestPhysicalAddress::new(PAGE_SIZE), PAGE_SIZE);
        let c: Range<GuestPhysicalAddress> = Range::from_start_len(GuestPhysicalAddress::new(2 * PAGE_SIZE), PAGE_SIZE);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
