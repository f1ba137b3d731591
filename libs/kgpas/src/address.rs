// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

macro_rules! impl_address {
    ($address_ty:ident) => {
        impl $address_ty {
            pub const MAX: Self = Self(usize::MAX);
            pub const MIN: Self = Self(usize::MIN);

            #[must_use]
            pub const fn new(n: usize) -> Self {
                Self(n)
            }

            #[inline]
            pub const fn get(&self) -> usize {
                self.0
            }

            /// Adds an unsigned offset to this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset)
            }

            /// Adds an unsigned offset to this address, returning `None` if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(n) => Some(Self(n)),
                    None => None,
                }
            }

            /// Calculates the distance between two addresses in bytes, _where it’s known that `self`
            /// is equal to or greater than `origin`_.
            ///
            /// # Panics
            ///
            /// Panics if `self` is less than `origin`.
            #[must_use]
            #[inline]
            pub const fn offset_from_unsigned(self, origin: Self) -> usize {
                let (a, b) = self.0.overflowing_sub(origin.0);
                if b {
                    panic!("attempt to subtract with overflow")
                } else {
                    a
                }
            }

            #[must_use]
            #[inline]
            pub const fn is_aligned_to(&self, align: usize) -> bool {
                assert!(
                    align.is_power_of_two(),
                    "is_aligned_to: align is not a power-of-two"
                );

                self.0 & (align - 1) == 0
            }

            #[must_use]
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(
                    align.is_power_of_two(),
                    "align_down: align is not a power-of-two"
                );

                let aligned = Self(self.0 & 0usize.wrapping_sub(align));
                debug_assert!(aligned.0 <= self.0);
                aligned
            }

            /// Returns the offset of this address into its `align`-sized block.
            #[must_use]
            #[inline]
            pub const fn offset_in(self, align: usize) -> usize {
                assert!(
                    align.is_power_of_two(),
                    "offset_in: align is not a power-of-two"
                );

                self.0 & (align - 1)
            }
        }

        impl ::core::fmt::Display for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
            }
        }

        impl ::core::fmt::Debug for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.debug_tuple(stringify!($address_ty))
                    .field(&format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
                    .finish()
            }
        }

        impl ::core::fmt::LowerHex for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// An address in the coordinate space the guest believes to be its physical memory.
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestPhysicalAddress(usize);
impl_address!(GuestPhysicalAddress);

/// An address in the physical memory of the host machine.
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostPhysicalAddress(usize);
impl_address!(HostPhysicalAddress);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn alignment() {
        let addr = GuestPhysicalAddress::new(0x1234_5678);

        assert!(!addr.is_aligned_to(PAGE_SIZE));
        assert_eq!(addr.align_down(PAGE_SIZE), GuestPhysicalAddress::new(0x1234_5000));
        assert_eq!(addr.offset_in(PAGE_SIZE), 0x678);
        assert!(GuestPhysicalAddress::new(0x1000_0000).is_aligned_to(PAGE_SIZE));
    }

    #[test]
    fn checked_add_overflow() {
        assert_eq!(HostPhysicalAddress::MAX.checked_add(1), None);
        assert_eq!(
            HostPhysicalAddress::new(0x1000).checked_add(0x1000),
            Some(HostPhysicalAddress::new(0x2000))
        );
    }

    #[test]
    fn formatting() {
        let addr = HostPhysicalAddress::new(0xdead_b000);

        assert_eq!(format!("{addr}"), "0x00000000deadb000");
        assert_eq!(format!("{addr:?}"), "HostPhysicalAddress(0x00000000deadb000)");
        assert_eq!(format!("{addr:x}"), "deadb000");
    }
}
