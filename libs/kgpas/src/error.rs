// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::GuestPhysicalAddress;

/// Errors returned by the guest-physical address space and its collaborators.
///
/// Both [`GuestPageTable`][crate::GuestPageTable] and [`BackingMemory`][crate::BackingMemory]
/// report failures through this type, the address space forwards them to its caller unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum Error {
    /// The system was not able to allocate memory needed for the operation. This includes
    /// page table engines installing fewer pages than requested.
    #[error("out of memory")]
    OutOfMemory,
    /// The translation state does not match the caller's expectation, e.g. unmapping a range
    /// that was never fully mapped.
    #[error("translation state does not match the requested operation")]
    BadState,
    /// No translation exists for the given guest-physical address.
    #[error("no translation for guest physical address {0}")]
    NotFound(GuestPhysicalAddress),
    /// An argument is invalid, e.g. an address or size is not page aligned.
    #[error("invalid argument")]
    InvalidArgument,
    /// The requested range lies (partly) outside of the address space or backing object.
    #[error("range {start:#x}..{end:#x} is out of bounds (limit {limit:#x})")]
    OutOfRange {
        start: usize,
        end: usize,
        limit: usize,
    },
    /// A translation already exists for the given guest-physical address.
    #[error("guest physical address {0} is already mapped")]
    AlreadyExists(GuestPhysicalAddress),
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $error:expr) => {
        if !$cond {
            return Err($error);
        }
    };
}
