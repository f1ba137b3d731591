// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(test), no_std)]

//! Guest-physical address space management.
//!
//! A [`GuestPhysicalAddressSpace`] owns the second-level translation of exactly one guest. It
//! glues together two collaborators:
//!
//! - a [`BackingMemory`] object that owns the host pages making up the guest's RAM and resolves
//!   guest-physical offsets to host pages, and
//! - a [`GuestPageTable`] engine that owns the architecture-specific translation structures
//!   (EPT, NPT, stage-2 tables, ...) and can install, remove and query single leaf mappings.
//!
//! On creation the entire backing object is mapped at guest-physical address zero (see
//! [`MappingPolicy`]), device pages such as an emulated interrupt controller can be added with
//! [`GuestPhysicalAddressSpace::map_device_page`], and the translation structures are torn down
//! when the address space is dropped.
//!
//! ## Concurrency
//!
//! All operations take `&self` and may run in parallel on different CPUs. The page table engine
//! is responsible for serializing accesses to the structures it touches, which makes concurrent
//! operations on *disjoint* pages safe. Operations on the *same* page must be synchronized by the
//! caller. Range operations are a sequence of single-page operations and are not atomic as a
//! whole.

extern crate alloc;

mod address;
mod address_range;
mod address_space;
pub mod arch;
pub mod backing;
mod config;
mod error;
mod flags;

pub use address::{GuestPhysicalAddress, HostPhysicalAddress};
pub use address_range::{AddressRangeExt, Pages};
pub use address_space::GuestPhysicalAddressSpace;
pub use arch::GuestPageTable;
pub use backing::BackingMemory;
pub use config::{AddressSpaceConfig, MappingPolicy};
pub use error::Error;
pub use flags::{AspaceFlags, MmuFlags, PageFaultFlags};

pub type Result<T> = core::result::Result<T, Error>;

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * 1024;
pub const GIB: usize = MIB * 1024;

/// The size of the smallest translation granule. All guest and host addresses handed to this crate
/// must be aligned to this.
pub const PAGE_SIZE: usize = 4 * KIB;

/// The default size of a guest-physical address space.
///
/// This is deliberately much larger than any realistic amount of guest RAM so device pages can be
/// placed above the RAM without colliding with it.
#[cfg(target_pointer_width = "64")]
pub const ADDRESS_SPACE_SIZE: usize = 256 * GIB;
#[cfg(not(target_pointer_width = "64"))]
pub const ADDRESS_SPACE_SIZE: usize = 2 * GIB;
