// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[cfg(feature = "emulate")]
pub mod emulate;

use crate::{AspaceFlags, GuestPhysicalAddress, HostPhysicalAddress, MmuFlags};

/// Architecture-specific second-level translation primitives (Intel EPT, AMD NPT, RISC-V G-stage,
/// AArch64 stage-2, ...).
///
/// Implementations own the translation structures of exactly one guest. All addresses passed to
/// the methods of this trait are aligned to [`PAGE_SIZE`][crate::PAGE_SIZE].
///
/// `map`, `unmap` and `query` take `&self`: implementations must serialize concurrent accesses to
/// the structures they touch internally, such that operations on disjoint pages may run in
/// parallel.
pub trait GuestPageTable {
    /// Sets up the translation structures for the guest-physical window `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the structures cannot be allocated or the window is not supported by
    /// the hardware.
    fn init(
        &mut self,
        base: GuestPhysicalAddress,
        size: usize,
        flags: AspaceFlags,
    ) -> crate::Result<()>;

    /// Tears down the translation structures, after which no guest access may resolve through
    /// them anymore.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the structures were not initialized or are corrupted.
    fn destroy(&mut self) -> crate::Result<()>;

    /// Installs `count` consecutive leaf translations from `guest` to `host` with the given
    /// permissions.
    ///
    /// Returns the number of pages *actually* mapped. An implementation that runs out of memory
    /// for intermediate tables may map fewer pages than requested and report the shorter count.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the pages is already mapped or lies outside of the window passed
    /// to [`init`][Self::init].
    fn map(
        &self,
        guest: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        count: usize,
        flags: MmuFlags,
    ) -> crate::Result<usize>;

    /// Removes the translations of `count` consecutive pages starting at `guest`.
    ///
    /// Pages that are not mapped are skipped. Returns the number of translations *actually*
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range lies outside of the window passed to [`init`][Self::init].
    fn unmap(&self, guest: GuestPhysicalAddress, count: usize) -> crate::Result<usize>;

    /// Returns the host page and permissions `guest` currently translates to.
    ///
    /// # Errors
    ///
    /// Returns `Err(Error::NotFound)` if no translation exists.
    fn query(&self, guest: GuestPhysicalAddress) -> crate::Result<(HostPhysicalAddress, MmuFlags)>;
}
