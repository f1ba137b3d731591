// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mycelium_bitfield::bitfield! {
    /// Permissions of a single second-level translation.
    ///
    /// Unlike host mappings, guest RAM is mapped read, write *and* execute: the guest enforces
    /// its own W^X policy through its own page tables, one level above us.
    #[derive(PartialEq, Eq)]
    pub struct MmuFlags<u8> {
        /// If set, the guest may read through this translation.
        pub const READ: bool;
        /// If set, the guest may write through this translation.
        pub const WRITE: bool;
        /// If set, the guest may fetch instructions through this translation.
        pub const EXECUTE: bool;
    }
}

mycelium_bitfield::bitfield! {
    /// Describes the access that caused a backing memory object to be asked for a page.
    #[derive(PartialEq, Eq)]
    pub struct PageFaultFlags<u8> {
        /// The access was a write, the backing object must provide a private, writable page.
        pub const WRITE: bool;
        /// The access was an instruction fetch.
        pub const INSTRUCTION: bool;
        /// The fault was synthesized by software rather than raised by hardware.
        pub const SW_FAULT: bool;
    }
}

mycelium_bitfield::bitfield! {
    /// Flags passed to [`GuestPageTable::init`][crate::GuestPageTable::init].
    #[derive(PartialEq, Eq)]
    pub struct AspaceFlags<u8> {
        /// The translation structures describe a guest-physical address space.
        pub const GUEST_PASPACE: bool;
    }
}

// ===== impl MmuFlags =====

impl MmuFlags {
    /// Permissions used for regular guest RAM.
    pub fn normal_memory() -> Self {
        Self::new()
            .with(Self::READ, true)
            .with(Self::WRITE, true)
            .with(Self::EXECUTE, true)
    }

    /// Permissions used for device pages. Device state must never be executable by the guest.
    pub fn device() -> Self {
        Self::new()
            .with(Self::READ, true)
            .with(Self::WRITE, true)
    }

    pub fn allows_read(&self) -> bool {
        self.get(Self::READ)
    }

    pub fn allows_write(&self) -> bool {
        self.get(Self::WRITE)
    }

    pub fn allows_execution(&self) -> bool {
        self.get(Self::EXECUTE)
    }
}

// ===== impl PageFaultFlags =====

impl PageFaultFlags {
    /// Flags used when populating guest RAM ahead of time: a software-triggered write fault that
    /// forces the backing object to materialize every page.
    pub fn populate() -> Self {
        Self::new()
            .with(Self::WRITE, true)
            .with(Self::SW_FAULT, true)
    }

    pub fn is_write(&self) -> bool {
        self.get(Self::WRITE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_is_never_executable() {
        let flags = MmuFlags::device();

        assert!(flags.allows_read());
        assert!(flags.allows_write());
        assert!(!flags.allows_execution());
    }

    #[test]
    fn normal_memory_is_rwx() {
        let flags = MmuFlags::normal_memory();

        assert!(flags.allows_read());
        assert!(flags.allows_write());
        assert!(flags.allows_execution());
    }

    #[test]
    fn populate_forces_write() {
        let flags = PageFaultFlags::populate();

        assert!(flags.is_write());
        assert!(flags.get(PageFaultFlags::SW_FAULT));
        assert!(!flags.get(PageFaultFlags::INSTRUCTION));
    }
}
