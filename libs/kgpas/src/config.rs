// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{ADDRESS_SPACE_SIZE, PAGE_SIZE};

/// When guest RAM gets translated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MappingPolicy {
    /// Map the entire backing memory object when the address space is created. Ordinary guest
    /// memory accesses never fault afterwards, at the cost of setup latency and pinning every page.
    #[default]
    Eager,
    /// Start out with an empty address space. The caller is responsible for populating it
    /// through [`map_range`][crate::GuestPhysicalAddressSpace::map_range], typically from its
    /// second-level page fault handler.
    OnDemand,
}

/// Construction parameters for a [`GuestPhysicalAddressSpace`][crate::GuestPhysicalAddressSpace].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceConfig {
    size: usize,
    policy: MappingPolicy,
}

impl Default for AddressSpaceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpaceConfig {
    pub const fn new() -> Self {
        Self {
            size: ADDRESS_SPACE_SIZE,
            policy: MappingPolicy::Eager,
        }
    }

    /// Sets the size of the guest-physical address space. Every mapping must lie below this.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or not a multiple of [`PAGE_SIZE`].
    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        assert!(
            size > 0 && size % PAGE_SIZE == 0,
            "address space size must be a non-zero multiple of the page size"
        );
        self.size = size;
        self
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: MappingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn policy(&self) -> MappingPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AddressSpaceConfig::default();

        assert_eq!(config.size(), ADDRESS_SPACE_SIZE);
        assert_eq!(config.policy(), MappingPolicy::Eager);
    }

    #[test]
    #[should_panic = "address space size must be a non-zero multiple of the page size"]
    fn unaligned_size() {
        let _ = AddressSpaceConfig::new().with_size(PAGE_SIZE + 1);
    }
}
