// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::ops::Range;

use crate::{
    AddressRangeExt, AddressSpaceConfig, AspaceFlags, BackingMemory, Error, GuestPageTable,
    GuestPhysicalAddress, HostPhysicalAddress, MappingPolicy, MmuFlags, PAGE_SIZE, PageFaultFlags,
};

/// The guest-physical address space of a single guest.
///
/// Translation structures are created by [`create`][Self::create] and torn down when the address
/// space is dropped. The backing memory object is shared with the guest's memory allocator.
#[derive(Debug)]
pub struct GuestPhysicalAddressSpace<P: GuestPageTable, B: BackingMemory> {
    arch: P,
    backing: Arc<B>,
    config: AddressSpaceConfig,
}

impl<P: GuestPageTable, B: BackingMemory> GuestPhysicalAddressSpace<P, B> {
    /// Creates an address space of [`ADDRESS_SPACE_SIZE`][crate::ADDRESS_SPACE_SIZE] bytes and
    /// maps the entire `backing` object at guest-physical address zero.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the translation structures cannot be initialized or the backing object
    /// cannot be mapped. No translation state outlives a failed call.
    pub fn create(arch: P, backing: Arc<B>) -> crate::Result<Self> {
        Self::create_with(arch, backing, AddressSpaceConfig::new())
    }

    /// Like [`create`][Self::create] but with explicit size and [`MappingPolicy`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if the translation structures cannot be initialized or, when the policy is
    /// [`MappingPolicy::Eager`], the backing object cannot be mapped. No translation state
    /// outlives a failed call.
    pub fn create_with(
        mut arch: P,
        backing: Arc<B>,
        config: AddressSpaceConfig,
    ) -> crate::Result<Self> {
        arch.init(
            GuestPhysicalAddress::MIN,
            config.size(),
            AspaceFlags::new().with(AspaceFlags::GUEST_PASPACE, true),
        )?;

        // from here on dropping `aspace` destroys the translation state again
        let aspace = Self {
            arch,
            backing,
            config,
        };

        match config.policy() {
            MappingPolicy::Eager => {
                let len = aspace.backing.size();
                if len > 0 {
                    aspace.map_range(GuestPhysicalAddress::MIN, len)?;
                }
            }
            MappingPolicy::OnDemand => {}
        }

        log::debug!(
            "created guest physical address space of {:#x} bytes ({:?}, backing {:#x} bytes)",
            config.size(),
            config.policy(),
            aspace.backing.size()
        );

        Ok(aspace)
    }

    /// Maps `[guest, guest + size)` to the pages of the backing object with read, write and
    /// execute permissions.
    ///
    /// Guest RAM is placed at guest-physical address zero, so the range also denotes the offsets
    /// within the backing object. Pages that are not yet backed are materialized.
    ///
    /// # Errors
    ///
    /// Returns `Err(Error::InvalidArgument)` if `guest` or `size` are not page aligned or `size`
    /// is zero, `Err(Error::OutOfRange)` if the range exceeds the address space and
    /// `Err(Error::OutOfMemory)` if the page table engine maps fewer pages than requested.
    /// Errors of the backing object or the engine are returned unmodified. On error, every page
    /// this call installed is unmapped again.
    pub fn map_range(&self, guest: GuestPhysicalAddress, size: usize) -> crate::Result<()> {
        let range = self.check_range(guest, size)?;
        log::debug!("map_range {range:?}");

        let flags = MmuFlags::normal_memory();
        let mut installed = 0;

        let res = self.backing.lookup(
            range.start.get()..range.end.get(),
            PageFaultFlags::populate(),
            &mut |offset, _index, host| {
                let page = GuestPhysicalAddress::new(offset);

                let mapped = self.arch.map(page, host, 1, flags)?;
                crate::ensure!(mapped == 1, Error::OutOfMemory);

                log::trace!("mapped {page} -> {host}");
                installed += 1;

                Ok(())
            },
        );

        if let Err(err) = res {
            log::warn!("map_range {range:?} failed after {installed} pages: {err}");
            self.rollback(range.start, installed);
            return Err(err);
        }

        Ok(())
    }

    /// Maps the single guest page at `guest` to the host page at `host` with read and write
    /// permissions. Device pages are never executable.
    ///
    /// # Errors
    ///
    /// Returns `Err(Error::InvalidArgument)` if either address is not page aligned,
    /// `Err(Error::OutOfRange)` if `guest` lies outside of the address space and
    /// `Err(Error::OutOfMemory)` if the page table engine did not map the page. Errors of the
    /// engine are returned unmodified.
    pub fn map_device_page(
        &self,
        guest: GuestPhysicalAddress,
        host: HostPhysicalAddress,
    ) -> crate::Result<()> {
        self.check_range(guest, PAGE_SIZE)?;
        crate::ensure!(host.is_aligned_to(PAGE_SIZE), Error::InvalidArgument);

        let mapped = self.arch.map(guest, host, 1, MmuFlags::device())?;
        crate::ensure!(mapped == 1, Error::OutOfMemory);

        log::debug!("mapped device page {guest} -> {host}");

        Ok(())
    }

    /// Removes the translations of all pages in `[guest, guest + size)`.
    ///
    /// # Errors
    ///
    /// Returns `Err(Error::InvalidArgument)` if `guest` or `size` are not page aligned or `size`
    /// is zero and `Err(Error::OutOfRange)` if the range exceeds the address space.
    /// Returns `Err(Error::BadState)` if not every page of the range was mapped; the pages that
    /// were mapped are unmapped regardless.
    pub fn unmap_range(&self, guest: GuestPhysicalAddress, size: usize) -> crate::Result<()> {
        let range = self.check_range(guest, size)?;
        let count = size / PAGE_SIZE;

        let unmapped = self.arch.unmap(guest, count)?;
        if unmapped != count {
            log::warn!("unmap_range {range:?} removed {unmapped} of {count} pages");
            return Err(Error::BadState);
        }

        log::debug!("unmapped {range:?}");

        Ok(())
    }

    /// Returns the host physical address `guest` translates to. The offset of `guest` within its
    /// page is carried over to the returned address.
    ///
    /// # Errors
    ///
    /// Returns `Err(Error::NotFound)` if `guest` is not mapped.
    pub fn translate(&self, guest: GuestPhysicalAddress) -> crate::Result<HostPhysicalAddress> {
        self.lookup(guest).map(|(host, _)| host)
    }

    /// Returns the host physical address *and* the permissions of the translation of `guest`.
    ///
    /// # Errors
    ///
    /// Returns `Err(Error::NotFound)` if `guest` is not mapped or lies outside of the address
    /// space.
    pub fn lookup(
        &self,
        guest: GuestPhysicalAddress,
    ) -> crate::Result<(HostPhysicalAddress, MmuFlags)> {
        crate::ensure!(guest.get() < self.config.size(), Error::NotFound(guest));

        let (page, flags) = self.arch.query(guest.align_down(PAGE_SIZE))?;

        Ok((page.add(guest.offset_in(PAGE_SIZE)), flags))
    }

    /// The size of the guest-physical address space in bytes.
    pub fn size(&self) -> usize {
        self.config.size()
    }

    pub fn policy(&self) -> MappingPolicy {
        self.config.policy()
    }

    pub fn backing(&self) -> &Arc<B> {
        &self.backing
    }

    pub fn arch(&self) -> &P {
        &self.arch
    }

    fn check_range(
        &self,
        guest: GuestPhysicalAddress,
        size: usize,
    ) -> crate::Result<Range<GuestPhysicalAddress>> {
        crate::ensure!(
            guest.is_aligned_to(PAGE_SIZE) && size > 0 && size % PAGE_SIZE == 0,
            Error::InvalidArgument
        );

        guest
            .checked_add(size)
            .filter(|end| end.get() <= self.config.size())
            .map(|end| guest..end)
            .ok_or(Error::OutOfRange {
                start: guest.get(),
                end: guest.get().saturating_add(size),
                limit: self.config.size(),
            })
    }

    /// Unmaps the first `count` pages starting at `start` after a failed [`map_range`][Self::map_range].
    fn rollback(&self, start: GuestPhysicalAddress, count: usize) {
        if count == 0 {
            return;
        }

        let range = Range::<GuestPhysicalAddress>::from_start_len(start, count * PAGE_SIZE);

        match self.arch.unmap(start, count) {
            Ok(unmapped) if unmapped == count => {
                log::trace!("rolled back {range:?}");
            }
            Ok(unmapped) => {
                log::warn!("rollback of {range:?} removed {unmapped} of {count} pages");
            }
            Err(err) => {
                log::warn!("rollback of {range:?} failed: {err}");
            }
        }
    }
}

impl<P: GuestPageTable, B: BackingMemory> Drop for GuestPhysicalAddressSpace<P, B> {
    fn drop(&mut self) {
        // nothing may be in flight at this point, so failure means the state is corrupted
        let res = self.arch.destroy();
        assert!(
            res.is_ok(),
            "failed to destroy guest translation state: {res:?}"
        );
    }
}
