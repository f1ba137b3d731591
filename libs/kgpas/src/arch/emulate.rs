// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A software implementation of [`GuestPageTable`] for tests and hosted environments.
//!
//! The emulated table is a four-level radix tree with 512 entries per table, the same shape as an
//! x86 EPT or a RISC-V Sv48x4 G-stage table, so it covers a 48-bit guest-physical address space.

use alloc::boxed::Box;
use core::ops::Range;
use core::{fmt, mem};

use lock_api::Mutex;

use crate::{
    AddressRangeExt, AspaceFlags, Error, GuestPageTable, GuestPhysicalAddress,
    HostPhysicalAddress, MmuFlags, PAGE_SIZE,
};

const LEVELS: u32 = 4;
const ENTRIES: usize = 512;
const INDEX_BITS: u32 = ENTRIES.trailing_zeros();
const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();
const ADDRESS_BITS: u32 = PAGE_SHIFT + INDEX_BITS * LEVELS;

/// The largest guest-physical address (exclusive) the emulated table can translate.
pub const MAX_GUEST_ADDRESS: usize = if ADDRESS_BITS < usize::BITS {
    1 << ADDRESS_BITS
} else {
    usize::MAX
};

pub struct EmulatedPageTable<R: lock_api::RawMutex> {
    inner: Mutex<R, Inner>,
    fail_destroy: bool,
}

struct Inner {
    window: Option<Range<GuestPhysicalAddress>>,
    destroyed: bool,
    root: Option<Box<Table>>,
    tables: TableAllocator,
    pages: usize,
}

/// Hands out intermediate tables, optionally limited to `budget` live tables at a time.
struct TableAllocator {
    live: usize,
    budget: Option<usize>,
}

struct Table {
    entries: [Entry; ENTRIES],
    /// Number of non-vacant entries.
    live: usize,
}

enum Entry {
    Vacant,
    Table(Box<Table>),
    Leaf(HostPhysicalAddress, MmuFlags),
}

// ===== impl EmulatedPageTable =====

impl<R: lock_api::RawMutex> Default for EmulatedPageTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: lock_api::RawMutex> fmt::Debug for EmulatedPageTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        f.debug_struct("EmulatedPageTable")
            .field("window", &inner.window)
            .field("destroyed", &inner.destroyed)
            .field("live_tables", &inner.tables.live)
            .field("mapped_pages", &inner.pages)
            .field("fail_destroy", &self.fail_destroy)
            .finish()
    }
}

impl<R: lock_api::RawMutex> EmulatedPageTable<R> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                window: None,
                destroyed: false,
                root: None,
                tables: TableAllocator {
                    live: 0,
                    budget: None,
                },
                pages: 0,
            }),
            fail_destroy: false,
        }
    }

    /// Limits the number of tables (including the root) that may be live at the same time.
    /// Once exhausted, [`GuestPageTable::map`] reports short counts.
    #[must_use]
    pub fn with_table_budget(mut self, budget: usize) -> Self {
        self.inner.get_mut().tables.budget = Some(budget);
        self
    }

    /// Makes [`GuestPageTable::destroy`] report corrupted translation state.
    #[must_use]
    pub fn with_failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    /// Returns the number of leaf translations currently installed.
    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().pages
    }

    /// Returns the number of tables (including the root) currently allocated.
    pub fn live_tables(&self) -> usize {
        self.inner.lock().tables.live
    }

    pub fn is_initialized(&self) -> bool {
        let inner = self.inner.lock();
        inner.root.is_some() && !inner.destroyed
    }
}

impl<R: lock_api::RawMutex> GuestPageTable for EmulatedPageTable<R> {
    fn init(
        &mut self,
        base: GuestPhysicalAddress,
        size: usize,
        _flags: AspaceFlags,
    ) -> crate::Result<()> {
        let inner = self.inner.get_mut();

        crate::ensure!(inner.root.is_none() && !inner.destroyed, Error::BadState);
        crate::ensure!(
            base.is_aligned_to(PAGE_SIZE) && size > 0 && size % PAGE_SIZE == 0,
            Error::InvalidArgument
        );

        let window = base
            .checked_add(size)
            .filter(|end| end.get() <= MAX_GUEST_ADDRESS)
            .map(|end| base..end)
            .ok_or(Error::OutOfRange {
                start: base.get(),
                end: base.get().saturating_add(size),
                limit: MAX_GUEST_ADDRESS,
            })?;

        let root = inner.tables.allocate().ok_or(Error::OutOfMemory)?;

        log::trace!("initialized emulated page table for {window:?}");

        inner.root = Some(root);
        inner.window = Some(window);

        Ok(())
    }

    fn destroy(&mut self) -> crate::Result<()> {
        let inner = self.inner.get_mut();

        crate::ensure!(!self.fail_destroy, Error::BadState);
        let root = inner.root.take().ok_or(Error::BadState)?;

        drop(root);
        inner.tables.live = 0;
        inner.pages = 0;
        inner.destroyed = true;

        log::trace!("destroyed emulated page table");

        Ok(())
    }

    fn map(
        &self,
        guest: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        count: usize,
        flags: MmuFlags,
    ) -> crate::Result<usize> {
        let mut inner = self.inner.lock();
        let range = inner.check_access(guest, count)?;
        crate::ensure!(host.is_aligned_to(PAGE_SIZE), Error::InvalidArgument);

        let Inner {
            root, tables, pages, ..
        } = &mut *inner;
        let root = root.as_mut().ok_or(Error::BadState)?;

        let mut mapped = 0;
        for (i, page) in range.pages(PAGE_SIZE).enumerate() {
            let frame = host.add(i * PAGE_SIZE);

            match insert_leaf(root, page.get(), frame, flags, tables) {
                Ok(true) => {
                    log::trace!("map {page} -> {frame} {flags:?}");
                    mapped += 1;
                }
                Ok(false) => {
                    log::trace!("out of tables after mapping {mapped} of {count} pages");
                    // release the tables allocated on the way down before running out
                    remove_leaf(root, page.get(), 0, tables);
                    break;
                }
                Err(err) => {
                    // leave the table as we found it
                    for page in range.pages(PAGE_SIZE).take(mapped) {
                        remove_leaf(root, page.get(), 0, tables);
                    }

                    *pages -= mapped;
                    return Err(err);
                }
            }

            *pages += 1;
        }

        Ok(mapped)
    }

    fn unmap(&self, guest: GuestPhysicalAddress, count: usize) -> crate::Result<usize> {
        let mut inner = self.inner.lock();
        let range = inner.check_access(guest, count)?;

        let Inner {
            root, tables, pages, ..
        } = &mut *inner;
        let root = root.as_mut().ok_or(Error::BadState)?;

        let mut unmapped = 0;
        for page in range.pages(PAGE_SIZE) {
            if remove_leaf(root, page.get(), 0, tables) {
                log::trace!("unmap {page}");
                unmapped += 1;
            }
        }

        *pages -= unmapped;

        Ok(unmapped)
    }

    fn query(&self, guest: GuestPhysicalAddress) -> crate::Result<(HostPhysicalAddress, MmuFlags)> {
        let inner = self.inner.lock();
        let root = inner.root.as_ref().ok_or(Error::BadState)?;
        let window = inner.window.as_ref().ok_or(Error::BadState)?;

        // the walk only looks at the low address bits, anything outside would alias
        crate::ensure!(
            guest >= window.start && guest < window.end,
            Error::NotFound(guest)
        );

        lookup(root, guest.align_down(PAGE_SIZE).get()).ok_or(Error::NotFound(guest))
    }
}

// ===== impl Inner =====

impl Inner {
    fn check_access(
        &self,
        guest: GuestPhysicalAddress,
        count: usize,
    ) -> crate::Result<Range<GuestPhysicalAddress>> {
        let window = self.window.as_ref().ok_or(Error::BadState)?;
        crate::ensure!(!self.destroyed, Error::BadState);
        crate::ensure!(guest.is_aligned_to(PAGE_SIZE), Error::InvalidArgument);

        let out_of_range = Error::OutOfRange {
            start: guest.get(),
            end: guest
                .get()
                .saturating_add(count.saturating_mul(PAGE_SIZE)),
            limit: window.end.get(),
        };

        let end = count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| guest.checked_add(len))
            .ok_or(out_of_range)?;

        crate::ensure!(
            guest >= window.start && end <= window.end,
            out_of_range
        );

        Ok(guest..end)
    }
}

// ===== impl TableAllocator =====

impl TableAllocator {
    fn allocate(&mut self) -> Option<Box<Table>> {
        if self.budget.is_some_and(|budget| self.live >= budget) {
            return None;
        }

        self.live += 1;
        Some(Box::new(Table {
            entries: core::array::from_fn(|_| Entry::Vacant),
            live: 0,
        }))
    }

    fn release(&mut self, table: Box<Table>) {
        debug_assert_eq!(table.live, 0);
        drop(table);
        self.live -= 1;
    }
}

fn table_index(addr: usize, level: u32) -> usize {
    debug_assert!(level < LEVELS);
    let shift = PAGE_SHIFT + INDEX_BITS * (LEVELS - 1 - level);
    (addr >> shift) & (ENTRIES - 1)
}

fn lookup(root: &Table, addr: usize) -> Option<(HostPhysicalAddress, MmuFlags)> {
    let mut table = root;

    // NB: iterate over the levels to have an explicit upper bound on the loop
    for level in 0..LEVELS {
        match &table.entries[table_index(addr, level)] {
            Entry::Vacant => return None,
            Entry::Leaf(host, flags) => return Some((*host, *flags)),
            Entry::Table(next) => table = next,
        }
    }

    None
}

/// Installs a leaf for `addr`, allocating intermediate tables as necessary.
///
/// Returns `Ok(false)` if the table allocator is exhausted.
fn insert_leaf(
    root: &mut Table,
    addr: usize,
    host: HostPhysicalAddress,
    flags: MmuFlags,
    tables: &mut TableAllocator,
) -> crate::Result<bool> {
    let mut table = root;

    for level in 0..LEVELS - 1 {
        let idx = table_index(addr, level);

        if matches!(table.entries[idx], Entry::Vacant) {
            let Some(new) = tables.allocate() else {
                return Ok(false);
            };

            table.entries[idx] = Entry::Table(new);
            table.live += 1;
        }

        table = match &mut table.entries[idx] {
            Entry::Table(next) => &mut **next,
            Entry::Leaf(..) => return Err(Error::AlreadyExists(GuestPhysicalAddress::new(addr))),
            Entry::Vacant => unreachable!(),
        };
    }

    let idx = table_index(addr, LEVELS - 1);
    crate::ensure!(
        matches!(table.entries[idx], Entry::Vacant),
        Error::AlreadyExists(GuestPhysicalAddress::new(addr))
    );

    table.entries[idx] = Entry::Leaf(host, flags);
    table.live += 1;

    Ok(true)
}

/// Removes the leaf for `addr` if present, freeing tables that become empty on the way up.
fn remove_leaf(table: &mut Table, addr: usize, level: u32, tables: &mut TableAllocator) -> bool {
    let idx = table_index(addr, level);

    let (removed, now_empty) = match &mut table.entries[idx] {
        Entry::Vacant => return false,
        Entry::Leaf(..) => (true, true),
        Entry::Table(next) => {
            let removed = remove_leaf(next, addr, level + 1, tables);
            (removed, next.live == 0)
        }
    };

    if now_empty {
        if let Entry::Table(subtable) = mem::replace(&mut table.entries[idx], Entry::Vacant) {
            tables.release(subtable);
        }
        table.live -= 1;
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GIB;

    type PageTable = EmulatedPageTable<parking_lot::RawMutex>;

    fn initialized(mut table: PageTable) -> PageTable {
        table
            .init(GuestPhysicalAddress::new(0), GIB, AspaceFlags::new())
            .unwrap();
        table
    }

    #[test_log::test]
    fn map_query_unmap() {
        let table = initialized(PageTable::new());

        let guest = GuestPhysicalAddress::new(0x7000);
        let host = HostPhysicalAddress::new(0x8000_0000);

        assert_eq!(table.map(guest, host, 2, MmuFlags::device()), Ok(2));
        assert_eq!(table.query(guest), Ok((host, MmuFlags::device())));
        assert_eq!(
            table.query(guest.add(PAGE_SIZE)),
            Ok((host.add(PAGE_SIZE), MmuFlags::device()))
        );
        assert_eq!(table.mapped_pages(), 2);

        assert_eq!(table.unmap(guest, 2), Ok(2));
        assert_eq!(table.query(guest), Err(Error::NotFound(guest)));
        assert_eq!(table.mapped_pages(), 0);
        // only the root remains
        assert_eq!(table.live_tables(), 1);
    }

    #[test_log::test]
    fn unmap_skips_vacant_pages() {
        let table = initialized(PageTable::new());

        let guest = GuestPhysicalAddress::new(0x1000);
        table
            .map(guest, HostPhysicalAddress::new(0x2000), 1, MmuFlags::normal_memory())
            .unwrap();

        assert_eq!(table.unmap(guest, 4), Ok(1));
    }

    #[test_log::test]
    fn double_map_is_rejected_and_rolled_back() {
        let table = initialized(PageTable::new());

        let host = HostPhysicalAddress::new(0x10_0000);
        table
            .map(GuestPhysicalAddress::new(0x3000), host, 1, MmuFlags::normal_memory())
            .unwrap();

        assert_eq!(
            table.map(GuestPhysicalAddress::new(0x1000), host, 3, MmuFlags::normal_memory()),
            Err(Error::AlreadyExists(GuestPhysicalAddress::new(0x3000)))
        );

        assert_eq!(table.mapped_pages(), 1);
        assert!(table.query(GuestPhysicalAddress::new(0x1000)).is_err());
        assert!(table.query(GuestPhysicalAddress::new(0x2000)).is_err());
    }

    #[test_log::test]
    fn table_budget_yields_short_count() {
        // root + 3 intermediate tables covers exactly one 2MiB block of leaves
        let table = initialized(PageTable::new().with_table_budget(4));

        let guest = GuestPhysicalAddress::new(0x1f_f000);
        let mapped = table
            .map(guest, HostPhysicalAddress::new(0), 2, MmuFlags::normal_memory())
            .unwrap();

        assert_eq!(mapped, 1);
        assert_eq!(table.mapped_pages(), 1);
    }

    #[test_log::test]
    fn short_count_releases_partial_walk() {
        let mut table = PageTable::new().with_table_budget(5);
        table
            .init(GuestPhysicalAddress::new(0), 2 * GIB, AspaceFlags::new())
            .unwrap();

        // the second page needs two fresh tables below the root but only one is left
        let guest = GuestPhysicalAddress::new(GIB - PAGE_SIZE);
        let mapped = table
            .map(guest, HostPhysicalAddress::new(0), 2, MmuFlags::normal_memory())
            .unwrap();

        assert_eq!(mapped, 1);
        assert_eq!(table.live_tables(), 4);

        assert_eq!(table.unmap(guest, 1), Ok(1));
        assert_eq!(table.live_tables(), 1);
    }

    #[test_log::test]
    fn query_outside_window_does_not_alias() {
        let table = initialized(PageTable::new());

        table
            .map(
                GuestPhysicalAddress::new(0),
                HostPhysicalAddress::new(0x8000_0000),
                1,
                MmuFlags::normal_memory(),
            )
            .unwrap();

        for guest in [GIB, MAX_GUEST_ADDRESS, 1 << 48, usize::MAX] {
            let guest = GuestPhysicalAddress::new(guest);
            assert_eq!(table.query(guest), Err(Error::NotFound(guest)));
        }
    }

    #[test_log::test]
    fn out_of_window() {
        let table = initialized(PageTable::new());

        assert!(matches!(
            table.map(
                GuestPhysicalAddress::new(GIB),
                HostPhysicalAddress::new(0),
                1,
                MmuFlags::normal_memory()
            ),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            table.unmap(GuestPhysicalAddress::new(GIB - PAGE_SIZE), 2),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test_log::test]
    fn destroy_releases_everything() {
        let mut table = initialized(PageTable::new());

        table
            .map(
                GuestPhysicalAddress::new(0),
                HostPhysicalAddress::new(0),
                16,
                MmuFlags::normal_memory(),
            )
            .unwrap();

        table.destroy().unwrap();

        assert!(!table.is_initialized());
        assert_eq!(table.live_tables(), 0);
        assert_eq!(table.mapped_pages(), 0);
        assert_eq!(table.destroy(), Err(Error::BadState));
        assert_eq!(
            table.query(GuestPhysicalAddress::new(0)),
            Err(Error::BadState)
        );
    }

    #[test]
    fn uninitialized_table_rejects_operations() {
        let table = PageTable::new();

        assert_eq!(
            table.map(
                GuestPhysicalAddress::new(0),
                HostPhysicalAddress::new(0),
                1,
                MmuFlags::normal_memory()
            ),
            Err(Error::BadState)
        );
        assert_eq!(table.unmap(GuestPhysicalAddress::new(0), 1), Err(Error::BadState));
    }
}
