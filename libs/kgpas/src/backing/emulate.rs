// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::collections::BTreeMap;
use core::fmt;
use core::ops::Range;

use lock_api::Mutex;

use crate::backing::{BackingMemory, check_offsets};
use crate::{Error, GuestPhysicalAddress, HostPhysicalAddress, PAGE_SIZE, PageFaultFlags};

/// A paged backing object that materializes host frames on first write.
///
/// Frames are handed out by a bump allocator starting at a configurable host physical address,
/// optionally limited to a fixed number of frames. A read of a page that was never written to
/// resolves to nothing, just like a sparse object without a zero page would.
pub struct EmulatedBacking<R: lock_api::RawMutex> {
    size: usize,
    frames: Mutex<R, Frames>,
}

struct Frames {
    /// Resident frames keyed by page-aligned object offset.
    resident: BTreeMap<usize, HostPhysicalAddress>,
    next_frame: HostPhysicalAddress,
    budget: Option<usize>,
    fault: Option<(usize, Error)>,
}

impl<R: lock_api::RawMutex> fmt::Debug for EmulatedBacking<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames = self.frames.lock();

        f.debug_struct("EmulatedBacking")
            .field("size", &self.size)
            .field("resident", &frames.resident.len())
            .field("next_frame", &frames.next_frame)
            .field("budget", &frames.budget)
            .field("fault", &frames.fault)
            .finish()
    }
}

impl<R: lock_api::RawMutex> EmulatedBacking<R> {
    pub const DEFAULT_FRAME_BASE: HostPhysicalAddress = HostPhysicalAddress::new(0x8000_0000);

    /// Creates an object of `size` bytes without any resident pages.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of [`PAGE_SIZE`].
    pub fn new(size: usize) -> Self {
        assert!(
            size % PAGE_SIZE == 0,
            "backing size must be a multiple of the page size"
        );

        Self {
            size,
            frames: Mutex::new(Frames {
                resident: BTreeMap::new(),
                next_frame: Self::DEFAULT_FRAME_BASE,
                budget: None,
                fault: None,
            }),
        }
    }

    /// Sets the host physical address the first materialized frame is placed at.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page aligned.
    #[must_use]
    pub fn with_frame_base(mut self, base: HostPhysicalAddress) -> Self {
        assert!(base.is_aligned_to(PAGE_SIZE), "frame base must be page aligned");
        self.frames.get_mut().next_frame = base;
        self
    }

    /// Limits the number of frames the object may materialize. Once exhausted, resolving an
    /// unbacked page fails with [`Error::OutOfMemory`].
    #[must_use]
    pub fn with_frame_budget(mut self, frames: usize) -> Self {
        self.frames.get_mut().budget = Some(frames);
        self
    }

    /// Makes resolution of the page at `offset` fail with `error`.
    #[must_use]
    pub fn with_fault_at(mut self, offset: usize, error: Error) -> Self {
        self.frames.get_mut().fault = Some((offset, error));
        self
    }

    /// Returns the frame currently backing the page at `offset`, if any.
    pub fn frame(&self, offset: usize) -> Option<HostPhysicalAddress> {
        let offset = offset - offset % PAGE_SIZE;
        self.frames.lock().resident.get(&offset).copied()
    }

    /// Returns the number of materialized pages.
    pub fn resident_pages(&self) -> usize {
        self.frames.lock().resident.len()
    }
}

impl<R: lock_api::RawMutex> BackingMemory for EmulatedBacking<R> {
    fn size(&self) -> usize {
        self.size
    }

    fn lookup(
        &self,
        range: Range<usize>,
        flags: PageFaultFlags,
        f: &mut dyn FnMut(usize, usize, HostPhysicalAddress) -> crate::Result<()>,
    ) -> crate::Result<()> {
        check_offsets(&range, self.size)?;

        for (index, offset) in range.step_by(PAGE_SIZE).enumerate() {
            // don't hold the lock across the callback, it may call back into us
            let frame = self.frames.lock().require_frame(offset, flags)?;

            f(offset, index, frame)?;
        }

        Ok(())
    }
}

// ===== impl Frames =====

impl Frames {
    fn require_frame(
        &mut self,
        offset: usize,
        flags: PageFaultFlags,
    ) -> crate::Result<HostPhysicalAddress> {
        if let Some((_, error)) = self.fault.filter(|(at, _)| *at == offset) {
            log::trace!("injecting {error:?} at offset {offset:#x}");
            return Err(error);
        }

        if let Some(frame) = self.resident.get(&offset) {
            return Ok(*frame);
        }

        crate::ensure!(
            flags.is_write(),
            Error::NotFound(GuestPhysicalAddress::new(offset))
        );
        crate::ensure!(
            self.budget.is_none_or(|budget| self.resident.len() < budget),
            Error::OutOfMemory
        );

        let frame = self.next_frame;
        self.next_frame = frame.checked_add(PAGE_SIZE).ok_or(Error::OutOfMemory)?;
        self.resident.insert(offset, frame);

        log::trace!("materialized frame {frame} for offset {offset:#x}");

        Ok(frame)
    }
}
