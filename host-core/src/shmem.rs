//! # Shared Memory Layout Manager
//!
//! Owns the region handed to the firmware: allocation, initialization,
//! queue lookup by `(direction, kind)` and release.
//!
//! The region is only ever accessed through atomics, both the control block
//! and the ring bytes, so references to it can be shared freely between the
//! session, the data path and the bus transport.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use log::debug;
use sap_shared::layout::{
    ControlBlock, RegionLayout, CONTROL_BLOCK_SIZE, PAGE_SIZE, SAP_CONTROL_BLOCK_ID,
};
use sap_shared::{CyclicQueue, Direction, QueueKind, QueueSizes};

use crate::error::{Result, SapError};

/// A page-aligned, zero-initialized shared region
pub struct SharedArea {
    base: NonNull<u8>,
    alloc: Layout,
    layout: RegionLayout,
}

// The region is only read and written through atomic types.
unsafe impl Send for SharedArea {}
unsafe impl Sync for SharedArea {}

impl SharedArea {
    /// Allocate a zeroed region large enough for `sizes`, rounded up to the
    /// page size. Queue sizes must be non-zero multiples of 4 so that the
    /// sentinel stays word aligned.
    pub fn allocate(sizes: QueueSizes) -> Result<Self> {
        for dir in Direction::ALL {
            for kind in QueueKind::ALL {
                let size = sizes.get(dir, kind);
                if size == 0 || size % 4 != 0 {
                    return Err(SapError::InvalidArgument(format!(
                        "queue {:?}/{:?} size {} is not a non-zero multiple of 4",
                        dir, kind, size
                    )));
                }
            }
        }

        let layout = RegionLayout::new(sizes);
        let alloc = Layout::from_size_align(layout.total_size(), PAGE_SIZE)
            .map_err(|e| SapError::Allocation(e.to_string()))?;

        // SAFETY: `alloc` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(alloc) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            SapError::Allocation(format!("{} bytes for the shared area", alloc.size()))
        })?;

        debug!("Allocated a shared area of {} bytes", alloc.size());

        Ok(Self {
            base,
            alloc,
            layout,
        })
    }

    /// Write the control block and the trailing sentinel
    pub fn init(&self) {
        self.control().init(self.layout.sizes());
        self.sentinel_word()
            .store(SAP_CONTROL_BLOCK_ID.to_le(), Ordering::Release);
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Page-rounded size of the region
    pub fn size(&self) -> usize {
        self.alloc.size()
    }

    pub fn control(&self) -> &ControlBlock {
        // SAFETY: the region starts with a page-aligned `ControlBlock`, made
        // only of atomics, for which the all-zero pattern is valid.
        unsafe { &*(self.base.as_ptr() as *const ControlBlock) }
    }

    /// Producer/consumer handle of one queue
    pub fn queue(&self, dir: Direction, kind: QueueKind) -> CyclicQueue<'_> {
        let range = self.layout.queue_range(dir, kind);
        // SAFETY: the range lies within the allocation and `AtomicU8` has
        // the same layout as `u8`.
        let ring = unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(range.start) as *const AtomicU8,
                range.len(),
            )
        };
        CyclicQueue::new(self.control().queue(dir, kind), ring)
    }

    pub fn sentinel(&self) -> u32 {
        u32::from_le(self.sentinel_word().load(Ordering::Acquire))
    }

    /// True while any host-to-firmware queue has unread bytes
    pub fn host_to_me_pending(&self) -> bool {
        QueueKind::ALL
            .iter()
            .any(|kind| self.control().queue(Direction::HostToMe, *kind).is_pending())
    }

    /// Check the magic, the control block size, the capacities and the
    /// sentinel against what [`SharedArea::init`] wrote.
    pub fn validate(&self) -> Result<()> {
        let ctrl = self.control();
        if ctrl.sap_id() != SAP_CONTROL_BLOCK_ID {
            return Err(SapError::ProtocolCorruption("bad control block id"));
        }
        if ctrl.size() as usize != CONTROL_BLOCK_SIZE {
            return Err(SapError::ProtocolCorruption("bad control block size"));
        }
        for dir in Direction::ALL {
            for kind in QueueKind::ALL {
                if ctrl.queue(dir, kind).capacity() != self.layout.sizes().get(dir, kind) {
                    return Err(SapError::ProtocolCorruption("queue capacity changed"));
                }
            }
        }
        if self.sentinel() != SAP_CONTROL_BLOCK_ID {
            return Err(SapError::ProtocolCorruption("sentinel overwritten"));
        }
        Ok(())
    }

    fn sentinel_word(&self) -> &AtomicU32 {
        // SAFETY: the sentinel offset is 4-byte aligned (queue sizes are
        // multiples of 4) and lies within the allocation.
        unsafe { &*(self.base.as_ptr().add(self.layout.sentinel_offset()) as *const AtomicU32) }
    }
}

impl Drop for SharedArea {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with the very same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.alloc) };
    }
}

impl std::fmt::Debug for SharedArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArea")
            .field("base", &self.base)
            .field("size", &self.alloc.size())
            .finish()
    }
}
