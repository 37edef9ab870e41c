//! # Shared Memory Layout
//!
//! Bit-exact description of the region shared with the firmware.
//!
//! ```text
//! ┌───────────────────────────────────┐ 0
//! │ ControlBlock (64 bytes)           │
//! ├───────────────────────────────────┤
//! │ Host -> ME data queue             │
//! ├───────────────────────────────────┤
//! │ Host -> ME notif queue            │
//! ├───────────────────────────────────┤
//! │ ME -> Host data queue             │
//! ├───────────────────────────────────┤
//! │ ME -> Host notif queue            │
//! ├───────────────────────────────────┤
//! │ sentinel: SAP control block id    │
//! ├───────────────────────────────────┤
//! │ padding up to the page size       │
//! └───────────────────────────────────┘
//! ```
//!
//! All multi-byte fields are little-endian. The firmware only trusts a
//! region whose header magic and trailing sentinel are both in place.

use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::queue::QueueControl;

/// "SAP!" in ASCII, little-endian
pub const SAP_CONTROL_BLOCK_ID: u32 = 0x2150_4153;

/// Host page size the region is rounded up to
pub const PAGE_SIZE: usize = 4096;

pub const SAP_H2M_DATA_Q_SZ: u32 = 48256;
pub const SAP_M2H_DATA_Q_SZ: u32 = 24128;
pub const SAP_H2M_NOTIF_Q_SZ: u32 = 2240;
pub const SAP_M2H_NOTIF_Q_SZ: u32 = 62720;

/// Size of the trailing sentinel word
pub const SENTINEL_SIZE: usize = 4;

/// Queue direction, index into [`ControlBlock`] directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    /// Host to firmware
    HostToMe = 0,
    /// Firmware to host
    MeToHost = 1,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::HostToMe, Direction::MeToHost];
}

/// Queue kind within a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QueueKind {
    /// Link-layer frames
    Data = 0,
    /// SAP notifications
    Notif = 1,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Data, QueueKind::Notif];
}

/// Per-direction control structure: `{reserved, queues[2]}`
#[repr(C)]
#[derive(Debug)]
pub struct SapDirection {
    reserved: AtomicU32,
    queues: [QueueControl; 2],
}

/// Header of the shared region
#[repr(C)]
#[derive(Debug)]
pub struct ControlBlock {
    sap_id: AtomicU32,
    size: AtomicU32,
    dir: [SapDirection; 2],
}

pub const CONTROL_BLOCK_SIZE: usize = core::mem::size_of::<ControlBlock>();

const _: () = assert!(core::mem::size_of::<SapDirection>() == 28);
const _: () = assert!(CONTROL_BLOCK_SIZE == 64);
const _: () = assert!(core::mem::align_of::<ControlBlock>() == 4);

impl ControlBlock {
    /// Magic identifier as stored in the region
    pub fn sap_id(&self) -> u32 {
        u32::from_le(self.sap_id.load(Ordering::Acquire))
    }

    /// Control block size as stored in the region
    pub fn size(&self) -> u32 {
        u32::from_le(self.size.load(Ordering::Relaxed))
    }

    pub fn queue(&self, dir: Direction, kind: QueueKind) -> &QueueControl {
        &self.dir[dir as usize].queues[kind as usize]
    }

    /// Write the queue capacities, then the size and finally the magic.
    /// The region must be zeroed beforehand.
    pub fn init(&self, sizes: &QueueSizes) {
        for dir in Direction::ALL {
            self.dir[dir as usize].reserved.store(0, Ordering::Relaxed);
            for kind in QueueKind::ALL {
                self.queue(dir, kind).init(sizes.get(dir, kind));
            }
        }
        self.size
            .store((CONTROL_BLOCK_SIZE as u32).to_le(), Ordering::Relaxed);
        self.sap_id
            .store(SAP_CONTROL_BLOCK_ID.to_le(), Ordering::Release);
    }
}

/// Byte capacities of the four queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct QueueSizes {
    pub h2m_data: u32,
    pub h2m_notif: u32,
    pub m2h_data: u32,
    pub m2h_notif: u32,
}

impl QueueSizes {
    pub const fn new() -> Self {
        Self {
            h2m_data: SAP_H2M_DATA_Q_SZ,
            h2m_notif: SAP_H2M_NOTIF_Q_SZ,
            m2h_data: SAP_M2H_DATA_Q_SZ,
            m2h_notif: SAP_M2H_NOTIF_Q_SZ,
        }
    }

    pub const fn get(&self, dir: Direction, kind: QueueKind) -> u32 {
        match (dir, kind) {
            (Direction::HostToMe, QueueKind::Data) => self.h2m_data,
            (Direction::HostToMe, QueueKind::Notif) => self.h2m_notif,
            (Direction::MeToHost, QueueKind::Data) => self.m2h_data,
            (Direction::MeToHost, QueueKind::Notif) => self.m2h_notif,
        }
    }

    pub const fn total(&self) -> usize {
        self.h2m_data as usize
            + self.h2m_notif as usize
            + self.m2h_data as usize
            + self.m2h_notif as usize
    }
}

impl Default for QueueSizes {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offsets of every part of the region for a given set of queue sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    sizes: QueueSizes,
    queue_offsets: [[usize; 2]; 2],
    sentinel_offset: usize,
    total_size: usize,
}

impl RegionLayout {
    /// Queues follow the control block in `(direction, kind)` order: data
    /// before notifications, host-to-firmware before firmware-to-host.
    pub const fn new(sizes: QueueSizes) -> Self {
        let h2m_data = CONTROL_BLOCK_SIZE;
        let h2m_notif = h2m_data + sizes.h2m_data as usize;
        let m2h_data = h2m_notif + sizes.h2m_notif as usize;
        let m2h_notif = m2h_data + sizes.m2h_data as usize;
        let sentinel_offset = m2h_notif + sizes.m2h_notif as usize;

        Self {
            sizes,
            queue_offsets: [[h2m_data, h2m_notif], [m2h_data, m2h_notif]],
            sentinel_offset,
            total_size: round_up(sentinel_offset + SENTINEL_SIZE, PAGE_SIZE),
        }
    }

    pub const fn sizes(&self) -> &QueueSizes {
        &self.sizes
    }

    /// Offset of the first byte of a queue
    pub const fn queue_offset(&self, dir: Direction, kind: QueueKind) -> usize {
        self.queue_offsets[dir as usize][kind as usize]
    }

    pub fn queue_range(&self, dir: Direction, kind: QueueKind) -> Range<usize> {
        let start = self.queue_offset(dir, kind);
        start..start + self.sizes.get(dir, kind) as usize
    }

    pub const fn sentinel_offset(&self) -> usize {
        self.sentinel_offset
    }

    /// Bytes actually used, before page rounding
    pub const fn used_size(&self) -> usize {
        self.sentinel_offset + SENTINEL_SIZE
    }

    /// Page-rounded size of the region
    pub const fn total_size(&self) -> usize {
        self.total_size
    }
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self::new(QueueSizes::new())
    }
}

pub const fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_offsets() {
        let layout = RegionLayout::default();
        assert_eq!(layout.queue_offset(Direction::HostToMe, QueueKind::Data), 64);
        assert_eq!(
            layout.queue_offset(Direction::HostToMe, QueueKind::Notif),
            64 + 48256
        );
        assert_eq!(
            layout.queue_offset(Direction::MeToHost, QueueKind::Data),
            64 + 48256 + 2240
        );
        assert_eq!(
            layout.queue_offset(Direction::MeToHost, QueueKind::Notif),
            64 + 48256 + 2240 + 24128
        );
        assert_eq!(layout.sentinel_offset(), 64 + 137_344);
        assert_eq!(layout.used_size(), 137_412);
        assert_eq!(layout.total_size(), 139_264);
        assert_eq!(layout.total_size() % PAGE_SIZE, 0);
    }

    #[test]
    fn test_small_layout_rounds_to_one_page() {
        let sizes = QueueSizes {
            h2m_data: 16,
            h2m_notif: 32,
            m2h_data: 16,
            m2h_notif: 32,
        };
        let layout = RegionLayout::new(sizes);
        assert_eq!(layout.queue_range(Direction::MeToHost, QueueKind::Notif), 128..160);
        assert_eq!(layout.sentinel_offset(), 160);
        assert_eq!(layout.total_size(), PAGE_SIZE);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
