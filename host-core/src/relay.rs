//! # Data-Plane Relay
//!
//! Moves Ethernet frames between the host network device and the firmware
//! data queues.
//!
//! Host to firmware: frames matched by the firmware filters (or copied on
//! transmit) are written to the data queue under the data-queue spin lock,
//! which never waits on the session lock. A full queue drops the frame.
//!
//! Firmware to host: the data queue is drained under the session lock and
//! the frames are handed to the network device after it is released.

use std::sync::atomic::Ordering;

use log::{debug, error, warn};
use sap_shared::protocol::{
    ByteWriter, CbDataHeader, Payload, SapHeader, SapMsgType, CB_TX_DHCP_FILT_IDX, SAP_HDR_SIZE,
};
use sap_shared::{CyclicQueue, Direction, QueueError, QueueKind};

use crate::context::{SapContext, SapDevice};
use crate::dispatch::{next_header, Batch};
use crate::error::{Result, SapError};
use crate::stats::RelayStats;
use crate::upstream::{EthernetFrame, RxVerdict};

impl SapDevice {
    /// Queue one frame for the firmware.
    ///
    /// `cb_tx` frames were transmitted by the host and carry the extended
    /// header telling the firmware which of its filters asked for them.
    pub(crate) fn add_data_to_ring(&self, frame: &[u8], cb_tx: bool) -> Result<()> {
        let live = self.data_q.lock();
        if !*live {
            return Err(SapError::NotConnected);
        }

        let (msg_type, ext_len) = if cb_tx {
            (SapMsgType::CbDataPacket, CbDataHeader::LEN)
        } else {
            (SapMsgType::DataPacket, 0)
        };
        let len = u16::try_from(ext_len + frame.len()).map_err(|_| {
            SapError::InvalidArgument(format!("frame of {} bytes", frame.len()))
        })?;

        let header = SapHeader::new(msg_type, len, self.next_sap_seq()).encode();
        let queue = self.shmem.queue(Direction::HostToMe, QueueKind::Data);

        let written = if cb_tx {
            let mut ext = [0u8; CbDataHeader::LEN];
            CbDataHeader {
                to_me_filt_status: 1 << CB_TX_DHCP_FILT_IDX,
                data_len: frame.len() as u32,
            }
            .encode_into(&mut ByteWriter::new(&mut ext));
            queue.write_parts(&[&header[..], &ext[..], frame])
        } else {
            queue.write_parts(&[&header[..], frame])
        };

        match written {
            Ok(_) => {
                self.stats.frame_to_firmware();
                Ok(())
            }
            Err(QueueError::InsufficientSpace) => {
                self.stats.frame_dropped_no_space();
                debug!("Data queue full, dropping a {} byte frame", frame.len());
                Err(SapError::InsufficientSpace)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Drain every frame published in the firmware-to-host data queue.
///
/// Non-data messages and frames shorter than an Ethernet header are skipped
/// on their own; a length beyond the published bytes ends the pass.
pub(crate) fn drain_data(queue: &CyclicQueue<'_>, stats: &RelayStats) -> Result<Batch<EthernetFrame>> {
    let mut reader = queue.reader()?;
    let mut batch = Batch::default();

    while reader.remaining() >= SAP_HDR_SIZE as u32 {
        let header = match next_header(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                batch.fault = Some(e);
                break;
            }
        };
        let len = header.len as usize;

        let skipped = if header.known_type() != Some(SapMsgType::DataPacket) {
            warn!("Unexpected message type {} in the data queue", header.msg_type);
            true
        } else if len < EthernetFrame::HEADER_LEN {
            error!("Data message shorter than an Ethernet header: {}", len);
            stats.frame_malformed();
            true
        } else {
            false
        };

        if skipped {
            if let Err(e) = reader.skip(header.len as u32) {
                batch.fault = Some(e.into());
                break;
            }
            continue;
        }

        let mut bytes = vec![0u8; len];
        if let Err(e) = reader.read(&mut bytes) {
            batch.fault = Some(e.into());
            break;
        }
        if let Some(frame) = EthernetFrame::parse(&bytes) {
            stats.frame_from_firmware();
            batch.items.push(frame);
        }
    }

    reader.finish();
    Ok(batch)
}

impl SapContext {
    /// Offer a frame received from the air to the firmware filters.
    ///
    /// Frames the network device classifies for the firmware are copied to
    /// the data queue. The verdict tells the caller whether the host stack
    /// keeps the frame.
    pub fn rx_from_air(&self, frame: &[u8]) -> RxVerdict {
        if !self.rx_hook.load(Ordering::Acquire) {
            return RxVerdict::Pass;
        }
        let (Some(netdev), Some(dev)) = (self.netdev(), self.device()) else {
            return RxVerdict::Pass;
        };
        let Some(filters) = dev.filters.snapshot() else {
            return RxVerdict::Pass;
        };

        let verdict = netdev.classify(frame, &filters);
        if verdict.to_firmware() {
            match dev.add_data_to_ring(frame, false) {
                Ok(()) => dev.coalescer.kick(),
                Err(e) => debug!("Frame not relayed to the firmware: {}", e),
            }
        }
        verdict
    }

    /// Copy a frame the host transmits to the firmware
    pub fn tx_copy_to_firmware(&self, frame: &[u8]) -> Result<()> {
        let dev = self.device().ok_or(SapError::NotConnected)?;
        dev.add_data_to_ring(frame, true)?;
        dev.coalescer.kick();
        Ok(())
    }

    pub(crate) fn deliver_frames(&self, frames: Vec<EthernetFrame>) {
        if frames.is_empty() {
            return;
        }
        let Some(netdev) = self.netdev() else {
            error!("Can't Tx {} frames without a network device", frames.len());
            return;
        };
        for frame in frames {
            netdev.transmit(frame);
        }
    }
}
