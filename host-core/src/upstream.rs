//! # Upstream Interfaces
//!
//! What the core exposes to the host network driver that registers with it
//! ([`SapOps`]) and what it needs from the host network device
//! ([`NetDevice`]).

use sap_shared::protocol::{ConnStatus, ConnectionInfo, ETH_ALEN};

use crate::filters::FilterSet;

/// Callbacks of the registered consumer.
///
/// They are invoked with the session lock held and must not call back into
/// the [`SapContext`](crate::SapContext).
pub trait SapOps: Send + Sync {
    /// The START handshake completed
    fn sap_connected(&self);

    /// The firmware reported its view of the link
    fn connection_status(&self, status: &ConnectionStatus);

    /// Block (`true`) or unblock the radio
    fn radio_kill(&self, blocked: bool);

    /// Whether the host may roam away from the current AP
    fn roaming_forbidden(&self, forbidden: bool);

    /// The device is going away while the bus is still up
    fn nic_stolen(&self);
}

/// Connection status as reported by the firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Link protection is active: the firmware wants the link untouched
    pub link_protected: bool,
    pub scan_request: bool,
    pub info: ConnectionInfo,
}

impl From<ConnStatus> for ConnectionStatus {
    fn from(status: ConnStatus) -> Self {
        Self {
            link_protected: status.link_prot_state != 0,
            scan_request: status.scan_request != 0,
            info: status.conn_info,
        }
    }
}

/// What happens to a frame received from the air
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    /// Host stack only
    Pass,
    /// Firmware gets a copy, host stack keeps it
    Copy,
    /// Firmware only
    Steal,
}

impl RxVerdict {
    pub fn to_firmware(self) -> bool {
        matches!(self, RxVerdict::Copy | RxVerdict::Steal)
    }

    pub fn host_keeps(self) -> bool {
        matches!(self, RxVerdict::Pass | RxVerdict::Copy)
    }
}

/// Host network device
pub trait NetDevice: Send + Sync {
    /// Transmit a frame the firmware asked the host to send
    fn transmit(&self, frame: EthernetFrame);

    /// Decide whether a received frame is of interest to the firmware
    fn classify(&self, frame: &[u8], filters: &FilterSet) -> RxVerdict;
}

/// An 802.3 frame: destination, source, ethertype and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: [u8; ETH_ALEN],
    pub src: [u8; ETH_ALEN],
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    pub const HEADER_LEN: usize = 14;

    /// Parse a frame; `None` when shorter than the Ethernet header
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::HEADER_LEN {
            return None;
        }
        let mut dst = [0u8; ETH_ALEN];
        let mut src = [0u8; ETH_ALEN];
        dst.copy_from_slice(&bytes[0..6]);
        src.copy_from_slice(&bytes[6..12]);
        Some(Self {
            dst,
            src,
            ethertype: u16::from_be_bytes([bytes[12], bytes[13]]),
            payload: bytes[Self::HEADER_LEN..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.dst);
        out.extend_from_slice(&self.src);
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Ethertype values below 0x600 are 802.3 lengths, not protocols
    pub fn is_ethertype(&self) -> bool {
        self.ethertype >= 0x0600
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ethernet_frame() {
        let mut raw = vec![0xff; 6];
        raw.extend_from_slice(&[2, 0, 0, 0, 0, 1]);
        raw.extend_from_slice(&[0x08, 0x00]);
        raw.extend_from_slice(b"ip packet");

        let frame = EthernetFrame::parse(&raw).unwrap();
        assert_eq!(frame.dst, [0xff; 6]);
        assert_eq!(frame.src, [2, 0, 0, 0, 0, 1]);
        assert_eq!(frame.ethertype, 0x0800);
        assert!(frame.is_ethertype());
        assert_eq!(frame.payload, b"ip packet");
        assert_eq!(frame.to_bytes(), raw);

        assert!(EthernetFrame::parse(&raw[..13]).is_none());
    }

    #[test]
    fn test_verdicts() {
        assert!(!RxVerdict::Pass.to_firmware());
        assert!(RxVerdict::Copy.to_firmware() && RxVerdict::Copy.host_keeps());
        assert!(!RxVerdict::Steal.host_keeps());
    }
}
