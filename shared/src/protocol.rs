//! # Protocol Message Definitions
//!
//! Two families of messages travel between the host and the firmware:
//!
//! - **Bus messages** go over the bus transport itself: the `START`
//!   handshake, its `START_OK` reply and the `CHECK_SHARED_AREA` doorbell.
//! - **SAP messages** go through the cyclic queues of the shared region:
//!   notifications on the notification queues, frames on the data queues.
//!
//! ## Frame Format
//!
//! ```text
//! Bus message                          SAP message
//! ┌────────┬─────────┬────────┬─────   ┌────────┬────────┬──────────┬─────────┐
//! │  type  │ seq_num │  len   │ ...    │  type  │  len   │ seq_num  │ payload │
//! │ 4 bytes│ 4 bytes │ 4 bytes│        │ 2 bytes│ 2 bytes│  4 bytes │ len B   │
//! └────────┴─────────┴────────┴─────   └────────┴────────┴──────────┴─────────┘
//! ```
//!
//! All fields are little-endian. Payload layouts are fixed size; each one
//! implements [`Payload`] with its exact encoded length.

use heapless::Vec;

/// The only SAP protocol version this host speaks
pub const SAP_VERSION: u8 = 3;

/// Size of [`MeMsgHeader`] on the wire
pub const ME_MSG_HDR_SIZE: usize = 12;

/// Size of [`SapHeader`] on the wire
pub const SAP_HDR_SIZE: usize = 8;

/// Initial sequence numbers advertised in the start message
pub const INIT_DATA_SEQ_NUM: u16 = 0x100;
pub const INIT_NOTIF_SEQ_NUM: u16 = 0x800;

/// Maximum SSID length carried in [`ConnectionInfo`]
pub const MAX_SSID_LEN: usize = 32;

/// Length of an Ethernet address
pub const ETH_ALEN: usize = 6;

/// Radio-kill state bits sent in `RADIO_STATE`
pub const SAP_SW_RFKILL_DEASSERTED: u32 = 1 << 0;
pub const SAP_HW_RFKILL_DEASSERTED: u32 = 1 << 1;

/// Filter status bit set on frames the host transmits on behalf of the
/// firmware's DHCP filter
pub const CB_TX_DHCP_FILT_IDX: u32 = 30;

/// Number of channels reported in the NVM
pub const NVM_NUM_CHANNELS: usize = 110;

/// Errors during message encoding/decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Output buffer too small for the message
    BufferTooSmall,
    /// Input shorter than the fixed layout
    TooShort,
    /// Header length disagrees with the bytes available
    LengthMismatch,
    /// Message type not known to this host
    UnknownType,
    /// SSID longer than [`MAX_SSID_LEN`]
    SsidTooLong,
}

// ============================================================================
// Bus messages
// ============================================================================

/// Bus message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum MeMsgType {
    Start = 1,
    StartOk = 2,
    CheckSharedArea = 3,
}

impl TryFrom<u32> for MeMsgType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Start),
            2 => Ok(Self::StartOk),
            3 => Ok(Self::CheckSharedArea),
            _ => Err(FrameError::UnknownType),
        }
    }
}

/// Header of every bus message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeMsgHeader {
    pub msg_type: u32,
    pub seq_num: u32,
    pub len: u32,
}

impl MeMsgHeader {
    pub fn encode(&self, out: &mut ByteWriter<'_>) {
        out.u32(self.msg_type);
        out.u32(self.seq_num);
        out.u32(self.len);
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut rd = ByteReader::new(data, ME_MSG_HDR_SIZE)?;
        Ok(Self {
            msg_type: rd.u32(),
            seq_num: rd.u32(),
            len: rd.u32(),
        })
    }
}

/// `START` message, also reused (header only) as the doorbell
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeMsgStart {
    pub hdr: MeMsgHeader,
    pub shared_mem: u64,
    pub init_data_seq_num: u16,
    pub init_notif_seq_num: u16,
    pub supported_versions: [u8; 64],
}

impl MeMsgStart {
    pub const SIZE: usize = 96;

    /// Handshake request advertising [`SAP_VERSION`]
    pub fn start(seq_num: u32) -> Self {
        let mut supported_versions = [0u8; 64];
        supported_versions[0] = SAP_VERSION;
        Self {
            hdr: MeMsgHeader {
                msg_type: MeMsgType::Start as u32,
                seq_num,
                len: Self::SIZE as u32,
            },
            shared_mem: 0,
            init_data_seq_num: INIT_DATA_SEQ_NUM,
            init_notif_seq_num: INIT_NOTIF_SEQ_NUM,
            supported_versions,
        }
    }

    /// The doorbell: a start-sized message with only type and sequence set
    pub fn check_shared_area(seq_num: u32) -> Self {
        Self {
            hdr: MeMsgHeader {
                msg_type: MeMsgType::CheckSharedArea as u32,
                seq_num,
                len: 0,
            },
            shared_mem: 0,
            init_data_seq_num: 0,
            init_notif_seq_num: 0,
            supported_versions: [0u8; 64],
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut out = ByteWriter::new(&mut buf);
        self.hdr.encode(&mut out);
        out.u64(self.shared_mem);
        out.u16(self.init_data_seq_num);
        out.u16(self.init_notif_seq_num);
        out.bytes(&self.supported_versions);
        out.zeros(8);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let hdr = MeMsgHeader::decode(data)?;
        let mut rd = ByteReader::new(data, Self::SIZE)?;
        rd.skip(ME_MSG_HDR_SIZE);
        Ok(Self {
            hdr,
            shared_mem: rd.u64(),
            init_data_seq_num: rd.u16(),
            init_notif_seq_num: rd.u16(),
            supported_versions: rd.array(),
        })
    }
}

/// `START_OK` reply from the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeMsgStartOk {
    pub hdr: MeMsgHeader,
    pub init_data_seq_num: u16,
    pub init_notif_seq_num: u16,
    pub supported_version: u8,
}

impl MeMsgStartOk {
    pub const SIZE: usize = 20;

    pub fn new(seq_num: u32, supported_version: u8) -> Self {
        Self {
            hdr: MeMsgHeader {
                msg_type: MeMsgType::StartOk as u32,
                seq_num,
                len: Self::SIZE as u32,
            },
            init_data_seq_num: INIT_DATA_SEQ_NUM,
            init_notif_seq_num: INIT_NOTIF_SEQ_NUM,
            supported_version,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut out = ByteWriter::new(&mut buf);
        self.hdr.encode(&mut out);
        out.u16(self.init_data_seq_num);
        out.u16(self.init_notif_seq_num);
        out.u8(self.supported_version);
        out.zeros(3);
        buf
    }

    /// Decode a reply; the length must match the layout exactly
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() != Self::SIZE {
            return Err(FrameError::LengthMismatch);
        }
        let hdr = MeMsgHeader::decode(data)?;
        let mut rd = ByteReader::new(data, Self::SIZE)?;
        rd.skip(ME_MSG_HDR_SIZE);
        Ok(Self {
            hdr,
            init_data_seq_num: rd.u16(),
            init_notif_seq_num: rd.u16(),
            supported_version: rd.u8(),
        })
    }
}

// ============================================================================
// SAP messages
// ============================================================================

/// SAP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum SapMsgType {
    // Both ways
    Ping = 1,
    Pong = 2,

    // From the firmware
    CsmeFilters = 500,
    AmtState = 502,
    CsmeReplyToHostOwnershipReq = 503,
    CsmeTakingOwnership = 504,
    TriggerIpRefresh = 505,
    CsmeCanReleaseOwnership = 506,
    NicOwner = 511,
    CsmeConnStatus = 512,
    Nvm = 513,

    // From the host
    BandSelection = 1000,
    RadioState = 1001,
    NicInfo = 1002,
    HostAsksForNicOwnership = 1003,
    HostSuspends = 1004,
    HostResumes = 1005,
    HostGoesDown = 1006,
    CsmeOwnershipConfirmed = 1007,
    CountryCode = 1008,
    HostLinkUp = 1009,
    HostLinkDown = 1010,
    WhoOwnsNic = 1011,
    WifidrDown = 1012,
    WifidrUp = 1013,
    HostOwnershipConfirmed = 1015,
    SarLimits = 1016,
    GetNvm = 1017,

    // Data queues
    DataPacket = 2000,
    CbDataPacket = 2001,
}

impl TryFrom<u16> for SapMsgType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Ping,
            2 => Self::Pong,
            500 => Self::CsmeFilters,
            502 => Self::AmtState,
            503 => Self::CsmeReplyToHostOwnershipReq,
            504 => Self::CsmeTakingOwnership,
            505 => Self::TriggerIpRefresh,
            506 => Self::CsmeCanReleaseOwnership,
            511 => Self::NicOwner,
            512 => Self::CsmeConnStatus,
            513 => Self::Nvm,
            1000 => Self::BandSelection,
            1001 => Self::RadioState,
            1002 => Self::NicInfo,
            1003 => Self::HostAsksForNicOwnership,
            1004 => Self::HostSuspends,
            1005 => Self::HostResumes,
            1006 => Self::HostGoesDown,
            1007 => Self::CsmeOwnershipConfirmed,
            1008 => Self::CountryCode,
            1009 => Self::HostLinkUp,
            1010 => Self::HostLinkDown,
            1011 => Self::WhoOwnsNic,
            1012 => Self::WifidrDown,
            1013 => Self::WifidrUp,
            1015 => Self::HostOwnershipConfirmed,
            1016 => Self::SarLimits,
            1017 => Self::GetNvm,
            2000 => Self::DataPacket,
            2001 => Self::CbDataPacket,
            _ => return Err(FrameError::UnknownType),
        })
    }
}

/// Header of every SAP message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SapHeader {
    pub msg_type: u16,
    /// Payload bytes following the header
    pub len: u16,
    pub seq_num: u32,
}

impl SapHeader {
    pub fn new(msg_type: SapMsgType, len: u16, seq_num: u32) -> Self {
        Self {
            msg_type: msg_type as u16,
            len,
            seq_num,
        }
    }

    pub fn encode(&self) -> [u8; SAP_HDR_SIZE] {
        let mut buf = [0u8; SAP_HDR_SIZE];
        let mut out = ByteWriter::new(&mut buf);
        out.u16(self.msg_type);
        out.u16(self.len);
        out.u32(self.seq_num);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut rd = ByteReader::new(data, SAP_HDR_SIZE)?;
        Ok(Self {
            msg_type: rd.u16(),
            len: rd.u16(),
            seq_num: rd.u32(),
        })
    }

    /// Known type of this message, if any
    pub fn known_type(&self) -> Option<SapMsgType> {
        SapMsgType::try_from(self.msg_type).ok()
    }

    /// Header plus payload
    pub fn total_len(&self) -> usize {
        SAP_HDR_SIZE + self.len as usize
    }
}

/// Fixed-size SAP payload layouts
pub trait Payload: Sized {
    /// Encoded payload length, header excluded
    const LEN: usize;

    /// Write exactly [`Self::LEN`] bytes
    fn encode_into(&self, out: &mut ByteWriter<'_>);

    /// Decode from the first [`Self::LEN`] bytes of `rd`
    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError>;

    /// Minimum message length (header included) accepted for this layout
    fn min_message_len() -> usize {
        SAP_HDR_SIZE + Self::LEN
    }

    fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let mut rd = ByteReader::new(payload, Self::LEN)?;
        Self::decode_from(&mut rd)
    }
}

/// Serialize `header || payload` into `out`, returning the bytes written
pub fn encode_message<P: Payload>(
    msg_type: SapMsgType,
    seq_num: u32,
    payload: &P,
    out: &mut [u8],
) -> Result<usize, FrameError> {
    let total = SAP_HDR_SIZE + P::LEN;
    if out.len() < total {
        return Err(FrameError::BufferTooSmall);
    }
    let hdr = SapHeader::new(msg_type, P::LEN as u16, seq_num);
    out[..SAP_HDR_SIZE].copy_from_slice(&hdr.encode());
    let mut wr = ByteWriter::new(&mut out[SAP_HDR_SIZE..total]);
    payload.encode_into(&mut wr);
    Ok(total)
}

/// Split one complete message into its header and payload.
///
/// `data` must hold at least the header and `header.len` payload bytes;
/// trailing bytes are ignored.
pub fn split_message(data: &[u8]) -> Result<(SapHeader, &[u8]), FrameError> {
    let hdr = SapHeader::decode(data)?;
    let end = hdr.total_len();
    if data.len() < end {
        return Err(FrameError::LengthMismatch);
    }
    Ok((hdr, &data[SAP_HDR_SIZE..end]))
}

/// Header-only message (PING, PONG, ownership notifications, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Empty;

impl Payload for Empty {
    const LEN: usize = 0;

    fn encode_into(&self, _out: &mut ByteWriter<'_>) {}

    fn decode_from(_rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        Ok(Empty)
    }
}

/// Single 32-bit value (AMT state, ownership reply, NIC owner, radio state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dword {
    pub val: u32,
}

impl Payload for Dword {
    const LEN: usize = 4;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.u32(self.val);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        Ok(Self { val: rd.u32() })
    }
}

/// Owner reported in `NIC_OWNER`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum NicOwner {
    Unknown = 0,
    Host = 1,
    Me = 2,
}

impl From<u32> for NicOwner {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Host,
            2 => Self::Me,
            _ => Self::Unknown,
        }
    }
}

/// Authentication modes carried in [`ConnectionInfo`]
pub mod auth {
    pub const OPEN: u32 = 0;
    pub const RSNA: u32 = 6;
    pub const RSNA_PSK: u32 = 7;
    pub const SAE: u32 = 9;
}

/// Pairwise ciphers carried in [`ConnectionInfo`]
pub mod cipher {
    pub const NONE: u32 = 0;
    pub const CCMP: u32 = 4;
    pub const GCMP: u32 = 8;
    pub const GCMP_256: u32 = 9;
}

/// Association description shared by `HOST_LINK_UP` and `CSME_CONN_STATUS`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionInfo {
    pub ssid: Vec<u8, MAX_SSID_LEN>,
    pub auth_mode: u32,
    pub pairwise_cipher: u32,
    pub channel: u8,
    pub band: u8,
    pub bssid: [u8; ETH_ALEN],
}

impl Payload for ConnectionInfo {
    const LEN: usize = 56;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.u32(self.ssid.len() as u32);
        let mut ssid = [0u8; MAX_SSID_LEN];
        ssid[..self.ssid.len()].copy_from_slice(&self.ssid);
        out.bytes(&ssid);
        out.u32(self.auth_mode);
        out.u32(self.pairwise_cipher);
        out.u8(self.channel);
        out.u8(self.band);
        out.u16(0);
        out.bytes(&self.bssid);
        out.u16(0);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let ssid_len = rd.u32() as usize;
        let raw_ssid: [u8; MAX_SSID_LEN] = rd.array();
        if ssid_len > MAX_SSID_LEN {
            return Err(FrameError::SsidTooLong);
        }
        let mut ssid = Vec::new();
        ssid.extend_from_slice(&raw_ssid[..ssid_len])
            .map_err(|_| FrameError::SsidTooLong)?;
        let auth_mode = rd.u32();
        let pairwise_cipher = rd.u32();
        let channel = rd.u8();
        let band = rd.u8();
        rd.skip(2);
        let bssid = rd.array();
        rd.skip(2);
        Ok(Self {
            ssid,
            auth_mode,
            pairwise_cipher,
            channel,
            band,
            bssid,
        })
    }
}

/// `CSME_CONN_STATUS`: the firmware's view of the link
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnStatus {
    pub link_prot_state: u32,
    pub scan_request: u32,
    pub conn_info: ConnectionInfo,
}

impl Payload for ConnStatus {
    const LEN: usize = 8 + ConnectionInfo::LEN;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.u32(self.link_prot_state);
        out.u32(self.scan_request);
        self.conn_info.encode_into(out);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            link_prot_state: rd.u32(),
            scan_request: rd.u32(),
            conn_info: ConnectionInfo::decode_from(rd)?,
        })
    }
}

/// `HOST_LINK_UP`: association info plus the co-located AP, if any
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostLinkUp {
    pub conn_info: ConnectionInfo,
    pub colloc_channel: u8,
    pub colloc_band: u8,
    pub colloc_bssid: [u8; ETH_ALEN],
}

impl Payload for HostLinkUp {
    const LEN: usize = ConnectionInfo::LEN + 12;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        self.conn_info.encode_into(out);
        out.u8(self.colloc_channel);
        out.u8(self.colloc_band);
        out.u16(0);
        out.bytes(&self.colloc_bssid);
        out.u16(0);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let conn_info = ConnectionInfo::decode_from(rd)?;
        let colloc_channel = rd.u8();
        let colloc_band = rd.u8();
        rd.skip(2);
        let colloc_bssid = rd.array();
        rd.skip(2);
        Ok(Self {
            conn_info,
            colloc_channel,
            colloc_band,
            colloc_bssid,
        })
    }
}

/// Link-down flavours for `HOST_LINK_DOWN`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LinkDownType {
    None = 0,
    Temporary = 1,
    Long = 2,
}

/// `HOST_LINK_DOWN`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostLinkDown {
    pub down_type: u8,
    pub reason_valid: u8,
    pub reason: u32,
}

impl HostLinkDown {
    pub fn long() -> Self {
        Self {
            down_type: LinkDownType::Long as u8,
            reason_valid: 0,
            reason: 0,
        }
    }
}

impl Payload for HostLinkDown {
    const LEN: usize = 8;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.u8(self.down_type);
        out.zeros(2);
        out.u8(self.reason_valid);
        out.u32(self.reason);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let down_type = rd.u8();
        rd.skip(2);
        Ok(Self {
            down_type,
            reason_valid: rd.u8(),
            reason: rd.u32(),
        })
    }
}

/// `COUNTRY_CODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CountryCode {
    pub mcc: u16,
    pub source_id: u8,
    pub diff_time: u32,
}

impl Payload for CountryCode {
    const LEN: usize = 8;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.u16(self.mcc);
        out.u8(self.source_id);
        out.u8(0);
        out.u32(self.diff_time);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let mcc = rd.u16();
        let source_id = rd.u8();
        rd.skip(1);
        Ok(Self {
            mcc,
            source_id,
            diff_time: rd.u32(),
        })
    }
}

/// `NIC_INFO`: interface and NVM MAC addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NicInfo {
    pub mac_address: [u8; ETH_ALEN],
    pub nvm_address: [u8; ETH_ALEN],
}

impl Payload for NicInfo {
    const LEN: usize = 12;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.bytes(&self.mac_address);
        out.bytes(&self.nvm_address);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            mac_address: rd.array(),
            nvm_address: rd.array(),
        })
    }
}

/// Per-chain power limits: 2 chains x 5 sub-bands
pub type SarTable = [[u16; 5]; 2];

/// `SAR_LIMITS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SarLimits {
    pub chains: SarTable,
}

impl Payload for SarLimits {
    const LEN: usize = 20;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        for chain in &self.chains {
            for limit in chain {
                out.u16(*limit);
            }
        }
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let mut chains = [[0u16; 5]; 2];
        for chain in chains.iter_mut() {
            for limit in chain.iter_mut() {
                *limit = rd.u16();
            }
        }
        Ok(Self { chains })
    }
}

/// `NVM`: the firmware's copy of the device NVM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nvm {
    pub hw_addr: [u8; ETH_ALEN],
    pub n_hw_addrs: u8,
    pub radio_cfg: u32,
    pub caps: u32,
    pub nvm_version: u32,
    pub channels: [u32; NVM_NUM_CHANNELS],
}

impl Default for Nvm {
    fn default() -> Self {
        Self {
            hw_addr: [0; ETH_ALEN],
            n_hw_addrs: 0,
            radio_cfg: 0,
            caps: 0,
            nvm_version: 0,
            channels: [0; NVM_NUM_CHANNELS],
        }
    }
}

impl Payload for Nvm {
    const LEN: usize = 20 + 4 * NVM_NUM_CHANNELS;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.bytes(&self.hw_addr);
        out.u8(self.n_hw_addrs);
        out.u8(0);
        out.u32(self.radio_cfg);
        out.u32(self.caps);
        out.u32(self.nvm_version);
        for channel in &self.channels {
            out.u32(*channel);
        }
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let hw_addr = rd.array();
        let n_hw_addrs = rd.u8();
        rd.skip(1);
        let radio_cfg = rd.u32();
        let caps = rd.u32();
        let nvm_version = rd.u32();
        let mut channels = [0u32; NVM_NUM_CHANNELS];
        for channel in channels.iter_mut() {
            *channel = rd.u32();
        }
        Ok(Self {
            hw_addr,
            n_hw_addrs,
            radio_cfg,
            caps,
            nvm_version,
            channels,
        })
    }
}

pub const SAP_MAX_FLEX_FILTERS: usize = 14;
pub const SAP_MAX_IPV6_FILTERS: usize = 4;
pub const SAP_MAX_ETH_FILTERS: usize = 5;

/// UDP/TCP port filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlexFilter {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

/// IPv6 filter matching the low 24 bits of the address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ipv6Filter {
    pub addr_lo24: [u8; 3],
    pub flags: u8,
}

/// Destination MAC filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EthFilter {
    pub mac_address: [u8; ETH_ALEN],
    pub flags: u8,
}

/// IPv4 address filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ipv4Filter {
    pub ipv4_addr: u32,
    pub flags: u32,
}

/// Out-of-band filters carried by `CSME_FILTERS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OobFilters {
    pub flex_filters: [FlexFilter; SAP_MAX_FLEX_FILTERS],
    pub icmpv6_flags: u32,
    pub ipv6_filters: [Ipv6Filter; SAP_MAX_IPV6_FILTERS],
    pub eth_filters: [EthFilter; SAP_MAX_ETH_FILTERS],
    pub ipv4_filter: Ipv4Filter,
}

impl Payload for OobFilters {
    const LEN: usize = 6 * SAP_MAX_FLEX_FILTERS
        + 4
        + 4 * SAP_MAX_IPV6_FILTERS
        + 7 * SAP_MAX_ETH_FILTERS
        + 1
        + 8;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        for f in &self.flex_filters {
            out.u16(f.src_port);
            out.u16(f.dst_port);
            out.u8(f.flags);
            out.u8(0);
        }
        out.u32(self.icmpv6_flags);
        for f in &self.ipv6_filters {
            out.bytes(&f.addr_lo24);
            out.u8(f.flags);
        }
        for f in &self.eth_filters {
            out.bytes(&f.mac_address);
            out.u8(f.flags);
        }
        out.u8(0);
        out.u32(self.ipv4_filter.ipv4_addr);
        out.u32(self.ipv4_filter.flags);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let mut filters = Self::default();
        for f in filters.flex_filters.iter_mut() {
            f.src_port = rd.u16();
            f.dst_port = rd.u16();
            f.flags = rd.u8();
            rd.skip(1);
        }
        filters.icmpv6_flags = rd.u32();
        for f in filters.ipv6_filters.iter_mut() {
            f.addr_lo24 = rd.array();
            f.flags = rd.u8();
        }
        for f in filters.eth_filters.iter_mut() {
            f.mac_address = rd.array();
            f.flags = rd.u8();
        }
        rd.skip(1);
        filters.ipv4_filter.ipv4_addr = rd.u32();
        filters.ipv4_filter.flags = rd.u32();
        Ok(filters)
    }
}

/// Header extension of `CB_DATA_PACKET` frames, following the SAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CbDataHeader {
    pub to_me_filt_status: u32,
    pub data_len: u32,
}

impl Payload for CbDataHeader {
    const LEN: usize = 40;

    fn encode_into(&self, out: &mut ByteWriter<'_>) {
        out.zeros(28);
        out.u32(self.to_me_filt_status);
        out.u32(0);
        out.u32(self.data_len);
    }

    fn decode_from(rd: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        rd.skip(28);
        let to_me_filt_status = rd.u32();
        rd.skip(4);
        Ok(Self {
            to_me_filt_status,
            data_len: rd.u32(),
        })
    }
}

// ============================================================================
// Little-endian cursor helpers
// ============================================================================

/// Little-endian writer over a pre-sized buffer.
///
/// Callers size the buffer from [`Payload::LEN`]; writing past the end is a
/// programming error and panics like any slice overrun.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    pub fn zeros(&mut self, len: usize) {
        self.buf[self.pos..self.pos + len].fill(0);
        self.pos += len;
    }

    pub fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }

    pub fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
}

/// Little-endian reader over a buffer checked up front for a minimum length
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Fails with [`FrameError::TooShort`] unless `buf` holds `need` bytes;
    /// reads within those bytes cannot fail afterwards.
    pub fn new(buf: &'a [u8], need: usize) -> Result<Self, FrameError> {
        if buf.len() < need {
            return Err(FrameError::TooShort);
        }
        Ok(Self {
            buf: &buf[..need],
            pos: 0,
        })
    }

    pub fn skip(&mut self, len: usize) {
        self.pos += len;
    }

    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    pub fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }
}
