//! # Message Dispatch
//!
//! Outbound control messages go through [`SapContext::send_notif`]: stamp a
//! sequence number, serialize `header || payload` into the host-to-firmware
//! notification queue, then ring the doorbell through the coalescer.
//!
//! Inbound traffic starts with a bus message. A "check shared area" doorbell
//! drains the firmware-to-host notification queue first, without the session
//! lock (each handler takes the locks it needs), then the data queue under
//! the session lock. Frames the firmware wants on the air are handed to the
//! network device once every lock is released.
//!
//! ```text
//! bus rx ──► START_OK ──────────► session
//!        └─► CHECK_SHARED_AREA ─► notif queue ──► handler table
//!                               └► data queue ───► NetDevice::transmit
//! ```

use std::sync::atomic::Ordering;
use std::sync::PoisonError;

use log::{debug, error, info, warn};
use sap_shared::protocol::{
    encode_message, ConnStatus, Dword, Empty, MeMsgHeader, MeMsgType, NicOwner, Nvm, OobFilters,
    Payload, SapHeader, SapMsgType, SAP_HDR_SIZE,
};
use sap_shared::{CyclicQueue, Direction, FrameError, QueueKind, QueueReader};

use crate::context::{Guarded, SapContext, SapDevice};
use crate::error::{Result, SapError};
use crate::filters::FilterSet;
use crate::relay;
use crate::transport::BUS_RX_BUF_SIZE;
use crate::upstream::ConnectionStatus;

/// Largest control message the host sends
const MAX_NOTIF_SIZE: usize = 512;

/// Items drained in one pass, plus the fault that stopped the pass early
#[derive(Debug)]
pub(crate) struct Batch<T> {
    pub(crate) items: Vec<T>,
    pub(crate) fault: Option<SapError>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            fault: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundMessage {
    pub(crate) header: SapHeader,
    pub(crate) payload: Vec<u8>,
}

/// Read the next SAP header of a batch, checking that its payload is fully
/// available
pub(crate) fn next_header(reader: &mut QueueReader<'_>) -> Result<SapHeader> {
    if reader.remaining() < SAP_HDR_SIZE as u32 {
        return Err(SapError::ProtocolCorruption("truncated SAP header"));
    }
    let mut raw = [0u8; SAP_HDR_SIZE];
    reader.read(&mut raw)?;
    let header = SapHeader::decode(&raw)?;
    if header.len as u32 > reader.remaining() {
        return Err(SapError::ProtocolCorruption(
            "SAP message longer than the queue contents",
        ));
    }
    Ok(header)
}

/// Drain every notification published in `queue`.
///
/// Messages decoded before a fault are kept. The read cursor always ends at
/// the write cursor observed when the pass started.
pub(crate) fn drain_notifications(queue: &CyclicQueue<'_>) -> Result<Batch<InboundMessage>> {
    let mut reader = queue.reader()?;
    let mut batch = Batch::default();

    while !reader.is_empty() {
        let header = match next_header(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                batch.fault = Some(e);
                break;
            }
        };
        let mut payload = vec![0u8; header.len as usize];
        if let Err(e) = reader.read(&mut payload) {
            batch.fault = Some(e.into());
            break;
        }
        batch.items.push(InboundMessage { header, payload });
    }

    reader.finish();
    Ok(batch)
}

// ============================================================================
// Handler table
// ============================================================================

type HandlerFn = fn(&SapContext, &SapDevice, &mut Guarded, &[u8]);

struct Handler {
    msg_type: SapMsgType,
    /// Minimum message length, header included
    min_len: usize,
    /// Take the registration lock before the session lock
    registration: bool,
    run: HandlerFn,
}

static HANDLERS: &[Handler] = &[
    Handler {
        msg_type: SapMsgType::Ping,
        min_len: SAP_HDR_SIZE,
        registration: false,
        run: handle_ping,
    },
    Handler {
        msg_type: SapMsgType::Pong,
        min_len: SAP_HDR_SIZE,
        registration: false,
        run: handle_pong,
    },
    Handler {
        msg_type: SapMsgType::CsmeFilters,
        min_len: SAP_HDR_SIZE + OobFilters::LEN,
        registration: false,
        run: handle_filters,
    },
    Handler {
        msg_type: SapMsgType::AmtState,
        min_len: SAP_HDR_SIZE + Dword::LEN,
        registration: true,
        run: handle_amt_state,
    },
    Handler {
        msg_type: SapMsgType::CsmeReplyToHostOwnershipReq,
        min_len: SAP_HDR_SIZE + Dword::LEN,
        registration: false,
        run: handle_ownership_reply,
    },
    Handler {
        msg_type: SapMsgType::CsmeTakingOwnership,
        min_len: SAP_HDR_SIZE,
        registration: false,
        run: handle_taking_ownership,
    },
    Handler {
        msg_type: SapMsgType::CsmeCanReleaseOwnership,
        min_len: SAP_HDR_SIZE,
        registration: false,
        run: handle_can_release_ownership,
    },
    Handler {
        msg_type: SapMsgType::NicOwner,
        min_len: SAP_HDR_SIZE + Dword::LEN,
        registration: false,
        run: handle_nic_owner,
    },
    Handler {
        msg_type: SapMsgType::CsmeConnStatus,
        min_len: SAP_HDR_SIZE + ConnStatus::LEN,
        registration: false,
        run: handle_conn_status,
    },
    Handler {
        msg_type: SapMsgType::Nvm,
        min_len: SAP_HDR_SIZE + Nvm::LEN,
        registration: false,
        run: handle_nvm,
    },
];

fn handle_ping(ctx: &SapContext, dev: &SapDevice, state: &mut Guarded, _payload: &[u8]) {
    ctx.send_logged(dev, state, SapMsgType::Pong, &Empty);
}

fn handle_pong(ctx: &SapContext, _dev: &SapDevice, state: &mut Guarded, _payload: &[u8]) {
    state.ping_pending = false;
    ctx.ping_wq.notify_all();
}

fn handle_filters(_ctx: &SapContext, dev: &SapDevice, _state: &mut Guarded, payload: &[u8]) {
    match OobFilters::decode(payload) {
        Ok(oob) => {
            dev.filters.replace(FilterSet::new(oob));
            debug!("Firmware filters updated");
        }
        Err(e) => warn!("Invalid filters message: {:?}", e),
    }
}

fn handle_amt_state(ctx: &SapContext, dev: &SapDevice, state: &mut Guarded, payload: &[u8]) {
    let Ok(Dword { val }) = Dword::decode(payload) else {
        return;
    };
    let enabled = val != 0;
    if state.amt_enabled == enabled {
        return;
    }

    state.amt_enabled = enabled;
    info!("AMT is {}", if enabled { "enabled" } else { "disabled" });

    if enabled {
        if ctx.netdev().is_some() {
            ctx.rx_hook.store(true, Ordering::Release);
        }
        ctx.push_init_config(dev, state);
    } else {
        if let Some(ops) = &state.ops {
            ops.radio_kill(false);
        }
        ctx.rx_hook.store(false, Ordering::Release);
    }
}

fn handle_ownership_reply(ctx: &SapContext, dev: &SapDevice, state: &mut Guarded, payload: &[u8]) {
    let Ok(Dword { val }) = Dword::decode(payload) else {
        return;
    };

    if !state.ownership.on_reply(val != 0) {
        info!("Ownership request denied");
        return;
    }

    ctx.ownership_wq.notify_all();
    ctx.send_logged(dev, state, SapMsgType::HostOwnershipConfirmed, &Empty);
    if let Some(ops) = &state.ops {
        ops.radio_kill(false);
    }
}

fn handle_taking_ownership(
    _ctx: &SapContext,
    _dev: &SapDevice,
    state: &mut Guarded,
    _payload: &[u8],
) {
    info!("The firmware is taking ownership of the device");
    state.ownership.on_firmware_taking();
    if let Some(ops) = &state.ops {
        ops.radio_kill(true);
    }
}

fn handle_can_release_ownership(
    ctx: &SapContext,
    dev: &SapDevice,
    state: &mut Guarded,
    _payload: &[u8],
) {
    // Nobody to give the device to
    if state.ops.is_none() {
        return;
    }
    state.ownership.request();
    ctx.send_logged(dev, state, SapMsgType::HostAsksForNicOwnership, &Empty);
}

fn handle_nic_owner(_ctx: &SapContext, _dev: &SapDevice, _state: &mut Guarded, payload: &[u8]) {
    if let Ok(Dword { val }) = Dword::decode(payload) {
        debug!("NIC owner: {:?}", NicOwner::from(val));
    }
}

fn handle_conn_status(_ctx: &SapContext, _dev: &SapDevice, state: &mut Guarded, payload: &[u8]) {
    let status = match ConnStatus::decode(payload) {
        Ok(status) => ConnectionStatus::from(status),
        Err(FrameError::SsidTooLong) => {
            warn!("Connection status with an SSID longer than 32 bytes, dropped");
            return;
        }
        Err(e) => {
            warn!("Invalid connection status: {:?}", e);
            return;
        }
    };

    let Some(ops) = &state.ops else {
        return;
    };
    ops.connection_status(&status);

    if state.ownership.host_owns() {
        ops.roaming_forbidden(status.link_protected);
    } else {
        ops.radio_kill(status.link_protected);
    }
}

fn handle_nvm(ctx: &SapContext, _dev: &SapDevice, state: &mut Guarded, payload: &[u8]) {
    match Nvm::decode(payload) {
        Ok(nvm) => {
            state.nvm = Some(nvm);
            ctx.nvm_wq.notify_all();
        }
        Err(e) => warn!("Invalid NVM message: {:?}", e),
    }
}

// ============================================================================
// SapContext: send and receive
// ============================================================================

impl SapContext {
    /// Send one control message to the firmware. Requires a connected
    /// session; the caller holds the session lock.
    pub(crate) fn send_notif<P: Payload>(
        &self,
        dev: &SapDevice,
        state: &Guarded,
        msg_type: SapMsgType,
        payload: &P,
    ) -> Result<()> {
        if !state.session.is_connected() {
            return Err(SapError::NotConnected);
        }

        let mut buf = [0u8; MAX_NOTIF_SIZE];
        let len = encode_message(msg_type, dev.next_sap_seq(), payload, &mut buf)?;

        dev.shmem
            .queue(Direction::HostToMe, QueueKind::Notif)
            .write(&buf[..len])?;
        dev.stats.notification_sent();

        dev.coalescer.signal()
    }

    /// [`send_notif`](Self::send_notif), logging failures instead of
    /// returning them
    pub(crate) fn send_logged<P: Payload>(
        &self,
        dev: &SapDevice,
        state: &Guarded,
        msg_type: SapMsgType,
        payload: &P,
    ) {
        if let Err(e) = self.send_notif(dev, state, msg_type, payload) {
            warn!("Failed to send {:?}: {}", msg_type, e);
        }
    }

    /// Receive callback of the bus
    pub(crate) fn handle_bus_rx(&self, dev: &SapDevice) {
        let mut buf = [0u8; BUS_RX_BUF_SIZE];
        let len = match dev.transport.recv(&mut buf) {
            Ok(0) => {
                error!("Got an empty response");
                return;
            }
            Ok(len) => len.min(BUS_RX_BUF_SIZE),
            Err(e) => {
                error!("Failed to receive data: {}", e);
                return;
            }
        };
        let msg = &buf[..len];

        let header = match MeMsgHeader::decode(msg) {
            Ok(header) => header,
            Err(_) => {
                error!("Bus message too short: {} bytes", len);
                return;
            }
        };

        match MeMsgType::try_from(header.msg_type) {
            Ok(MeMsgType::StartOk) => self.handle_start_ok(dev, msg),
            Ok(MeMsgType::CheckSharedArea) => self.handle_check_shared_area(dev),
            _ => info!("Got a RX message: {}", header.msg_type),
        }
    }

    fn handle_check_shared_area(&self, dev: &SapDevice) {
        {
            // Outermost lock: a concurrent pass must neither re-read nor
            // overtake this batch.
            let _drain = dev.notif_rx.lock().unwrap_or_else(PoisonError::into_inner);
            let notif_q = dev.shmem.queue(Direction::MeToHost, QueueKind::Notif);
            match drain_notifications(&notif_q) {
                Ok(batch) => {
                    for msg in &batch.items {
                        self.dispatch_message(dev, msg);
                    }
                    if let Some(fault) = batch.fault {
                        error!("Notification queue: {}", fault);
                    }
                }
                Err(e) => error!("Can't drain the notification queue: {}", e),
            }
        }

        let frames = {
            let _state = self.lock_state();
            let data_q = dev.shmem.queue(Direction::MeToHost, QueueKind::Data);
            match relay::drain_data(&data_q, &dev.stats) {
                Ok(batch) => {
                    if let Some(fault) = batch.fault {
                        error!("Data queue: {}", fault);
                    }
                    batch.items
                }
                Err(e) => {
                    error!("Can't drain the data queue: {}", e);
                    Vec::new()
                }
            }
        };

        self.deliver_frames(frames);
    }

    fn dispatch_message(&self, dev: &SapDevice, msg: &InboundMessage) {
        let Some(msg_type) = msg.header.known_type() else {
            debug!("Unsupported message type {}", msg.header.msg_type);
            return;
        };
        let Some(handler) = HANDLERS.iter().find(|h| h.msg_type == msg_type) else {
            debug!("Ignoring {:?}", msg_type);
            return;
        };
        if msg.header.total_len() < handler.min_len {
            warn!(
                "{:?} too short: {} bytes, need {}",
                msg_type,
                msg.header.total_len(),
                handler.min_len
            );
            return;
        }

        let _registration = handler.registration.then(|| self.lock_registration());
        let mut state = self.lock_state();
        (handler.run)(self, dev, &mut state, &msg.payload);
    }

    // ========================================================================
    // Request / response
    // ========================================================================

    /// Fetch a fresh copy of the firmware NVM
    pub fn get_nvm(&self) -> Result<Nvm> {
        let mut state = self.lock_state();
        let dev = self.connected_device(&state).ok_or(SapError::NotConnected)?;

        state.nvm = None;
        self.send_notif(&dev, &state, SapMsgType::GetNvm, &Empty)?;
        drop(dev);

        let (state, _) = self
            .nvm_wq
            .wait_timeout_while(state, self.config.nvm_timeout(), |s| {
                s.session.is_connected() && s.nvm.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !state.session.is_connected() {
            return Err(SapError::NotConnected);
        }
        state.nvm.clone().ok_or(SapError::Timeout)
    }

    /// Round-trip a PING through the shared queues
    pub fn ping(&self) -> Result<()> {
        let mut state = self.lock_state();
        let dev = self.connected_device(&state).ok_or(SapError::NotConnected)?;

        state.ping_pending = true;
        if let Err(e) = self.send_notif(&dev, &state, SapMsgType::Ping, &Empty) {
            state.ping_pending = false;
            return Err(e);
        }
        drop(dev);

        let (mut state, _) = self
            .ping_wq
            .wait_timeout_while(state, self.config.ping_timeout(), |s| {
                s.session.is_connected() && s.ping_pending
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !state.session.is_connected() {
            return Err(SapError::NotConnected);
        }
        if std::mem::take(&mut state.ping_pending) {
            return Err(SapError::Timeout);
        }
        Ok(())
    }
}
