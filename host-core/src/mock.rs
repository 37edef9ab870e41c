//! Bus, firmware and host doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sap_shared::protocol::{
    encode_message, MeMsgHeader, MeMsgStart, MeMsgStartOk, Payload, SapHeader, SapMsgType,
    SAP_HDR_SIZE,
};
use sap_shared::{CyclicQueue, Direction, QueueKind, QueueSizes};
use tokio::runtime::{Builder, Runtime};

use crate::config::SapConfig;
use crate::context::SapContext;
use crate::error::{Result, SapError};
use crate::filters::FilterSet;
use crate::shmem::SharedArea;
use crate::transport::{BusTransport, RxCallback};
use crate::upstream::{ConnectionStatus, EthernetFrame, NetDevice, RxVerdict, SapOps};

type SharedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct MockBus {
    sent: Mutex<Vec<Vec<u8>>>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    rx: Mutex<Option<SharedCallback>>,
    enabled: AtomicBool,
    area: Mutex<Option<Arc<SharedArea>>>,
    pub(crate) fail_send: AtomicBool,
}

impl BusTransport for MockBus {
    fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(SapError::Transport("bus is down".into()));
        }
        self.sent.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let Some(msg) = self.inbox.lock().unwrap().pop_front() else {
            return Ok(0);
        };
        let len = msg.len().min(buf.len());
        buf[..len].copy_from_slice(&msg[..len]);
        Ok(len)
    }

    fn register_rx(&self, callback: RxCallback) -> Result<()> {
        *self.rx.lock().unwrap() = Some(Arc::from(callback));
        Ok(())
    }

    fn enable(&self) -> Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn dma_map(&self, area: Arc<SharedArea>) -> Result<()> {
        *self.area.lock().unwrap() = Some(area);
        Ok(())
    }

    fn dma_unmap(&self) -> Result<()> {
        self.area.lock().unwrap().take();
        Ok(())
    }
}

impl MockBus {
    /// Queue a bus message and run the receive callback, like an interrupt
    pub(crate) fn deliver(&self, msg: &[u8]) {
        self.inbox.lock().unwrap().push_back(msg.to_vec());
        let callback = self.rx.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Bus message types sent by the host, in order
    pub(crate) fn sent_types(&self) -> Vec<u32> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|msg| MeMsgHeader::decode(msg).unwrap().msg_type)
            .collect()
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn mapped_area(&self) -> Option<Arc<SharedArea>> {
        self.area.lock().unwrap().clone()
    }
}

// ============================================================================
// Firmware side
// ============================================================================

pub(crate) fn start_ok(version: u8) -> Vec<u8> {
    MeMsgStartOk::new(1, version).encode().to_vec()
}

pub(crate) fn doorbell() -> Vec<u8> {
    MeMsgStart::check_shared_area(1).encode().to_vec()
}

pub(crate) fn encode<P: Payload>(msg_type: SapMsgType, payload: &P) -> Vec<u8> {
    let mut buf = vec![0u8; SAP_HDR_SIZE + P::LEN];
    encode_message(msg_type, 1, payload, &mut buf).unwrap();
    buf
}

/// Consume every message the host wrote to `queue`
pub(crate) fn drain_host_queue(queue: &CyclicQueue<'_>) -> Vec<(SapHeader, Vec<u8>)> {
    let mut reader = queue.reader().unwrap();
    let mut out = Vec::new();
    while reader.remaining() >= SAP_HDR_SIZE as u32 {
        let mut raw = [0u8; SAP_HDR_SIZE];
        reader.read(&mut raw).unwrap();
        let header = SapHeader::decode(&raw).unwrap();
        let mut payload = vec![0u8; header.len as usize];
        reader.read(&mut payload).unwrap();
        out.push((header, payload));
    }
    reader.finish();
    out
}

// ============================================================================
// Host side
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OpsEvent {
    Connected,
    ConnectionStatus(ConnectionStatus),
    RadioKill(bool),
    RoamingForbidden(bool),
    NicStolen,
}

#[derive(Default)]
pub(crate) struct RecordingOps {
    events: Mutex<Vec<OpsEvent>>,
}

impl RecordingOps {
    pub(crate) fn take(&self) -> Vec<OpsEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, event: OpsEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl SapOps for RecordingOps {
    fn sap_connected(&self) {
        self.push(OpsEvent::Connected);
    }

    fn connection_status(&self, status: &ConnectionStatus) {
        self.push(OpsEvent::ConnectionStatus(status.clone()));
    }

    fn radio_kill(&self, blocked: bool) {
        self.push(OpsEvent::RadioKill(blocked));
    }

    fn roaming_forbidden(&self, forbidden: bool) {
        self.push(OpsEvent::RoamingForbidden(forbidden));
    }

    fn nic_stolen(&self) {
        self.push(OpsEvent::NicStolen);
    }
}

/// Network device classifying on the Ethernet filters only
#[derive(Default)]
pub(crate) struct RecordingNetDev {
    pub(crate) transmitted: Mutex<Vec<EthernetFrame>>,
}

impl NetDevice for RecordingNetDev {
    fn transmit(&self, frame: EthernetFrame) {
        self.transmitted.lock().unwrap().push(frame);
    }

    fn classify(&self, frame: &[u8], filters: &FilterSet) -> RxVerdict {
        EthernetFrame::parse(frame)
            .and_then(|eth| filters.match_eth_dst(&eth.dst))
            .unwrap_or(RxVerdict::Pass)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub(crate) fn test_config() -> SapConfig {
    SapConfig {
        ownership_timeout_ms: 100,
        nvm_timeout_ms: 100,
        ping_timeout_ms: 100,
        teardown_poll_attempts: 2,
        teardown_poll_interval_ms: 1,
        queue_sizes: QueueSizes {
            h2m_data: 4096,
            h2m_notif: 1024,
            m2h_data: 4096,
            m2h_notif: 1024,
        },
        ..SapConfig::default()
    }
}

pub(crate) struct Harness {
    pub(crate) ctx: Arc<SapContext>,
    pub(crate) bus: Arc<MockBus>,
    pub(crate) ops: Arc<RecordingOps>,
    area: Arc<SharedArea>,
    _runtime: Runtime,
}

impl Harness {
    /// Probed device with a registered consumer, START sent
    pub(crate) fn probed(config: SapConfig) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let ctx = SapContext::new(config, runtime.handle().clone());
        let bus = Arc::new(MockBus::default());
        let ops = Arc::new(RecordingOps::default());

        ctx.register(ops.clone()).unwrap();
        ctx.probe(bus.clone()).unwrap();
        let area = bus.mapped_area().unwrap();

        Self {
            ctx,
            bus,
            ops,
            area,
            _runtime: runtime,
        }
    }

    /// Session up, initial configuration consumed by the firmware
    pub(crate) fn connected() -> Self {
        Self::connected_with(test_config())
    }

    pub(crate) fn connected_with(config: SapConfig) -> Self {
        let h = Self::probed(config);
        h.bus.deliver(&start_ok(sap_shared::SAP_VERSION));
        assert!(h.ctx.is_connected());
        h.host_notifs();
        h.ops.take();
        h
    }

    pub(crate) fn area(&self) -> &SharedArea {
        &self.area
    }

    /// Firmware writes a notification and rings the host
    pub(crate) fn notify<P: Payload>(&self, msg_type: SapMsgType, payload: &P) {
        self.push_raw(Direction::MeToHost, QueueKind::Notif, &encode(msg_type, payload));
        self.bus.deliver(&doorbell());
    }

    pub(crate) fn push_raw(&self, dir: Direction, kind: QueueKind, bytes: &[u8]) {
        self.area.queue(dir, kind).write(bytes).unwrap();
    }

    /// Notification types the host sent since the last call
    pub(crate) fn host_notifs(&self) -> Vec<SapMsgType> {
        self.host_notif_messages()
            .into_iter()
            .map(|(hdr, _)| hdr.known_type().unwrap())
            .collect()
    }

    pub(crate) fn host_notif_messages(&self) -> Vec<(SapHeader, Vec<u8>)> {
        drain_host_queue(&self.area.queue(Direction::HostToMe, QueueKind::Notif))
    }

    pub(crate) fn host_data(&self) -> Vec<(SapHeader, Vec<u8>)> {
        drain_host_queue(&self.area.queue(Direction::HostToMe, QueueKind::Data))
    }

    /// True once the host wrote something to its notification queue
    pub(crate) fn host_notif_pending(&self) -> bool {
        self.area
            .queue(Direction::HostToMe, QueueKind::Notif)
            .is_pending()
    }
}

/// Poll `cond` for up to two seconds
pub(crate) fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}
