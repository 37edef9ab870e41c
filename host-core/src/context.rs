//! # SAP Context
//!
//! The process-wide object tying everything together: the configuration
//! cache that survives sessions, the registered consumer, the session and
//! ownership state machines and the currently bound device.
//!
//! ## Lock Order
//!
//! ```text
//! notification drain ──► registration lock ──► session lock ──► data-queue lock (spin)
//! ```
//!
//! The notification drain lock makes the bus receive path the single
//! consumer of the firmware notification queue, even when receive callbacks
//! run concurrently.
//!
//! The device, network device and filter slots are `RwLock<Option<Arc<_>>>`
//! leaves: they are only held long enough to clone an `Arc`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use log::{debug, error, info, warn};
use sap_shared::protocol::{Empty, MeMsgStart, Nvm, SapMsgType};
use serde::Serialize;
use tokio::runtime::Handle;

use crate::coalescer::{Doorbell, SignalCoalescer};
use crate::config::{ConfigCache, SapConfig};
use crate::error::{Result, SapError};
use crate::filters::FilterStore;
use crate::ownership::{Ownership, OwnershipState};
use crate::session::{Session, SessionState};
use crate::shmem::SharedArea;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::transport::BusTransport;
use crate::upstream::{NetDevice, SapOps};

/// Everything guarded by the session lock
pub(crate) struct Guarded {
    pub(crate) cache: ConfigCache,
    pub(crate) ops: Option<Arc<dyn SapOps>>,
    /// The registration slot is taken, possibly without ops while
    /// unregistering
    pub(crate) registered: bool,
    pub(crate) session: Session,
    pub(crate) ownership: Ownership,
    pub(crate) amt_enabled: bool,
    pub(crate) nvm: Option<Nvm>,
    pub(crate) ping_pending: bool,
}

impl Guarded {
    fn new() -> Self {
        Self {
            cache: ConfigCache::default(),
            ops: None,
            registered: false,
            session: Session::new(),
            ownership: Ownership::new(),
            amt_enabled: false,
            nvm: None,
            ping_pending: false,
        }
    }
}

/// One bound bus device and its shared area
pub(crate) struct SapDevice {
    pub(crate) transport: Arc<dyn BusTransport>,
    pub(crate) shmem: Arc<SharedArea>,
    /// Held while one pass drains and dispatches firmware notifications
    pub(crate) notif_rx: Mutex<()>,
    /// Data-queue lock; the flag is the data path liveness
    pub(crate) data_q: spin::Mutex<bool>,
    me_seq: AtomicU32,
    sap_seq: AtomicU32,
    pub(crate) coalescer: Arc<SignalCoalescer>,
    pub(crate) filters: FilterStore,
    pub(crate) stats: Arc<RelayStats>,
}

impl SapDevice {
    fn new(
        transport: Arc<dyn BusTransport>,
        shmem: Arc<SharedArea>,
        config: &SapConfig,
        runtime: Handle,
        stats: Arc<RelayStats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<SapDevice>| {
            let doorbell: Weak<dyn Doorbell> = me.clone();
            SapDevice {
                transport,
                shmem,
                notif_rx: Mutex::new(()),
                data_q: spin::Mutex::new(false),
                me_seq: AtomicU32::new(0),
                sap_seq: AtomicU32::new(0),
                coalescer: Arc::new(SignalCoalescer::new(
                    config.doorbell_cooldown(),
                    runtime,
                    doorbell,
                    Arc::clone(&stats),
                )),
                filters: FilterStore::new(),
                stats,
            }
        })
    }

    pub(crate) fn next_sap_seq(&self) -> u32 {
        self.sap_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn next_me_seq(&self) -> u32 {
        self.me_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn send_bus(&self, msg: &[u8]) -> Result<()> {
        let sent = self.transport.send(msg)?;
        if sent != msg.len() {
            return Err(SapError::Transport(format!(
                "sent {} bytes out of {}",
                sent,
                msg.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn send_start(&self) -> Result<()> {
        let msg = MeMsgStart::start(self.next_me_seq());
        self.send_bus(&msg.encode()).map_err(|e| {
            error!("Failed to send the START message: {}", e);
            e
        })?;
        debug!("START sent, waiting for the response...");
        Ok(())
    }
}

impl Doorbell for SapDevice {
    fn pending(&self) -> bool {
        self.shmem.host_to_me_pending()
    }

    fn ring(&self) -> Result<()> {
        let msg = MeMsgStart::check_shared_area(self.next_me_seq());
        self.send_bus(&msg.encode()).map_err(|e| {
            error!("Failed to send CHECK_SHARED_AREA: {}", e);
            e
        })
    }
}

/// Session-level status, serialized by [`SapContext::stats_json`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub session: SessionState,
    pub ownership: OwnershipState,
    pub amt_enabled: bool,
    pub relay: StatsSnapshot,
}

/// Host side of the SAP protocol
pub struct SapContext {
    pub(crate) config: SapConfig,
    runtime: Handle,
    registration: Mutex<()>,
    state: Mutex<Guarded>,
    pub(crate) ownership_wq: Condvar,
    pub(crate) nvm_wq: Condvar,
    pub(crate) ping_wq: Condvar,
    device: RwLock<Option<Arc<SapDevice>>>,
    netdev: RwLock<Option<Arc<dyn NetDevice>>>,
    /// Received frames are offered to the firmware filters
    pub(crate) rx_hook: AtomicBool,
    pub(crate) stats: Arc<RelayStats>,
}

impl SapContext {
    /// Create the context. Timers run on `runtime`.
    pub fn new(config: SapConfig, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            config,
            runtime,
            registration: Mutex::new(()),
            state: Mutex::new(Guarded::new()),
            ownership_wq: Condvar::new(),
            nvm_wq: Condvar::new(),
            ping_wq: Condvar::new(),
            device: RwLock::new(None),
            netdev: RwLock::new(None),
            rx_hook: AtomicBool::new(false),
            stats: Arc::new(RelayStats::new()),
        })
    }

    pub fn config(&self) -> &SapConfig {
        &self.config
    }

    pub fn session_state(&self) -> SessionState {
        self.lock_state().session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().session.is_connected()
    }

    pub fn ownership_state(&self) -> OwnershipState {
        self.lock_state().ownership.state()
    }

    pub fn amt_enabled(&self) -> bool {
        self.lock_state().amt_enabled
    }

    pub fn is_bound(&self) -> bool {
        self.device().is_some()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, Guarded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_registration(&self) -> MutexGuard<'_, ()> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn device(&self) -> Option<Arc<SapDevice>> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn netdev(&self) -> Option<Arc<dyn NetDevice>> {
        self.netdev
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace_netdev(&self, netdev: Option<Arc<dyn NetDevice>>) {
        *self.netdev.write().unwrap_or_else(PoisonError::into_inner) = netdev;
    }

    /// The bound device, if the session is connected
    pub(crate) fn connected_device(&self, state: &Guarded) -> Option<Arc<SapDevice>> {
        if state.session.is_connected() {
            self.device()
        } else {
            None
        }
    }

    // ========================================================================
    // Device lifecycle
    // ========================================================================

    /// Bind a bus device: allocate and initialize the shared area, map it,
    /// enable the transport, hook the receive path and start the handshake.
    ///
    /// Every step is undone in reverse order when a later one fails.
    pub fn probe(self: &Arc<Self>, transport: Arc<dyn BusTransport>) -> Result<()> {
        if self.device().is_some() {
            return Err(SapError::InvalidArgument("a device is already bound".into()));
        }

        let shmem = Arc::new(SharedArea::allocate(self.config.queue_sizes)?);
        shmem.init();

        transport.dma_map(Arc::clone(&shmem)).map_err(|e| {
            error!("Couldn't map the shared area: {}", e);
            e
        })?;

        let dev = SapDevice::new(
            Arc::clone(&transport),
            shmem,
            &self.config,
            self.runtime.clone(),
            Arc::clone(&self.stats),
        );

        if let Err(e) = self.enable(&dev) {
            self.unmap(&dev);
            return Err(e);
        }

        if self.config.defer_start_message {
            info!("Waiting for an explicit request to start the SAP protocol");
        } else {
            let mut state = self.lock_state();
            state.session.start_sent();
            if let Err(e) = dev.send_start() {
                state.session.start_failed();
                drop(state);
                if let Err(e) = dev.transport.disable() {
                    warn!("Failed to disable the bus: {}", e);
                }
                dev.coalescer.shutdown();
                self.unmap(&dev);
                return Err(e);
            }
        }

        *self.device.write().unwrap_or_else(PoisonError::into_inner) = Some(dev);
        info!("SAP device bound");
        Ok(())
    }

    fn enable(self: &Arc<Self>, dev: &Arc<SapDevice>) -> Result<()> {
        dev.transport.enable().map_err(|e| {
            error!("Failed to enable the bus: {}", e);
            e
        })?;

        let ctx = Arc::downgrade(self);
        let weak_dev = Arc::downgrade(dev);
        let registered = dev.transport.register_rx(Box::new(move || {
            if let (Some(ctx), Some(dev)) = (ctx.upgrade(), weak_dev.upgrade()) {
                ctx.handle_bus_rx(&dev);
            }
        }));

        if let Err(e) = registered {
            error!("Failed to register the receive callback: {}", e);
            if let Err(e) = dev.transport.disable() {
                warn!("Failed to disable the bus: {}", e);
            }
            return Err(e);
        }
        Ok(())
    }

    fn unmap(&self, dev: &SapDevice) {
        if let Err(e) = dev.transport.dma_unmap() {
            warn!("Failed to unmap the shared area: {}", e);
        }
    }

    /// Unbind the device: tell the firmware the host goes down, stop the
    /// data path, disable the bus, wake every waiter and release the
    /// shared area.
    pub fn remove(&self) {
        let Some(dev) = self.device() else {
            return;
        };
        let _registration = self.lock_registration();

        // Removed while the bus is up: the NIC itself is going away.
        if dev.transport.is_enabled() {
            if let Some(ops) = self.lock_state().ops.clone() {
                ops.nic_stolen();
            }
        }

        self.rx_hook.store(false, Ordering::Release);

        {
            let state = self.lock_state();
            dev.coalescer.unthrottle();
            if let Err(e) = self.send_notif(&dev, &state, SapMsgType::HostGoesDown, &Empty) {
                debug!("HOST_GOES_DOWN not sent: {}", e);
            }
        }
        self.wait_for_drain(&dev);

        *dev.data_q.lock() = false;

        {
            let mut state = self.lock_state();
            state.session.disconnect();
            state.ownership.reset();
            state.amt_enabled = false;
            if let Some(ops) = &state.ops {
                ops.radio_kill(false);
            }
        }

        if let Err(e) = dev.transport.disable() {
            warn!("Failed to disable the bus: {}", e);
        }
        dev.coalescer.shutdown();

        let mut state = self.lock_state();
        self.device
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        state.nvm = None;
        state.ping_pending = false;
        self.ownership_wq.notify_all();
        self.nvm_wq.notify_all();
        self.ping_wq.notify_all();
        dev.filters.clear();
        self.unmap(&dev);
        drop(state);

        info!("SAP device removed");
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register the single consumer of the SAP session
    pub fn register(&self, ops: Arc<dyn SapOps>) -> Result<()> {
        let _registration = self.lock_registration();
        let mut state = self.lock_state();

        if state.registered {
            return Err(SapError::AlreadyRegistered);
        }
        state.registered = true;
        state.ops = Some(ops);

        if let Some(dev) = self.connected_device(&state) {
            self.send_logged(&dev, &state, SapMsgType::WifidrUp, &Empty);
        }
        Ok(())
    }

    /// Drop the callbacks and the association and power-limit caches. The
    /// slot stays reserved until [`unregister_complete`](Self::unregister_complete).
    pub fn start_unregister(&self) {
        let _registration = self.lock_registration();
        let mut state = self.lock_state();

        if self.netdev().is_some() {
            warn!("Unregistering while a network device is still set");
        }
        state.cache.conn_info = None;
        state.cache.power_limit = None;
        state.ops = None;
    }

    pub fn unregister_complete(&self) {
        let _registration = self.lock_registration();
        let mut state = self.lock_state();

        state.registered = false;
        if let Some(dev) = self.connected_device(&state) {
            self.send_logged(&dev, &state, SapMsgType::WifidrDown, &Empty);
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> ContextStats {
        let state = self.lock_state();
        ContextStats {
            session: state.session.state(),
            ownership: state.ownership.state(),
            amt_enabled: state.amt_enabled,
            relay: self.stats.snapshot(),
        }
    }

    pub fn stats_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.stats())?)
    }
}

impl std::fmt::Debug for SapContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SapContext")
            .field("config", &self.config)
            .field("bound", &self.is_bound())
            .finish()
    }
}
