//! # Configuration
//!
//! Two different things live here:
//!
//! - [`SapConfig`]: the tunables of the core, fixed for the lifetime of a
//!   [`SapContext`].
//! - [`ConfigCache`]: what the host driver told us about itself (identity,
//!   regulatory data, association). It survives sessions and is pushed to
//!   the firmware every time a session comes up.
//!
//! The configuration setters update the cache and, when a session is up,
//! send the matching notification right away.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use sap_shared::protocol::{
    ConnectionInfo, CountryCode, Dword, Empty, HostLinkDown, HostLinkUp, NicInfo, SapMsgType,
    SarLimits, SarTable, ETH_ALEN, SAP_HW_RFKILL_DEASSERTED, SAP_SW_RFKILL_DEASSERTED,
};
use sap_shared::QueueSizes;
use serde::{Deserialize, Serialize};

use crate::context::SapContext;
use crate::error::{Result, SapError};
use crate::upstream::NetDevice;

/// Tunables of the host core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SapConfig {
    /// Minimum time between two "check shared area" doorbells
    pub doorbell_cooldown_ms: u64,
    pub ownership_timeout_ms: u64,
    pub nvm_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Polls of the host-to-firmware queues after HOST_GOES_DOWN
    pub teardown_poll_attempts: u32,
    pub teardown_poll_interval_ms: u64,
    /// Do not send START on probe; wait for an explicit resend
    pub defer_start_message: bool,
    pub queue_sizes: QueueSizes,
}

impl Default for SapConfig {
    fn default() -> Self {
        Self {
            doorbell_cooldown_ms: 100,
            ownership_timeout_ms: 500,
            nvm_timeout_ms: 2000,
            ping_timeout_ms: 1000,
            teardown_poll_attempts: 10,
            teardown_poll_interval_ms: 5,
            defer_start_message: false,
            queue_sizes: QueueSizes::default(),
        }
    }
}

impl SapConfig {
    /// Parse a JSON configuration; missing fields take their default
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SapConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("h2m_data", self.queue_sizes.h2m_data),
            ("h2m_notif", self.queue_sizes.h2m_notif),
            ("m2h_data", self.queue_sizes.m2h_data),
            ("m2h_notif", self.queue_sizes.m2h_notif),
        ];
        for (name, size) in sizes {
            if size == 0 || size % 4 != 0 {
                return Err(SapError::Config(format!(
                    "queue size {} = {} is not a non-zero multiple of 4",
                    name, size
                )));
            }
        }
        if self.teardown_poll_attempts == 0 {
            return Err(SapError::Config("teardown_poll_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn doorbell_cooldown(&self) -> Duration {
        Duration::from_millis(self.doorbell_cooldown_ms)
    }

    pub fn ownership_timeout(&self) -> Duration {
        Duration::from_millis(self.ownership_timeout_ms)
    }

    pub fn nvm_timeout(&self) -> Duration {
        Duration::from_millis(self.nvm_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn teardown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.teardown_poll_interval_ms)
    }
}

/// Host state replayed to the firmware on every new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCache {
    /// Current association, if any
    pub conn_info: Option<ConnectionInfo>,
    pub mcc: u16,
    pub power_limit: Option<SarTable>,
    pub mac_address: [u8; ETH_ALEN],
    pub nvm_address: [u8; ETH_ALEN],
    /// `SAP_*_RFKILL_DEASSERTED` bits
    pub rf_kill: u32,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self {
            conn_info: None,
            mcc: 0,
            power_limit: None,
            mac_address: [0; ETH_ALEN],
            nvm_address: [0; ETH_ALEN],
            rf_kill: SAP_SW_RFKILL_DEASSERTED | SAP_HW_RFKILL_DEASSERTED,
        }
    }
}

/// AP co-located with the one the host is associated to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollocatedAp {
    pub channel: u8,
    pub bssid: [u8; ETH_ALEN],
}

impl CollocatedAp {
    /// 0 for 2.4 GHz channels, 1 otherwise
    pub fn band(&self) -> u8 {
        if self.channel <= 14 {
            0
        } else {
            1
        }
    }
}

impl SapContext {
    /// Set or clear the host network device. The receive filter hook is
    /// active while a device is set and AMT is enabled.
    pub fn set_netdev(&self, netdev: Option<Arc<dyn NetDevice>>) {
        let _registration = self.lock_registration();
        let state = self.lock_state();

        let hook = netdev.is_some() && state.amt_enabled && state.session.is_connected();
        self.replace_netdev(netdev);
        self.rx_hook.store(hook, Ordering::Release);
        debug!("Network device updated, receive hook {}", if hook { "on" } else { "off" });
    }

    pub fn set_nic_info(&self, mac_address: [u8; ETH_ALEN], nvm_address: [u8; ETH_ALEN]) {
        let mut state = self.lock_state();
        state.cache.mac_address = mac_address;
        state.cache.nvm_address = nvm_address;

        if let Some(dev) = self.connected_device(&state) {
            let msg = NicInfo {
                mac_address,
                nvm_address,
            };
            self.send_logged(&dev, &state, SapMsgType::NicInfo, &msg);
        }
    }

    pub fn set_country_code(&self, mcc: u16) {
        let mut state = self.lock_state();
        state.cache.mcc = mcc;

        if let Some(dev) = self.connected_device(&state) {
            let msg = CountryCode {
                mcc,
                ..Default::default()
            };
            self.send_logged(&dev, &state, SapMsgType::CountryCode, &msg);
        }
    }

    pub fn set_power_limit(&self, table: &SarTable) {
        let mut state = self.lock_state();
        state.cache.power_limit = Some(*table);

        if let Some(dev) = self.connected_device(&state) {
            let msg = SarLimits { chains: *table };
            self.send_logged(&dev, &state, SapMsgType::SarLimits, &msg);
        }
    }

    /// Report the radio-kill switches; `true` means the radio is blocked
    pub fn set_rfkill_state(&self, hw_rfkill: bool, sw_rfkill: bool) {
        let mut rf_kill = 0;
        if !sw_rfkill {
            rf_kill |= SAP_SW_RFKILL_DEASSERTED;
        }
        if !hw_rfkill {
            rf_kill |= SAP_HW_RFKILL_DEASSERTED;
        }

        let mut state = self.lock_state();
        state.cache.rf_kill = rf_kill;

        if let Some(dev) = self.connected_device(&state) {
            self.send_logged(&dev, &state, SapMsgType::RadioState, &Dword { val: rf_kill });
        }
    }

    /// The host associated. The firmware only hears about it while AMT is
    /// enabled; the association is cached either way.
    pub fn host_associated(&self, conn_info: &ConnectionInfo, colloc: Option<&CollocatedAp>) {
        let mut msg = HostLinkUp {
            conn_info: conn_info.clone(),
            ..Default::default()
        };
        if let Some(ap) = colloc {
            msg.colloc_channel = ap.channel;
            msg.colloc_band = ap.band();
            msg.colloc_bssid = ap.bssid;
        }

        let mut state = self.lock_state();
        if state.amt_enabled {
            if let Some(dev) = self.connected_device(&state) {
                self.send_logged(&dev, &state, SapMsgType::HostLinkUp, &msg);
            }
        }
        state.cache.conn_info = Some(msg.conn_info);
    }

    pub fn host_disassociated(&self) {
        let mut state = self.lock_state();
        if let Some(dev) = self.connected_device(&state) {
            self.send_logged(&dev, &state, SapMsgType::HostLinkDown, &HostLinkDown::long());
        }
        state.cache.conn_info = None;
    }

    /// The host finished taking the device down. Acknowledges a pending
    /// firmware takeover.
    pub fn device_down(&self) {
        let mut state = self.lock_state();
        let Some(dev) = self.connected_device(&state) else {
            return;
        };
        if !state.ownership.on_device_down() {
            return;
        }
        if let Err(e) = self.send_notif(&dev, &state, SapMsgType::CsmeOwnershipConfirmed, &Empty)
        {
            warn!("Failed to confirm the firmware ownership: {}", e);
        }
    }
}
