//! # Session State Machine
//!
//! ```text
//! Disconnected ──START sent──► StartSent ──valid START_OK──► Connected
//!      ▲                           │                            │
//!      └──── bad START_OK ─────────┘                            │
//!      └──────────────────────── device removed ────────────────┘
//! ```
//!
//! A START_OK is valid when it has the exact size of the reply and carries
//! [`SAP_VERSION`]. There is no automatic retry: a rejected handshake stays
//! `Disconnected` until [`SapContext::resend_start`] is called.

use std::thread;

use log::{error, info, warn};
use sap_shared::protocol::{
    CountryCode, Dword, Empty, HostLinkUp, MeMsgStartOk, NicInfo, SapMsgType, SarLimits,
    SAP_VERSION,
};
use serde::Serialize;
use thiserror::Error;

use crate::context::{Guarded, SapContext, SapDevice};
use crate::error::{Result, SapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    StartSent,
    Connected,
}

/// Why a START_OK was rejected
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("size is incorrect: {0} instead of {size}", size = MeMsgStartOk::SIZE)]
    BadLength(usize),
    #[error("didn't get the expected version: got {0}")]
    BadVersion(u8),
}

/// Result of feeding a START_OK to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOkOutcome {
    /// The session just became connected
    Connected,
    /// The reply was invalid, the session is disconnected
    Rejected(HandshakeError),
    /// No handshake in progress
    Ignored(SessionState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// START went out. A connected session stays connected.
    pub fn start_sent(&mut self) {
        if self.state != SessionState::Connected {
            self.state = SessionState::StartSent;
        }
    }

    /// Sending START failed
    pub fn start_failed(&mut self) {
        if self.state == SessionState::StartSent {
            self.state = SessionState::Disconnected;
        }
    }

    pub fn on_start_ok(&mut self, reply: &[u8]) -> StartOkOutcome {
        if self.state != SessionState::StartSent {
            return StartOkOutcome::Ignored(self.state);
        }

        let outcome = match MeMsgStartOk::decode(reply) {
            Err(_) => StartOkOutcome::Rejected(HandshakeError::BadLength(reply.len())),
            Ok(msg) if msg.supported_version != SAP_VERSION => {
                StartOkOutcome::Rejected(HandshakeError::BadVersion(msg.supported_version))
            }
            Ok(_) => StartOkOutcome::Connected,
        };

        self.state = match outcome {
            StartOkOutcome::Connected => SessionState::Connected,
            _ => SessionState::Disconnected,
        };
        outcome
    }

    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
    }
}

impl SapContext {
    /// Send START again, e.g. after a rejected handshake or when the first
    /// one was deferred
    pub fn resend_start(&self) -> Result<()> {
        let dev = self.device().ok_or(SapError::NotConnected)?;
        let mut state = self.lock_state();

        state.session.start_sent();
        if let Err(e) = dev.send_start() {
            state.session.start_failed();
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn handle_start_ok(&self, dev: &SapDevice, reply: &[u8]) {
        let mut state = self.lock_state();

        match state.session.on_start_ok(reply) {
            StartOkOutcome::Connected => {
                info!("Got a valid START_OK from the firmware");
                *dev.data_q.lock() = true;

                if state.ops.is_some() {
                    self.send_logged(dev, &state, SapMsgType::WifidrUp, &Empty);
                    self.push_init_config(dev, &mut state);
                    if let Some(ops) = &state.ops {
                        ops.sap_connected();
                    }
                }
            }
            StartOkOutcome::Rejected(reason) => {
                error!("Got an invalid START_OK from the firmware: {}", reason);
            }
            StartOkOutcome::Ignored(current) => {
                warn!("Unexpected START_OK while {:?}", current);
            }
        }
    }

    /// Replay the configuration cache, in an order the firmware relies on:
    /// ownership, link, country code, power limits, identity, radio state.
    pub(crate) fn push_init_config(&self, dev: &SapDevice, state: &mut Guarded) {
        state.ownership.request();
        self.send_logged(dev, state, SapMsgType::HostAsksForNicOwnership, &Empty);

        if let Some(conn_info) = &state.cache.conn_info {
            let msg = HostLinkUp {
                conn_info: conn_info.clone(),
                ..Default::default()
            };
            self.send_logged(dev, state, SapMsgType::HostLinkUp, &msg);
        }

        let mcc = CountryCode {
            mcc: state.cache.mcc,
            ..Default::default()
        };
        self.send_logged(dev, state, SapMsgType::CountryCode, &mcc);

        if let Some(chains) = state.cache.power_limit {
            self.send_logged(dev, state, SapMsgType::SarLimits, &SarLimits { chains });
        }

        let nic = NicInfo {
            mac_address: state.cache.mac_address,
            nvm_address: state.cache.nvm_address,
        };
        self.send_logged(dev, state, SapMsgType::NicInfo, &nic);

        let rf_kill = Dword {
            val: state.cache.rf_kill,
        };
        self.send_logged(dev, state, SapMsgType::RadioState, &rf_kill);
    }

    /// Poll the host-to-firmware queues until the firmware consumed them.
    /// Gives up after the configured number of attempts.
    pub(crate) fn wait_for_drain(&self, dev: &SapDevice) -> bool {
        for _ in 0..self.config.teardown_poll_attempts {
            if !dev.shmem.host_to_me_pending() {
                return true;
            }
            thread::sleep(self.config.teardown_poll_interval());
        }
        if !dev.shmem.host_to_me_pending() {
            return true;
        }
        error!("Couldn't get an ACK from the firmware on HOST_GOES_DOWN");
        false
    }
}
