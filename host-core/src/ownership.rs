//! # Ownership Arbitration
//!
//! Tracks who controls the radio. Every transition happens with the session
//! lock held.
//!
//! ```text
//!                   request
//!  FirmwareOwns ───────────────► RequestPending
//!       ▲  ▲                      │    │
//!       │  └──── denied/timeout ──┘    │ granted
//!       │                              ▼
//!       └──── firmware takes ─────  HostOwns
//! ```
//!
//! A firmware takeover also raises a sticky flag: the host owes the firmware
//! a confirmation once its own teardown of the radio is done.

use std::sync::PoisonError;

use log::{debug, info};
use sap_shared::protocol::{Empty, SapMsgType};
use serde::Serialize;

use crate::context::SapContext;
use crate::error::{Result, SapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OwnershipState {
    HostOwns,
    FirmwareOwns,
    RequestPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    state: OwnershipState,
    firmware_taking_ownership: bool,
    /// A denial arrived for the current request
    denied: bool,
}

impl Default for Ownership {
    fn default() -> Self {
        Self::new()
    }
}

impl Ownership {
    pub fn new() -> Self {
        Self {
            state: OwnershipState::FirmwareOwns,
            firmware_taking_ownership: false,
            denied: false,
        }
    }

    pub fn state(&self) -> OwnershipState {
        self.state
    }

    pub fn host_owns(&self) -> bool {
        self.state == OwnershipState::HostOwns
    }

    pub fn firmware_taking_ownership(&self) -> bool {
        self.firmware_taking_ownership
    }

    pub fn was_denied(&self) -> bool {
        self.denied
    }

    /// The host asks the firmware for the radio
    pub fn request(&mut self) {
        self.state = OwnershipState::RequestPending;
        self.denied = false;
    }

    /// Reply to a request. Returns `true` when the host now owns the radio.
    ///
    /// A denial only settles a pending request back to the firmware; it
    /// never takes the radio away from the host.
    pub fn on_reply(&mut self, granted: bool) -> bool {
        if granted {
            self.state = OwnershipState::HostOwns;
            self.denied = false;
            return true;
        }
        self.denied = true;
        if self.state == OwnershipState::RequestPending {
            self.state = OwnershipState::FirmwareOwns;
        }
        false
    }

    pub fn on_firmware_taking(&mut self) {
        self.state = OwnershipState::FirmwareOwns;
        self.firmware_taking_ownership = true;
    }

    /// The host finished its teardown. Returns `true` when a takeover must
    /// be confirmed to the firmware.
    pub fn on_device_down(&mut self) -> bool {
        std::mem::take(&mut self.firmware_taking_ownership)
    }

    /// A request went unanswered
    pub fn on_timeout(&mut self) {
        if self.state == OwnershipState::RequestPending {
            self.state = OwnershipState::FirmwareOwns;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl SapContext {
    /// Ask the firmware for the radio and wait for the answer.
    ///
    /// Succeeds right away when there is no session or AMT is disabled:
    /// nobody else is using the radio then. Fails with
    /// [`SapError::NotConnected`] if the session goes away while waiting,
    /// [`SapError::Denied`] if the firmware refused and
    /// [`SapError::Timeout`] if it never answered.
    pub fn get_ownership(&self) -> Result<()> {
        let mut state = self.lock_state();

        let Some(dev) = self.connected_device(&state) else {
            return Ok(());
        };
        if !state.amt_enabled {
            return Ok(());
        }

        state.ownership.request();
        if let Err(e) = self.send_notif(&dev, &state, SapMsgType::HostAsksForNicOwnership, &Empty)
        {
            state.ownership.on_timeout();
            return Err(e);
        }
        drop(dev);

        let (mut state, _) = self
            .ownership_wq
            .wait_timeout_while(state, self.config.ownership_timeout(), |s| {
                s.session.is_connected() && !s.ownership.host_owns()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !state.session.is_connected() {
            return Err(SapError::NotConnected);
        }
        if state.ownership.host_owns() {
            return Ok(());
        }

        let denied = state.ownership.was_denied();
        state.ownership.on_timeout();
        if denied {
            info!("Ownership request denied");
            Err(SapError::Denied)
        } else {
            debug!("Ownership request timed out");
            Err(SapError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_firmware() {
        let own = Ownership::new();
        assert_eq!(own.state(), OwnershipState::FirmwareOwns);
        assert!(!own.firmware_taking_ownership());
    }

    #[test]
    fn test_grant() {
        let mut own = Ownership::new();
        own.request();
        assert_eq!(own.state(), OwnershipState::RequestPending);
        assert!(own.on_reply(true));
        assert!(own.host_owns());
    }

    #[test]
    fn test_denial_never_leaves_firmware_owns() {
        let mut own = Ownership::new();
        assert!(!own.on_reply(false));
        assert_eq!(own.state(), OwnershipState::FirmwareOwns);

        own.request();
        assert!(!own.on_reply(false));
        assert_eq!(own.state(), OwnershipState::FirmwareOwns);
        assert!(own.was_denied());

        own.request();
        assert!(!own.was_denied());
    }

    #[test]
    fn test_denial_keeps_host_ownership() {
        let mut own = Ownership::new();
        own.request();
        own.on_reply(true);
        own.on_reply(false);
        assert!(own.host_owns());
    }

    #[test]
    fn test_takeover_flag_is_sticky_until_device_down() {
        let mut own = Ownership::new();
        own.request();
        own.on_reply(true);

        own.on_firmware_taking();
        assert_eq!(own.state(), OwnershipState::FirmwareOwns);
        assert!(own.firmware_taking_ownership());

        own.request();
        own.on_reply(true);
        assert!(own.firmware_taking_ownership());

        assert!(own.on_device_down());
        assert!(!own.firmware_taking_ownership());
        assert!(!own.on_device_down());
    }

    #[test]
    fn test_timeout_returns_to_firmware() {
        let mut own = Ownership::new();
        own.request();
        own.on_timeout();
        assert_eq!(own.state(), OwnershipState::FirmwareOwns);

        own.request();
        own.on_reply(true);
        own.on_timeout();
        assert!(own.host_owns());
    }

    mod scenarios {
        use super::*;
        use crate::mock::{test_config, wait_until, Harness, OpsEvent};
        use crate::SapConfig;
        use sap_shared::protocol::Dword;
        use std::sync::Arc;
        use std::thread;

        fn with_amt(config: SapConfig) -> Harness {
            let h = Harness::connected_with(config);
            h.notify(SapMsgType::AmtState, &Dword { val: 1 });
            h.host_notifs();
            h.ops.take();
            h
        }

        /// Run `get_ownership` on another thread, returning once the request
        /// is in the queue
        fn request_in_background(h: &Harness) -> thread::JoinHandle<Result<()>> {
            let ctx = Arc::clone(&h.ctx);
            let waiter = thread::spawn(move || ctx.get_ownership());
            wait_until(|| h.host_notif_pending());
            waiter
        }

        #[test]
        fn test_no_request_without_amt() {
            let h = Harness::connected();
            assert!(h.ctx.get_ownership().is_ok());
            assert!(h.host_notifs().is_empty());
        }

        #[test]
        fn test_no_request_without_session() {
            let h = Harness::probed(test_config());
            assert!(h.ctx.get_ownership().is_ok());
        }

        #[test]
        fn test_granted() {
            let h = with_amt(SapConfig {
                ownership_timeout_ms: 2000,
                ..test_config()
            });
            let waiter = request_in_background(&h);
            assert_eq!(h.ctx.ownership_state(), OwnershipState::RequestPending);

            h.notify(SapMsgType::CsmeReplyToHostOwnershipReq, &Dword { val: 1 });

            assert!(waiter.join().unwrap().is_ok());
            assert_eq!(h.ctx.ownership_state(), OwnershipState::HostOwns);
            assert_eq!(
                h.host_notifs(),
                vec![
                    SapMsgType::HostAsksForNicOwnership,
                    SapMsgType::HostOwnershipConfirmed
                ]
            );
            assert_eq!(h.ops.take(), vec![OpsEvent::RadioKill(false)]);
        }

        #[test]
        fn test_denied() {
            let h = with_amt(test_config());
            let waiter = request_in_background(&h);

            h.notify(SapMsgType::CsmeReplyToHostOwnershipReq, &Dword { val: 0 });
            assert_eq!(h.ctx.ownership_state(), OwnershipState::FirmwareOwns);

            assert!(matches!(waiter.join().unwrap(), Err(SapError::Denied)));
            assert_eq!(h.ctx.ownership_state(), OwnershipState::FirmwareOwns);
            assert!(h.ops.take().is_empty());
        }

        #[test]
        fn test_timeout_returns_to_firmware() {
            let h = with_amt(test_config());
            assert!(matches!(h.ctx.get_ownership(), Err(SapError::Timeout)));
            assert_eq!(h.ctx.ownership_state(), OwnershipState::FirmwareOwns);
        }

        #[test]
        fn test_teardown_wakes_the_waiter() {
            let h = with_amt(SapConfig {
                ownership_timeout_ms: 5000,
                ..test_config()
            });
            let waiter = request_in_background(&h);

            h.ctx.remove();
            assert!(matches!(waiter.join().unwrap(), Err(SapError::NotConnected)));
        }

        #[test]
        fn test_takeover_is_confirmed_on_device_down() {
            let h = with_amt(test_config());

            h.notify(SapMsgType::CsmeTakingOwnership, &Empty);
            assert_eq!(h.ctx.ownership_state(), OwnershipState::FirmwareOwns);
            assert_eq!(h.ops.take(), vec![OpsEvent::RadioKill(true)]);

            h.ctx.device_down();
            assert_eq!(h.host_notifs(), vec![SapMsgType::CsmeOwnershipConfirmed]);

            h.ctx.device_down();
            assert!(h.host_notifs().is_empty());
        }

        #[test]
        fn test_can_release_triggers_a_new_request() {
            let h = with_amt(test_config());
            h.notify(SapMsgType::CsmeTakingOwnership, &Empty);

            h.notify(SapMsgType::CsmeCanReleaseOwnership, &Empty);
            assert_eq!(h.ctx.ownership_state(), OwnershipState::RequestPending);
            assert_eq!(h.host_notifs(), vec![SapMsgType::HostAsksForNicOwnership]);
        }
    }
}
