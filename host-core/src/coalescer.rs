//! # Throttled Signal Coalescer
//!
//! Rate-limits the "check shared area" doorbell. The first signal rings
//! immediately and opens a cooldown window; signals inside the window are
//! suppressed. When the window closes, one more doorbell is sent if the
//! host-to-firmware queues still hold unread bytes, which opens a new window.
//!
//! ```text
//! signal ──► ring ──┬── cooldown ──► pending? ──► ring ──┬── cooldown ──► ...
//!                   │                                    │
//! signal ──► (suppressed)                                └── not pending: idle
//! ```
//!
//! The cooldown runs as a single tokio task that is aborted on shutdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::stats::RelayStats;

/// Default cooldown between two doorbells
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(100);

/// The thing being rung.
///
/// Implementations must not take the session lock.
pub trait Doorbell: Send + Sync {
    /// Unread bytes remain in a host-to-firmware queue
    fn pending(&self) -> bool;

    /// Send one doorbell to the firmware
    fn ring(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct CoalescerState {
    throttled: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the window is re-armed or cancelled; an expiring
    /// timer only acts on the window it was armed for
    generation: u64,
    closed: bool,
}

pub struct SignalCoalescer {
    state: Mutex<CoalescerState>,
    cooldown: Duration,
    runtime: Handle,
    doorbell: Weak<dyn Doorbell>,
    stats: Arc<RelayStats>,
}

impl SignalCoalescer {
    pub fn new(
        cooldown: Duration,
        runtime: Handle,
        doorbell: Weak<dyn Doorbell>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            state: Mutex::new(CoalescerState::default()),
            cooldown,
            runtime,
            doorbell,
            stats,
        }
    }

    /// Ring now unless a cooldown window is open
    pub fn signal(self: &Arc<Self>) -> Result<()> {
        let Some(doorbell) = self.doorbell.upgrade() else {
            return Ok(());
        };

        let generation = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            if state.throttled {
                self.stats.doorbell_suppressed();
                return Ok(());
            }
            state.throttled = true;
            self.arm_timer(&mut state)
        };

        // The bus send blocks; the window is already reserved.
        match doorbell.ring() {
            Ok(()) => {
                self.stats.doorbell_sent();
                Ok(())
            }
            Err(e) => {
                self.release_window(generation);
                Err(e)
            }
        }
    }

    /// Schedule a [`signal`](Self::signal) on the runtime, for paths that
    /// must not block on the bus
    pub fn kick(self: &Arc<Self>) {
        let coalescer = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Err(e) = coalescer.signal() {
                warn!("Failed to ring the doorbell: {}", e);
            }
        });
    }

    /// Close the current window so the next signal rings immediately
    pub fn unthrottle(&self) {
        let mut state = self.lock();
        state.throttled = false;
        Self::cancel_timer(&mut state);
    }

    /// Cancel the cooldown timer and ignore any further signal
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.throttled = false;
        Self::cancel_timer(&mut state);
    }

    pub fn is_throttled(&self) -> bool {
        self.lock().throttled
    }

    fn cancel_timer(state: &mut CoalescerState) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Open a new window; returns its generation
    fn arm_timer(self: &Arc<Self>, state: &mut CoalescerState) -> u64 {
        Self::cancel_timer(state);
        let generation = state.generation;
        let weak = Arc::downgrade(self);
        let cooldown = self.cooldown;
        state.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(coalescer) = weak.upgrade() {
                coalescer.cooldown_expired(generation);
            }
        }));
        generation
    }

    /// Reopen the window after a failed ring, unless it was re-armed since
    fn release_window(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.throttled = false;
            Self::cancel_timer(&mut state);
        }
    }

    fn cooldown_expired(self: &Arc<Self>, generation: u64) {
        let (doorbell, generation) = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            // This task's own handle: drop it without aborting.
            state.timer = None;
            state.throttled = false;
            if state.closed {
                return;
            }
            let Some(doorbell) = self.doorbell.upgrade() else {
                return;
            };
            if !doorbell.pending() {
                return;
            }
            state.throttled = true;
            (doorbell, self.arm_timer(&mut state))
        };

        debug!("Data still pending after the cooldown, ringing again");
        match doorbell.ring() {
            Ok(()) => self.stats.doorbell_sent(),
            Err(e) => {
                warn!("Failed to ring the doorbell after the cooldown: {}", e);
                self.release_window(generation);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoalescerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SignalCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalCoalescer")
            .field("cooldown", &self.cooldown)
            .field("state", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SapError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::OnceLock;

    #[derive(Default)]
    struct MockDoorbell {
        rings: AtomicUsize,
        pending: AtomicBool,
        fail: AtomicBool,
    }

    impl Doorbell for MockDoorbell {
        fn pending(&self) -> bool {
            self.pending.load(Ordering::SeqCst)
        }

        fn ring(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SapError::Transport("bus is down".into()));
            }
            self.rings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Checks from inside `ring` whether the coalescer state is free
    #[derive(Default)]
    struct LockCheckingDoorbell {
        coalescer: OnceLock<Weak<SignalCoalescer>>,
        rings: AtomicUsize,
        rings_unlocked: AtomicUsize,
    }

    impl Doorbell for LockCheckingDoorbell {
        fn pending(&self) -> bool {
            true
        }

        fn ring(&self) -> Result<()> {
            self.rings.fetch_add(1, Ordering::SeqCst);
            if let Some(coalescer) = self.coalescer.get().and_then(Weak::upgrade) {
                if coalescer.state.try_lock().is_ok() {
                    self.rings_unlocked.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }

    fn setup() -> (Arc<MockDoorbell>, Arc<SignalCoalescer>, Arc<RelayStats>) {
        let bell = Arc::new(MockDoorbell::default());
        let weak: Weak<dyn Doorbell> = Arc::downgrade(&bell) as Weak<dyn Doorbell>;
        let stats = Arc::new(RelayStats::new());
        let coalescer = Arc::new(SignalCoalescer::new(
            DEFAULT_COOLDOWN,
            Handle::current(),
            weak,
            Arc::clone(&stats),
        ));
        (bell, coalescer, stats)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_within_window_are_suppressed() {
        let (bell, coalescer, stats) = setup();

        coalescer.signal().unwrap();
        coalescer.signal().unwrap();
        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 1);
        assert!(coalescer.is_throttled());

        advance(150).await;
        assert_eq!(bell.rings.load(Ordering::SeqCst), 1);
        assert!(!coalescer.is_throttled());
        assert_eq!(stats.snapshot().doorbells_suppressed, 2);

        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rings_once_more_when_data_remains() {
        let (bell, coalescer, _stats) = setup();
        bell.pending.store(true, Ordering::SeqCst);

        coalescer.signal().unwrap();
        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 1);

        advance(110).await;
        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);
        assert!(coalescer.is_throttled());

        bell.pending.store(false, Ordering::SeqCst);
        advance(110).await;
        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);
        assert!(!coalescer.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unthrottle_and_shutdown() {
        let (bell, coalescer, _stats) = setup();
        bell.pending.store(true, Ordering::SeqCst);

        coalescer.signal().unwrap();
        coalescer.unthrottle();
        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);

        coalescer.shutdown();
        advance(500).await;
        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_leaves_new_window_alone() {
        let (bell, coalescer, _stats) = setup();

        coalescer.signal().unwrap();
        let stale = coalescer.lock().generation;
        coalescer.unthrottle();
        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);

        // The first timer woke up just before it was aborted.
        coalescer.cooldown_expired(stale);
        assert!(coalescer.is_throttled());
        assert!(coalescer.lock().timer.is_some());

        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);

        advance(150).await;
        assert!(!coalescer.is_throttled());
        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rings_without_holding_the_state_lock() {
        let bell = Arc::new(LockCheckingDoorbell::default());
        let weak: Weak<dyn Doorbell> = Arc::downgrade(&bell) as Weak<dyn Doorbell>;
        let coalescer = Arc::new(SignalCoalescer::new(
            DEFAULT_COOLDOWN,
            Handle::current(),
            weak,
            Arc::new(RelayStats::new()),
        ));
        bell.coalescer.set(Arc::downgrade(&coalescer)).unwrap();

        coalescer.signal().unwrap();
        advance(110).await;

        assert_eq!(bell.rings.load(Ordering::SeqCst), 2);
        assert_eq!(bell.rings_unlocked.load(Ordering::SeqCst), 2);
        coalescer.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ring_reopens_the_window() {
        let (bell, coalescer, stats) = setup();

        bell.fail.store(true, Ordering::SeqCst);
        assert!(coalescer.signal().is_err());
        assert!(!coalescer.is_throttled());

        bell.fail.store(false, Ordering::SeqCst);
        coalescer.signal().unwrap();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().doorbells_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_rings_from_the_runtime() {
        let (bell, coalescer, _stats) = setup();
        coalescer.kick();
        assert_eq!(bell.rings.load(Ordering::SeqCst), 0);
        advance(1).await;
        assert_eq!(bell.rings.load(Ordering::SeqCst), 1);
    }
}
