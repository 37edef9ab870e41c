//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters updated from the control and data paths
#[derive(Debug, Default)]
pub struct RelayStats {
    frames_to_firmware: AtomicU64,
    frames_from_firmware: AtomicU64,
    frames_dropped_no_space: AtomicU64,
    frames_malformed: AtomicU64,
    notifications_sent: AtomicU64,
    doorbells_sent: AtomicU64,
    doorbells_suppressed: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_to_firmware: u64,
    pub frames_from_firmware: u64,
    pub frames_dropped_no_space: u64,
    pub frames_malformed: u64,
    pub notifications_sent: u64,
    pub doorbells_sent: u64,
    pub doorbells_suppressed: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_to_firmware(&self) {
        self.frames_to_firmware.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_from_firmware(&self) {
        self.frames_from_firmware.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped_no_space(&self) {
        self.frames_dropped_no_space.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn doorbell_sent(&self) {
        self.doorbells_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn doorbell_suppressed(&self) {
        self.doorbells_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_to_firmware: self.frames_to_firmware.load(Ordering::Relaxed),
            frames_from_firmware: self.frames_from_firmware.load(Ordering::Relaxed),
            frames_dropped_no_space: self.frames_dropped_no_space.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            doorbells_sent: self.doorbells_sent.load(Ordering::Relaxed),
            doorbells_suppressed: self.doorbells_suppressed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = RelayStats::new();
        stats.frame_to_firmware();
        stats.frame_to_firmware();
        stats.doorbell_sent();
        stats.doorbell_suppressed();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_to_firmware, 2);
        assert_eq!(snap.doorbells_sent, 1);
        assert_eq!(snap.doorbells_suppressed, 1);
        assert_eq!(snap.frames_dropped_no_space, 0);
    }

    #[test]
    fn test_snapshot_json() {
        let stats = RelayStats::new();
        stats.frame_from_firmware();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["frames_from_firmware"], 1);
        assert_eq!(json["notifications_sent"], 0);
    }
}
