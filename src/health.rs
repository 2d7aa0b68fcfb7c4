use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Message counters shared between the transport loop and the write
/// pipeline. All updates are relaxed; the snapshot is a point-in-time
/// view, not a consistent cut.
#[derive(Debug, Default)]
pub struct Counters {
    pub malformed_topic: AtomicU64,
    pub malformed_payload: AtomicU64,
    pub written: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dropped: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            malformed_topic: self.malformed_topic.load(Ordering::Relaxed),
            malformed_payload: self.malformed_payload.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub malformed_topic: u64,
    pub malformed_payload: u64,
    pub written: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
pub struct HealthState {
    pub connected: AtomicBool,
    /// Unix millis of the last inbound publish; 0 means none yet.
    last_message_at: AtomicU64,
    pub counters: Counters,
}

impl HealthState {
    pub fn mark_message(&self, at: u64) {
        self.last_message_at.fetch_max(at, Ordering::Relaxed);
    }

    /// Point-in-time snapshot for external monitoring; never blocks.
    pub fn snapshot(&self) -> HealthSnapshot {
        let at = self.last_message_at.load(Ordering::Relaxed);
        HealthSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            last_message_at: if at == 0 { None } else { Some(at) },
            counters: self.counters.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub last_message_at: Option<u64>,
    pub counters: CounterSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn snapshot_reflects_counters() {
        let health = HealthState::default();
        health.counters.written.fetch_add(3, Ordering::Relaxed);
        health.counters.malformed_topic.fetch_add(1, Ordering::Relaxed);

        let snap = health.snapshot();
        assert_eq!(snap.counters.written, 3);
        assert_eq!(snap.counters.malformed_topic, 1);
        assert_eq!(snap.counters.dropped, 0);
        assert!(!snap.connected);
    }

    #[test]
    fn last_message_at_is_none_until_first_message() {
        let health = HealthState::default();
        assert_eq!(health.snapshot().last_message_at, None);

        health.mark_message(1_700_000_000_000);
        assert_eq!(health.snapshot().last_message_at, Some(1_700_000_000_000));

        // A stale timestamp never moves the marker backwards.
        health.mark_message(1);
        assert_eq!(health.snapshot().last_message_at, Some(1_700_000_000_000));
    }
}
