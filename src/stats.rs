use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the forwarder loop and publisher delivery tasks.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    events_received: AtomicU64,
    mutations: AtomicU64,
    removals: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    publish_failures: AtomicU64,
    encode_failures: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub mutations: u64,
    pub removals: u64,
    pub published: u64,
    pub delivered: u64,
    pub publish_failures: u64,
    pub encode_failures: u64,
    pub dead_lettered: u64,
}

impl ForwarderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, is_mutation: bool) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        if is_mutation {
            self.mutations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}
