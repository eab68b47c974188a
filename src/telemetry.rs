use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Default, Debug)]
pub struct HubStats {
    registered: AtomicU64,
    superseded: AtomicU64,
    unregistered: AtomicU64,
    forwarded: AtomicU64,
    forward_misses: AtomicU64,
    dropped: AtomicU64,
}

impl HubStats {
    pub fn on_register(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_supersede(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_unregister(&self) {
        self.unregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_forward_miss(&self) {
        self.forward_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            registered_total: self.registered.load(Ordering::Relaxed),
            superseded_total: self.superseded.load(Ordering::Relaxed),
            unregistered_total: self.unregistered.load(Ordering::Relaxed),
            forwarded_total: self.forwarded.load(Ordering::Relaxed),
            forward_misses_total: self.forward_misses.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStatsSnapshot {
    pub registered_total: u64,
    pub superseded_total: u64,
    pub unregistered_total: u64,
    pub forwarded_total: u64,
    pub forward_misses_total: u64,
    pub dropped_total: u64,
}
