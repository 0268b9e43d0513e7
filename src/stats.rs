//! Per-container statistics
//!
//! Counters live in memory while a container is open and are persisted into
//! the metadata container on close (and replayed on open).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Persisted form of [`ContainerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub objects: u64,
    pub live_bytes: u64,
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
}

/// Live counters of an open container
#[derive(Debug, Default)]
pub struct ContainerStats {
    objects: AtomicU64,
    live_bytes: AtomicU64,
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
}

impl ContainerStats {
    pub fn from_record(record: StatsRecord) -> Self {
        Self {
            objects: AtomicU64::new(record.objects),
            live_bytes: AtomicU64::new(record.live_bytes),
            puts: AtomicU64::new(record.puts),
            gets: AtomicU64::new(record.gets),
            deletes: AtomicU64::new(record.deletes),
        }
    }

    pub fn record(&self) -> StatsRecord {
        StatsRecord {
            objects: self.objects.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    pub fn objects(&self) -> u64 {
        self.objects.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Account a put that replaced `prev` live bytes (None if new) with `now`
    pub fn on_put(&self, prev: Option<u64>, now: u64) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        match prev {
            Some(old) => self.sub_bytes(old),
            None => {
                self.objects.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.live_bytes.fetch_add(now, Ordering::Relaxed);
    }

    /// Account a delete of `prev` live bytes (None if nothing was there)
    pub fn on_delete(&self, prev: Option<u64>) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = prev {
            self.sub_bytes(old);
            let _ = self
                .objects
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    pub fn on_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    fn sub_bytes(&self, n: u64) {
        let _ = self
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| Some(b.saturating_sub(n)));
    }
}

