//! Per-tunnel traffic counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by one tunnel instance.
///
/// Only the relays of the owning instance increment them; anyone may
/// read a snapshot without locking. Values are monotonically
/// non-decreasing for the lifetime of the instance and start at zero on
/// every (re)start.
#[derive(Debug, Default)]
pub struct TunnelCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections: AtomicU64,
    errors: AtomicU64,
}

impl TunnelCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let counters = TunnelCounters::new();
        counters.add_bytes_in(4);
        counters.add_bytes_out(4);
        counters.incr_connections();

        let snap = counters.snapshot();
        assert_eq!(snap.bytes_in, 4);
        assert_eq!(snap.bytes_out, 4);
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.errors, 0);
    }

    #[test]
    fn test_concurrent_increments_sum_up() {
        let counters = std::sync::Arc::new(TunnelCounters::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = counters.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    c.add_bytes_in(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.snapshot().bytes_in, 8000);
    }
}
