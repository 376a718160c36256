//! Packet and connection counters.
//!
//! All counters are relaxed atomics: they are written from every worker and
//! only read for reporting, so no ordering with other memory is needed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Traffic counters kept per service and per destination.
#[derive(Debug, Default)]
pub struct Counters {
    /// Connections scheduled.
    pub conns: AtomicU64,
    /// Packets client -> backend.
    pub in_pkts: AtomicU64,
    /// Packets backend -> client.
    pub out_pkts: AtomicU64,
    /// Bytes client -> backend.
    pub in_bytes: AtomicU64,
    /// Bytes backend -> client.
    pub out_bytes: AtomicU64,
}

impl Counters {
    pub(crate) fn record_in(&self, bytes: usize) {
        self.in_pkts.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, bytes: usize) {
        self.out_pkts.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_conn(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            conns: self.conns.load(Ordering::Relaxed),
            in_pkts: self.in_pkts.load(Ordering::Relaxed),
            out_pkts: self.out_pkts.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub conns: u64,
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// Process-wide data plane statistics.
#[derive(Debug, Default)]
pub struct Stats {
    /// Traffic on load-balanced flows.
    pub traffic: Counters,
    /// Packets dropped by length/header checks.
    pub malformed: AtomicU64,
    /// Packets accepted without load balancing (no service, unknown protocol,
    /// mid-flow segment without a connection, passthrough port).
    pub passthrough: AtomicU64,
    /// Packets dropped because no destination could be scheduled.
    pub sched_unreach: AtomicU64,
    /// Connection allocations refused (table full, local ports exhausted).
    pub alloc_failures: AtomicU64,
    /// Packets dropped because the bound destination went unavailable.
    pub dest_unavailable: AtomicU64,
    /// Packets dropped by rewrite or transmit failures.
    pub xmit_errors: AtomicU64,
    /// Connections reclaimed by the sweeper.
    pub conns_reaped: AtomicU64,
    /// Replication notifications emitted.
    pub sync_sent: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            traffic: self.traffic.snapshot(),
            malformed: self.malformed.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            sched_unreach: self.sched_unreach.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            dest_unavailable: self.dest_unavailable.load(Ordering::Relaxed),
            xmit_errors: self.xmit_errors.load(Ordering::Relaxed),
            conns_reaped: self.conns_reaped.load(Ordering::Relaxed),
            sync_sent: self.sync_sent.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub traffic: CounterSnapshot,
    pub malformed: u64,
    pub passthrough: u64,
    pub sched_unreach: u64,
    pub alloc_failures: u64,
    pub dest_unavailable: u64,
    pub xmit_errors: u64,
    pub conns_reaped: u64,
    pub sync_sent: u64,
}
