//! Destination (real server) state.
//!
//! A destination is shared between the control plane, which flips its weight
//! and availability, and the packet path, which reads those fields and bumps
//! the connection counters. Every mutable field is an atomic; availability is
//! read relaxed because one stale packet after a health change is acceptable.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::stats::{CounterSnapshot, Counters};

/// Control-plane description of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub addr: Ipv4Addr,
    /// Backend port; 0 keeps the packet's destination port.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_available() -> bool {
    true
}

impl DestinationConfig {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            addr: *addr.ip(),
            port: addr.port(),
            weight: default_weight(),
            available: default_available(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }
}

/// A real server behind a virtual service.
#[derive(Debug)]
pub struct Destination {
    addr: Ipv4Addr,
    port: u16,
    weight: AtomicU32,
    available: AtomicBool,
    active_conns: AtomicU32,
    inactive_conns: AtomicU32,
    stats: Counters,
}

impl Destination {
    pub fn new(config: &DestinationConfig) -> Self {
        Self {
            addr: config.addr,
            port: config.port,
            weight: AtomicU32::new(config.weight),
            available: AtomicBool::new(config.available),
            active_conns: AtomicU32::new(0),
            inactive_conns: AtomicU32::new(0),
            stats: Counters::default(),
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Configured endpoint (port may be 0).
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }

    /// Endpoint to use for a flow whose virtual port is `vport`.
    pub fn target_for(&self, vport: u16) -> SocketAddrV4 {
        let port = if self.port != 0 { self.port } else { vport };
        SocketAddrV4::new(self.addr, port)
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn active_conns(&self) -> u32 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn inactive_conns(&self) -> u32 {
        self.inactive_conns.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &Counters {
        &self.stats
    }

    /// Apply weight and availability from a config update.
    pub(crate) fn apply(&self, config: &DestinationConfig) {
        self.weight.store(config.weight, Ordering::Relaxed);
        self.available.store(config.available, Ordering::Relaxed);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// A new connection starts out inactive.
    pub(crate) fn bind_conn(&self) {
        self.inactive_conns.fetch_add(1, Ordering::Relaxed);
        self.stats.record_conn();
    }

    pub(crate) fn activate_conn(&self) {
        self.inactive_conns.fetch_sub(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deactivate_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
        self.inactive_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unbind_conn(&self, active: bool) {
        if active {
            self.active_conns.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.inactive_conns.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            addr: self.socket_addr(),
            weight: self.weight(),
            available: self.is_available(),
            active_conns: self.active_conns(),
            inactive_conns: self.inactive_conns(),
            stats: self.stats.snapshot(),
        }
    }
}

/// Serializable view of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationSnapshot {
    pub addr: SocketAddrV4,
    pub weight: u32,
    pub available: bool,
    pub active_conns: u32,
    pub inactive_conns: u32,
    pub stats: CounterSnapshot,
}
