//! Virtual service definition.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use flowgate_packet::IpProto;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::destination::{Destination, DestinationSnapshot};
use crate::error::DirectoryError;
use crate::sched::Scheduler;
use crate::stats::{CounterSnapshot, Counters};

/// Identity of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    /// Matched on protocol, virtual address and port (port 0 is a wildcard).
    Addr {
        protocol: IpProto,
        addr: Ipv4Addr,
        port: u16,
    },
    /// Matched on the packet's firewall mark.
    Fwmark(u32),
}

impl ServiceKey {
    pub fn tcp(vaddr: SocketAddrV4) -> Self {
        ServiceKey::Addr {
            protocol: IpProto::TCP,
            addr: *vaddr.ip(),
            port: vaddr.port(),
        }
    }

    pub fn udp(vaddr: SocketAddrV4) -> Self {
        ServiceKey::Addr {
            protocol: IpProto::UDP,
            addr: *vaddr.ip(),
            port: vaddr.port(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKey::Addr {
                protocol,
                addr,
                port,
            } => write!(f, "{} {}:{}", protocol, addr, port),
            ServiceKey::Fwmark(mark) => write!(f, "FWM {}", mark),
        }
    }
}

/// How packets of a connection are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMethod {
    /// Destination NAT toward the backend, source NAT on the way back.
    /// Backends must route replies through the balancer.
    #[default]
    Nat,
    /// Both endpoints rewritten on both legs; backends see a local address
    /// of the balancer as the client.
    FullNat,
}

bitflags::bitflags! {
    /// Service behavior flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u32 {
        /// UDP flows get a connection per packet.
        const ONE_PACKET = 0x0001;
        /// Client affinity. Reserved; rejected at configuration time.
        const PERSISTENT = 0x0002;
    }
}

/// Control-plane description of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub key: ServiceKey,
    pub protocol: IpProto,
    /// Service port. For fwmark services this is informational and only used
    /// by the passthrough rule.
    pub port: u16,
    pub scheduler: String,
    pub forward: ForwardMethod,
    pub flags: ServiceFlags,
    /// Source addresses for the backend leg of full-NAT connections.
    pub local_addrs: Vec<Ipv4Addr>,
}

impl ServiceConfig {
    pub fn new(key: ServiceKey) -> Self {
        let (protocol, port) = match key {
            ServiceKey::Addr { protocol, port, .. } => (protocol, port),
            ServiceKey::Fwmark(_) => (IpProto::TCP, 0),
        };
        Self {
            key,
            protocol,
            port,
            scheduler: "rr".to_string(),
            forward: ForwardMethod::Nat,
            flags: ServiceFlags::empty(),
            local_addrs: Vec::new(),
        }
    }

    pub fn tcp(vaddr: SocketAddrV4) -> Self {
        Self::new(ServiceKey::tcp(vaddr))
    }

    pub fn udp(vaddr: SocketAddrV4) -> Self {
        Self::new(ServiceKey::udp(vaddr))
    }

    pub fn fwmark(mark: u32, protocol: IpProto, port: u16) -> Self {
        let mut config = Self::new(ServiceKey::Fwmark(mark));
        config.protocol = protocol;
        config.port = port;
        config
    }

    pub fn with_scheduler(mut self, name: &str) -> Self {
        self.scheduler = name.to_string();
        self
    }

    pub fn with_forward(mut self, forward: ForwardMethod) -> Self {
        self.forward = forward;
        self
    }

    pub fn with_flags(mut self, flags: ServiceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_local_addrs(mut self, addrs: Vec<Ipv4Addr>) -> Self {
        self.local_addrs = addrs;
        self
    }

    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.flags.contains(ServiceFlags::PERSISTENT) {
            return Err(DirectoryError::InvalidService(
                "persistent services are not supported".to_string(),
            ));
        }
        if !self.protocol.has_ports() {
            return Err(DirectoryError::InvalidService(format!(
                "protocol {} cannot be load balanced",
                self.protocol
            )));
        }
        if self.forward == ForwardMethod::FullNat && self.local_addrs.is_empty() {
            return Err(DirectoryError::InvalidService(
                "full-NAT service needs at least one local address".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lowest local port handed out for full-NAT.
pub const LOCAL_PORT_MIN: u16 = 1024;

/// Rotating source of `(local address, local port)` candidates for the
/// backend leg of full-NAT connections.
#[derive(Debug, Default)]
pub struct LocalAddrPool {
    addrs: Vec<Ipv4Addr>,
    addr_cursor: AtomicUsize,
    port_cursor: AtomicU32,
}

impl LocalAddrPool {
    pub fn new(addrs: Vec<Ipv4Addr>) -> Self {
        Self {
            addrs,
            addr_cursor: AtomicUsize::new(0),
            port_cursor: AtomicU32::new(0),
        }
    }

    pub fn addrs(&self) -> &[Ipv4Addr] {
        &self.addrs
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Next candidate endpoint. Callers check it against the connection
    /// table and ask again on collision.
    pub fn next_candidate(&self) -> Option<SocketAddrV4> {
        if self.addrs.is_empty() {
            return None;
        }
        let idx = self.addr_cursor.fetch_add(1, Ordering::Relaxed) % self.addrs.len();
        let span = u32::from(u16::MAX - LOCAL_PORT_MIN) + 1;
        let port = LOCAL_PORT_MIN as u32 + self.port_cursor.fetch_add(1, Ordering::Relaxed) % span;
        Some(SocketAddrV4::new(self.addrs[idx], port as u16))
    }
}

/// A virtual service and its destination list.
pub struct Service {
    key: ServiceKey,
    protocol: IpProto,
    port: u16,
    scheduler: Arc<dyn Scheduler>,
    forward: ForwardMethod,
    flags: ServiceFlags,
    local_addrs: Arc<LocalAddrPool>,
    destinations: Arc<ArcSwap<Vec<Arc<Destination>>>>,
    sched_cursor: Arc<Mutex<Option<usize>>>,
    stats: Arc<Counters>,
}

impl Service {
    pub(crate) fn new(config: &ServiceConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            key: config.key,
            protocol: config.protocol,
            port: config.port,
            scheduler,
            forward: config.forward,
            flags: config.flags,
            local_addrs: Arc::new(LocalAddrPool::new(config.local_addrs.clone())),
            destinations: Arc::new(ArcSwap::from_pointee(Vec::new())),
            sched_cursor: Arc::new(Mutex::new(None)),
            stats: Arc::new(Counters::default()),
        }
    }

    /// Build the replacement for `self` after a config update. Destinations,
    /// scheduler rotation and counters carry over.
    pub(crate) fn rebuilt(&self, config: &ServiceConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let local_addrs = if config.local_addrs == self.local_addrs.addrs() {
            Arc::clone(&self.local_addrs)
        } else {
            Arc::new(LocalAddrPool::new(config.local_addrs.clone()))
        };
        Self {
            key: self.key,
            protocol: config.protocol,
            port: config.port,
            scheduler,
            forward: config.forward,
            flags: config.flags,
            local_addrs,
            destinations: Arc::clone(&self.destinations),
            sched_cursor: Arc::clone(&self.sched_cursor),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    pub fn protocol(&self) -> IpProto {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_fwmark(&self) -> bool {
        matches!(self.key, ServiceKey::Fwmark(_))
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn forward(&self) -> ForwardMethod {
        self.forward
    }

    pub fn flags(&self) -> ServiceFlags {
        self.flags
    }

    pub fn local_addrs(&self) -> &LocalAddrPool {
        &self.local_addrs
    }

    /// Current destination list. The returned snapshot never changes; updates
    /// publish a new list.
    pub fn destinations(&self) -> Arc<Vec<Arc<Destination>>> {
        self.destinations.load_full()
    }

    pub(crate) fn publish_destinations(&self, dests: Vec<Arc<Destination>>) {
        self.destinations.store(Arc::new(dests));
    }

    pub fn find_destination(&self, addr: SocketAddrV4) -> Option<Arc<Destination>> {
        self.destinations
            .load()
            .iter()
            .find(|d| d.socket_addr() == addr)
            .cloned()
    }

    /// Rotation state for the service's scheduler: index of the last pick.
    pub fn sched_cursor(&self) -> &Mutex<Option<usize>> {
        &self.sched_cursor
    }

    pub fn stats(&self) -> &Counters {
        &self.stats
    }

    pub(crate) fn stats_handle(&self) -> Arc<Counters> {
        Arc::clone(&self.stats)
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            key: self.key.to_string(),
            protocol: self.protocol.to_string(),
            port: self.port,
            scheduler: self.scheduler.name().to_string(),
            forward: self.forward,
            destinations: self.destinations.load().iter().map(|d| d.snapshot()).collect(),
            stats: self.stats.snapshot(),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("key", &self.key)
            .field("port", &self.port)
            .field("scheduler", &self.scheduler.name())
            .field("forward", &self.forward)
            .field("flags", &self.flags)
            .field("destinations", &self.destinations.load().len())
            .finish()
    }
}

/// Serializable view of a service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub key: String,
    pub protocol: String,
    pub port: u16,
    pub scheduler: String,
    pub forward: ForwardMethod,
    pub destinations: Vec<DestinationSnapshot>,
    pub stats: CounterSnapshot,
}
