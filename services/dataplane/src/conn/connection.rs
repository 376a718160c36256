//! Per-flow connection record and the reference handle workers hold on it.

use std::fmt;
use std::net::SocketAddrV4;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flowgate_packet::IpProto;
use parking_lot::Mutex;
use serde::Serialize;

use super::FlowKey;
use crate::directory::Destination;
use crate::proto::ProtoState;
use crate::stats::Counters;

bitflags::bitflags! {
    /// Connection behavior flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnFlags: u32 {
        /// Both legs rewrite source and destination.
        const FULLNAT = 0x0001;
        /// Destination NAT toward the backend, source NAT back.
        const MASQ = 0x0002;
        /// Expire right after the first packet.
        const ONE_PACKET = 0x0004;
    }
}

/// Reference count value marking a connection the sweep has claimed.
const REAPED: u32 = u32::MAX;

/// Deadline `timeout` after `now_ms`, saturating at `u64::MAX`.
fn deadline_after(now_ms: u64, timeout: Duration) -> u64 {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_add(timeout_ms)
}

/// Mutable protocol state, serialized by the connection's mutex.
#[derive(Debug, Clone, Copy)]
pub struct FlowState {
    pub state: ProtoState,
    /// State as of the previous packet's end of processing.
    pub old_state: ProtoState,
    pub timeout: Duration,
    /// Whether the destination counts this connection as active.
    pub(crate) dest_active: bool,
}

/// Everything needed to build a connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnParams {
    pub protocol: IpProto,
    pub client: SocketAddrV4,
    pub vaddr: SocketAddrV4,
    pub local: SocketAddrV4,
    pub real: SocketAddrV4,
    pub flags: ConnFlags,
    pub state: ProtoState,
    pub timeout: Duration,
    pub now_ms: u64,
}

/// One tracked flow.
pub struct Connection {
    protocol: IpProto,
    client: SocketAddrV4,
    vaddr: SocketAddrV4,
    local: SocketAddrV4,
    real: SocketAddrV4,
    flags: ConnFlags,
    dest: Weak<Destination>,
    service_stats: Arc<Counters>,
    flow: Mutex<FlowState>,
    expired: AtomicBool,
    deadline_ms: AtomicU64,
    refcnt: AtomicU32,
    created_ms: u64,
    in_pkts: AtomicU64,
    out_pkts: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
}

impl Connection {
    pub(crate) fn new(
        params: &ConnParams,
        dest: &Arc<Destination>,
        service_stats: Arc<Counters>,
    ) -> Self {
        Self {
            protocol: params.protocol,
            client: params.client,
            vaddr: params.vaddr,
            local: params.local,
            real: params.real,
            flags: params.flags,
            dest: Arc::downgrade(dest),
            service_stats,
            flow: Mutex::new(FlowState {
                state: params.state,
                old_state: params.state,
                timeout: params.timeout,
                dest_active: false,
            }),
            expired: AtomicBool::new(false),
            deadline_ms: AtomicU64::new(deadline_after(params.now_ms, params.timeout)),
            refcnt: AtomicU32::new(0),
            created_ms: params.now_ms,
            in_pkts: AtomicU64::new(0),
            out_pkts: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
        }
    }

    pub fn protocol(&self) -> IpProto {
        self.protocol
    }

    pub fn client(&self) -> SocketAddrV4 {
        self.client
    }

    pub fn vaddr(&self) -> SocketAddrV4 {
        self.vaddr
    }

    /// Source endpoint of the backend leg. Equal to the client endpoint
    /// unless the connection is full-NAT.
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn real(&self) -> SocketAddrV4 {
        self.real
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn is_fullnat(&self) -> bool {
        self.flags.contains(ConnFlags::FULLNAT)
    }

    /// Tuple of client traffic toward the virtual service.
    pub fn forward_key(&self) -> FlowKey {
        FlowKey::new(self.protocol, self.client, self.vaddr)
    }

    /// Tuple of backend replies.
    pub fn reverse_key(&self) -> FlowKey {
        FlowKey::new(self.protocol, self.real, self.local)
    }

    /// The destination, if it still exists.
    pub fn destination(&self) -> Option<Arc<Destination>> {
        self.dest.upgrade()
    }

    /// Counters of the service that created the connection.
    pub(crate) fn service_stats(&self) -> &Counters {
        &self.service_stats
    }

    pub(crate) fn is_bound_to(&self, dest: &Arc<Destination>) -> bool {
        std::ptr::eq(self.dest.as_ptr(), Arc::as_ptr(dest))
    }

    pub fn flow(&self) -> &Mutex<FlowState> {
        &self.flow
    }

    pub fn state(&self) -> ProtoState {
        self.flow.lock().state
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Mark the connection expired. Lookups stop returning it and the next
    /// sweep reclaims it once unreferenced. The idle deadline is left as is.
    /// Returns false if it was already expired.
    pub fn force_expire(&self) -> bool {
        !self.expired.swap(true, Ordering::AcqRel)
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now_ms: u64, timeout: Duration) {
        self.deadline_ms
            .store(deadline_after(now_ms, timeout), Ordering::Relaxed);
    }

    pub(crate) fn is_due(&self, now_ms: u64) -> bool {
        self.is_expired() || now_ms >= self.deadline_ms()
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Take a reference unless the sweep has already claimed the record.
    fn try_hold(&self) -> bool {
        let mut current = self.refcnt.load(Ordering::Acquire);
        loop {
            if current == REAPED {
                return false;
            }
            match self.refcnt.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn put(&self) {
        let previous = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0 && previous != REAPED, "refcount underflow");
    }

    /// Claim an unreferenced connection for reclamation.
    pub(crate) fn try_reap(&self) -> bool {
        self.refcnt
            .compare_exchange(0, REAPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the connection only if it is still due once no worker holds
    /// it. A worker that refreshed the timer between the sweep's first check
    /// and the claim gets its connection back.
    pub(crate) fn try_reap_due(&self, now_ms: u64) -> bool {
        if !self.try_reap() {
            return false;
        }
        if self.is_due(now_ms) {
            return true;
        }
        self.refcnt.store(0, Ordering::Release);
        false
    }

    pub(crate) fn is_reaped(&self) -> bool {
        self.refcnt() == REAPED
    }

    /// Count a client-side packet. Returns the new inbound packet count.
    pub(crate) fn account_in(&self, bytes: usize) -> u64 {
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.in_pkts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn account_out(&self, bytes: usize) {
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.out_pkts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_pkts(&self) -> u64 {
        self.in_pkts.load(Ordering::Relaxed)
    }

    pub fn out_pkts(&self) -> u64 {
        self.out_pkts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConnSnapshot {
        let flow = *self.flow.lock();
        ConnSnapshot {
            protocol: self.protocol.to_string(),
            client: self.client,
            vaddr: self.vaddr,
            local: self.local,
            real: self.real,
            fullnat: self.is_fullnat(),
            state: flow.state.name(),
            timeout_secs: flow.timeout.as_secs(),
            deadline_ms: self.deadline_ms(),
            created_ms: self.created_ms,
            expired: self.is_expired(),
            in_pkts: self.in_pkts(),
            out_pkts: self.out_pkts(),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("protocol", &self.protocol)
            .field("client", &self.client)
            .field("vaddr", &self.vaddr)
            .field("local", &self.local)
            .field("real", &self.real)
            .field("flags", &self.flags)
            .field("expired", &self.is_expired())
            .field("refcnt", &self.refcnt())
            .finish()
    }
}

/// Serializable view of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnSnapshot {
    pub protocol: String,
    pub client: SocketAddrV4,
    pub vaddr: SocketAddrV4,
    pub local: SocketAddrV4,
    pub real: SocketAddrV4,
    pub fullnat: bool,
    pub state: &'static str,
    pub timeout_secs: u64,
    pub deadline_ms: u64,
    pub created_ms: u64,
    pub expired: bool,
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// A held reference to a connection.
///
/// While any `ConnRef` exists the sweep will not reclaim the connection.
/// Dropping it releases the reference.
pub struct ConnRef {
    conn: Arc<Connection>,
}

impl ConnRef {
    pub(crate) fn hold(conn: &Arc<Connection>) -> Option<Self> {
        conn.try_hold().then(|| Self {
            conn: Arc::clone(conn),
        })
    }

    pub fn ptr_eq(a: &ConnRef, b: &ConnRef) -> bool {
        Arc::ptr_eq(&a.conn, &b.conn)
    }
}

impl Deref for ConnRef {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Clone for ConnRef {
    fn clone(&self) -> Self {
        // Already held, so the sweep cannot claim it concurrently.
        self.conn.refcnt.fetch_add(1, Ordering::AcqRel);
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl Drop for ConnRef {
    fn drop(&mut self) {
        self.conn.put();
    }
}

impl fmt::Debug for ConnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.conn.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DestinationConfig;
    use crate::proto::{TcpState, UdpState};

    fn conn() -> (Arc<Connection>, Arc<Destination>) {
        let dest = Arc::new(Destination::new(&DestinationConfig::new(
            "10.0.0.11:8080".parse().unwrap(),
        )));
        let params = ConnParams {
            protocol: IpProto::TCP,
            client: "192.168.1.5:4000".parse().unwrap(),
            vaddr: "10.0.0.1:80".parse().unwrap(),
            local: "192.168.1.5:4000".parse().unwrap(),
            real: "10.0.0.11:8080".parse().unwrap(),
            flags: ConnFlags::MASQ,
            state: ProtoState::Tcp(TcpState::None),
            timeout: Duration::from_secs(2),
            now_ms: 1_000,
        };
        (
            Arc::new(Connection::new(&params, &dest, Arc::new(Counters::default()))),
            dest,
        )
    }

    #[test]
    fn test_keys() {
        let (conn, _dest) = conn();
        assert_eq!(conn.forward_key().to_string(), "TCP 192.168.1.5:4000 -> 10.0.0.1:80");
        assert_eq!(conn.reverse_key().to_string(), "TCP 10.0.0.11:8080 -> 192.168.1.5:4000");
        assert_eq!(conn.deadline_ms(), 3_000);
    }

    #[test]
    fn test_refs_block_reap() {
        let (conn, _dest) = conn();
        let a = ConnRef::hold(&conn).unwrap();
        let b = a.clone();
        assert_eq!(conn.refcnt(), 2);
        assert!(!conn.try_reap());

        drop(a);
        drop(b);
        assert_eq!(conn.refcnt(), 0);
        assert!(conn.try_reap());
        assert!(conn.is_reaped());
        assert!(ConnRef::hold(&conn).is_none());
    }

    #[test]
    fn test_force_expire_keeps_deadline() {
        let (conn, _dest) = conn();
        let deadline = conn.deadline_ms();
        assert!(conn.force_expire());
        assert!(!conn.force_expire());
        assert!(conn.is_expired());
        assert_eq!(conn.deadline_ms(), deadline);
        assert!(conn.is_due(0));
    }

    #[test]
    fn test_refreshed_connection_is_not_reaped() {
        let (conn, _dest) = conn();
        assert!(conn.is_due(3_000));

        // A packet lands after the sweep saw the connection as due.
        let held = ConnRef::hold(&conn).unwrap();
        conn.touch(3_000, Duration::from_secs(2));
        drop(held);

        assert!(!conn.try_reap_due(3_000));
        assert_eq!(conn.refcnt(), 0);
        assert!(ConnRef::hold(&conn).is_some());

        assert!(conn.try_reap_due(5_000));
        assert!(conn.is_reaped());
    }

    #[test]
    fn test_huge_timeout_saturates_deadline() {
        let (conn, _dest) = conn();
        conn.touch(10_000, Duration::from_secs(u64::MAX / 1000));
        assert_eq!(conn.deadline_ms(), u64::MAX);
        conn.touch(10_000, Duration::MAX);
        assert_eq!(conn.deadline_ms(), u64::MAX);
        assert!(!conn.is_due(u64::MAX - 1));
    }

    #[test]
    fn test_destination_is_weak() {
        let (conn, dest) = conn();
        assert!(conn.is_bound_to(&dest));
        drop(dest);
        assert!(conn.destination().is_none());
    }

    #[test]
    fn test_snapshot_serializes() {
        let (conn, _dest) = conn();
        conn.account_in(60);
        conn.account_out(40);
        conn.flow().lock().state = ProtoState::Udp(UdpState::Normal);

        let json = serde_json::to_value(conn.snapshot()).unwrap();
        assert_eq!(json["state"], "UDP");
        assert_eq!(json["in_pkts"], 1);
        assert_eq!(json["out_bytes"], 40);
        assert_eq!(json["real"], "10.0.0.11:8080");
    }
}
