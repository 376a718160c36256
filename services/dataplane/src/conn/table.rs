//! Hashed connection table.
//!
//! Buckets are `Vec`s behind their own `RwLock`; lookups take a read lock on
//! one bucket. A connection appears twice, once under its forward tuple and
//! once under its reverse tuple, and each entry records which orientation it
//! is. Insertion locks both buckets in index order.
//!
//! Removal happens only in [`ConnTable::sweep`]. An entry is removed once the
//! sweep has moved its reference count from 0 to the reap sentinel, which a
//! concurrent lookup can never undo. The sweep checks the deadline once more
//! after the claim: a worker may have refreshed the timer between the first
//! check and the claim, and such a connection has its count reset to 0 and
//! stays. Inserts need the forward bucket's write lock, which the sweep holds
//! throughout, so no duplicate can appear while the claim is undone.
//!
//! `max` is enforced by reserving a slot in the global count before the
//! entries are pushed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use flowgate_packet::IpProto;
use parking_lot::{RwLock, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, error, trace};

use super::connection::ConnParams;
use super::{ConnFlags, ConnRef, ConnSnapshot, Connection, Direction, FlowKey};
use crate::directory::{Destination, ForwardMethod, Service, ServiceFlags};
use crate::proto::ProtoState;
use crate::sched::PacketInfo;

/// Attempts at finding a free full-NAT local endpoint.
const LOCAL_PORT_ATTEMPTS: usize = 16;

/// Why a new connection could not be created.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("packet port {packet} does not match service port {service}")]
    PortMismatch { service: u16, packet: u16 },

    #[error("no eligible destination")]
    NoDestination,

    #[error("connection table full ({0} entries)")]
    TableFull(usize),

    #[error("no free local endpoint for full-NAT")]
    PortsExhausted,
}

impl ScheduleError {
    /// Failures caused by resource limits rather than configuration.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, ScheduleError::TableFull(_) | ScheduleError::PortsExhausted)
    }
}

/// Result of a sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Connections examined.
    pub scanned: usize,
    /// Connections reclaimed.
    pub reaped: usize,
    /// Due connections skipped because a worker held them.
    pub busy: usize,
}

#[derive(Debug)]
struct Entry {
    key: FlowKey,
    direction: Direction,
    conn: Arc<Connection>,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.conn.is_expired() && !self.conn.is_reaped()
    }
}

type Bucket = RwLock<Vec<Entry>>;

/// Write guards on the forward and reverse buckets of one connection.
struct BucketPair<'a> {
    first: RwLockWriteGuard<'a, Vec<Entry>>,
    second: Option<RwLockWriteGuard<'a, Vec<Entry>>>,
    forward_is_first: bool,
}

impl BucketPair<'_> {
    fn forward(&mut self) -> &mut Vec<Entry> {
        match (&mut self.second, self.forward_is_first) {
            (Some(second), false) => &mut **second,
            _ => &mut *self.first,
        }
    }

    fn reverse(&mut self) -> &mut Vec<Entry> {
        match (&mut self.second, self.forward_is_first) {
            (Some(second), true) => &mut **second,
            _ => &mut *self.first,
        }
    }
}

pub struct ConnTable {
    buckets: Box<[Bucket]>,
    mask: usize,
    hasher: RandomState,
    count: AtomicUsize,
    max: usize,
}

impl ConnTable {
    /// Table with `1 << bits` buckets holding at most `max` connections.
    pub fn new(bits: u32, max: usize) -> Self {
        let size = 1usize << bits;
        let buckets = (0..size).map(|_| RwLock::new(Vec::new())).collect();
        Self {
            buckets,
            mask: size - 1,
            hasher: RandomState::new(),
            count: AtomicUsize::new(0),
            max,
        }
    }

    fn bucket_of(&self, key: &FlowKey) -> usize {
        (self.hasher.hash_one(key) as usize) & self.mask
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a live connection under either of its tuples and take a reference.
    pub fn lookup(&self, key: &FlowKey) -> Option<(ConnRef, Direction)> {
        let bucket = self.buckets[self.bucket_of(key)].read();
        bucket
            .iter()
            .filter(|e| e.key == *key && !e.conn.is_expired())
            .find_map(|e| ConnRef::hold(&e.conn).map(|r| (r, e.direction)))
    }

    /// Schedule a destination for a flow that missed the table and insert
    /// its connection. If another worker inserted the same flow first, its
    /// connection is returned instead.
    pub fn create_on_miss(
        &self,
        service: &Arc<Service>,
        packet: &PacketInfo,
        initial: ProtoState,
        timeout: Duration,
        now_ms: u64,
    ) -> Result<ConnRef, ScheduleError> {
        let key = packet.key;
        if !service.is_fwmark() && key.dst.port() != service.port() {
            if service.port() == 0 {
                error!(
                    service = %service.key(),
                    "Port zero is only supported in persistent services, check the service configuration"
                );
            }
            return Err(ScheduleError::PortMismatch {
                service: service.port(),
                packet: key.dst.port(),
            });
        }

        let dest = service
            .scheduler()
            .schedule(service, packet)
            .ok_or(ScheduleError::NoDestination)?;
        let real = dest.target_for(key.dst.port());

        let mut flags = match service.forward() {
            ForwardMethod::FullNat => ConnFlags::FULLNAT,
            ForwardMethod::Nat => ConnFlags::MASQ,
        };
        if service.flags().contains(ServiceFlags::ONE_PACKET) && key.protocol == IpProto::UDP {
            flags |= ConnFlags::ONE_PACKET;
        }

        let attempts = if flags.contains(ConnFlags::FULLNAT) {
            LOCAL_PORT_ATTEMPTS
        } else {
            1
        };

        for _ in 0..attempts {
            let local = if flags.contains(ConnFlags::FULLNAT) {
                service
                    .local_addrs()
                    .next_candidate()
                    .ok_or(ScheduleError::PortsExhausted)?
            } else {
                key.src
            };

            let params = ConnParams {
                protocol: key.protocol,
                client: key.src,
                vaddr: key.dst,
                local,
                real,
                flags,
                state: initial,
                timeout,
                now_ms,
            };
            if let Some(result) = self.try_insert(&params, &dest, service) {
                return result;
            }
            trace!(flow = %key, local = %local, "Local endpoint in use, retrying");
        }

        debug!(flow = %key, real = %real, "No free reverse tuple for connection");
        Err(ScheduleError::PortsExhausted)
    }

    /// Insert under both tuples. `None` means the reverse tuple is taken and
    /// the caller should try another local endpoint.
    fn try_insert(
        &self,
        params: &ConnParams,
        dest: &Arc<Destination>,
        service: &Service,
    ) -> Option<Result<ConnRef, ScheduleError>> {
        let forward_key = FlowKey::new(params.protocol, params.client, params.vaddr);
        let reverse_key = FlowKey::new(params.protocol, params.real, params.local);
        let mut buckets = self.lock_pair(self.bucket_of(&forward_key), self.bucket_of(&reverse_key));

        let existing = buckets
            .forward()
            .iter()
            .filter(|e| e.key == forward_key && e.direction.is_forward() && e.is_live())
            .find_map(|e| ConnRef::hold(&e.conn));
        if let Some(existing) = existing {
            trace!(flow = %forward_key, "Lost insert race, using existing connection");
            return Some(Ok(existing));
        }

        if buckets
            .reverse()
            .iter()
            .any(|e| e.key == reverse_key && e.is_live())
        {
            return None;
        }

        if !self.reserve_slot() {
            return Some(Err(ScheduleError::TableFull(self.max)));
        }

        let conn = Arc::new(Connection::new(params, dest, service.stats_handle()));
        let Some(held) = ConnRef::hold(&conn) else {
            self.count.fetch_sub(1, Ordering::Relaxed);
            return None;
        };
        buckets.forward().push(Entry {
            key: forward_key,
            direction: Direction::Forward,
            conn: Arc::clone(&conn),
        });
        buckets.reverse().push(Entry {
            key: reverse_key,
            direction: Direction::Reverse,
            conn,
        });
        drop(buckets);

        dest.bind_conn();
        service.stats().record_conn();

        debug!(
            conn.client = %params.client,
            conn.vaddr = %params.vaddr,
            conn.local = %params.local,
            conn.real = %params.real,
            flags = ?params.flags,
            "Connection created"
        );
        Some(Ok(held))
    }

    /// Take one slot of the connection budget.
    fn reserve_slot(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    fn lock_pair(&self, forward: usize, reverse: usize) -> BucketPair<'_> {
        let (low, high) = if forward <= reverse {
            (forward, reverse)
        } else {
            (reverse, forward)
        };
        let first = self.buckets[low].write();
        let second = (high != low).then(|| self.buckets[high].write());
        BucketPair {
            first,
            second,
            forward_is_first: forward <= reverse,
        }
    }

    /// Give back a reference. Equivalent to dropping it.
    pub fn release(&self, conn: ConnRef) {
        drop(conn);
    }

    pub fn force_expire(&self, conn: &Connection) -> bool {
        conn.force_expire()
    }

    /// Reclaim every connection that is due and unreferenced.
    pub fn sweep(&self, now_ms: u64) -> SweepStats {
        let mut stats = SweepStats::default();

        for bucket in self.buckets.iter() {
            {
                let entries = bucket.read();
                if !entries
                    .iter()
                    .any(|e| e.direction.is_forward() && e.conn.is_due(now_ms))
                {
                    stats.scanned += entries.iter().filter(|e| e.direction.is_forward()).count();
                    continue;
                }
            }

            let mut reaped = Vec::new();
            {
                let mut entries = bucket.write();
                entries.retain(|e| {
                    if !e.direction.is_forward() {
                        return true;
                    }
                    stats.scanned += 1;
                    if !e.conn.is_due(now_ms) {
                        return true;
                    }
                    if e.conn.try_reap_due(now_ms) {
                        reaped.push(Arc::clone(&e.conn));
                        false
                    } else {
                        if e.conn.refcnt() > 0 {
                            stats.busy += 1;
                        }
                        true
                    }
                });
            }

            for conn in reaped {
                self.unlink_reverse(&conn);
                self.reclaim(&conn);
                stats.reaped += 1;
            }
        }

        if stats.reaped > 0 {
            debug!(
                reaped = stats.reaped,
                busy = stats.busy,
                remaining = self.len(),
                "Connection sweep"
            );
        }
        stats
    }

    fn unlink_reverse(&self, conn: &Arc<Connection>) {
        let idx = self.bucket_of(&conn.reverse_key());
        self.buckets[idx]
            .write()
            .retain(|e| !Arc::ptr_eq(&e.conn, conn));
    }

    fn reclaim(&self, conn: &Connection) {
        if let Some(dest) = conn.destination() {
            dest.unbind_conn(conn.flow().lock().dest_active);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        trace!(
            conn.client = %conn.client(),
            conn.real = %conn.real(),
            "Connection reclaimed"
        );
    }

    /// Force-expire every connection bound to `dest`.
    pub fn expire_destination(&self, dest: &Arc<Destination>) -> usize {
        let mut expired = 0;
        for bucket in self.buckets.iter() {
            for e in bucket.read().iter() {
                if e.direction.is_forward() && e.conn.is_bound_to(dest) && e.conn.force_expire() {
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            debug!(dest = %dest.socket_addr(), expired, "Expired destination connections");
        }
        expired
    }

    /// Expire everything and sweep. Connections still held by a worker
    /// survive until a later sweep.
    pub fn flush(&self, now_ms: u64) -> SweepStats {
        for bucket in self.buckets.iter() {
            for e in bucket.read().iter() {
                e.conn.force_expire();
            }
        }
        self.sweep(now_ms)
    }

    pub fn snapshots(&self) -> Vec<ConnSnapshot> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            for e in bucket.read().iter() {
                if e.direction.is_forward() && e.is_live() {
                    out.push(e.conn.snapshot());
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for ConnTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnTable")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::directory::{DestinationConfig, ServiceConfig, ServiceDirectory};
    use crate::proto::TcpState;
    use crate::sched::RoundRobin;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn service(config: ServiceConfig, dests: &[&str]) -> Arc<Service> {
        let dir = ServiceDirectory::new();
        let svc = dir.add_service(&config, Arc::new(RoundRobin)).unwrap();
        for d in dests {
            dir.add_destination(&config.key, &DestinationConfig::new(addr(d)))
                .unwrap();
        }
        svc
    }

    fn info(src: &str, dst: &str) -> PacketInfo {
        PacketInfo {
            key: FlowKey::new(IpProto::TCP, addr(src), addr(dst)),
            mark: 0,
            len: 60,
        }
    }

    fn create(table: &ConnTable, svc: &Arc<Service>, src: &str, now: u64) -> Result<ConnRef, ScheduleError> {
        table.create_on_miss(
            svc,
            &info(src, "10.0.0.1:80"),
            ProtoState::Tcp(TcpState::None),
            Duration::from_secs(2),
            now,
        )
    }

    #[test]
    fn test_create_then_lookup_both_directions() {
        let table = ConnTable::new(8, 100);
        let svc = service(ServiceConfig::tcp(addr("10.0.0.1:80")), &["10.0.0.11:8080"]);

        let conn = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();
        assert_eq!(conn.real(), addr("10.0.0.11:8080"));
        assert_eq!(table.len(), 1);

        let (fwd, dir) = table.lookup(&conn.forward_key()).unwrap();
        assert_eq!(dir, Direction::Forward);
        assert!(ConnRef::ptr_eq(&fwd, &conn));

        let (rev, dir) = table
            .lookup(&FlowKey::new(IpProto::TCP, addr("10.0.0.11:8080"), addr("192.168.1.5:4000")))
            .unwrap();
        assert_eq!(dir, Direction::Reverse);
        assert!(ConnRef::ptr_eq(&rev, &conn));
        assert_eq!(conn.refcnt(), 3);
    }

    #[test]
    fn test_second_create_returns_existing() {
        let table = ConnTable::new(8, 100);
        let svc = service(
            ServiceConfig::tcp(addr("10.0.0.1:80")),
            &["10.0.0.11:8080", "10.0.0.12:8080"],
        );

        let first = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();
        let second = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();
        assert!(ConnRef::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_port_mismatch_and_no_destination() {
        let table = ConnTable::new(8, 100);
        let svc = service(ServiceConfig::tcp(addr("10.0.0.1:80")), &[]);
        let err = table
            .create_on_miss(
                &svc,
                &info("192.168.1.5:4000", "10.0.0.1:81"),
                ProtoState::Tcp(TcpState::None),
                Duration::from_secs(2),
                0,
            )
            .unwrap_err();
        assert_eq!(err, ScheduleError::PortMismatch { service: 80, packet: 81 });

        let err = create(&table, &svc, "192.168.1.5:4000", 0).unwrap_err();
        assert_eq!(err, ScheduleError::NoDestination);
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_full() {
        let table = ConnTable::new(8, 1);
        let svc = service(ServiceConfig::tcp(addr("10.0.0.1:80")), &["10.0.0.11:8080"]);
        let _held = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();

        let err = create(&table, &svc, "192.168.1.6:4000", 0).unwrap_err();
        assert_eq!(err, ScheduleError::TableFull(1));
        assert!(err.is_allocation_failure());
    }

    #[test]
    fn test_concurrent_inserts_respect_max() {
        let table = ConnTable::new(8, 16);
        let svc = service(ServiceConfig::tcp(addr("10.0.0.1:80")), &["10.0.0.11:8080"]);

        let created: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8u16)
                .map(|worker| {
                    let (table, svc) = (&table, &svc);
                    s.spawn(move || {
                        (0..16u16)
                            .filter(|i| {
                                let src = format!("192.168.{worker}.1:{}", 4000 + i);
                                create(table, svc, &src, 0).is_ok()
                            })
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(created, 16);
        assert_eq!(table.len(), 16);
        assert_eq!(table.snapshots().len(), 16);
    }

    #[test]
    fn test_sweep_skips_held_and_reaps_idle() {
        let table = ConnTable::new(8, 100);
        let svc = service(ServiceConfig::tcp(addr("10.0.0.1:80")), &["10.0.0.11:8080"]);
        let dest = svc.destinations()[0].clone();

        let held = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();
        let key = held.forward_key();

        let stats = table.sweep(10_000);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.reaped, 0);
        assert_eq!(table.len(), 1);

        drop(held);
        let stats = table.sweep(1_000);
        assert_eq!(stats.reaped, 0, "not due yet");

        let stats = table.sweep(10_000);
        assert_eq!(stats.reaped, 1);
        assert!(table.is_empty());
        assert!(table.lookup(&key).is_none());
        assert!(table
            .lookup(&FlowKey::new(IpProto::TCP, addr("10.0.0.11:8080"), addr("192.168.1.5:4000")))
            .is_none());
        assert_eq!(dest.inactive_conns(), 0);
    }

    #[test]
    fn test_force_expired_connection_misses_and_is_reaped() {
        let table = ConnTable::new(8, 100);
        let svc = service(ServiceConfig::tcp(addr("10.0.0.1:80")), &["10.0.0.11:8080"]);
        let conn = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();
        let key = conn.forward_key();

        assert!(table.force_expire(&conn));
        assert!(table.lookup(&key).is_none());
        table.release(conn);

        assert_eq!(table.sweep(0).reaped, 1);
    }

    #[test]
    fn test_expire_destination() {
        let table = ConnTable::new(8, 100);
        let svc = service(
            ServiceConfig::tcp(addr("10.0.0.1:80")),
            &["10.0.0.11:8080", "10.0.0.12:8080"],
        );
        let a = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();
        let b = create(&table, &svc, "192.168.1.5:4001", 0).unwrap();
        let d1 = svc.destinations()[0].clone();

        assert_eq!(table.expire_destination(&d1), 1);
        assert!(a.is_expired());
        assert!(!b.is_expired());
    }

    #[test]
    fn test_fullnat_allocates_distinct_local_endpoints() {
        let table = ConnTable::new(8, 100);
        let config = ServiceConfig::tcp(addr("10.0.0.1:80"))
            .with_forward(ForwardMethod::FullNat)
            .with_local_addrs(vec![Ipv4Addr::new(10, 1, 0, 1)]);
        let svc = service(config, &["10.0.0.11:8080"]);

        let a = create(&table, &svc, "192.168.1.5:4000", 0).unwrap();
        let b = create(&table, &svc, "192.168.1.6:4000", 0).unwrap();
        assert!(a.is_fullnat());
        assert_eq!(*a.local().ip(), Ipv4Addr::new(10, 1, 0, 1));
        assert_ne!(a.local(), b.local());

        let (rev, dir) = table
            .lookup(&FlowKey::new(IpProto::TCP, addr("10.0.0.11:8080"), b.local()))
            .unwrap();
        assert_eq!(dir, Direction::Reverse);
        assert!(ConnRef::ptr_eq(&rev, &b));
    }

    #[test]
    fn test_flush_empties_unheld() {
        let table = ConnTable::new(8, 100);
        let svc = service(ServiceConfig::tcp(addr("10.0.0.1:80")), &["10.0.0.11:8080"]);
        for port in 4000..4010 {
            drop(create(&table, &svc, &format!("192.168.1.5:{port}"), 0).unwrap());
        }
        let held = create(&table, &svc, "192.168.1.5:5000", 0).unwrap();

        let stats = table.flush(0);
        assert_eq!(stats.reaped, 10);
        assert_eq!(table.len(), 1);
        drop(held);
        assert_eq!(table.sweep(0).reaped, 1);
    }
}
