//! Process-scoped data plane state.
//!
//! A [`Context`] owns the connection table, the registries, the service
//! directory and the collaborators (clock, transmitter, ICMP handling,
//! replication sink). Workers share it through an `Arc` and pass it down the
//! pipeline; nothing here is global.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::Tunables;
use crate::conn::{ConnSnapshot, ConnTable, SweepStats};
use crate::directory::{
    Destination, DestinationConfig, Service, ServiceConfig, ServiceDirectory, ServiceKey,
};
use crate::error::{DirectoryError, InitError};
use crate::proto::{IcmpRelation, PassThrough, ProtocolRegistry, TcpHandler, UdpHandler};
use crate::sched::{RoundRobin, Scheduler, SchedulerRegistry};
use crate::stats::{Stats, StatsSnapshot};
use crate::sync::SyncSink;
use crate::xmit::{StackForward, Transmitter};

pub struct Context {
    tunables: Tunables,
    clock: Arc<dyn Clock>,
    conns: ConnTable,
    services: ServiceDirectory,
    schedulers: SchedulerRegistry,
    protocols: ProtocolRegistry,
    transmitter: Arc<dyn Transmitter>,
    icmp: Arc<dyn IcmpRelation>,
    sync_sink: Option<Arc<dyn SyncSink>>,
    stats: Stats,
    shut_down: AtomicBool,
}

/// Builder for [`Context`] with replaceable collaborators.
pub struct ContextBuilder {
    tunables: Tunables,
    clock: Arc<dyn Clock>,
    transmitter: Arc<dyn Transmitter>,
    icmp: Arc<dyn IcmpRelation>,
    sync_sink: Option<Arc<dyn SyncSink>>,
}

impl ContextBuilder {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            tunables,
            clock: Arc::new(MonotonicClock::new()),
            transmitter: Arc::new(StackForward),
            icmp: Arc::new(PassThrough),
            sync_sink: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_transmitter(mut self, transmitter: Arc<dyn Transmitter>) -> Self {
        self.transmitter = transmitter;
        self
    }

    pub fn with_icmp(mut self, icmp: Arc<dyn IcmpRelation>) -> Self {
        self.icmp = icmp;
        self
    }

    pub fn with_sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sync_sink = Some(sink);
        self
    }

    /// Validate tunables, allocate the connection table and register the
    /// built-in protocol handlers and schedulers.
    pub fn build(self) -> Result<Arc<Context>, InitError> {
        self.tunables.validate()?;

        let ctx = Context {
            conns: ConnTable::new(self.tunables.conn_tab_bits, self.tunables.max_connections),
            services: ServiceDirectory::new(),
            schedulers: SchedulerRegistry::new(),
            protocols: ProtocolRegistry::new(),
            clock: self.clock,
            transmitter: self.transmitter,
            icmp: self.icmp,
            sync_sink: self.sync_sink,
            stats: Stats::new(),
            shut_down: AtomicBool::new(false),
            tunables: self.tunables,
        };

        let timeouts = &ctx.tunables.timeouts;
        ctx.protocols
            .register(Arc::new(TcpHandler::new(timeouts.clone())))?;
        ctx.protocols
            .register(Arc::new(UdpHandler::new(timeouts.clone())))?;
        ctx.schedulers.register(Arc::new(RoundRobin::new()))?;

        info!(
            conn_tab_bits = ctx.tunables.conn_tab_bits,
            max_connections = ctx.tunables.max_connections,
            expire_nodest_conn = ctx.tunables.expire_nodest_conn,
            "Data plane initialized"
        );
        Ok(Arc::new(ctx))
    }
}

impl Context {
    /// Context with default collaborators.
    pub fn init(tunables: Tunables) -> Result<Arc<Context>, InitError> {
        ContextBuilder::new(tunables).build()
    }

    pub fn builder(tunables: Tunables) -> ContextBuilder {
        ContextBuilder::new(tunables)
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn conns(&self) -> &ConnTable {
        &self.conns
    }

    pub fn services(&self) -> &ServiceDirectory {
        &self.services
    }

    pub fn schedulers(&self) -> &SchedulerRegistry {
        &self.schedulers
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    pub fn transmitter(&self) -> &dyn Transmitter {
        self.transmitter.as_ref()
    }

    pub fn icmp(&self) -> &dyn IcmpRelation {
        self.icmp.as_ref()
    }

    pub fn sync_sink(&self) -> Option<&dyn SyncSink> {
        self.sync_sink.as_deref()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn connections(&self) -> Vec<ConnSnapshot> {
        self.conns.snapshots()
    }

    // Control plane.

    pub fn add_service(&self, config: &ServiceConfig) -> Result<Arc<Service>, DirectoryError> {
        let scheduler = self.resolve_scheduler(&config.scheduler)?;
        self.services.add_service(config, scheduler)
    }

    pub fn update_service(&self, config: &ServiceConfig) -> Result<Arc<Service>, DirectoryError> {
        let scheduler = self.resolve_scheduler(&config.scheduler)?;
        self.services.update_service(config, scheduler)
    }

    /// Remove a service and expire the connections bound to its destinations.
    pub fn remove_service(&self, key: &ServiceKey) -> Result<Arc<Service>, DirectoryError> {
        let removed = self.services.remove_service(key)?;
        for dest in removed.destinations().iter() {
            self.conns.expire_destination(dest);
        }
        Ok(removed)
    }

    pub fn add_destination(
        &self,
        key: &ServiceKey,
        config: &DestinationConfig,
    ) -> Result<Arc<Destination>, DirectoryError> {
        self.services.add_destination(key, config)
    }

    /// Update a destination. Marking it unavailable expires its connections
    /// when `expire_nodest_conn` is set.
    pub fn update_destination(
        &self,
        key: &ServiceKey,
        config: &DestinationConfig,
    ) -> Result<Arc<Destination>, DirectoryError> {
        let dest = self.services.update_destination(key, config)?;
        if !config.available && self.tunables.expire_nodest_conn {
            self.conns.expire_destination(&dest);
        }
        Ok(dest)
    }

    /// Remove a destination and force-expire its connections.
    pub fn remove_destination(
        &self,
        key: &ServiceKey,
        addr: SocketAddrV4,
    ) -> Result<Arc<Destination>, DirectoryError> {
        let removed = self.services.remove_destination(key, addr)?;
        let expired = self.conns.expire_destination(&removed);
        info!(service = %key, dest = %addr, expired, "Destination connections expired");
        Ok(removed)
    }

    /// Apply a service and its destinations from the service file.
    pub fn apply_service(
        &self,
        config: &ServiceConfig,
        destinations: &[DestinationConfig],
    ) -> Result<Arc<Service>, DirectoryError> {
        let service = match self.services.get(&config.key) {
            Some(_) => self.update_service(config)?,
            None => self.add_service(config)?,
        };
        for dest in destinations {
            match self.services.add_destination(&config.key, dest) {
                Err(DirectoryError::DestinationExists { .. }) => {
                    self.services.update_destination(&config.key, dest)?;
                }
                other => {
                    other?;
                }
            }
        }
        Ok(service)
    }

    fn resolve_scheduler(&self, name: &str) -> Result<Arc<dyn Scheduler>, DirectoryError> {
        self.schedulers
            .get(name)
            .ok_or_else(|| DirectoryError::UnknownScheduler(name.to_string()))
    }

    // Lifecycle.

    /// One expiration pass.
    pub fn sweep(&self) -> SweepStats {
        let stats = self.conns.sweep(self.clock.now_ms());
        self.stats
            .conns_reaped
            .fetch_add(stats.reaped as u64, Ordering::Relaxed);
        stats
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Flush the connection table and empty the registries. Safe to call
    /// more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let flushed = self.conns.flush(self.clock.now_ms());
        self.stats
            .conns_reaped
            .fetch_add(flushed.reaped as u64, Ordering::Relaxed);
        if flushed.busy > 0 {
            warn!(busy = flushed.busy, "Connections still referenced at shutdown");
        }

        let services = self.services.clear();
        self.schedulers.clear();
        self.protocols.clear();
        info!(
            reaped = flushed.reaped,
            services = services.len(),
            "Data plane shut down"
        );
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("conns", &self.conns)
            .field("services", &self.services.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use flowgate_packet::IpProto;

    use super::*;

    fn small() -> Tunables {
        Tunables {
            conn_tab_bits: 8,
            ..Tunables::default()
        }
    }

    #[test]
    fn test_init_registers_builtins() {
        let ctx = Context::init(small()).unwrap();
        assert!(ctx.protocols().get(IpProto::TCP).is_some());
        assert!(ctx.protocols().get(IpProto::UDP).is_some());
        assert!(ctx.protocols().get(IpProto::ICMP).is_none());
        assert_eq!(ctx.schedulers().names(), vec!["rr".to_string()]);
    }

    #[test]
    fn test_init_rejects_bad_tunables() {
        let tunables = Tunables {
            conn_tab_bits: 2,
            ..Tunables::default()
        };
        assert!(matches!(
            Context::init(tunables),
            Err(InitError::InvalidTunable { .. })
        ));
    }

    #[test]
    fn test_unknown_scheduler() {
        let ctx = Context::init(small()).unwrap();
        let config = ServiceConfig::tcp("10.0.0.1:80".parse().unwrap()).with_scheduler("wlc");
        match ctx.add_service(&config) {
            Err(DirectoryError::UnknownScheduler(name)) => assert_eq!(name, "wlc"),
            other => panic!("Expected UnknownScheduler, got {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let ctx = Context::init(small()).unwrap();
        ctx.add_service(&ServiceConfig::tcp("10.0.0.1:80".parse().unwrap()))
            .unwrap();

        ctx.shutdown();
        assert!(ctx.is_shut_down());
        assert!(ctx.services().is_empty());
        assert!(ctx.protocols().protocols().is_empty());

        ctx.shutdown();
        assert!(ctx.is_shut_down());
    }

    #[test]
    fn test_apply_service_upserts_destinations() {
        let ctx = Context::init(small()).unwrap();
        let config = ServiceConfig::tcp("10.0.0.1:80".parse().unwrap());
        let dest = DestinationConfig::new("10.0.0.11:8080".parse().unwrap());

        ctx.apply_service(&config, std::slice::from_ref(&dest)).unwrap();
        let svc = ctx
            .apply_service(&config, &[dest.with_weight(5)])
            .unwrap();

        let dests = svc.destinations();
        assert_eq!(dests.len(), 1);
        assert_eq!(dests[0].weight(), 5);
    }
}
