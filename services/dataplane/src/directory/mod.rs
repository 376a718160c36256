//! Service directory.
//!
//! Holds every virtual service and its destinations. The packet path reads an
//! immutable snapshot through `ArcSwap`; control-plane writers serialize on a
//! mutex, build the next snapshot and publish it in one store. A reader that
//! loaded the previous snapshot keeps a consistent view until it drops it.

mod destination;
mod service;

pub use destination::{Destination, DestinationConfig, DestinationSnapshot};
pub use service::{
    ForwardMethod, LocalAddrPool, Service, ServiceConfig, ServiceFlags, ServiceKey,
    ServiceSnapshot, LOCAL_PORT_MIN,
};

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use arc_swap::ArcSwap;
use flowgate_packet::IpProto;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::DirectoryError;
use crate::sched::Scheduler;

/// Immutable view of all services.
#[derive(Debug, Default)]
struct DirectorySnapshot {
    by_key: HashMap<ServiceKey, Arc<Service>>,
}

impl DirectorySnapshot {
    fn with_upsert(&self, service: Arc<Service>) -> Self {
        let mut by_key = self.by_key.clone();
        by_key.insert(service.key(), service);
        Self { by_key }
    }

    fn without(&self, key: &ServiceKey) -> Self {
        let mut by_key = self.by_key.clone();
        by_key.remove(key);
        Self { by_key }
    }
}

/// Registry of virtual services.
pub struct ServiceDirectory {
    snapshot: ArcSwap<DirectorySnapshot>,
    writer: Mutex<()>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(DirectorySnapshot::default()),
            writer: Mutex::new(()),
        }
    }

    /// Add a service. The scheduler has already been resolved by name.
    pub fn add_service(
        &self,
        config: &ServiceConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Service>, DirectoryError> {
        config.validate()?;
        let _guard = self.writer.lock();
        let current = self.snapshot.load();
        if current.by_key.contains_key(&config.key) {
            return Err(DirectoryError::ServiceExists(config.key));
        }

        let service = Arc::new(Service::new(config, scheduler));
        self.snapshot
            .store(Arc::new(current.with_upsert(Arc::clone(&service))));

        info!(
            service = %config.key,
            scheduler = %service.scheduler().name(),
            forward = ?config.forward,
            "Service added"
        );
        Ok(service)
    }

    /// Replace a service's settings, keeping its destinations and counters.
    pub fn update_service(
        &self,
        config: &ServiceConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Service>, DirectoryError> {
        config.validate()?;
        let _guard = self.writer.lock();
        let current = self.snapshot.load();
        let old = current
            .by_key
            .get(&config.key)
            .ok_or(DirectoryError::ServiceNotFound(config.key))?;

        let service = Arc::new(old.rebuilt(config, scheduler));
        self.snapshot
            .store(Arc::new(current.with_upsert(Arc::clone(&service))));

        info!(service = %config.key, "Service updated");
        Ok(service)
    }

    /// Remove a service. Its connections keep their destinations until they
    /// expire; callers that want them gone expire them through the table.
    pub fn remove_service(&self, key: &ServiceKey) -> Result<Arc<Service>, DirectoryError> {
        let _guard = self.writer.lock();
        let current = self.snapshot.load();
        let removed = current
            .by_key
            .get(key)
            .cloned()
            .ok_or(DirectoryError::ServiceNotFound(*key))?;

        self.snapshot.store(Arc::new(current.without(key)));
        info!(service = %key, "Service removed");
        Ok(removed)
    }

    pub fn add_destination(
        &self,
        key: &ServiceKey,
        config: &DestinationConfig,
    ) -> Result<Arc<Destination>, DirectoryError> {
        let _guard = self.writer.lock();
        let service = self.require(key)?;
        let addr = config.socket_addr();
        let mut dests = service.destinations().as_ref().clone();
        if dests.iter().any(|d| d.socket_addr() == addr) {
            return Err(DirectoryError::DestinationExists {
                service: *key,
                dest: addr,
            });
        }

        let dest = Arc::new(Destination::new(config));
        dests.push(Arc::clone(&dest));
        service.publish_destinations(dests);

        info!(
            service = %key,
            dest = %addr,
            weight = config.weight,
            available = config.available,
            "Destination added"
        );
        Ok(dest)
    }

    /// Update weight and availability in place. Connections already bound to
    /// the destination keep their binding.
    pub fn update_destination(
        &self,
        key: &ServiceKey,
        config: &DestinationConfig,
    ) -> Result<Arc<Destination>, DirectoryError> {
        let _guard = self.writer.lock();
        let service = self.require(key)?;
        let addr = config.socket_addr();
        let dest = service
            .find_destination(addr)
            .ok_or(DirectoryError::DestinationNotFound {
                service: *key,
                dest: addr,
            })?;

        dest.apply(config);
        info!(
            service = %key,
            dest = %addr,
            weight = config.weight,
            available = config.available,
            "Destination updated"
        );
        Ok(dest)
    }

    pub fn remove_destination(
        &self,
        key: &ServiceKey,
        addr: SocketAddrV4,
    ) -> Result<Arc<Destination>, DirectoryError> {
        let _guard = self.writer.lock();
        let service = self.require(key)?;
        let mut dests = service.destinations().as_ref().clone();
        let pos = dests
            .iter()
            .position(|d| d.socket_addr() == addr)
            .ok_or(DirectoryError::DestinationNotFound {
                service: *key,
                dest: addr,
            })?;

        let removed = dests.remove(pos);
        service.publish_destinations(dests);
        info!(service = %key, dest = %addr, "Destination removed");
        Ok(removed)
    }

    pub fn get(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        self.snapshot.load().by_key.get(key).cloned()
    }

    /// Resolve the service a packet targets: fwmark first when the packet
    /// carries one, then the exact address and port, then the port-0
    /// wildcard for the address.
    pub fn find(&self, protocol: IpProto, dst: SocketAddrV4, mark: u32) -> Option<Arc<Service>> {
        let snapshot = self.snapshot.load();

        if mark != 0 {
            if let Some(svc) = snapshot.by_key.get(&ServiceKey::Fwmark(mark)) {
                return Some(Arc::clone(svc));
            }
        }

        let exact = ServiceKey::Addr {
            protocol,
            addr: *dst.ip(),
            port: dst.port(),
        };
        if let Some(svc) = snapshot.by_key.get(&exact) {
            return Some(Arc::clone(svc));
        }

        let wildcard = ServiceKey::Addr {
            protocol,
            addr: *dst.ip(),
            port: 0,
        };
        let found = snapshot.by_key.get(&wildcard).cloned();
        if found.is_none() {
            debug!(protocol = %protocol, dst = %dst, mark, "No service for packet");
        }
        found
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.snapshot.load().by_key.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().by_key.is_empty()
    }

    /// Drop every service. Used on shutdown.
    pub fn clear(&self) -> Vec<Arc<Service>> {
        let _guard = self.writer.lock();
        let previous = self.snapshot.swap(Arc::new(DirectorySnapshot::default()));
        previous.by_key.values().cloned().collect()
    }

    fn require(&self, key: &ServiceKey) -> Result<Arc<Service>, DirectoryError> {
        self.get(key).ok_or(DirectoryError::ServiceNotFound(*key))
    }
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::RoundRobin;

    fn rr() -> Arc<dyn Scheduler> {
        Arc::new(RoundRobin::new())
    }

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_service_rejects_duplicate() {
        let dir = ServiceDirectory::new();
        let config = ServiceConfig::tcp(addr("10.0.0.1:80"));
        dir.add_service(&config, rr()).unwrap();

        match dir.add_service(&config, rr()) {
            Err(DirectoryError::ServiceExists(key)) => assert_eq!(key, config.key),
            other => panic!("Expected ServiceExists, got {:?}", other),
        }
    }

    #[test]
    fn test_find_prefers_fwmark_then_exact_then_wildcard() {
        let dir = ServiceDirectory::new();
        dir.add_service(&ServiceConfig::tcp(addr("10.0.0.1:0")), rr())
            .unwrap();
        dir.add_service(&ServiceConfig::tcp(addr("10.0.0.1:80")), rr())
            .unwrap();
        dir.add_service(&ServiceConfig::fwmark(7, IpProto::TCP, 0), rr())
            .unwrap();

        let svc = dir.find(IpProto::TCP, addr("10.0.0.1:80"), 7).unwrap();
        assert_eq!(svc.key(), ServiceKey::Fwmark(7));

        let svc = dir.find(IpProto::TCP, addr("10.0.0.1:80"), 0).unwrap();
        assert_eq!(svc.key(), ServiceKey::tcp(addr("10.0.0.1:80")));

        let svc = dir.find(IpProto::TCP, addr("10.0.0.1:443"), 0).unwrap();
        assert_eq!(svc.port(), 0);

        assert!(dir.find(IpProto::UDP, addr("10.0.0.1:80"), 0).is_none());
    }

    #[test]
    fn test_destination_lifecycle() {
        let dir = ServiceDirectory::new();
        let key = ServiceKey::tcp(addr("10.0.0.1:80"));
        dir.add_service(&ServiceConfig::new(key), rr()).unwrap();

        let dest_cfg = DestinationConfig::new(addr("10.0.0.11:8080"));
        dir.add_destination(&key, &dest_cfg).unwrap();
        assert!(matches!(
            dir.add_destination(&key, &dest_cfg),
            Err(DirectoryError::DestinationExists { .. })
        ));

        let dest = dir
            .update_destination(&key, &dest_cfg.clone().with_weight(0))
            .unwrap();
        assert_eq!(dest.weight(), 0);

        dir.remove_destination(&key, addr("10.0.0.11:8080")).unwrap();
        let err = dir
            .remove_destination(&key, addr("10.0.0.11:8080"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(dir.get(&key).unwrap().destinations().is_empty());
    }

    #[test]
    fn test_update_service_keeps_destinations() {
        let dir = ServiceDirectory::new();
        let config = ServiceConfig::udp(addr("10.0.0.1:53"));
        dir.add_service(&config, rr()).unwrap();
        dir.add_destination(&config.key, &DestinationConfig::new(addr("10.0.0.11:53")))
            .unwrap();

        let updated = dir
            .update_service(&config.clone().with_flags(ServiceFlags::ONE_PACKET), rr())
            .unwrap();
        assert!(updated.flags().contains(ServiceFlags::ONE_PACKET));
        assert_eq!(updated.destinations().len(), 1);
    }

    #[test]
    fn test_reader_snapshot_survives_update() {
        let dir = ServiceDirectory::new();
        let key = ServiceKey::tcp(addr("10.0.0.1:80"));
        dir.add_service(&ServiceConfig::new(key), rr()).unwrap();
        dir.add_destination(&key, &DestinationConfig::new(addr("10.0.0.11:80")))
            .unwrap();

        let svc = dir.get(&key).unwrap();
        let before = svc.destinations();
        dir.add_destination(&key, &DestinationConfig::new(addr("10.0.0.12:80")))
            .unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(svc.destinations().len(), 2);
    }
}
