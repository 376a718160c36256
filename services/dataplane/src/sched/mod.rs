//! Destination schedulers.
//!
//! A scheduler picks the destination for a flow's first packet. Schedulers
//! are registered by name; services resolve theirs when they are configured.

mod rr;

pub use rr::RoundRobin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::conn::FlowKey;
use crate::directory::{Destination, Service};
use crate::error::RegistryError;

/// What a scheduler may look at when choosing a destination.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    pub key: FlowKey,
    pub mark: u32,
    pub len: usize,
}

/// Destination selection algorithm.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Pick a destination for a new flow, or `None` when no destination is
    /// eligible.
    fn schedule(&self, service: &Service, packet: &PacketInfo) -> Option<Arc<Destination>>;
}

impl fmt::Debug for dyn Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scheduler({})", self.name())
    }
}

/// Scheduler name -> implementation.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: RwLock<HashMap<String, Arc<dyn Scheduler>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scheduler: Arc<dyn Scheduler>) -> Result<(), RegistryError> {
        let name = scheduler.name().to_string();
        let mut schedulers = self.schedulers.write();
        if schedulers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        info!(scheduler = %name, "Scheduler registered");
        schedulers.insert(name, scheduler);
        Ok(())
    }

    /// Services already holding the scheduler keep using it.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Scheduler>, RegistryError> {
        let removed = self
            .schedulers
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        info!(scheduler = %name, "Scheduler unregistered");
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schedulers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn clear(&self) {
        self.schedulers.write().clear();
    }
}
