//! Round robin.

use std::sync::Arc;

use tracing::trace;

use super::{PacketInfo, Scheduler};
use crate::directory::{Destination, Service};

/// Cycles through a service's destinations, skipping those with weight 0 or
/// marked unavailable. Rotation state lives on the service, so one instance
/// serves every service that names `rr`.
#[derive(Debug, Default)]
pub struct RoundRobin;

impl RoundRobin {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for RoundRobin {
    fn name(&self) -> &str {
        "rr"
    }

    fn schedule(&self, service: &Service, packet: &PacketInfo) -> Option<Arc<Destination>> {
        let dests = service.destinations();
        let n = dests.len();
        if n == 0 {
            return None;
        }

        let mut cursor = service.sched_cursor().lock();
        let start = match *cursor {
            Some(last) => (last + 1) % n,
            None => 0,
        };

        for step in 0..n {
            let idx = (start + step) % n;
            let dest = &dests[idx];
            if dest.weight() > 0 && dest.is_available() {
                *cursor = Some(idx);
                trace!(
                    flow = %packet.key,
                    dest = %dest.socket_addr(),
                    "Round robin picked destination"
                );
                return Some(Arc::clone(dest));
            }
        }
        None
    }
}
