//! Protocol handlers.
//!
//! Each transport protocol the balancer understands registers a
//! [`ProtocolHandler`]: how to extract the flow key, whether a packet may open
//! a new flow, and how the per-flow state machine advances. Packets whose
//! protocol has no handler are passed through untouched.

pub mod icmp;
mod tcp;
mod udp;

pub use icmp::{IcmpRelation, PassThrough};
pub use tcp::{TcpHandler, TcpState};
pub use udp::{UdpHandler, UdpState};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use flowgate_packet::{Headers, IpProto, Packet, PacketError};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, trace};

use crate::conn::{ConnRef, Connection, Direction, FlowKey, ScheduleError};
use crate::context::Context;
use crate::directory::Service;
use crate::error::{RegistryError, TransmitError};
use crate::sched::PacketInfo;
use crate::xmit;

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtoState {
    Tcp(TcpState),
    Udp(UdpState),
}

impl ProtoState {
    pub fn name(self) -> &'static str {
        match self {
            ProtoState::Tcp(s) => s.name(),
            ProtoState::Udp(s) => s.name(),
        }
    }

    /// Connections in this state count as active on their destination.
    pub fn is_established(self) -> bool {
        self == ProtoState::Tcp(TcpState::Established)
    }
}

impl fmt::Display for ProtoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Longest idle timeout a service file may configure, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Per-state idle timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub tcp_none: u64,
    pub tcp_established: u64,
    pub tcp_syn_sent: u64,
    pub tcp_syn_recv: u64,
    pub tcp_fin_wait: u64,
    pub tcp_time_wait: u64,
    pub tcp_close: u64,
    pub tcp_close_wait: u64,
    pub tcp_last_ack: u64,
    pub tcp_listen: u64,
    pub tcp_syn_ack: u64,
    pub udp: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tcp_none: 2,
            tcp_established: 15 * 60,
            tcp_syn_sent: 2 * 60,
            tcp_syn_recv: 60,
            tcp_fin_wait: 2 * 60,
            tcp_time_wait: 2 * 60,
            tcp_close: 10,
            tcp_close_wait: 60,
            tcp_last_ack: 30,
            tcp_listen: 2 * 60,
            tcp_syn_ack: 2 * 60,
            udp: 5 * 60,
        }
    }
}

impl Timeouts {
    /// Every timeout with its configuration name.
    pub fn entries(&self) -> [(&'static str, u64); 12] {
        [
            ("tcp_none", self.tcp_none),
            ("tcp_established", self.tcp_established),
            ("tcp_syn_sent", self.tcp_syn_sent),
            ("tcp_syn_recv", self.tcp_syn_recv),
            ("tcp_fin_wait", self.tcp_fin_wait),
            ("tcp_time_wait", self.tcp_time_wait),
            ("tcp_close", self.tcp_close),
            ("tcp_close_wait", self.tcp_close_wait),
            ("tcp_last_ack", self.tcp_last_ack),
            ("tcp_listen", self.tcp_listen),
            ("tcp_syn_ack", self.tcp_syn_ack),
            ("udp", self.udp),
        ]
    }
}

/// Outcome of one state machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ProtoState,
    pub to: ProtoState,
    pub timeout: Duration,
}

/// Per-protocol behavior of the pipeline.
pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> IpProto;

    fn name(&self) -> &'static str;

    /// State a new connection starts in, before its first packet is applied.
    fn initial_state(&self) -> ProtoState;

    fn timeout(&self, state: ProtoState) -> Duration;

    /// Compute the next state for a packet seen on `direction`.
    fn next_state(
        &self,
        current: ProtoState,
        direction: Direction,
        pkt: &Packet<'_>,
        h: &Headers,
    ) -> ProtoState;

    fn state_name(&self, state: ProtoState) -> &'static str {
        state.name()
    }

    fn extract_key(&self, pkt: &Packet<'_>, h: &Headers) -> Result<FlowKey, PacketError> {
        let (src, dst) = pkt.endpoints(h)?;
        Ok(FlowKey::new(h.protocol(), src, dst))
    }

    fn lookup_existing(&self, ctx: &Context, key: &FlowKey) -> Option<(ConnRef, Direction)> {
        ctx.conns().lookup(key)
    }

    /// Whether a packet that matched no connection may create one.
    fn opens_flow(&self, _pkt: &Packet<'_>, _h: &Headers) -> bool {
        true
    }

    fn schedule_new(
        &self,
        ctx: &Context,
        service: &Arc<Service>,
        packet: &PacketInfo,
    ) -> Result<ConnRef, ScheduleError> {
        let initial = self.initial_state();
        ctx.conns().create_on_miss(
            service,
            packet,
            initial,
            self.timeout(initial),
            ctx.clock().now_ms(),
        )
    }

    /// Advance the connection's state machine and restart its idle timer.
    /// Entering or leaving an established state moves the connection
    /// between its destination's active and inactive counters.
    fn transition(
        &self,
        conn: &Connection,
        direction: Direction,
        pkt: &Packet<'_>,
        h: &Headers,
        now_ms: u64,
    ) -> Transition {
        let mut flow = conn.flow().lock();
        let from = flow.state;
        let to = self.next_state(from, direction, pkt, h);
        let timeout = self.timeout(to);

        flow.state = to;
        flow.timeout = timeout;
        conn.touch(now_ms, timeout);

        let active = to.is_established();
        if active != flow.dest_active {
            if let Some(dest) = conn.destination() {
                if active {
                    dest.activate_conn();
                } else {
                    dest.deactivate_conn();
                }
            }
            flow.dest_active = active;
        }

        if from != to {
            trace!(
                conn.client = %conn.client(),
                from = self.state_name(from),
                to = self.state_name(to),
                direction = ?direction,
                "State transition"
            );
        }
        Transition { from, to, timeout }
    }

    fn transmit(
        &self,
        ctx: &Context,
        pkt: &mut Packet<'_>,
        h: &mut Headers,
        conn: &Connection,
        direction: Direction,
    ) -> Result<(), TransmitError> {
        xmit::transmit(ctx, pkt, h, conn, direction)
    }
}

impl fmt::Debug for dyn ProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolHandler({})", self.name())
    }
}

type HandlerMap = HashMap<IpProto, Arc<dyn ProtocolHandler>>;

/// Protocol number -> handler. Reads are lock-free snapshots.
pub struct ProtocolRegistry {
    handlers: ArcSwap<HandlerMap>,
    writer: Mutex<()>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn register(&self, handler: Arc<dyn ProtocolHandler>) -> Result<(), RegistryError> {
        let _guard = self.writer.lock();
        let current = self.handlers.load();
        let protocol = handler.protocol();
        if current.contains_key(&protocol) {
            return Err(RegistryError::AlreadyRegistered(handler.name().to_string()));
        }

        let mut next = current.as_ref().clone();
        info!(protocol = handler.name(), "Protocol handler registered");
        next.insert(protocol, handler);
        self.handlers.store(Arc::new(next));
        Ok(())
    }

    pub fn unregister(&self, protocol: IpProto) -> Result<Arc<dyn ProtocolHandler>, RegistryError> {
        let _guard = self.writer.lock();
        let mut next = self.handlers.load().as_ref().clone();
        let removed = next
            .remove(&protocol)
            .ok_or_else(|| RegistryError::NotRegistered(protocol.to_string()))?;
        self.handlers.store(Arc::new(next));
        info!(protocol = removed.name(), "Protocol handler unregistered");
        Ok(removed)
    }

    pub fn get(&self, protocol: IpProto) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.load().get(&protocol).cloned()
    }

    pub fn protocols(&self) -> Vec<IpProto> {
        let mut protocols: Vec<IpProto> = self.handlers.load().keys().copied().collect();
        protocols.sort();
        protocols
    }

    pub(crate) fn clear(&self) {
        let _guard = self.writer.lock();
        self.handlers.store(Arc::new(HashMap::new()));
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
