//! Connection tracking.
//!
//! A [`Connection`] is the per-flow record binding a client flow to a
//! destination. The [`ConnTable`] indexes every connection under both its
//! forward tuple (client -> virtual) and reverse tuple (real -> local), so a
//! single lookup resolves packets in either direction.

mod connection;
pub mod sweep;
mod table;

pub use connection::{ConnFlags, ConnRef, ConnSnapshot, Connection, FlowState};
pub use table::{ConnTable, ScheduleError, SweepStats};

use std::fmt;
use std::net::SocketAddrV4;

use flowgate_packet::IpProto;

/// Transport 5-tuple identifying one direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: IpProto,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl FlowKey {
    pub fn new(protocol: IpProto, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { protocol, src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Which leg of a connection a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client toward backend.
    Forward,
    /// Backend toward client.
    Reverse,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        self == Direction::Forward
    }
}
