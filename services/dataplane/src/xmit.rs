//! Header rewrite and hand-off to the I/O layer.
//!
//! Rewrites per forwarding method:
//!
//! | method   | leg     | source        | destination   |
//! |----------|---------|---------------|---------------|
//! | full-NAT | forward | local         | real          |
//! | full-NAT | reverse | virtual       | client        |
//! | NAT      | forward | (unchanged)   | real          |
//! | NAT      | reverse | virtual       | (unchanged)   |

use std::fmt;
use std::net::SocketAddrV4;

use flowgate_packet::{Headers, Packet};

use crate::conn::{Connection, Direction};
use crate::context::Context;
use crate::error::TransmitError;

/// Where a rewritten packet is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    Backend(SocketAddrV4),
    Client(SocketAddrV4),
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextHop::Backend(addr) => write!(f, "backend {}", addr),
            NextHop::Client(addr) => write!(f, "client {}", addr),
        }
    }
}

/// Network I/O seam. Called with the rewritten packet before the verdict is
/// returned.
pub trait Transmitter: Send + Sync {
    fn transmit(&self, pkt: &Packet<'_>, hop: NextHop) -> Result<(), TransmitError>;
}

/// Leaves delivery to the network stack, which routes the rewritten packet
/// once it is accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackForward;

impl Transmitter for StackForward {
    fn transmit(&self, _pkt: &Packet<'_>, _hop: NextHop) -> Result<(), TransmitError> {
        Ok(())
    }
}

/// Endpoint rewrite for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rewrite {
    pub src: Option<SocketAddrV4>,
    pub dst: Option<SocketAddrV4>,
    pub hop: NextHop,
}

impl Rewrite {
    pub fn for_conn(conn: &Connection, direction: Direction) -> Self {
        match (conn.is_fullnat(), direction) {
            (true, Direction::Forward) => Self {
                src: Some(conn.local()),
                dst: Some(conn.real()),
                hop: NextHop::Backend(conn.real()),
            },
            (true, Direction::Reverse) => Self {
                src: Some(conn.vaddr()),
                dst: Some(conn.client()),
                hop: NextHop::Client(conn.client()),
            },
            (false, Direction::Forward) => Self {
                src: None,
                dst: Some(conn.real()),
                hop: NextHop::Backend(conn.real()),
            },
            (false, Direction::Reverse) => Self {
                src: Some(conn.vaddr()),
                dst: None,
                hop: NextHop::Client(conn.client()),
            },
        }
    }
}

/// Rewrite the packet for `direction` and pass it to the context's
/// transmitter.
pub fn transmit(
    ctx: &Context,
    pkt: &mut Packet<'_>,
    h: &mut Headers,
    conn: &Connection,
    direction: Direction,
) -> Result<(), TransmitError> {
    let rewrite = Rewrite::for_conn(conn, direction);
    pkt.rewrite(h, rewrite.src, rewrite.dst)?;
    ctx.transmitter().transmit(pkt, rewrite.hop)
}
