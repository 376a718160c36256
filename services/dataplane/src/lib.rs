//! flowgate data plane.
//!
//! Connection tracking, scheduling and NAT for an L4 load balancer. The
//! network stack hands packets to a [`Pipeline`], which returns a
//! [`Verdict`] after rewriting load-balanced traffic in place.

pub mod clock;
pub mod config;
pub mod conn;
pub mod context;
pub mod directory;
pub mod error;
pub mod pipeline;
pub mod proto;
pub mod sched;
pub mod stats;
pub mod sync;
pub mod xmit;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ServiceFile, ServiceEntry, Tunables};
pub use conn::{ConnRef, ConnSnapshot, ConnTable, Connection, Direction, FlowKey, SweepStats};
pub use context::{Context, ContextBuilder};
pub use directory::{
    Destination, DestinationConfig, ForwardMethod, Service, ServiceConfig, ServiceDirectory,
    ServiceFlags, ServiceKey,
};
pub use error::{DirectoryError, InitError, RegistryError, TransmitError};
pub use pipeline::{DropReason, Pipeline, Verdict};
pub use proto::{IcmpRelation, ProtoState, ProtocolHandler, TcpState, UdpState};
pub use sched::{PacketInfo, RoundRobin, Scheduler};
pub use stats::{Stats, StatsSnapshot};
pub use sync::{SyncSink, SyncThreshold};
pub use xmit::{NextHop, StackForward, Transmitter};
