//! Per-packet processing.
//!
//! Every packet ends in exactly one [`Verdict`]. Failures are counted and
//! logged, then turned into `Drop`; nothing on this path panics or blocks on
//! anything but the bucket and per-connection locks.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use flowgate_packet::{classify, AddressFamily, Headers, IpProto, Packet, PacketError};
use tracing::{debug, trace, warn};

use crate::conn::{ConnFlags, ConnRef, Direction, FlowKey, ScheduleError};
use crate::context::Context;
use crate::directory::Service;
use crate::proto::ProtocolHandler;
use crate::sched::PacketInfo;
use crate::stats::Stats;

/// What the network stack should do with the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue normal processing (deliver the possibly rewritten packet).
    Accept,
    /// Discard.
    Drop,
}

/// Why a packet was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(PacketError),
    PortMismatch { service: u16, packet: u16 },
    NoDestination,
    AllocationFailure(ScheduleError),
    DestinationUnavailable,
    Transmit(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed(e) => write!(f, "malformed packet: {}", e),
            DropReason::PortMismatch { service, packet } => {
                write!(f, "port {} does not match service port {}", packet, service)
            }
            DropReason::NoDestination => write!(f, "no eligible destination"),
            DropReason::AllocationFailure(e) => write!(f, "allocation failure: {}", e),
            DropReason::DestinationUnavailable => write!(f, "destination unavailable"),
            DropReason::Transmit(e) => write!(f, "transmit failed: {}", e),
        }
    }
}

/// One worker's view of the data plane.
#[derive(Debug, Clone)]
pub struct Pipeline {
    ctx: Arc<Context>,
}

impl Pipeline {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Process one packet in place.
    pub fn process(&self, pkt: &mut Packet<'_>) -> Verdict {
        match self.run(pkt) {
            Ok(verdict) => verdict,
            Err(reason) => {
                self.record_drop(&reason);
                Verdict::Drop
            }
        }
    }

    /// Process a worker's batch, returning verdicts in order.
    pub fn process_batch(&self, pkts: &mut [Packet<'_>]) -> Vec<Verdict> {
        pkts.iter_mut().map(|pkt| self.process(pkt)).collect()
    }

    fn run(&self, pkt: &mut Packet<'_>) -> Result<Verdict, DropReason> {
        let ctx = self.ctx.as_ref();

        if pkt.family() != AddressFamily::Inet {
            return Ok(self.pass(ctx));
        }

        let mut h = match classify(pkt) {
            Ok(h) => h,
            Err(e) if e.is_malformed() => return Err(DropReason::Malformed(e)),
            Err(_) => return Ok(self.pass(ctx)),
        };

        if h.protocol() == IpProto::ICMP {
            if let Some(verdict) = ctx.icmp().related(ctx, pkt, &h) {
                return Ok(verdict);
            }
        }

        let Some(handler) = ctx.protocols().get(h.protocol()) else {
            return Ok(self.pass(ctx));
        };

        let key = match handler.extract_key(pkt, &h) {
            Ok(key) => key,
            Err(e) if e.is_malformed() => return Err(DropReason::Malformed(e)),
            Err(_) => return Ok(self.pass(ctx)),
        };

        let conn = match handler.lookup_existing(ctx, &key) {
            Some((conn, Direction::Reverse)) => {
                return self.handle_response(handler.as_ref(), pkt, &mut h, conn);
            }
            Some((conn, Direction::Forward)) => conn,
            None => match self.schedule(handler.as_ref(), pkt, &h, key)? {
                Some(conn) => conn,
                None => return Ok(self.pass(ctx)),
            },
        };

        trace!(flow = %key, real = %conn.real(), "Incoming packet");

        // A connection whose backend went away stops here without touching
        // its idle timer.
        let available = conn
            .destination()
            .map(|dest| dest.is_available())
            .unwrap_or(false);
        if !available {
            if ctx.tunables().expire_nodest_conn {
                conn.force_expire();
            }
            return Err(DropReason::DestinationUnavailable);
        }

        let len = h.total_len();
        let in_pkts = conn.account_in(len);
        conn.service_stats().record_in(len);
        if let Some(dest) = conn.destination() {
            dest.stats().record_in(len);
        }
        ctx.stats().traffic.record_in(len);

        let now = ctx.clock().now_ms();
        handler.transition(&conn, Direction::Forward, pkt, &h, now);
        let sent = handler.transmit(ctx, pkt, &mut h, &conn, Direction::Forward);

        self.maybe_sync(&conn, in_pkts);
        if conn.flags().contains(ConnFlags::ONE_PACKET) {
            conn.force_expire();
        }

        match sent {
            Ok(()) => Ok(Verdict::Accept),
            Err(e) => Err(DropReason::Transmit(e.to_string())),
        }
    }

    /// Create a connection for a packet that missed the table. `Ok(None)`
    /// means the packet is not ours to balance.
    fn schedule(
        &self,
        handler: &dyn ProtocolHandler,
        pkt: &Packet<'_>,
        h: &Headers,
        key: FlowKey,
    ) -> Result<Option<ConnRef>, DropReason> {
        let ctx = self.ctx.as_ref();
        if !handler.opens_flow(pkt, h) {
            trace!(flow = %key, "No connection and not a flow opener");
            return Ok(None);
        }
        let Some(service) = ctx.services().find(key.protocol, key.dst, pkt.mark()) else {
            return Ok(None);
        };

        let info = PacketInfo {
            key,
            mark: pkt.mark(),
            len: h.total_len(),
        };
        match handler.schedule_new(ctx, &service, &info) {
            Ok(conn) => {
                Stats::bump(&ctx.stats().traffic.conns);
                Ok(Some(conn))
            }
            Err(e) if e.is_allocation_failure() => {
                warn!(
                    flow = %key,
                    service = %service.key(),
                    error = %e,
                    "Connection allocation failed"
                );
                Err(DropReason::AllocationFailure(e))
            }
            Err(e) => self.leave(&service, key, e).map(|()| None),
        }
    }

    /// Scheduling failed. Packets to other ports of a passthrough service's
    /// address continue through the stack; everything else is dropped.
    fn leave(&self, svc: &Service, key: FlowKey, error: ScheduleError) -> Result<(), DropReason> {
        let ctx = self.ctx.as_ref();
        if ctx.tunables().is_passthrough_port(svc.port()) && key.dst.port() != svc.port() {
            trace!(flow = %key, service = %svc.key(), "Passthrough port, accepting");
            return Ok(());
        }

        match error {
            ScheduleError::PortMismatch { service, packet } => {
                Err(DropReason::PortMismatch { service, packet })
            }
            _ => Err(DropReason::NoDestination),
        }
    }

    /// Reply from a backend: translate back toward the client.
    fn handle_response(
        &self,
        handler: &dyn ProtocolHandler,
        pkt: &mut Packet<'_>,
        h: &mut Headers,
        conn: ConnRef,
    ) -> Result<Verdict, DropReason> {
        let ctx = self.ctx.as_ref();
        trace!(
            conn.client = %conn.client(),
            real = %conn.real(),
            "Response packet"
        );

        let len = h.total_len();
        conn.account_out(len);
        conn.service_stats().record_out(len);
        if let Some(dest) = conn.destination() {
            dest.stats().record_out(len);
        }
        ctx.stats().traffic.record_out(len);

        handler.transition(&conn, Direction::Reverse, pkt, h, ctx.clock().now_ms());
        handler
            .transmit(ctx, pkt, h, &conn, Direction::Reverse)
            .map_err(|e| DropReason::Transmit(e.to_string()))?;
        Ok(Verdict::Accept)
    }

    /// Offer the connection to the replication sink, then remember the
    /// current state for the next packet's comparison.
    fn maybe_sync(&self, conn: &ConnRef, in_pkts: u64) {
        let ctx = self.ctx.as_ref();
        let send = {
            let mut flow = conn.flow().lock();
            let send = ctx.sync_sink().is_some()
                && ctx.tunables().sync_threshold.should_sync(
                    conn.protocol(),
                    flow.old_state,
                    flow.state,
                    in_pkts,
                );
            flow.old_state = flow.state;
            send
        };

        if let (true, Some(sink)) = (send, ctx.sync_sink()) {
            sink.sync_conn(&conn.snapshot());
            Stats::bump(&ctx.stats().sync_sent);
        }
    }

    fn pass(&self, ctx: &Context) -> Verdict {
        Stats::bump(&ctx.stats().passthrough);
        Verdict::Accept
    }

    fn record_drop(&self, reason: &DropReason) {
        let stats = self.ctx.stats();
        let counter: &AtomicU64 = match reason {
            DropReason::Malformed(_) => &stats.malformed,
            DropReason::PortMismatch { .. } | DropReason::NoDestination => &stats.sched_unreach,
            DropReason::AllocationFailure(_) => &stats.alloc_failures,
            DropReason::DestinationUnavailable => &stats.dest_unavailable,
            DropReason::Transmit(_) => &stats.xmit_errors,
        };
        Stats::bump(counter);
        debug!(reason = %reason, "Packet dropped");
    }
}
