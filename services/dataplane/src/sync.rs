//! Connection replication hook.
//!
//! A standby balancer can only take over established flows if it learns
//! about them. The pipeline samples connections and hands snapshots to an
//! installed [`SyncSink`]; the transport is the sink's business.

use flowgate_packet::IpProto;
use serde::Deserialize;

use crate::conn::ConnSnapshot;
use crate::proto::{ProtoState, TcpState};

/// Receiver of connection snapshots.
pub trait SyncSink: Send + Sync {
    fn sync_conn(&self, snapshot: &ConnSnapshot);
}

/// Sampling rule: a connection is sent when its inbound packet count modulo
/// `period` equals `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncThreshold {
    pub start: u64,
    pub period: u64,
}

impl Default for SyncThreshold {
    fn default() -> Self {
        Self {
            start: 3,
            period: 50,
        }
    }
}

impl SyncThreshold {
    /// Whether a connection should be replicated after this packet.
    ///
    /// Established (or non-TCP) connections are sampled by packet count. A TCP
    /// connection that just moved into a closing state is always sent so the
    /// standby shortens its timeout too.
    pub fn should_sync(
        &self,
        protocol: IpProto,
        old_state: ProtoState,
        state: ProtoState,
        in_pkts: u64,
    ) -> bool {
        let is_tcp = protocol == IpProto::TCP;
        let sampled = (!is_tcp || state == ProtoState::Tcp(TcpState::Established))
            && self.period > 0
            && in_pkts % self.period == self.start;
        let closing = is_tcp
            && old_state != state
            && matches!(state, ProtoState::Tcp(s) if s.is_closing());
        sampled || closing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::UdpState;

    const ES: ProtoState = ProtoState::Tcp(TcpState::Established);
    const FW: ProtoState = ProtoState::Tcp(TcpState::FinWait);
    const SR: ProtoState = ProtoState::Tcp(TcpState::SynRecv);
    const UDP: ProtoState = ProtoState::Udp(UdpState::Normal);

    #[test]
    fn test_sampling_by_packet_count() {
        let t = SyncThreshold::default();
        assert!(t.should_sync(IpProto::TCP, ES, ES, 3));
        assert!(t.should_sync(IpProto::TCP, ES, ES, 53));
        assert!(!t.should_sync(IpProto::TCP, ES, ES, 4));
        assert!(!t.should_sync(IpProto::TCP, SR, SR, 3), "not yet established");
        assert!(t.should_sync(IpProto::UDP, UDP, UDP, 103));
    }

    #[test]
    fn test_closing_transition_always_syncs() {
        let t = SyncThreshold::default();
        assert!(t.should_sync(IpProto::TCP, ES, FW, 10));
        assert!(!t.should_sync(IpProto::TCP, FW, FW, 10), "no change");
    }

    #[test]
    fn test_zero_period_disables_sampling() {
        let t = SyncThreshold { start: 0, period: 0 };
        assert!(!t.should_sync(IpProto::UDP, UDP, UDP, 0));
        assert!(t.should_sync(IpProto::TCP, ES, FW, 1));
    }
}
