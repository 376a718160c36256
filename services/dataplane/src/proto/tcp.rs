//! TCP state tracking.
//!
//! The balancer sees both legs of every flow, so it follows the handshake and
//! teardown from the flags it observes. Each packet picks one flag class by
//! priority (RST, then SYN, then FIN, then ACK) and looks up the next state in
//! a per-direction table. Packets with none of those flags leave the state
//! alone.

use std::time::Duration;

use flowgate_packet::{Headers, IpProto, Packet, PacketError, TcpFlags};

use super::{ProtoState, ProtocolHandler, Timeouts};
use crate::conn::{Direction, FlowKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    None,
    Established,
    SynSent,
    SynRecv,
    FinWait,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    SynAck,
}

impl TcpState {
    pub fn name(self) -> &'static str {
        match self {
            TcpState::None => "NONE",
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::SynAck => "SYN_ACK",
        }
    }

    /// Teardown states worth replicating as soon as they are entered.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            TcpState::FinWait | TcpState::CloseWait | TcpState::TimeWait
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

use TcpState::{
    Close as CL, CloseWait as CW, Established as ES, FinWait as FW, LastAck as LA, Listen as LI,
    None as NO, SynAck as SA, SynRecv as SR, SynSent as SS, TimeWait as TW,
};

/// Rows: SYN, FIN, ACK, RST. Columns follow `TcpState` declaration order.
type StateTable = [[TcpState; 11]; 4];

/// Client toward backend.
#[rustfmt::skip]
const FORWARD: StateTable = [
    //       NO  ES  SS  SR  FW  TW  CL  CW  LA  LI  SA
    /*syn*/ [SR, ES, ES, SR, SR, SR, SR, SR, SR, SR, SR],
    /*fin*/ [CL, CW, SS, TW, TW, TW, CL, CW, LA, LI, TW],
    /*ack*/ [CL, ES, SS, ES, FW, TW, CL, CW, CL, LI, ES],
    /*rst*/ [CL, CL, CL, SR, CL, CL, CL, CL, LA, LI, SR],
];

/// Backend toward client.
#[rustfmt::skip]
const REVERSE: StateTable = [
    //       NO  ES  SS  SR  FW  TW  CL  CW  LA  LI  SA
    /*syn*/ [SS, ES, SS, SR, SS, SS, SS, SS, SS, LI, SR],
    /*fin*/ [TW, FW, SS, TW, FW, TW, CL, TW, LA, LI, TW],
    /*ack*/ [ES, ES, SS, ES, FW, TW, CL, CW, LA, ES, ES],
    /*rst*/ [CL, CL, SS, CL, CL, TW, CL, CL, CL, CL, CL],
];

fn flag_row(flags: TcpFlags) -> Option<usize> {
    if flags.contains(TcpFlags::RST) {
        Some(3)
    } else if flags.contains(TcpFlags::SYN) {
        Some(0)
    } else if flags.contains(TcpFlags::FIN) {
        Some(1)
    } else if flags.contains(TcpFlags::ACK) {
        Some(2)
    } else {
        None
    }
}

/// Next TCP state for a segment with `flags` travelling on `direction`.
pub fn next_tcp_state(current: TcpState, direction: Direction, flags: TcpFlags) -> TcpState {
    let Some(row) = flag_row(flags) else {
        return current;
    };
    let table = match direction {
        Direction::Forward => &FORWARD,
        Direction::Reverse => &REVERSE,
    };
    table[row][current.index()]
}

#[derive(Debug)]
pub struct TcpHandler {
    timeouts: Timeouts,
}

impl TcpHandler {
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }

    fn timeout_secs(&self, state: TcpState) -> u64 {
        let t = &self.timeouts;
        match state {
            TcpState::None => t.tcp_none,
            TcpState::Established => t.tcp_established,
            TcpState::SynSent => t.tcp_syn_sent,
            TcpState::SynRecv => t.tcp_syn_recv,
            TcpState::FinWait => t.tcp_fin_wait,
            TcpState::TimeWait => t.tcp_time_wait,
            TcpState::Close => t.tcp_close,
            TcpState::CloseWait => t.tcp_close_wait,
            TcpState::LastAck => t.tcp_last_ack,
            TcpState::Listen => t.tcp_listen,
            TcpState::SynAck => t.tcp_syn_ack,
        }
    }
}

impl ProtocolHandler for TcpHandler {
    fn protocol(&self) -> IpProto {
        IpProto::TCP
    }

    fn name(&self) -> &'static str {
        "TCP"
    }

    fn initial_state(&self) -> ProtoState {
        ProtoState::Tcp(TcpState::None)
    }

    fn timeout(&self, state: ProtoState) -> Duration {
        let secs = match state {
            ProtoState::Tcp(s) => self.timeout_secs(s),
            ProtoState::Udp(_) => self.timeouts.tcp_none,
        };
        Duration::from_secs(secs)
    }

    /// A segment too short for a full TCP header is malformed, even when
    /// the ports are readable.
    fn extract_key(&self, pkt: &Packet<'_>, h: &Headers) -> Result<FlowKey, PacketError> {
        pkt.tcp_flags(h)?;
        let (src, dst) = pkt.endpoints(h)?;
        Ok(FlowKey::new(IpProto::TCP, src, dst))
    }

    fn next_state(
        &self,
        current: ProtoState,
        direction: Direction,
        pkt: &Packet<'_>,
        h: &Headers,
    ) -> ProtoState {
        let ProtoState::Tcp(state) = current else {
            return current;
        };
        match pkt.tcp_flags(h) {
            Ok(flags) => ProtoState::Tcp(next_tcp_state(state, direction, flags)),
            Err(_) => current,
        }
    }

    /// Only a bare SYN starts a connection; anything else without a
    /// connection is traffic the balancer does not own.
    fn opens_flow(&self, pkt: &Packet<'_>, h: &Headers) -> bool {
        match pkt.tcp_flags(h) {
            Ok(flags) => {
                flags.contains(TcpFlags::SYN)
                    && !flags.intersects(TcpFlags::ACK | TcpFlags::RST | TcpFlags::FIN)
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SYN: TcpFlags = TcpFlags::SYN;
    const ACK: TcpFlags = TcpFlags::ACK;
    const FIN_ACK: TcpFlags = TcpFlags::FIN.union(TcpFlags::ACK);
    const RST_ACK: TcpFlags = TcpFlags::RST.union(TcpFlags::ACK);
    const SYN_ACK: TcpFlags = TcpFlags::SYN.union(TcpFlags::ACK);
    const PSH: TcpFlags = TcpFlags::PSH;

    #[rstest]
    #[case::client_syn(NO, Direction::Forward, SYN, SR)]
    #[case::server_syn_ack(SR, Direction::Reverse, SYN_ACK, SR)]
    #[case::client_ack(SR, Direction::Forward, ACK, ES)]
    #[case::server_ack_completes(SR, Direction::Reverse, ACK, ES)]
    #[case::data_stays_established(ES, Direction::Forward, ACK, ES)]
    #[case::client_fin(ES, Direction::Forward, FIN_ACK, CW)]
    #[case::server_fin(ES, Direction::Reverse, FIN_ACK, FW)]
    #[case::fin_wait_client_fin(FW, Direction::Forward, FIN_ACK, TW)]
    #[case::close_wait_server_fin(CW, Direction::Reverse, FIN_ACK, TW)]
    #[case::rst_beats_ack(ES, Direction::Forward, RST_ACK, CL)]
    #[case::server_rst(ES, Direction::Reverse, RST_ACK, CL)]
    #[case::no_relevant_flag(ES, Direction::Forward, PSH, ES)]
    #[case::time_wait_rst_reverse(TW, Direction::Reverse, RST_ACK, TW)]
    fn test_transition_table(
        #[case] from: TcpState,
        #[case] direction: Direction,
        #[case] flags: TcpFlags,
        #[case] expected: TcpState,
    ) {
        assert_eq!(next_tcp_state(from, direction, flags), expected);
    }

    #[test]
    fn test_full_handshake_and_teardown() {
        let steps = [
            (Direction::Forward, SYN, SR),
            (Direction::Reverse, SYN_ACK, SR),
            (Direction::Forward, ACK, ES),
            (Direction::Forward, FIN_ACK, CW),
            (Direction::Reverse, ACK, CW),
            (Direction::Reverse, FIN_ACK, TW),
            (Direction::Forward, ACK, TW),
        ];
        let mut state = NO;
        for (direction, flags, expected) in steps {
            state = next_tcp_state(state, direction, flags);
            assert_eq!(state, expected, "after {:?} {:?}", direction, flags);
        }
    }

    #[test]
    fn test_timeouts_follow_state() {
        let handler = TcpHandler::new(Timeouts::default());
        assert_eq!(
            handler.timeout(ProtoState::Tcp(TcpState::Established)),
            Duration::from_secs(900)
        );
        assert_eq!(
            handler.timeout(ProtoState::Tcp(TcpState::Close)),
            Duration::from_secs(10)
        );
        assert_eq!(
            handler.timeout(ProtoState::Tcp(TcpState::SynRecv)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_closing_states() {
        assert!(FW.is_closing());
        assert!(CW.is_closing());
        assert!(TW.is_closing());
        assert!(!ES.is_closing());
        assert!(!LA.is_closing());
    }
}
