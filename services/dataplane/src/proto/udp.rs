//! UDP has no handshake: a flow is a single state kept alive by traffic.

use std::time::Duration;

use flowgate_packet::{Headers, IpProto, Packet};

use super::{ProtoState, ProtocolHandler, Timeouts};
use crate::conn::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UdpState {
    Normal,
}

impl UdpState {
    pub fn name(self) -> &'static str {
        match self {
            UdpState::Normal => "UDP",
        }
    }
}

#[derive(Debug)]
pub struct UdpHandler {
    timeout: Duration,
}

impl UdpHandler {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            timeout: Duration::from_secs(timeouts.udp),
        }
    }
}

impl ProtocolHandler for UdpHandler {
    fn protocol(&self) -> IpProto {
        IpProto::UDP
    }

    fn name(&self) -> &'static str {
        "UDP"
    }

    fn initial_state(&self) -> ProtoState {
        ProtoState::Udp(UdpState::Normal)
    }

    fn timeout(&self, _state: ProtoState) -> Duration {
        self.timeout
    }

    fn next_state(
        &self,
        current: ProtoState,
        _direction: Direction,
        _pkt: &Packet<'_>,
        _h: &Headers,
    ) -> ProtoState {
        current
    }
}
