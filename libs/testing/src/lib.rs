//! Packet builders for flowgate tests.
//!
//! Produces well-formed IPv4 TCP/UDP/ICMP buffers with valid checksums so
//! tests can drive the data plane without a network stack.

use std::net::{Ipv4Addr, SocketAddrV4};

use flowgate_packet::{classify, AddressFamily, IpProto, Packet, TcpFlags};

/// Builder for a single IPv4 packet.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    protocol: IpProto,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    flags: TcpFlags,
    payload: Vec<u8>,
    ttl: u8,
}

impl PacketBuilder {
    pub fn tcp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(IpProto::TCP, src, dst)
    }

    pub fn udp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(IpProto::UDP, src, dst)
    }

    /// ICMP echo request; ports are ignored.
    pub fn icmp_echo(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self::new(
            IpProto::ICMP,
            SocketAddrV4::new(src, 0),
            SocketAddrV4::new(dst, 0),
        )
    }

    fn new(protocol: IpProto, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            protocol,
            src,
            dst,
            flags: TcpFlags::ACK,
            payload: Vec::new(),
            ttl: 64,
        }
    }

    pub fn flags(mut self, flags: TcpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let l4 = match self.protocol {
            IpProto::TCP => self.tcp_segment(),
            IpProto::UDP => self.udp_datagram(),
            _ => self.icmp_message(),
        };

        let total = (20 + l4.len()) as u16;
        let mut buf = Vec::with_capacity(total as usize);
        buf.extend_from_slice(&[0x45, 0x00]);
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, self.ttl, self.protocol.0, 0, 0]);
        buf.extend_from_slice(&self.src.ip().octets());
        buf.extend_from_slice(&self.dst.ip().octets());
        buf.extend_from_slice(&l4);

        let mut pkt = Packet::new(&mut buf, AddressFamily::Inet);
        // The builder only ever produces consistent lengths.
        if let Ok(h) = classify(&pkt) {
            let _ = pkt.fill_checksums(&h);
        }
        buf
    }

    fn tcp_segment(&self) -> Vec<u8> {
        let mut seg = Vec::with_capacity(20 + self.payload.len());
        seg.extend_from_slice(&self.src.port().to_be_bytes());
        seg.extend_from_slice(&self.dst.port().to_be_bytes());
        seg.extend_from_slice(&1u32.to_be_bytes()); // seq
        seg.extend_from_slice(&0u32.to_be_bytes()); // ack
        seg.extend_from_slice(&[0x50, self.flags.bits(), 0xff, 0xff, 0, 0, 0, 0]);
        seg.extend_from_slice(&self.payload);
        seg
    }

    fn udp_datagram(&self) -> Vec<u8> {
        let len = (8 + self.payload.len()) as u16;
        let mut dgram = Vec::with_capacity(len as usize);
        dgram.extend_from_slice(&self.src.port().to_be_bytes());
        dgram.extend_from_slice(&self.dst.port().to_be_bytes());
        dgram.extend_from_slice(&len.to_be_bytes());
        dgram.extend_from_slice(&[0, 0]);
        dgram.extend_from_slice(&self.payload);
        dgram
    }

    fn icmp_message(&self) -> Vec<u8> {
        let mut msg = vec![8, 0, 0, 0, 0, 1, 0, 1];
        msg.extend_from_slice(&self.payload);
        let csum = flowgate_packet::checksum(&msg);
        msg[2..4].copy_from_slice(&csum.to_be_bytes());
        msg
    }
}

/// TCP SYN from `src` to `dst`.
pub fn tcp_syn(src: &str, dst: &str) -> Vec<u8> {
    PacketBuilder::tcp(addr(src), addr(dst))
        .flags(TcpFlags::SYN)
        .build()
}

/// TCP segment with arbitrary flags.
pub fn tcp(src: &str, dst: &str, flags: TcpFlags) -> Vec<u8> {
    PacketBuilder::tcp(addr(src), addr(dst)).flags(flags).build()
}

/// UDP datagram carrying `payload`.
pub fn udp(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
    PacketBuilder::udp(addr(src), addr(dst))
        .payload(payload)
        .build()
}

/// Parse a socket address literal, panicking on bad test input.
pub fn addr(s: &str) -> SocketAddrV4 {
    s.parse()
        .unwrap_or_else(|_| panic!("bad socket address in test: {s}"))
}

/// Source and destination endpoints of a built TCP/UDP packet.
pub fn endpoints(buf: &mut [u8]) -> (SocketAddrV4, SocketAddrV4) {
    let pkt = Packet::new(buf, AddressFamily::Inet);
    let h = classify(&pkt).expect("test packet should classify");
    pkt.endpoints(&h).expect("test packet should carry ports")
}

/// True if the IP and transport checksums of `buf` verify.
pub fn checksums_ok(buf: &mut [u8]) -> bool {
    let pkt = Packet::new(buf, AddressFamily::Inet);
    match classify(&pkt) {
        Ok(h) => pkt.checksums_valid(&h),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_packets_verify() {
        let mut syn = tcp_syn("192.168.1.5:4000", "10.0.0.1:80");
        assert!(checksums_ok(&mut syn));
        assert_eq!(
            endpoints(&mut syn),
            (addr("192.168.1.5:4000"), addr("10.0.0.1:80"))
        );

        let mut dgram = udp("192.168.1.5:5353", "10.0.0.1:53", b"query");
        assert!(checksums_ok(&mut dgram));

        let mut echo =
            PacketBuilder::icmp_echo("192.168.1.5".parse().unwrap(), "10.0.0.1".parse().unwrap())
                .build();
        assert!(checksums_ok(&mut echo));
    }
}
