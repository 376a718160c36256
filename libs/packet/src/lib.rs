//! Packet header access for the data plane.
//!
//! This library provides helpers for:
//! - Classifying raw IPv4 buffers (length and header sanity checks)
//! - Extracting flow tuples and TCP control flags
//! - Internet checksum computation and verification
//! - In-place address/port rewrite with checksum recomputation
//!
//! Buffers start at the IP header. Link-layer framing is stripped by the
//! network stack before a packet reaches the data plane.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use thiserror::Error;

/// Packet errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer is shorter than the minimal header.
    #[error("packet too short: {len} bytes (need at least {min})")]
    TooShort { len: usize, min: usize },

    /// Version nibble is not 4.
    #[error("unsupported IP version {0}")]
    BadVersion(u8),

    /// Packet was tagged with a family this crate does not parse.
    #[error("unsupported address family: {0}")]
    UnsupportedFamily(AddressFamily),

    /// IHL field encodes fewer than 20 bytes.
    #[error("invalid IP header length {0}")]
    BadHeaderLength(usize),

    /// Declared total length is larger than the bytes we actually hold.
    #[error("declared total length {declared} exceeds buffer length {actual}")]
    TotalLengthExceedsBuffer { declared: usize, actual: usize },

    /// Header length is larger than the declared total length.
    #[error("header length {header} exceeds total length {total}")]
    HeaderExceedsTotal { header: usize, total: usize },

    /// Transport header is cut short.
    #[error("truncated {protocol} header: {len} bytes")]
    TruncatedTransport { protocol: IpProto, len: usize },

    /// Protocol carries no ports.
    #[error("protocol {0} has no ports")]
    NoPorts(IpProto),

    /// Protocol name could not be parsed.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
}

impl PacketError {
    /// Returns true if the error describes an inconsistent packet (as opposed
    /// to a packet this crate simply does not handle).
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            PacketError::UnsupportedFamily(_)
                | PacketError::NoPorts(_)
                | PacketError::UnknownProtocol(_)
        )
    }
}

// ============================================================================
// Protocol numbers and families
// ============================================================================

/// Address family tag supplied by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    Inet,
    /// IPv6.
    Inet6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "inet"),
            AddressFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// IP protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpProto(pub u8);

impl IpProto {
    pub const ICMP: IpProto = IpProto(1);
    pub const TCP: IpProto = IpProto(6);
    pub const UDP: IpProto = IpProto(17);

    /// Returns true for protocols whose first four L4 bytes are ports.
    pub fn has_ports(self) -> bool {
        self == IpProto::TCP || self == IpProto::UDP
    }

    /// Minimum transport header length, if we know it.
    fn min_header_len(self) -> Option<usize> {
        match self {
            IpProto::TCP => Some(TCP_MIN_HEADER_LEN),
            IpProto::UDP => Some(UDP_HEADER_LEN),
            _ => None,
        }
    }

    /// Offset of the checksum inside the transport header.
    fn checksum_offset(self) -> Option<usize> {
        match self {
            IpProto::TCP => Some(16),
            IpProto::UDP => Some(6),
            _ => None,
        }
    }
}

impl fmt::Display for IpProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IpProto::ICMP => write!(f, "ICMP"),
            IpProto::TCP => write!(f, "TCP"),
            IpProto::UDP => write!(f, "UDP"),
            IpProto(n) => write!(f, "IP_{}", n),
        }
    }
}

impl FromStr for IpProto {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(IpProto::TCP),
            "udp" => Ok(IpProto::UDP),
            "icmp" => Ok(IpProto::ICMP),
            other => other
                .parse::<u8>()
                .map(IpProto)
                .map_err(|_| PacketError::UnknownProtocol(s.to_string())),
        }
    }
}

bitflags::bitflags! {
    /// TCP control flags (byte 13 of the TCP header).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Minimum IPv4 header length.
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Minimum TCP header length.
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

// ============================================================================
// Classification
// ============================================================================

/// Parsed IPv4 header fields.
///
/// Only [`classify`] produces this, so holding one means the length checks
/// passed for the buffer it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headers {
    family: AddressFamily,
    protocol: IpProto,
    header_len: usize,
    total_len: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

impl Headers {
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn protocol(&self) -> IpProto {
        self.protocol
    }

    /// IP header length in bytes; also the offset of the transport header.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Declared total length.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Transport header plus payload length.
    pub fn l4_len(&self) -> usize {
        self.total_len - self.header_len
    }

    pub fn src(&self) -> Ipv4Addr {
        self.src
    }

    pub fn dst(&self) -> Ipv4Addr {
        self.dst
    }
}

/// Classify a packet buffer.
///
/// Fails when the declared total length is inconsistent with the buffer, or
/// the header length exceeds the total length.
pub fn classify(packet: &Packet<'_>) -> Result<Headers, PacketError> {
    if packet.family != AddressFamily::Inet {
        return Err(PacketError::UnsupportedFamily(packet.family));
    }

    let buf = &*packet.buf;
    if buf.len() < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::TooShort {
            len: buf.len(),
            min: IPV4_MIN_HEADER_LEN,
        });
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::BadVersion(version));
    }

    let header_len = usize::from(buf[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::BadHeaderLength(header_len));
    }

    let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    if total_len > buf.len() {
        return Err(PacketError::TotalLengthExceedsBuffer {
            declared: total_len,
            actual: buf.len(),
        });
    }
    if header_len > total_len {
        return Err(PacketError::HeaderExceedsTotal {
            header: header_len,
            total: total_len,
        });
    }

    Ok(Headers {
        family: packet.family,
        protocol: IpProto(buf[9]),
        header_len,
        total_len,
        src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
    })
}

// ============================================================================
// Packet buffer
// ============================================================================

/// A mutable packet buffer handed over by the network stack.
#[derive(Debug)]
pub struct Packet<'a> {
    buf: &'a mut [u8],
    family: AddressFamily,
    mark: u32,
}

impl<'a> Packet<'a> {
    /// Wrap a buffer that starts at the IP header.
    pub fn new(buf: &'a mut [u8], family: AddressFamily) -> Self {
        Self {
            buf,
            family,
            mark: 0,
        }
    }

    /// Attach a firewall mark (0 means unmarked).
    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf
    }

    /// Transport header and payload as declared by the IP header.
    fn l4(&self, h: &Headers) -> &[u8] {
        self.buf.get(h.header_len..h.total_len).unwrap_or(&[])
    }

    fn l4_mut(&mut self, h: &Headers) -> &mut [u8] {
        self.buf
            .get_mut(h.header_len..h.total_len)
            .unwrap_or(&mut [])
    }

    /// Source and destination ports for TCP/UDP.
    pub fn ports(&self, h: &Headers) -> Result<(u16, u16), PacketError> {
        if !h.protocol.has_ports() {
            return Err(PacketError::NoPorts(h.protocol));
        }
        let l4 = self.l4(h);
        if l4.len() < 4 {
            return Err(PacketError::TruncatedTransport {
                protocol: h.protocol,
                len: l4.len(),
            });
        }
        Ok((
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        ))
    }

    /// Source and destination endpoints for TCP/UDP.
    pub fn endpoints(&self, h: &Headers) -> Result<(SocketAddrV4, SocketAddrV4), PacketError> {
        let (sport, dport) = self.ports(h)?;
        Ok((
            SocketAddrV4::new(h.src, sport),
            SocketAddrV4::new(h.dst, dport),
        ))
    }

    /// TCP control flags.
    pub fn tcp_flags(&self, h: &Headers) -> Result<TcpFlags, PacketError> {
        let l4 = self.l4(h);
        if h.protocol != IpProto::TCP {
            return Err(PacketError::NoPorts(h.protocol));
        }
        if l4.len() < TCP_MIN_HEADER_LEN {
            return Err(PacketError::TruncatedTransport {
                protocol: h.protocol,
                len: l4.len(),
            });
        }
        Ok(TcpFlags::from_bits_truncate(l4[13]))
    }

    /// Rewrite source and/or destination endpoints in place and recompute
    /// checksums. The cached addresses in `h` are updated to match.
    pub fn rewrite(
        &mut self,
        h: &mut Headers,
        src: Option<SocketAddrV4>,
        dst: Option<SocketAddrV4>,
    ) -> Result<(), PacketError> {
        let min = h
            .protocol
            .min_header_len()
            .ok_or(PacketError::NoPorts(h.protocol))?;
        let l4_len = self.l4(h).len();
        if l4_len < min {
            return Err(PacketError::TruncatedTransport {
                protocol: h.protocol,
                len: l4_len,
            });
        }

        if let Some(src) = src {
            self.buf[12..16].copy_from_slice(&src.ip().octets());
            let off = h.header_len;
            self.buf[off..off + 2].copy_from_slice(&src.port().to_be_bytes());
            h.src = *src.ip();
        }
        if let Some(dst) = dst {
            self.buf[16..20].copy_from_slice(&dst.ip().octets());
            let off = h.header_len + 2;
            self.buf[off..off + 2].copy_from_slice(&dst.port().to_be_bytes());
            h.dst = *dst.ip();
        }

        self.recompute_checksums(h, ChecksumMode::PreserveAbsent)
    }

    /// Compute every checksum from scratch, including a UDP checksum that was
    /// previously absent. Used when synthesizing packets.
    pub fn fill_checksums(&mut self, h: &Headers) -> Result<(), PacketError> {
        self.recompute_checksums(h, ChecksumMode::Always)
    }

    fn recompute_checksums(&mut self, h: &Headers, mode: ChecksumMode) -> Result<(), PacketError> {
        let ihl = h.header_len;
        self.buf[10] = 0;
        self.buf[11] = 0;
        let csum = checksum(&self.buf[..ihl]);
        self.buf[10..12].copy_from_slice(&csum.to_be_bytes());

        let Some(offset) = h.protocol.checksum_offset() else {
            return Ok(());
        };
        let (src, dst, protocol) = (h.src, h.dst, h.protocol);
        let seg = self.l4_mut(h);
        if seg.len() < offset + 2 {
            return Err(PacketError::TruncatedTransport {
                protocol,
                len: seg.len(),
            });
        }

        // UDP over IPv4 may omit its checksum (all zeros).
        let is_udp = protocol == IpProto::UDP;
        if is_udp && mode == ChecksumMode::PreserveAbsent && seg[offset..offset + 2] == [0, 0] {
            return Ok(());
        }

        seg[offset] = 0;
        seg[offset + 1] = 0;
        let mut csum = fold(sum_words(seg, pseudo_header_sum(src, dst, protocol, seg.len())));
        if is_udp && csum == 0 {
            csum = 0xffff;
        }
        seg[offset..offset + 2].copy_from_slice(&csum.to_be_bytes());
        Ok(())
    }

    /// Verify the IPv4 header checksum and, for TCP/UDP, the transport
    /// checksum.
    pub fn checksums_valid(&self, h: &Headers) -> bool {
        if fold(sum_words(&self.buf[..h.header_len], 0)) != 0 {
            return false;
        }
        let Some(offset) = h.protocol.checksum_offset() else {
            return true;
        };
        let seg = self.l4(h);
        if seg.len() < offset + 2 {
            return false;
        }
        if h.protocol == IpProto::UDP && seg[offset..offset + 2] == [0, 0] {
            return true;
        }
        fold(sum_words(
            seg,
            pseudo_header_sum(h.src, h.dst, h.protocol, seg.len()),
        )) == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecksumMode {
    Always,
    PreserveAbsent,
}

// ============================================================================
// Checksums
// ============================================================================

/// Internet checksum (RFC 1071) over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Sum 16-bit big-endian words onto `initial`; an odd trailing byte is
/// padded with zero.
fn sum_words(data: &[u8], initial: u64) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut sum = initial;
    for word in &mut chunks {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

/// Fold to 16 bits and take the one's complement.
fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProto, len: usize) -> u64 {
    let s = src.octets();
    let d = dst.octets();
    u64::from(u16::from_be_bytes([s[0], s[1]]))
        + u64::from(u16::from_be_bytes([s[2], s[3]]))
        + u64::from(u16::from_be_bytes([d[0], d[1]]))
        + u64::from(u16::from_be_bytes([d[2], d[3]]))
        + u64::from(protocol.0)
        + len as u64
}
