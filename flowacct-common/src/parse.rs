use network_types::{
    ip::{Ipv4Hdr, Ipv6Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};

use crate::flow::{FlowKeyV4, FlowKeyV6, ProtoPort, IPPROTO_TCP, IPPROTO_UDP};

/// Read-only, bounds-delimited access to one packet starting at the IP
/// header.
///
/// Implementations must return `None` / `false` for any range that is not
/// entirely inside the packet; callers never touch packet memory any other
/// way.
pub trait PacketView {
    /// Total length of the packet as reported by the hook.
    fn packet_len(&self) -> u32;

    /// Whether `len` bytes starting at `offset` lie inside the view.
    fn fits(&self, offset: usize, len: usize) -> bool;

    /// Copy `N` bytes starting at `offset`.
    fn bytes<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;

    fn byte(&self, offset: usize) -> Option<u8> {
        self.bytes::<1>(offset).map(|[b]| b)
    }

    fn be16(&self, offset: usize) -> Option<u16> {
        self.bytes::<2>(offset).map(u16::from_be_bytes)
    }
}

impl PacketView for [u8] {
    fn packet_len(&self) -> u32 {
        u32::try_from(self.len()).unwrap_or(u32::MAX)
    }

    fn fits(&self, offset: usize, len: usize) -> bool {
        matches!(offset.checked_add(len), Some(end) if end <= self.len())
    }

    fn bytes<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.get(offset..end)?.try_into().ok()
    }
}

/// Why a packet could not be classified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Malformed {
    /// A header (L3 or L4) extends past the end of the view.
    Truncated,
    /// The version nibble is neither 4 nor 6.
    UnknownVersion(u8),
    /// IPv4 IHL smaller than the fixed header.
    BadHeaderLength(u8),
}

/// A flow key as read off the wire, before normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParsedFlow {
    V4(FlowKeyV4),
    V6(FlowKeyV6),
}

/// Classify the packet behind `view`.
pub fn parse<V: PacketView + ?Sized>(view: &V) -> Result<ParsedFlow, Malformed> {
    let version_ihl = view.byte(0).ok_or(Malformed::Truncated)?;
    match version_ihl >> 4 {
        4 => parse_ipv4(view, version_ihl).map(ParsedFlow::V4),
        6 => parse_ipv6(view).map(ParsedFlow::V6),
        other => Err(Malformed::UnknownVersion(other)),
    }
}

fn parse_ipv4<V: PacketView + ?Sized>(view: &V, version_ihl: u8) -> Result<FlowKeyV4, Malformed> {
    if !view.fits(0, Ipv4Hdr::LEN) {
        return Err(Malformed::Truncated);
    }
    let ihl = version_ihl & 0x0f;
    if ihl < 5 {
        return Err(Malformed::BadHeaderLength(ihl));
    }

    let proto = view.byte(9).ok_or(Malformed::Truncated)?;
    let src_addr = view.bytes::<4>(12).ok_or(Malformed::Truncated)?;
    let dst_addr = view.bytes::<4>(16).ok_or(Malformed::Truncated)?;
    let l4 = transport(view, proto, usize::from(ihl) * 4)?;

    Ok(FlowKeyV4 {
        src_addr,
        dst_addr,
        l4,
    })
}

fn parse_ipv6<V: PacketView + ?Sized>(view: &V) -> Result<FlowKeyV6, Malformed> {
    if !view.fits(0, Ipv6Hdr::LEN) {
        return Err(Malformed::Truncated);
    }

    // Extension headers are not walked: next-header is taken as the
    // transport protocol.
    let next_header = view.byte(6).ok_or(Malformed::Truncated)?;
    let src_addr = view.bytes::<16>(8).ok_or(Malformed::Truncated)?;
    let dst_addr = view.bytes::<16>(24).ok_or(Malformed::Truncated)?;
    let l4 = transport(view, next_header, Ipv6Hdr::LEN)?;

    Ok(FlowKeyV6 {
        src_addr,
        dst_addr,
        l4,
    })
}

fn transport<V: PacketView + ?Sized>(
    view: &V,
    proto: u8,
    offset: usize,
) -> Result<ProtoPort, Malformed> {
    let header_len = match proto {
        IPPROTO_TCP => TcpHdr::LEN,
        IPPROTO_UDP => UdpHdr::LEN,
        _ => return Ok(ProtoPort::new(proto, 0, 0)),
    };
    if !view.fits(offset, header_len) {
        return Err(Malformed::Truncated);
    }
    let src_port = view.be16(offset).ok_or(Malformed::Truncated)?;
    let dst_port = view.be16(offset + 2).ok_or(Malformed::Truncated)?;
    Ok(ProtoPort::new(proto, src_port, dst_port))
}
