use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use network_types::ip::IpProto;

pub const IPPROTO_TCP: u8 = IpProto::Tcp as u8;
pub const IPPROTO_UDP: u8 = IpProto::Udp as u8;

/// Which side of the cgroup boundary saw the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    Ingress,
    Egress,
}

/// Transport identity of a flow.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtoPort {
    /// IP protocol number: 6 = TCP, 17 = UDP.
    pub proto: u8,
    /// Always zero; the kernel hashes the raw key bytes.
    pub _pad: u8,
    /// Source port in host byte order, zero unless TCP or UDP.
    pub src_port: u16,
    /// Destination port in host byte order, zero unless TCP or UDP.
    pub dst_port: u16,
}

impl ProtoPort {
    pub const fn new(proto: u8, src_port: u16, dst_port: u16) -> Self {
        Self {
            proto,
            _pad: 0,
            src_port,
            dst_port,
        }
    }

    pub const fn swapped(self) -> Self {
        Self::new(self.proto, self.dst_port, self.src_port)
    }
}

/// Canonical IPv4 flow key, the key type of the `V4_FLOWS` map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowKeyV4 {
    /// Source address in network byte order.
    pub src_addr: [u8; 4],
    /// Destination address in network byte order.
    pub dst_addr: [u8; 4],
    pub l4: ProtoPort,
}

/// Canonical IPv6 flow key, the key type of the `V6_FLOWS` map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowKeyV6 {
    /// Source address in network byte order.
    pub src_addr: [u8; 16],
    /// Destination address in network byte order.
    pub dst_addr: [u8; 16],
    pub l4: ProtoPort,
}

/// Behaviour shared by both address families' keys.
pub trait FlowKey: Copy {
    fn src_ip(&self) -> IpAddr;
    fn dst_ip(&self) -> IpAddr;
    fn l4(&self) -> ProtoPort;

    /// The same conversation seen from the other end.
    fn swapped(&self) -> Self;

    /// Map a key read off the wire to the table key for `direction`.
    ///
    /// Ingress keys are already canonical. Egress keys are flipped so that
    /// both halves of a conversation land on one entry.
    fn normalize(self, direction: Direction) -> Self {
        match direction {
            Direction::Ingress => self,
            Direction::Egress => self.swapped(),
        }
    }
}

impl FlowKeyV4 {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, l4: ProtoPort) -> Self {
        Self {
            src_addr: src.octets(),
            dst_addr: dst.octets(),
            l4,
        }
    }
}

impl FlowKey for FlowKeyV4 {
    fn src_ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(self.src_addr))
    }

    fn dst_ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(self.dst_addr))
    }

    fn l4(&self) -> ProtoPort {
        self.l4
    }

    fn swapped(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            l4: self.l4.swapped(),
        }
    }
}

impl FlowKeyV6 {
    pub fn new(src: Ipv6Addr, dst: Ipv6Addr, l4: ProtoPort) -> Self {
        Self {
            src_addr: src.octets(),
            dst_addr: dst.octets(),
            l4,
        }
    }
}

impl FlowKey for FlowKeyV6 {
    fn src_ip(&self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(self.src_addr))
    }

    fn dst_ip(&self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(self.dst_addr))
    }

    fn l4(&self) -> ProtoPort {
        self.l4
    }

    fn swapped(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            l4: self.l4.swapped(),
        }
    }
}

/// Per-flow counters as stored in the kernel maps.
///
/// `out` follows the canonical key's source -> destination orientation,
/// `in` the reverse.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowStats {
    pub out_bytes: u64,
    pub out_packets: u64,
    pub in_bytes: u64,
    pub in_packets: u64,
}

impl FlowStats {
    /// Counters describing a single packet, used to create a new entry.
    pub const fn seed(direction: Direction, len: u64) -> Self {
        match direction {
            Direction::Ingress => Self {
                out_bytes: len,
                out_packets: 1,
                in_bytes: 0,
                in_packets: 0,
            },
            Direction::Egress => Self {
                out_bytes: 0,
                out_packets: 0,
                in_bytes: len,
                in_packets: 1,
            },
        }
    }

    pub const fn total_bytes(&self) -> u64 {
        self.out_bytes.wrapping_add(self.in_bytes)
    }

    pub const fn total_packets(&self) -> u64 {
        self.out_packets.wrapping_add(self.in_packets)
    }

    /// Growth since `earlier`. A counter that went backwards means the entry
    /// was recreated, so nothing is attributed to this interval.
    pub fn delta_since(&self, earlier: &FlowStats) -> FlowStats {
        if self.out_bytes < earlier.out_bytes
            || self.out_packets < earlier.out_packets
            || self.in_bytes < earlier.in_bytes
            || self.in_packets < earlier.in_packets
        {
            return FlowStats::default();
        }
        FlowStats {
            out_bytes: self.out_bytes - earlier.out_bytes,
            out_packets: self.out_packets - earlier.out_packets,
            in_bytes: self.in_bytes - earlier.in_bytes,
            in_packets: self.in_packets - earlier.in_packets,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == FlowStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_flow() -> FlowKeyV4 {
        FlowKeyV4::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(93, 184, 216, 34),
            ProtoPort::new(IPPROTO_TCP, 51000, 443),
        )
    }

    #[test]
    fn test_key_layout_has_no_implicit_padding() {
        assert_eq!(core::mem::size_of::<ProtoPort>(), 6);
        assert_eq!(core::mem::size_of::<FlowKeyV4>(), 14);
        assert_eq!(core::mem::size_of::<FlowKeyV6>(), 38);
        assert_eq!(core::mem::size_of::<FlowStats>(), 32);
    }

    #[test]
    fn test_ingress_normalize_is_identity() {
        let key = web_flow();
        assert_eq!(key.normalize(Direction::Ingress), key);
    }

    #[test]
    fn test_egress_normalize_swaps_endpoints_and_ports() {
        let key = web_flow().normalize(Direction::Egress);
        assert_eq!(key.src_addr, [93, 184, 216, 34]);
        assert_eq!(key.dst_addr, [10, 0, 0, 1]);
        assert_eq!(key.l4.src_port, 443);
        assert_eq!(key.l4.dst_port, 51000);
        assert_eq!(key.l4.proto, IPPROTO_TCP);
    }

    #[test]
    fn test_double_swap_restores_key() {
        let v4 = web_flow();
        assert_eq!(v4.normalize(Direction::Egress).swapped(), v4);

        let v6 = FlowKeyV6::new(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            ProtoPort::new(IPPROTO_UDP, 5353, 53),
        );
        assert_eq!(v6.swapped().swapped(), v6);
    }

    #[test]
    fn test_both_directions_share_canonical_key() {
        let seen_on_ingress = web_flow();
        let seen_on_egress = web_flow().swapped();
        assert_eq!(
            seen_on_ingress.normalize(Direction::Ingress),
            seen_on_egress.normalize(Direction::Egress)
        );
    }

    #[test]
    fn test_seed_counts_one_packet() {
        let ingress = FlowStats::seed(Direction::Ingress, 100);
        assert_eq!((ingress.out_bytes, ingress.out_packets), (100, 1));
        assert_eq!((ingress.in_bytes, ingress.in_packets), (0, 0));

        let egress = FlowStats::seed(Direction::Egress, 60);
        assert_eq!((egress.out_bytes, egress.out_packets), (0, 0));
        assert_eq!((egress.in_bytes, egress.in_packets), (60, 1));
    }

    #[test]
    fn test_delta_since() {
        let earlier = FlowStats {
            out_bytes: 100,
            out_packets: 1,
            in_bytes: 60,
            in_packets: 1,
        };
        let later = FlowStats {
            out_bytes: 250,
            out_packets: 3,
            in_bytes: 60,
            in_packets: 1,
        };
        let delta = later.delta_since(&earlier);
        assert_eq!(delta.out_bytes, 150);
        assert_eq!(delta.out_packets, 2);
        assert!(later.delta_since(&later).is_zero());

        // Entry recreated between polls.
        assert!(earlier.delta_since(&later).is_zero());
    }
}
