use std::fmt::Write as _;
use std::net::IpAddr;

use serde::Serialize;

use flowacct_common::{AddressFamily, FlowKey, FlowKeyV4, FlowKeyV6, FlowStats, ProtoPort};

/// A canonical key from either table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowId {
    V4(FlowKeyV4),
    V6(FlowKeyV6),
}

impl FlowId {
    pub fn family(&self) -> AddressFamily {
        match self {
            FlowId::V4(_) => AddressFamily::V4,
            FlowId::V6(_) => AddressFamily::V6,
        }
    }

    pub fn src_ip(&self) -> IpAddr {
        match self {
            FlowId::V4(key) => key.src_ip(),
            FlowId::V6(key) => key.src_ip(),
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match self {
            FlowId::V4(key) => key.dst_ip(),
            FlowId::V6(key) => key.dst_ip(),
        }
    }

    pub fn l4(&self) -> ProtoPort {
        match self {
            FlowId::V4(key) => key.l4(),
            FlowId::V6(key) => key.l4(),
        }
    }

    /// Endpoints in the JSON / storage friendly form.
    pub fn describe(&self) -> FlowDescription {
        let l4 = self.l4();
        FlowDescription {
            family: self.family(),
            src_addr: self.src_ip().to_string(),
            src_port: l4.src_port,
            dst_addr: self.dst_ip().to_string(),
            dst_port: l4.dst_port,
            protocol: protocol_name(l4.proto),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowDescription {
    pub family: AddressFamily,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
    pub protocol: String,
}

pub fn protocol_name(proto: u8) -> String {
    match proto {
        6 => "TCP".to_string(),
        17 => "UDP".to_string(),
        other => format!("IP({})", other),
    }
}

/// Anything that can enumerate both flow tables.
///
/// IPv4 entries come first, then IPv6, each in the table's own iteration
/// order.
pub trait FlowSource {
    fn snapshot(&self) -> anyhow::Result<Vec<(FlowId, FlowStats)>>;
}

/// Render one table entry as its two report lines.
///
/// The layout is consumed by other tools and must not change:
///
/// ```text
/// 1.2.3.4(:1111)->5.6.7.8(:80):::: 1000 bytes 5 packets
/// 5.6.7.8(:80)->1.2.3.4(:1111):::: 2000 bytes 8 packets
/// ```
pub fn render_entry(out: &mut String, flow: &FlowId, stats: &FlowStats) {
    let (src, dst, l4) = (flow.src_ip(), flow.dst_ip(), flow.l4());
    let _ = writeln!(
        out,
        "{}(:{})->{}(:{}):::: {} bytes {} packets",
        src, l4.src_port, dst, l4.dst_port, stats.out_bytes, stats.out_packets
    );
    let _ = writeln!(
        out,
        "{}(:{})->{}(:{}):::: {} bytes {} packets",
        dst, l4.dst_port, src, l4.src_port, stats.in_bytes, stats.in_packets
    );
}

pub fn render_report(flows: &[(FlowId, FlowStats)]) -> String {
    let mut out = String::new();
    for (flow, stats) in flows {
        render_entry(&mut out, flow, stats);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_render_entry_exact_format() {
        let flow = FlowId::V4(FlowKeyV4::new(
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(5, 6, 7, 8),
            ProtoPort::new(6, 1111, 80),
        ));
        let stats = FlowStats {
            out_bytes: 1000,
            out_packets: 5,
            in_bytes: 2000,
            in_packets: 8,
        };
        let mut out = String::new();
        render_entry(&mut out, &flow, &stats);
        assert_eq!(
            out,
            "1.2.3.4(:1111)->5.6.7.8(:80):::: 1000 bytes 5 packets\n\
             5.6.7.8(:80)->1.2.3.4(:1111):::: 2000 bytes 8 packets\n"
        );
    }

    #[test]
    fn test_render_ipv6_uses_colon_form() {
        let flow = FlowId::V6(FlowKeyV6::new(
            "2001:db8::1".parse::<Ipv6Addr>().unwrap(),
            "2001:db8::2".parse::<Ipv6Addr>().unwrap(),
            ProtoPort::new(17, 5353, 53),
        ));
        let report = render_report(&[(flow, FlowStats::default())]);
        let lines: Vec<_> = report.lines().collect();
        assert_eq!(lines[0], "2001:db8::1(:5353)->2001:db8::2(:53):::: 0 bytes 0 packets");
        assert_eq!(lines[1], "2001:db8::2(:53)->2001:db8::1(:5353):::: 0 bytes 0 packets");
    }

    #[test]
    fn test_non_transport_flow_has_zero_ports() {
        let flow = FlowId::V4(FlowKeyV4::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            ProtoPort::new(1, 0, 0),
        ));
        let report = render_report(&[(flow, FlowStats::default())]);
        assert!(report.starts_with("10.0.0.1(:0)->10.0.0.2(:0):::: "));
        assert_eq!(flow.describe().protocol, "IP(1)");
    }

    #[test]
    fn test_empty_report() {
        assert_eq!(render_report(&[]), "");
    }
}
