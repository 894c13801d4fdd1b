use crate::flow::{Direction, FlowKey, FlowKeyV4, FlowKeyV6};
use crate::parse::{parse, Malformed, PacketView, ParsedFlow};
use crate::table::{record_observation, FlowTable, RecordOutcome};

/// Verdict handed back to the cgroup_skb hook. Accounting never drops.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressFamily {
    V4,
    V6,
}

/// What the dispatcher did with one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Accounted {
        family: AddressFamily,
        outcome: RecordOutcome,
    },
    Malformed(Malformed),
}

/// Ties parsing, normalization and the per-family tables together.
///
/// The tables are borrowed, so the same dispatcher works over kernel maps
/// inside the eBPF program and over in-process tables on the host.
pub struct FlowAccounting<'t, T4: ?Sized, T6: ?Sized> {
    v4: &'t T4,
    v6: &'t T6,
}

impl<'t, T4, T6> FlowAccounting<'t, T4, T6>
where
    T4: FlowTable<FlowKeyV4> + ?Sized,
    T6: FlowTable<FlowKeyV6> + ?Sized,
{
    pub fn new(v4: &'t T4, v6: &'t T6) -> Self {
        Self { v4, v6 }
    }

    /// Classify the packet and record it against the matching table.
    pub fn observe<V: PacketView + ?Sized>(&self, view: &V, direction: Direction) -> Observation {
        let len = u64::from(view.packet_len());
        match parse(view) {
            Ok(ParsedFlow::V4(key)) => Observation::Accounted {
                family: AddressFamily::V4,
                outcome: record_observation(self.v4, &key.normalize(direction), direction, len),
            },
            Ok(ParsedFlow::V6(key)) => Observation::Accounted {
                family: AddressFamily::V6,
                outcome: record_observation(self.v6, &key.normalize(direction), direction, len),
            },
            Err(reason) => Observation::Malformed(reason),
        }
    }

    pub fn ingress<V: PacketView + ?Sized>(&self, view: &V) -> Verdict {
        self.observe(view, Direction::Ingress);
        Verdict::Accept
    }

    pub fn egress<V: PacketView + ?Sized>(&self, view: &V) -> Verdict {
        self.observe(view, Direction::Egress);
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowStats, ProtoPort, IPPROTO_TCP, IPPROTO_UDP};
    use crate::parse::tests::{ipv4_packet, ipv6_packet, tcp_header, udp_header};
    use crate::table::tests::TestTable;

    const CLIENT: [u8; 4] = [1, 2, 3, 4];
    const SERVER: [u8; 4] = [5, 6, 7, 8];

    fn padded(mut pkt: Vec<u8>, len: usize) -> Vec<u8> {
        pkt.resize(len, 0);
        pkt
    }

    fn canonical() -> FlowKeyV4 {
        FlowKeyV4 {
            src_addr: CLIENT,
            dst_addr: SERVER,
            l4: ProtoPort::new(IPPROTO_TCP, 1111, 80),
        }
    }

    #[test]
    fn test_verdict_is_one() {
        assert_eq!(Verdict::Accept as i32, 1);
    }

    #[test]
    fn test_both_directions_aggregate_into_one_entry() {
        let v4 = TestTable::with_capacity(8);
        let v6 = TestTable::with_capacity(8);
        let accounting = FlowAccounting::new(&v4, &v6);

        let inbound = padded(ipv4_packet(IPPROTO_TCP, CLIENT, SERVER, &tcp_header(1111, 80)), 100);
        let outbound = padded(ipv4_packet(IPPROTO_TCP, SERVER, CLIENT, &tcp_header(80, 1111)), 60);

        assert_eq!(accounting.ingress(inbound.as_slice()), Verdict::Accept);
        assert_eq!(accounting.egress(outbound.as_slice()), Verdict::Accept);

        assert_eq!(v4.len(), 1);
        assert_eq!(
            v4.stats(&canonical()).unwrap(),
            FlowStats {
                out_bytes: 100,
                out_packets: 1,
                in_bytes: 60,
                in_packets: 1,
            }
        );
        assert_eq!(v6.len(), 0);
    }

    #[test]
    fn test_egress_first_seeds_in_counters() {
        let v4 = TestTable::with_capacity(8);
        let v6 = TestTable::<FlowKeyV6>::with_capacity(8);
        let accounting = FlowAccounting::new(&v4, &v6);

        let outbound = padded(ipv4_packet(IPPROTO_TCP, SERVER, CLIENT, &tcp_header(80, 1111)), 60);
        let observed = accounting.observe(outbound.as_slice(), Direction::Egress);
        assert_eq!(
            observed,
            Observation::Accounted {
                family: AddressFamily::V4,
                outcome: RecordOutcome::Seeded,
            }
        );
        let stats = v4.stats(&canonical()).unwrap();
        assert_eq!((stats.out_bytes, stats.out_packets), (0, 0));
        assert_eq!((stats.in_bytes, stats.in_packets), (60, 1));
    }

    #[test]
    fn test_conversation_totals_match_packets() {
        let v4 = TestTable::with_capacity(8);
        let v6 = TestTable::<FlowKeyV6>::with_capacity(8);
        let accounting = FlowAccounting::new(&v4, &v6);

        let sizes = [
            (Direction::Ingress, 64),
            (Direction::Egress, 1500),
            (Direction::Egress, 1500),
            (Direction::Ingress, 52),
            (Direction::Egress, 300),
        ];
        for (direction, len) in sizes {
            let pkt = match direction {
                Direction::Ingress => ipv4_packet(IPPROTO_UDP, CLIENT, SERVER, &udp_header(4000, 53)),
                Direction::Egress => ipv4_packet(IPPROTO_UDP, SERVER, CLIENT, &udp_header(53, 4000)),
            };
            accounting.observe(padded(pkt, len).as_slice(), direction);
        }

        let key = FlowKeyV4 {
            src_addr: CLIENT,
            dst_addr: SERVER,
            l4: ProtoPort::new(IPPROTO_UDP, 4000, 53),
        };
        let stats = v4.stats(&key).unwrap();
        assert_eq!(stats.total_bytes(), 64 + 1500 + 1500 + 52 + 300);
        assert_eq!(stats.total_packets(), 5);
        assert_eq!(stats.out_packets, 2);
        assert_eq!(stats.in_packets, 3);
    }

    #[test]
    fn test_truncated_packet_leaves_table_untouched() {
        let v4 = TestTable::with_capacity(8);
        let v6 = TestTable::<FlowKeyV6>::with_capacity(8);
        let accounting = FlowAccounting::new(&v4, &v6);

        let whole = ipv4_packet(IPPROTO_TCP, CLIENT, SERVER, &tcp_header(1111, 80));
        let cut = &whole[..whole.len() - 1];

        assert_eq!(accounting.ingress(cut), Verdict::Accept);
        assert_eq!(
            accounting.observe(cut, Direction::Ingress),
            Observation::Malformed(Malformed::Truncated)
        );
        assert_eq!(v4.len(), 0);
        assert_eq!(v6.len(), 0);
    }

    #[test]
    fn test_full_table_still_accepts() {
        let v4 = TestTable::with_capacity(1);
        let v6 = TestTable::<FlowKeyV6>::with_capacity(1);
        let accounting = FlowAccounting::new(&v4, &v6);

        let first = ipv4_packet(IPPROTO_UDP, CLIENT, SERVER, &udp_header(1, 2));
        let second = ipv4_packet(IPPROTO_UDP, CLIENT, SERVER, &udp_header(3, 4));
        accounting.ingress(first.as_slice());
        let before = v4.stats(&FlowKeyV4 {
            src_addr: CLIENT,
            dst_addr: SERVER,
            l4: ProtoPort::new(IPPROTO_UDP, 1, 2),
        });

        assert_eq!(
            accounting.observe(second.as_slice(), Direction::Ingress),
            Observation::Accounted {
                family: AddressFamily::V4,
                outcome: RecordOutcome::CapacityExhausted,
            }
        );
        assert_eq!(accounting.ingress(second.as_slice()), Verdict::Accept);
        assert_eq!(v4.len(), 1);
        assert_eq!(
            v4.stats(&FlowKeyV4 {
                src_addr: CLIENT,
                dst_addr: SERVER,
                l4: ProtoPort::new(IPPROTO_UDP, 1, 2),
            }),
            before
        );
    }

    #[test]
    fn test_ipv6_goes_to_v6_table() {
        let v4 = TestTable::<FlowKeyV4>::with_capacity(8);
        let v6 = TestTable::with_capacity(8);
        let accounting = FlowAccounting::new(&v4, &v6);

        let (a, b) = ([0x20; 16], [0x30; 16]);
        let out = ipv6_packet(IPPROTO_TCP, b, a, &tcp_header(443, 50000));
        accounting.egress(out.as_slice());

        let key = FlowKeyV6 {
            src_addr: a,
            dst_addr: b,
            l4: ProtoPort::new(IPPROTO_TCP, 50000, 443),
        };
        let stats = v6.stats(&key).unwrap();
        assert_eq!(stats.in_packets, 1);
        assert_eq!(stats.in_bytes, out.len() as u64);
        assert_eq!(v4.len(), 0);
    }
}
