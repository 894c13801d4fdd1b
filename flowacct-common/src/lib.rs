#![cfg_attr(not(test), no_std)]

//! Flow accounting core shared by the cgroup_skb programs and the userspace
//! agent.
//!
//! Everything in here must stay usable from eBPF: no allocation, no loops
//! over packet data, and every packet read goes through a bounds-checked
//! [`PacketView`].

pub mod dispatch;
pub mod flow;
pub mod parse;
pub mod table;

pub use dispatch::{AddressFamily, FlowAccounting, Observation, Verdict};
pub use flow::{Direction, FlowKey, FlowKeyV4, FlowKeyV6, FlowStats, ProtoPort};
pub use parse::{parse, Malformed, PacketView, ParsedFlow};
pub use table::{record_observation, FlowCounters, FlowTable, InsertOutcome, RecordOutcome};

/// Name of the kernel map holding IPv4 flows.
pub const V4_FLOWS_MAP: &str = "V4_FLOWS";
/// Name of the kernel map holding IPv6 flows.
pub const V6_FLOWS_MAP: &str = "V6_FLOWS";

/// Default number of IPv4 flows the kernel map can hold.
pub const V4_FLOW_MAP_SIZE: u32 = 65535;
/// Default number of IPv6 flows the kernel map can hold.
pub const V6_FLOW_MAP_SIZE: u32 = 65535;

#[cfg(feature = "user")]
mod user_impls {
    use super::{FlowKeyV4, FlowKeyV6, FlowStats};

    unsafe impl aya::Pod for FlowKeyV4 {}
    unsafe impl aya::Pod for FlowKeyV6 {}
    unsafe impl aya::Pod for FlowStats {}
}
