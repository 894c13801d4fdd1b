//! Userspace side of flowacct: loads the cgroup_skb programs, walks the flow
//! maps, and turns the raw counters into reports, deltas and metrics.

pub mod api;
pub mod config;
pub mod endpoints;
pub mod ledger;
pub mod loader;
pub mod report;
pub mod storage;
pub mod table;
