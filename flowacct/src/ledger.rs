use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use flowacct_common::FlowStats;

use crate::endpoints::{EndpointDirectory, EndpointPair, EndpointTraffic};
use crate::report::{FlowDescription, FlowId};

/// Per-poll growth of one flow, as persisted and served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSample {
    pub timestamp: i64,
    #[serde(flatten)]
    pub flow: FlowDescription,
    #[serde(flatten)]
    pub delta: FlowStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub flow: FlowDescription,
    /// Counters as last read from the table.
    pub stats: FlowStats,
    /// Growth observed at the last poll that changed this flow.
    pub last_delta: FlowStats,
    /// Consecutive polls without any change.
    pub idle_polls: u32,
    pub first_seen: i64,
    pub last_changed: i64,
}

/// Userspace view of the flow tables, updated once per poll.
///
/// The kernel tables only ever grow, so the ledger works in deltas: each
/// poll is compared to the previous one and only the growth is added to
/// the running totals. A flow that stays unchanged for `idle_limit` polls
/// is no longer reported as active, but its last counters are kept so a
/// later poll does not count its history twice.
///
/// Deltas of flows with at least one configured endpoint are also summed
/// per directed endpoint pair. Those sums only grow.
pub struct Ledger {
    flows: DashMap<FlowId, LedgerEntry>,
    endpoints: EndpointDirectory,
    pairs: DashMap<EndpointPair, (u64, u64)>,
    last_snapshot: Mutex<Vec<(FlowId, FlowStats)>>,
    idle_limit: u32,
    pub total_bytes: AtomicU64,
    pub total_packets: AtomicU64,
    pub active_flows: AtomicUsize,
    pub polls: AtomicU64,
}

impl Ledger {
    pub fn new(idle_limit: u32) -> Self {
        Self {
            flows: DashMap::new(),
            endpoints: EndpointDirectory::default(),
            pairs: DashMap::new(),
            last_snapshot: Mutex::new(Vec::new()),
            idle_limit,
            total_bytes: AtomicU64::new(0),
            total_packets: AtomicU64::new(0),
            active_flows: AtomicUsize::new(0),
            polls: AtomicU64::new(0),
        }
    }

    pub fn with_endpoints(mut self, endpoints: EndpointDirectory) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Fold one table snapshot in and return the non-zero deltas.
    pub fn apply(&self, snapshot: &[(FlowId, FlowStats)]) -> Vec<FlowSample> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut samples = Vec::new();

        for (id, stats) in snapshot {
            let delta = match self.flows.get_mut(id) {
                Some(mut entry) => {
                    let delta = stats.delta_since(&entry.stats);
                    if *stats == entry.stats {
                        entry.idle_polls = entry.idle_polls.saturating_add(1);
                    } else {
                        entry.stats = *stats;
                        entry.last_delta = delta;
                        entry.idle_polls = 0;
                        entry.last_changed = now;
                    }
                    delta
                }
                None => {
                    self.flows.insert(
                        *id,
                        LedgerEntry {
                            flow: id.describe(),
                            stats: *stats,
                            last_delta: *stats,
                            idle_polls: 0,
                            first_seen: now,
                            last_changed: now,
                        },
                    );
                    *stats
                }
            };

            if delta.is_zero() {
                continue;
            }
            self.total_bytes
                .fetch_add(delta.total_bytes(), Ordering::Relaxed);
            self.total_packets
                .fetch_add(delta.total_packets(), Ordering::Relaxed);
            if let Some(pair) = self.endpoints.pair(id) {
                self.add_directed(pair.reversed(), delta.in_bytes, delta.in_packets);
                self.add_directed(pair, delta.out_bytes, delta.out_packets);
            }
            samples.push(FlowSample {
                timestamp: now,
                flow: id.describe(),
                delta,
            });
        }

        // Entries that left the table entirely.
        let present: HashSet<&FlowId> = snapshot.iter().map(|(id, _)| id).collect();
        self.flows.retain(|id, _| present.contains(id));

        let active = self
            .flows
            .iter()
            .filter(|entry| entry.idle_polls < self.idle_limit)
            .count();
        self.active_flows.store(active, Ordering::Relaxed);
        self.polls.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut last) = self.last_snapshot.lock() {
            *last = snapshot.to_vec();
        }

        samples
    }

    /// Active flows, largest total first.
    pub fn active(&self, limit: usize) -> Vec<LedgerEntry> {
        let mut entries: Vec<_> = self
            .flows
            .iter()
            .filter(|entry| entry.idle_polls < self.idle_limit)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| b.stats.total_bytes().cmp(&a.stats.total_bytes()));
        entries.truncate(limit);
        entries
    }

    fn add_directed(&self, pair: EndpointPair, bytes: u64, packets: u64) {
        if packets == 0 {
            return;
        }
        let mut total = self.pairs.entry(pair).or_default();
        total.0 = total.0.saturating_add(bytes);
        total.1 = total.1.saturating_add(packets);
    }

    /// Totals per directed endpoint pair, largest first.
    pub fn endpoint_traffic(&self) -> Vec<EndpointTraffic> {
        let mut traffic: Vec<_> = self
            .pairs
            .iter()
            .map(|entry| EndpointTraffic {
                pair: entry.key().clone(),
                bytes: entry.value().0,
                packets: entry.value().1,
            })
            .collect();
        traffic.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.pair.cmp(&b.pair)));
        traffic
    }

    pub fn last_snapshot(&self) -> Vec<(FlowId, FlowStats)> {
        self.last_snapshot
            .lock()
            .map(|last| last.clone())
            .unwrap_or_default()
    }

    pub fn tracked(&self) -> usize {
        self.flows.len()
    }
}
