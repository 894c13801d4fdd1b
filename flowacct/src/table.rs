use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use flowacct_common::{
    FlowAccounting, FlowCounters, FlowKeyV4, FlowKeyV6, FlowStats, FlowTable, InsertOutcome,
    V4_FLOW_MAP_SIZE, V6_FLOW_MAP_SIZE,
};

use crate::report::{FlowId, FlowSource};

/// In-process counterpart of the kernel flow maps.
///
/// Holds at most `capacity` entries and never evicts. Counters are updated
/// with atomics; the shard lock is only taken to create an entry.
pub struct BoundedFlowTable<K> {
    entries: DashMap<K, FlowCounters>,
    len: AtomicUsize,
    capacity: usize,
}

impl<K: Eq + Hash + Copy + Ord> BoundedFlowTable<K> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> Option<FlowStats> {
        self.entries.get(key).map(|counters| counters.snapshot())
    }

    /// All entries, ordered by key.
    pub fn snapshot(&self) -> Vec<(K, FlowStats)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().snapshot()))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl<K: Eq + Hash + Copy> FlowTable<K> for BoundedFlowTable<K> {
    type Entry<'a> = Ref<'a, K, FlowCounters> where Self: 'a;

    fn lookup(&self, key: &K) -> Option<Ref<'_, K, FlowCounters>> {
        self.entries.get(key)
    }

    fn insert_if_absent(&self, key: &K, seed: &FlowStats) -> InsertOutcome {
        match self.entries.entry(*key) {
            Entry::Occupied(_) => InsertOutcome::AlreadyPresent,
            Entry::Vacant(slot) => {
                if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return InsertOutcome::CapacityExceeded;
                }
                slot.insert(FlowCounters::new(*seed));
                InsertOutcome::Inserted
            }
        }
    }
}

/// One table per address family, sized like the kernel maps.
pub struct HostTables {
    pub v4: BoundedFlowTable<FlowKeyV4>,
    pub v6: BoundedFlowTable<FlowKeyV6>,
}

impl Default for HostTables {
    fn default() -> Self {
        Self::with_capacity(V4_FLOW_MAP_SIZE as usize, V6_FLOW_MAP_SIZE as usize)
    }
}

impl HostTables {
    pub fn with_capacity(v4: usize, v6: usize) -> Self {
        Self {
            v4: BoundedFlowTable::with_capacity(v4),
            v6: BoundedFlowTable::with_capacity(v6),
        }
    }

    pub fn accounting(
        &self,
    ) -> FlowAccounting<'_, BoundedFlowTable<FlowKeyV4>, BoundedFlowTable<FlowKeyV6>> {
        FlowAccounting::new(&self.v4, &self.v6)
    }
}

impl FlowSource for HostTables {
    fn snapshot(&self) -> anyhow::Result<Vec<(FlowId, FlowStats)>> {
        let v4 = self.v4.snapshot().into_iter().map(|(k, s)| (FlowId::V4(k), s));
        let v6 = self.v6.snapshot().into_iter().map(|(k, s)| (FlowId::V6(k), s));
        Ok(v4.chain(v6).collect())
    }
}
