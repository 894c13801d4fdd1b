use core::mem::{align_of, size_of};
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::flow::{Direction, FlowStats};

/// Atomically updated view of a [`FlowStats`] entry.
///
/// Layout-identical to `FlowStats`, so the kernel can hand out a pointer to
/// a map value and have it updated in place with fetch-and-add.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FlowCounters {
    out_bytes: AtomicU64,
    out_packets: AtomicU64,
    in_bytes: AtomicU64,
    in_packets: AtomicU64,
}

const _: () = assert!(size_of::<FlowCounters>() == size_of::<FlowStats>());
const _: () = assert!(align_of::<FlowCounters>() == align_of::<FlowStats>());

impl FlowCounters {
    pub const fn new(stats: FlowStats) -> Self {
        Self {
            out_bytes: AtomicU64::new(stats.out_bytes),
            out_packets: AtomicU64::new(stats.out_packets),
            in_bytes: AtomicU64::new(stats.in_bytes),
            in_packets: AtomicU64::new(stats.in_packets),
        }
    }

    /// Reinterpret a map value as atomic counters.
    ///
    /// # Safety
    ///
    /// `stats` must be valid for reads and writes for `'a`, suitably aligned,
    /// and only ever accessed atomically while the reference is live.
    pub unsafe fn from_ptr<'a>(stats: *mut FlowStats) -> &'a FlowCounters {
        &*(stats as *const FlowCounters)
    }

    /// Account one packet of `len` bytes.
    pub fn add(&self, direction: Direction, len: u64) {
        let (bytes, packets) = match direction {
            Direction::Ingress => (&self.out_bytes, &self.out_packets),
            Direction::Egress => (&self.in_bytes, &self.in_packets),
        };
        bytes.fetch_add(len, Ordering::Relaxed);
        packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlowStats {
        FlowStats {
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            out_packets: self.out_packets.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            in_packets: self.in_packets.load(Ordering::Relaxed),
        }
    }
}

/// Result of an insert-only-if-absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    CapacityExceeded,
}

/// A fixed-capacity concurrent map from flow key to counters.
///
/// Implementations never evict and never overwrite an existing entry.
pub trait FlowTable<K> {
    type Entry<'a>: Deref<Target = FlowCounters>
    where
        Self: 'a;

    fn lookup(&self, key: &K) -> Option<Self::Entry<'_>>;

    fn insert_if_absent(&self, key: &K, seed: &FlowStats) -> InsertOutcome;
}

/// What happened to one packet's contribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The packet created the entry.
    Seeded,
    /// The packet was added to an existing entry.
    Incremented,
    /// Another caller created the entry first and it vanished before this
    /// packet could be added.
    LostInsertRace,
    /// The table is full and the flow is new.
    CapacityExhausted,
}

/// Add one packet to the entry for `key`, creating it if needed.
pub fn record_observation<K, T>(table: &T, key: &K, direction: Direction, len: u64) -> RecordOutcome
where
    T: FlowTable<K> + ?Sized,
{
    if let Some(counters) = table.lookup(key) {
        counters.add(direction, len);
        return RecordOutcome::Incremented;
    }

    match table.insert_if_absent(key, &FlowStats::seed(direction, len)) {
        InsertOutcome::Inserted => RecordOutcome::Seeded,
        InsertOutcome::CapacityExceeded => RecordOutcome::CapacityExhausted,
        // Lost the race to a concurrent first packet; fold in once.
        InsertOutcome::AlreadyPresent => match table.lookup(key) {
            Some(counters) => {
                counters.add(direction, len);
                RecordOutcome::Incremented
            }
            None => RecordOutcome::LostInsertRace,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::flow::{FlowKeyV4, ProtoPort, IPPROTO_TCP};

    /// Minimal capacity-bounded table for exercising the core.
    pub(crate) struct TestTable<K> {
        pub(crate) entries: Mutex<HashMap<K, Arc<FlowCounters>>>,
        capacity: usize,
    }

    impl<K> TestTable<K> {
        pub(crate) fn with_capacity(capacity: usize) -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
                capacity,
            }
        }
    }

    impl<K: Copy + Eq + std::hash::Hash> TestTable<K> {
        pub(crate) fn stats(&self, key: &K) -> Option<FlowStats> {
            self.entries.lock().unwrap().get(key).map(|c| c.snapshot())
        }

        pub(crate) fn len(&self) -> usize {
            self.entries.lock().unwrap().len()
        }
    }

    impl<K: Copy + Eq + std::hash::Hash> FlowTable<K> for TestTable<K> {
        type Entry<'a> = Arc<FlowCounters> where Self: 'a;

        fn lookup(&self, key: &K) -> Option<Arc<FlowCounters>> {
            self.entries.lock().unwrap().get(key).cloned()
        }

        fn insert_if_absent(&self, key: &K, seed: &FlowStats) -> InsertOutcome {
            let mut entries = self.entries.lock().unwrap();
            if entries.contains_key(key) {
                return InsertOutcome::AlreadyPresent;
            }
            if entries.len() >= self.capacity {
                return InsertOutcome::CapacityExceeded;
            }
            entries.insert(*key, Arc::new(FlowCounters::new(*seed)));
            InsertOutcome::Inserted
        }
    }

    /// Reports "absent" on the first lookup, then behaves normally, to
    /// replay a lost insert race deterministically.
    struct RacyTable {
        inner: TestTable<FlowKeyV4>,
        first_lookup: Mutex<bool>,
    }

    impl FlowTable<FlowKeyV4> for RacyTable {
        type Entry<'a> = Arc<FlowCounters> where Self: 'a;

        fn lookup(&self, key: &FlowKeyV4) -> Option<Arc<FlowCounters>> {
            let mut first = self.first_lookup.lock().unwrap();
            if *first {
                *first = false;
                return None;
            }
            self.inner.lookup(key)
        }

        fn insert_if_absent(&self, key: &FlowKeyV4, seed: &FlowStats) -> InsertOutcome {
            self.inner.insert_if_absent(key, seed)
        }
    }

    fn key(last_octet: u8) -> FlowKeyV4 {
        FlowKeyV4 {
            src_addr: [10, 0, 0, last_octet],
            dst_addr: [10, 0, 1, 1],
            l4: ProtoPort::new(IPPROTO_TCP, 40000, 80),
        }
    }

    #[test]
    fn test_counters_layout_matches_stats() {
        let mut raw = FlowStats::seed(Direction::Ingress, 10);
        let counters = unsafe { FlowCounters::from_ptr(&mut raw) };
        counters.add(Direction::Egress, 5);
        assert_eq!(
            counters.snapshot(),
            FlowStats {
                out_bytes: 10,
                out_packets: 1,
                in_bytes: 5,
                in_packets: 1,
            }
        );
    }

    #[test]
    fn test_first_packet_seeds_entry_once() {
        let table = TestTable::with_capacity(4);
        assert_eq!(
            record_observation(&table, &key(1), Direction::Ingress, 100),
            RecordOutcome::Seeded
        );
        let stats = table.stats(&key(1)).unwrap();
        assert_eq!((stats.out_bytes, stats.out_packets), (100, 1));
        assert_eq!((stats.in_bytes, stats.in_packets), (0, 0));
    }

    #[test]
    fn test_existing_entry_is_incremented() {
        let table = TestTable::with_capacity(4);
        record_observation(&table, &key(1), Direction::Ingress, 100);
        assert_eq!(
            record_observation(&table, &key(1), Direction::Egress, 60),
            RecordOutcome::Incremented
        );
        record_observation(&table, &key(1), Direction::Ingress, 40);

        let stats = table.stats(&key(1)).unwrap();
        assert_eq!((stats.out_bytes, stats.out_packets), (140, 2));
        assert_eq!((stats.in_bytes, stats.in_packets), (60, 1));
    }

    #[test]
    fn test_full_table_drops_new_flows_only() {
        let table = TestTable::with_capacity(2);
        record_observation(&table, &key(1), Direction::Ingress, 10);
        record_observation(&table, &key(2), Direction::Egress, 20);
        let before = (table.stats(&key(1)), table.stats(&key(2)));

        assert_eq!(
            record_observation(&table, &key(3), Direction::Ingress, 30),
            RecordOutcome::CapacityExhausted
        );
        assert_eq!(table.len(), 2);
        assert!(table.stats(&key(3)).is_none());
        assert_eq!((table.stats(&key(1)), table.stats(&key(2))), before);

        // Known flows keep counting.
        assert_eq!(
            record_observation(&table, &key(1), Direction::Ingress, 10),
            RecordOutcome::Incremented
        );
    }

    #[test]
    fn test_lost_insert_race_folds_into_winner() {
        let table = RacyTable {
            inner: TestTable::with_capacity(4),
            first_lookup: Mutex::new(true),
        };
        table
            .inner
            .insert_if_absent(&key(1), &FlowStats::seed(Direction::Ingress, 100));

        assert_eq!(
            record_observation(&table, &key(1), Direction::Egress, 60),
            RecordOutcome::Incremented
        );
        let stats = table.inner.stats(&key(1)).unwrap();
        assert_eq!((stats.out_bytes, stats.out_packets), (100, 1));
        assert_eq!((stats.in_bytes, stats.in_packets), (60, 1));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let table = Arc::new(TestTable::with_capacity(4));
        record_observation(&*table, &key(1), Direction::Ingress, 1);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        record_observation(&*table, &key(1), Direction::Egress, 3);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = table.stats(&key(1)).unwrap();
        assert_eq!(stats.in_packets, 8000);
        assert_eq!(stats.in_bytes, 24000);
        assert_eq!(stats.out_packets, 1);
    }
}
