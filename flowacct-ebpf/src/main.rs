#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    macros::{cgroup_skb, map},
    maps::HashMap,
    programs::SkBuffContext,
};
use aya_log_ebpf::debug;
use core::ptr;
use flowacct_common::{
    AddressFamily, Direction, FlowAccounting, FlowCounters, FlowKeyV4, FlowKeyV6, FlowStats,
    FlowTable, InsertOutcome, Observation, PacketView, RecordOutcome, Verdict, V4_FLOW_MAP_SIZE,
    V6_FLOW_MAP_SIZE,
};

const EEXIST: i64 = 17;

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

#[map]
static V4_FLOWS: HashMap<FlowKeyV4, FlowStats> = HashMap::with_max_entries(V4_FLOW_MAP_SIZE, 0);

#[map]
static V6_FLOWS: HashMap<FlowKeyV6, FlowStats> = HashMap::with_max_entries(V6_FLOW_MAP_SIZE, 0);

#[cgroup_skb(ingress)]
pub fn flowacct_ingress(ctx: SkBuffContext) -> i32 {
    account(&ctx, Direction::Ingress)
}

#[cgroup_skb(egress)]
pub fn flowacct_egress(ctx: SkBuffContext) -> i32 {
    account(&ctx, Direction::Egress)
}

#[inline(always)]
fn account(ctx: &SkBuffContext, direction: Direction) -> i32 {
    let v4 = KernelTable(&V4_FLOWS);
    let v6 = KernelTable(&V6_FLOWS);
    let accounting = FlowAccounting::new(&v4, &v6);

    if let Observation::Accounted {
        family,
        outcome: RecordOutcome::CapacityExhausted,
    } = accounting.observe(&SkbView(ctx), direction)
    {
        let map = match family {
            AddressFamily::V4 => "V4_FLOWS",
            AddressFamily::V6 => "V6_FLOWS",
        };
        debug!(ctx, "{} is full, flow not recorded", map);
    }

    Verdict::Accept as i32
}

/// Bounds-checked access to the packet behind a cgroup_skb context.
///
/// Every read is checked against `data_end` right before the load so the
/// verifier can see the bound.
struct SkbView<'a>(&'a SkBuffContext);

impl PacketView for SkbView<'_> {
    #[inline(always)]
    fn packet_len(&self) -> u32 {
        self.0.len()
    }

    #[inline(always)]
    fn fits(&self, offset: usize, len: usize) -> bool {
        self.0.data() + offset + len <= self.0.data_end()
    }

    #[inline(always)]
    fn bytes<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let start = self.0.data() + offset;
        if start + N > self.0.data_end() {
            return None;
        }
        Some(unsafe { ptr::read_unaligned(start as *const [u8; N]) })
    }
}

/// A kernel hash map seen through the core's table interface.
struct KernelTable<K: 'static>(&'static HashMap<K, FlowStats>);

impl<K: 'static> FlowTable<K> for KernelTable<K> {
    type Entry<'a> = &'a FlowCounters where Self: 'a;

    #[inline(always)]
    fn lookup(&self, key: &K) -> Option<&FlowCounters> {
        let value = self.0.get_ptr_mut(key)?;
        // Map values are only ever touched through FlowCounters' atomics.
        Some(unsafe { FlowCounters::from_ptr(value) })
    }

    #[inline(always)]
    fn insert_if_absent(&self, key: &K, seed: &FlowStats) -> InsertOutcome {
        match self.0.insert(key, seed, BPF_NOEXIST as u64) {
            Ok(()) => InsertOutcome::Inserted,
            Err(errno) if errno == -EEXIST => InsertOutcome::AlreadyPresent,
            // -E2BIG once max_entries is reached.
            Err(_) => InsertOutcome::CapacityExceeded,
        }
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
