//! Hardware-counter adapter: chooser event tables, per-thread reads and
//! the derived-metric vectors.
//!
//! The chooser (from `HWPC_CHOOSER`) fixes three things at once: the raw
//! event set programmed on every thread, the layout of the sorted
//! derived-metric vector computed from the accumulated events, and the
//! unit of the headline rate in the vector's last slot.
//!
//! Events are either counted per compute core (summed across threads) or
//! shared across a core-memory group, in which case the value is read
//! once per cluster and prorated between the processes sharing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::warn;

use crate::config::{HwpcChooser, Topology};

pub mod backend;

pub use self::backend::{CounterBackend, NullBackend};

/// Cores per core-memory group on the modelled node.
pub const CORES_PER_CMG: usize = 12;

/// Core-memory groups per node.
pub const NODE_CMGS: usize = 4;

/// Peak floating-point operations per core per cycle.
pub const FLOP_PER_CYCLE: f64 = 32.0;

/// Assumed core clock when `/proc/cpuinfo` gives none.
pub const DEFAULT_CORE_HZ: f64 = 2.0e9;

bitflags! {
    /// Attributes of one raw event.
    pub struct EventFlags: u32 {
        /// Counted privately by each compute core; sums across threads.
        const PER_CORE = 0b0000_0001;
        /// Shared across a core-memory group; read once per cluster and
        /// prorated between the processes on the node.
        const PER_CMG  = 0b0000_0010;
        /// The value is floating-point operations.
        const FP_OPS   = 0b0000_0100;
        /// The value is bytes moved.
        const BYTES    = 0b0000_1000;
        /// Produced by vector (SIMD) instructions.
        const VECTOR   = 0b0001_0000;
        /// Cache hits at some level.
        const CACHE_HIT = 0b0010_0000;
        /// Load instructions.
        const LOAD     = 0b0100_0000;
        /// Store instructions.
        const STORE    = 0b1000_0000;
    }
}

/// One raw event in a chooser's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDesc {
    pub name: &'static str,
    pub flags: EventFlags,
}

impl EventDesc {
    fn new(name: &'static str, flags: EventFlags) -> EventDesc {
        EventDesc { name, flags }
    }
}

/// The raw event set a chooser programs. USER programs nothing.
pub fn event_table(chooser: HwpcChooser) -> Vec<EventDesc> {
    let core = EventFlags::PER_CORE;
    let cmg = EventFlags::PER_CMG;
    match chooser {
        HwpcChooser::Flops => vec![
            EventDesc::new("FP_OPS_SP", core | EventFlags::FP_OPS),
            EventDesc::new("FP_OPS_DP", core | EventFlags::FP_OPS),
        ],
        HwpcChooser::Bandwidth => vec![
            EventDesc::new("CMG_READ_BYTES", cmg | EventFlags::BYTES),
            EventDesc::new("CMG_WRITE_BYTES", cmg | EventFlags::BYTES),
        ],
        HwpcChooser::Vector => vec![
            EventDesc::new("FP_SCALAR_OPS", core | EventFlags::FP_OPS),
            EventDesc::new("FP_VECTOR_OPS", core | EventFlags::FP_OPS | EventFlags::VECTOR),
        ],
        HwpcChooser::Cache => vec![
            EventDesc::new("L1_HIT", core | EventFlags::CACHE_HIT),
            EventDesc::new("L2_HIT", core | EventFlags::CACHE_HIT),
            EventDesc::new("L2_MISS_DM", core),
        ],
        HwpcChooser::Cycle => vec![
            EventDesc::new("CYCLES", core),
            EventDesc::new("INSTRUCTIONS", core),
        ],
        HwpcChooser::LoadStore => vec![
            EventDesc::new("LOAD_INS", core | EventFlags::LOAD),
            EventDesc::new("STORE_INS", core | EventFlags::STORE),
            EventDesc::new("VEC_LOAD_INS", core | EventFlags::LOAD | EventFlags::VECTOR),
            EventDesc::new("VEC_STORE_INS", core | EventFlags::STORE | EventFlags::VECTOR),
        ],
        HwpcChooser::User => vec![],
    }
}

/// Labels of the derived-vector slots, in order. The last slot is always
/// the headline rate.
pub fn slot_names(chooser: HwpcChooser) -> &'static [&'static str] {
    match chooser {
        HwpcChooser::Flops => &["FP total", "Peak %", "Flops"],
        HwpcChooser::Bandwidth => &["Read B", "Write B", "Total B", "B/s"],
        HwpcChooser::Vector => &["Scalar ops", "Vector ops", "Vector %", "Flops"],
        HwpcChooser::Cache => &["L1 hits", "L2 hits", "Accesses", "Hit %"],
        HwpcChooser::Cycle => &["Cycles/thread", "Instructions", "Ins/cyc"],
        HwpcChooser::LoadStore => &["Loads", "Stores", "Vector %", "Ops/s"],
        HwpcChooser::User => &["User flop", "Flops"],
    }
}

/// Number of derived-vector slots.
pub fn slot_count(chooser: HwpcChooser) -> usize {
    slot_names(chooser).len()
}

/// Unit suffix of the headline rate.
pub fn unit(chooser: HwpcChooser) -> &'static str {
    match chooser {
        HwpcChooser::Flops | HwpcChooser::Vector | HwpcChooser::User => "Flops",
        HwpcChooser::Bandwidth => "B/s",
        HwpcChooser::Cache => "%",
        HwpcChooser::Cycle => "Ins/cyc",
        HwpcChooser::LoadStore => "Ops/s",
    }
}

/// Inputs of the derived-vector computation for one scope (a thread row
/// or the merged process totals).
#[derive(Debug, Clone, Copy)]
pub struct DeriveInput<'a> {
    /// Accumulated event deltas, in table order.
    pub accum: &'a [f64],
    /// Elapsed seconds in the same scope.
    pub time: f64,
    /// User-declared flop, consumed by the USER chooser only.
    pub user_flop: f64,
    /// Threads contributing to `accum`.
    pub threads: usize,
    /// Core clock in Hz, for the peak percentage.
    pub core_hz: f64,
}

fn sum_flagged(accum: &[f64], events: &[EventDesc], flag: EventFlags) -> f64 {
    accum
        .iter()
        .zip(events.iter())
        .filter(|(_, e)| e.flags.contains(flag))
        .map(|(v, _)| *v)
        .sum()
}

fn rate(value: f64, time: f64) -> f64 {
    if time > 0.0 {
        value / time
    } else {
        0.0
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

/// Compute the sorted derived-metric vector for one chooser.
pub fn derive_sorted(
    chooser: HwpcChooser,
    events: &[EventDesc],
    input: &DeriveInput<'_>,
) -> Vec<f64> {
    let threads = input.threads.max(1) as f64;
    match chooser {
        HwpcChooser::Flops => {
            let total = sum_flagged(input.accum, events, EventFlags::FP_OPS);
            let flops = rate(total, input.time);
            let peak = input.core_hz * FLOP_PER_CYCLE * threads;
            vec![total, percent(flops, peak), flops]
        }
        HwpcChooser::Bandwidth => {
            let read = input.accum.get(0).copied().unwrap_or(0.0);
            let write = input.accum.get(1).copied().unwrap_or(0.0);
            let total = sum_flagged(input.accum, events, EventFlags::BYTES);
            vec![read, write, total, rate(total, input.time)]
        }
        HwpcChooser::Vector => {
            let scalar = input.accum.get(0).copied().unwrap_or(0.0);
            let vector = sum_flagged(input.accum, events, EventFlags::VECTOR);
            let total = sum_flagged(input.accum, events, EventFlags::FP_OPS);
            vec![scalar, vector, percent(vector, total), rate(total, input.time)]
        }
        HwpcChooser::Cache => {
            let l1 = input.accum.get(0).copied().unwrap_or(0.0);
            let l2 = input.accum.get(1).copied().unwrap_or(0.0);
            let miss = input.accum.get(2).copied().unwrap_or(0.0);
            let hits = sum_flagged(input.accum, events, EventFlags::CACHE_HIT);
            let accesses = hits + miss;
            vec![l1, l2, accesses, percent(hits, accesses)]
        }
        HwpcChooser::Cycle => {
            let cycles = input.accum.get(0).copied().unwrap_or(0.0);
            let ins = input.accum.get(1).copied().unwrap_or(0.0);
            let ipc = if cycles > 0.0 { ins / cycles } else { 0.0 };
            vec![cycles / threads, ins, ipc]
        }
        HwpcChooser::LoadStore => {
            let loads = sum_flagged(input.accum, events, EventFlags::LOAD);
            let stores = sum_flagged(input.accum, events, EventFlags::STORE);
            let vector = sum_flagged(input.accum, events, EventFlags::VECTOR);
            let ops = loads + stores;
            vec![loads, stores, percent(vector, ops), rate(ops, input.time)]
        }
        HwpcChooser::User => vec![input.user_flop, rate(input.user_flop, input.time)],
    }
}

/// The total measured quantity behind a derived vector: the volume the
/// report's operations column shows and divides per call.
pub fn volume(chooser: HwpcChooser, sorted: &[f64]) -> f64 {
    let slot = |i: usize| sorted.get(i).copied().unwrap_or(0.0);
    match chooser {
        HwpcChooser::Flops | HwpcChooser::User => slot(0),
        HwpcChooser::Bandwidth | HwpcChooser::Cache => slot(2),
        HwpcChooser::Vector | HwpcChooser::LoadStore => slot(0) + slot(1),
        HwpcChooser::Cycle => slot(1),
    }
}

/// Which node-global clusters this process accounts for, with the weight
/// each contributes.
///
/// With up to one process per cluster, every process owns an integer
/// number of clusters and any leftover cluster is shared by all node
/// ranks at weight `1/node_procs`. With more processes than clusters a
/// process accounts for exactly one cluster at weight `1/sharers`.
pub fn cmg_weights(node_procs: usize, rank_on_node: usize, cmgs: usize) -> Vec<(usize, f64)> {
    if node_procs <= cmgs {
        let base = cmgs / node_procs;
        let mut weights = Vec::with_capacity(base + 1);
        let first = rank_on_node * base;
        for c in first..first + base {
            weights.push((c, 1.0));
        }
        for c in node_procs * base..cmgs {
            weights.push((c, 1.0 / node_procs as f64));
        }
        weights
    } else {
        let cmg = rank_on_node * cmgs / node_procs;
        let sharers = (0..node_procs)
            .filter(|q| q * cmgs / node_procs == cmg)
            .count();
        vec![(cmg, 1.0 / sharers as f64)]
    }
}

/// Per-process HWPC state: the chooser, the bound event set and the
/// per-thread bind/degrade bookkeeping.
pub struct HwpcContext {
    chooser: HwpcChooser,
    events: Vec<EventDesc>,
    backend: Arc<dyn CounterBackend>,
    threads: usize,
    core_hz: f64,
    topology: Option<Topology>,
    bound: Vec<AtomicBool>,
    degraded: Vec<AtomicBool>,
    topology_warned: AtomicBool,
    affinity_warned: AtomicBool,
}

impl HwpcContext {
    pub fn new(
        chooser: HwpcChooser,
        backend: Arc<dyn CounterBackend>,
        threads: usize,
        core_hz: Option<f64>,
        topology: Option<Topology>,
    ) -> HwpcContext {
        let events = event_table(chooser);
        HwpcContext {
            chooser,
            events,
            backend,
            threads,
            core_hz: core_hz.unwrap_or(DEFAULT_CORE_HZ),
            topology,
            bound: (0..threads).map(|_| AtomicBool::new(false)).collect(),
            degraded: (0..threads).map(|_| AtomicBool::new(false)).collect(),
            topology_warned: AtomicBool::new(false),
            affinity_warned: AtomicBool::new(false),
        }
    }

    pub fn chooser(&self) -> HwpcChooser {
        self.chooser
    }

    pub fn events(&self) -> &[EventDesc] {
        &self.events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn slot_count(&self) -> usize {
        slot_count(self.chooser)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// True when the derived vector carries measured events (anything but
    /// USER with all threads degraded is non-trivial).
    pub fn measuring(&self) -> bool {
        !self.events.is_empty()
    }

    /// Snapshot this thread's counters, binding the event set on first
    /// touch. `None` when nothing is programmed or the thread has been
    /// degraded to zero HWPC.
    pub fn read_now(&self, thread: usize) -> Option<Vec<u64>> {
        self.snapshot(thread, false)
    }

    /// Snapshot at a bracket close, through the back-end's stop/start
    /// pair for contexts that cannot read a running counter. Counters
    /// keep running afterwards either way.
    pub fn read_at_stop(&self, thread: usize) -> Option<Vec<u64>> {
        self.snapshot(thread, true)
    }

    fn snapshot(&self, thread: usize, at_stop: bool) -> Option<Vec<u64>> {
        if self.events.is_empty() || thread >= self.threads {
            return None;
        }
        if self.degraded[thread].load(Ordering::Relaxed) {
            return None;
        }
        if !self.bound[thread].swap(true, Ordering::Relaxed) {
            if let Err(e) = self.backend.bind_events(thread, &self.events) {
                self.degrade(thread, &e);
                return None;
            }
        }
        let mut values = vec![0u64; self.events.len()];
        let read = if at_stop {
            self.backend
                .stop(thread, &mut values)
                .and_then(|()| self.backend.start(thread, &values))
        } else {
            self.backend.read(thread, &mut values)
        };
        match read {
            Ok(()) => Some(values),
            Err(e) => {
                self.degrade(thread, &e);
                None
            }
        }
    }

    fn degrade(&self, thread: usize, reason: &crate::error::HwpcError) {
        warn!(
            "thread {} keeps zero HWPC values for this run: {}",
            thread, reason
        );
        self.degraded[thread].store(true, Ordering::Relaxed);
    }

    /// The node-global cluster a local thread belongs to, assuming packed
    /// affinity.
    fn thread_cmg(&self, thread: usize) -> usize {
        let core = match self.topology {
            Some(t) => t.rank_on_node * self.threads + thread,
            None => thread,
        };
        (core / CORES_PER_CMG) % NODE_CMGS
    }

    /// Merge per-thread accumulations into the process-level value for
    /// each event, honouring the per-event sharing policy.
    pub fn merge_rows(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let mut merged = vec![0.0; self.events.len()];
        for (e, desc) in self.events.iter().enumerate() {
            if desc.flags.contains(EventFlags::PER_CMG) {
                merged[e] = self.merge_shared_event(rows, e);
            } else {
                merged[e] = rows.iter().map(|r| r[e]).sum();
            }
        }
        merged
    }

    fn merge_shared_event(&self, rows: &[Vec<f64>], e: usize) -> f64 {
        // One observation per cluster: threads on the same CMG read the
        // same shared counter, so the first local thread of each cluster
        // is its reader.
        let mut observed: Vec<Option<f64>> = vec![None; NODE_CMGS];
        for (t, row) in rows.iter().enumerate() {
            let c = self.thread_cmg(t);
            if observed[c].is_none() {
                observed[c] = Some(row[e]);
            }
        }
        match self.topology {
            Some(topo) => {
                // The reader index above follows physical core packing;
                // the weights follow the logical cluster split. The two
                // agree only when the node is fully subscribed, so an
                // accounted cluster can otherwise have no reading and
                // contributes zero.
                if topo.node_procs * self.threads != CORES_PER_CMG * NODE_CMGS
                    && !self.affinity_warned.swap(true, Ordering::Relaxed)
                {
                    warn!(
                        "{} process(es) x {} thread(s) does not fill the node's {} cores; \
                         unread per-CMG clusters are prorated as zero",
                        topo.node_procs,
                        self.threads,
                        CORES_PER_CMG * NODE_CMGS
                    );
                }
                cmg_weights(topo.node_procs, topo.rank_on_node, NODE_CMGS)
                    .into_iter()
                    .map(|(c, w)| w * observed.get(c).copied().flatten().unwrap_or(0.0))
                    .sum()
            }
            None => {
                if !self.topology_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "no node topology hints; per-CMG counters are summed without proration"
                    );
                }
                observed.iter().flatten().sum()
            }
        }
    }

    /// The derived vector for one scope.
    pub fn derive(&self, accum: &[f64], time: f64, user_flop: f64, threads: usize) -> Vec<f64> {
        derive_sorted(
            self.chooser,
            &self.events,
            &DeriveInput {
                accum,
                time,
                user_flop,
                threads,
                core_hz: self.core_hz,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_and_slots_are_consistent() {
        for c in &[
            HwpcChooser::Flops,
            HwpcChooser::Bandwidth,
            HwpcChooser::Vector,
            HwpcChooser::Cache,
            HwpcChooser::Cycle,
            HwpcChooser::LoadStore,
            HwpcChooser::User,
        ] {
            assert_eq!(slot_names(*c).len(), slot_count(*c));
            assert!(slot_count(*c) >= 2 || *c == HwpcChooser::User);
        }
        assert!(event_table(HwpcChooser::User).is_empty());
    }

    #[test]
    fn flops_vector_has_rate_last() {
        let events = event_table(HwpcChooser::Flops);
        let accum = [3.0e9, 1.0e9];
        let v = derive_sorted(
            HwpcChooser::Flops,
            &events,
            &DeriveInput {
                accum: &accum,
                time: 2.0,
                user_flop: 0.0,
                threads: 4,
                core_hz: 2.0e9,
            },
        );
        assert_eq!(v.len(), 3);
        assert!((v[0] - 4.0e9).abs() < 1.0);
        assert!((v[2] - 2.0e9).abs() < 1.0);
        // peak = 2e9 * 32 * 4 = 256e9, rate 2e9 -> 0.78125 %
        assert!((v[1] - 0.78125).abs() < 1e-9);
    }

    #[test]
    fn bandwidth_vector_sums_bytes() {
        let events = event_table(HwpcChooser::Bandwidth);
        let accum = [6.0e8, 2.0e8];
        let v = derive_sorted(
            HwpcChooser::Bandwidth,
            &events,
            &DeriveInput {
                accum: &accum,
                time: 0.5,
                user_flop: 0.0,
                threads: 1,
                core_hz: 2.0e9,
            },
        );
        assert_eq!(v, vec![6.0e8, 2.0e8, 8.0e8, 1.6e9]);
    }

    #[test]
    fn cache_vector_reports_hit_percentage() {
        let events = event_table(HwpcChooser::Cache);
        let accum = [70.0, 20.0, 10.0];
        let v = derive_sorted(
            HwpcChooser::Cache,
            &events,
            &DeriveInput {
                accum: &accum,
                time: 1.0,
                user_flop: 0.0,
                threads: 1,
                core_hz: 2.0e9,
            },
        );
        assert_eq!(v[2], 100.0);
        assert!((v[3] - 90.0).abs() < 1e-12);
    }

    #[test]
    fn user_vector_is_flop_over_time() {
        let v = derive_sorted(
            HwpcChooser::User,
            &[],
            &DeriveInput {
                accum: &[],
                time: 2.0,
                user_flop: 1.0e9,
                threads: 1,
                core_hz: 2.0e9,
            },
        );
        assert_eq!(v, vec![1.0e9, 5.0e8]);
    }

    #[test]
    fn zero_time_never_divides() {
        let events = event_table(HwpcChooser::LoadStore);
        let accum = [1.0, 2.0, 3.0, 4.0];
        let v = derive_sorted(
            HwpcChooser::LoadStore,
            &events,
            &DeriveInput {
                accum: &accum,
                time: 0.0,
                user_flop: 0.0,
                threads: 1,
                core_hz: 2.0e9,
            },
        );
        assert_eq!(*v.last().unwrap(), 0.0);
    }

    #[test]
    fn volume_is_the_total_quantity_slot() {
        assert_eq!(volume(HwpcChooser::Flops, &[7.0, 1.0, 3.5]), 7.0);
        assert_eq!(volume(HwpcChooser::Bandwidth, &[1.0, 2.0, 3.0, 6.0]), 3.0);
        assert_eq!(volume(HwpcChooser::Vector, &[2.0, 8.0, 80.0, 5.0]), 10.0);
        assert_eq!(volume(HwpcChooser::Cycle, &[100.0, 250.0, 2.5]), 250.0);
        assert_eq!(volume(HwpcChooser::User, &[9.0, 4.5]), 9.0);
    }

    #[test]
    fn owned_clusters_with_few_ranks() {
        // 2 ranks on a 4-cluster node: two clusters each, no sharing.
        assert_eq!(cmg_weights(2, 0, 4), vec![(0, 1.0), (1, 1.0)]);
        assert_eq!(cmg_weights(2, 1, 4), vec![(2, 1.0), (3, 1.0)]);
    }

    #[test]
    fn leftover_cluster_is_shared_by_all() {
        // 3 ranks, 4 clusters: one owned each plus a third of cluster 3.
        for r in 0..3 {
            let w = cmg_weights(3, r, 4);
            assert_eq!(w.len(), 2);
            assert_eq!(w[0], (r, 1.0));
            assert_eq!(w[1].0, 3);
            assert!((w[1].1 - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn crowded_node_splits_single_cluster() {
        // 8 ranks, 4 clusters: pairs share one cluster at half weight.
        for r in 0..8 {
            let w = cmg_weights(8, r, 4);
            assert_eq!(w, vec![(r / 2, 0.5)]);
        }
        // 6 ranks, 4 clusters: sharer counts are either 2 or 1.
        let total: f64 = (0..6).map(|r| cmg_weights(6, r, 4)[0].1).sum();
        assert!((total - 4.0).abs() < 1e-12);
    }

    #[test]
    fn per_core_events_sum_across_threads() {
        let ctx = HwpcContext::new(
            HwpcChooser::Flops,
            Arc::new(NullBackend),
            4,
            Some(2.0e9),
            None,
        );
        let rows = vec![
            vec![10.0, 1.0],
            vec![20.0, 2.0],
            vec![30.0, 3.0],
            vec![40.0, 4.0],
        ];
        assert_eq!(ctx.merge_rows(&rows), vec![100.0, 10.0]);
    }

    #[test]
    fn per_cmg_events_read_once_per_cluster() {
        // 13 threads span two clusters; threads 0..12 share one reading,
        // thread 12 provides the second cluster's.
        let ctx = HwpcContext::new(
            HwpcChooser::Bandwidth,
            Arc::new(NullBackend),
            13,
            Some(2.0e9),
            None,
        );
        let mut rows = vec![vec![500.0, 100.0]; 13];
        rows[12] = vec![700.0, 300.0];
        assert_eq!(ctx.merge_rows(&rows), vec![1200.0, 400.0]);
    }

    #[test]
    fn per_cmg_events_prorated_with_topology() {
        // 8 ranks per node: this rank's cluster is shared by a pair.
        let ctx = HwpcContext::new(
            HwpcChooser::Bandwidth,
            Arc::new(NullBackend),
            4,
            Some(2.0e9),
            Some(Topology {
                node_procs: 8,
                rank_on_node: 0,
            }),
        );
        let rows = vec![vec![1000.0, 0.0]; 4];
        assert_eq!(ctx.merge_rows(&rows)[0], 500.0);
    }
}
