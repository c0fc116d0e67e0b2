//! Three-phase reduction of per-thread data into the master thread.
//!
//! Phase 1 runs serially on the master and seeds the process-scoped
//! scratch area with the master's row. Phase 2 runs where each thread's
//! private row is addressable — inside the fork-join fan-out — and copies
//! every other thread's row into its scratch slot; it is skipped for
//! sections that never executed inside a parallel region. Phase 3 runs
//! serially again: it copies the scratch back, computes the process-level
//! event accumulation under the sharing policy, sums the scalar
//! aggregates across rows, derives the process-level metric vector, marks
//! the section merged and zeroes the scratch. The fan-out join supplies
//! the barriers around phase 2.

use std::sync::Mutex;

use crate::hwpc::HwpcContext;
use crate::watch::SectionWatch;

/// One thread's slot in the scratch area.
#[derive(Debug, Clone)]
pub(crate) struct ScratchRow {
    pub calls: f64,
    pub time: f64,
    pub flop: f64,
    pub accum: Vec<f64>,
    pub sorted: Vec<f64>,
}

impl ScratchRow {
    fn new(events: usize, slots: usize) -> ScratchRow {
        ScratchRow {
            calls: 0.0,
            time: 0.0,
            flop: 0.0,
            accum: vec![0.0; events],
            sorted: vec![0.0; slots],
        }
    }

    fn zero(&mut self) {
        self.calls = 0.0;
        self.time = 0.0;
        self.flop = 0.0;
        for v in self.accum.iter_mut() {
            *v = 0.0;
        }
        for v in self.sorted.iter_mut() {
            *v = 0.0;
        }
    }
}

/// The cross-thread channel of the merge. One instance per process,
/// reused section after section; zeroed at the end of every phase 3.
pub(crate) struct Scratch {
    rows: Vec<ScratchRow>,
}

impl Scratch {
    pub fn new(threads: usize, events: usize, slots: usize) -> Scratch {
        Scratch {
            rows: (0..threads).map(|_| ScratchRow::new(events, slots)).collect(),
        }
    }

    pub fn zero(&mut self) {
        for r in self.rows.iter_mut() {
            r.zero();
        }
    }
}

fn copy_row_to_scratch(watch: &SectionWatch, scratch: &Mutex<Scratch>, t: usize, hwpc: &HwpcContext) {
    // Derive this thread's metric vector from its own accumulation, then
    // publish the whole row. The row lock is released before the scratch
    // lock is taken.
    let (calls, time, flop, accum, sorted) = {
        let mut row = watch.row(t);
        let accum_f: Vec<f64> = row.accum.iter().map(|&v| v as f64).collect();
        row.sorted = hwpc.derive(&accum_f, row.time, row.flop, 1);
        (
            row.calls as f64,
            row.time,
            row.flop,
            accum_f,
            row.sorted.clone(),
        )
    };
    let mut scratch = scratch.lock().unwrap();
    let slot = &mut scratch.rows[t];
    slot.calls = calls;
    slot.time = time;
    slot.flop = flop;
    slot.accum.copy_from_slice(&accum);
    slot.sorted.copy_from_slice(&sorted);
}

/// Phase 1: master-only, serial.
pub(crate) fn phase1_master(watch: &SectionWatch, scratch: &Mutex<Scratch>, hwpc: &HwpcContext) {
    copy_row_to_scratch(watch, scratch, 0, hwpc);
}

/// Phase 2: one call per non-master thread, from inside a parallel
/// construct (the fan-out, or the application's own region through
/// `merge_threads`).
pub(crate) fn phase2_thread(
    watch: &SectionWatch,
    scratch: &Mutex<Scratch>,
    t: usize,
    hwpc: &HwpcContext,
) {
    if t == 0 {
        return;
    }
    copy_row_to_scratch(watch, scratch, t, hwpc);
}

/// Phase 3: master-only, serial. Consumes the scratch.
pub(crate) fn phase3_master(watch: &SectionWatch, scratch: &Mutex<Scratch>, hwpc: &HwpcContext) {
    let threads = watch.thread_count();
    // Rows phase 2 never filled (serial-only sections) are not copied
    // back; their counter accumulation is read live instead.
    let copy_back = if watch.in_parallel() { threads } else { 1 };
    let merged_rows: Vec<ScratchRow> = {
        let scratch = scratch.lock().unwrap();
        scratch.rows[..copy_back].to_vec()
    };
    for (t, slot) in merged_rows.iter().enumerate() {
        watch.row(t).sorted.copy_from_slice(&slot.sorted);
    }

    // Whole-process accumulation, per-event sharing policy applied, plus
    // the scalar aggregates summed over every thread's slot.
    let mut rows_accum: Vec<Vec<f64>> = Vec::with_capacity(threads);
    let mut calls = 0u64;
    let mut time = 0.0;
    let mut flop = 0.0;
    let mut master_time = 0.0;
    let mut max_time: f64 = 0.0;
    for t in 0..threads {
        if let Some(slot) = merged_rows.get(t) {
            rows_accum.push(slot.accum.clone());
            calls += slot.calls as u64;
            time += slot.time;
            flop += slot.flop;
            if t == 0 {
                master_time = slot.time;
            }
            max_time = max_time.max(slot.time);
        } else {
            let row = watch.row(t);
            rows_accum.push(row.accum.iter().map(|&v| v as f64).collect());
            calls += row.calls;
            time += row.time;
            flop += row.flop;
            max_time = max_time.max(row.time);
        }
    }
    let merged = hwpc.merge_rows(&rows_accum);

    // Rates divide by the master's elapsed time when the bracket was
    // serial; a section run purely inside a region uses the slowest
    // thread instead. Summed thread time would overcount wall clock.
    let time_base = if master_time > 0.0 { master_time } else { max_time };
    let sorted = hwpc.derive(&merged, time_base, flop, threads);

    {
        let mut totals = watch.totals.lock().unwrap();
        totals.accum.copy_from_slice(&merged);
        totals.sorted = sorted;
        totals.calls = calls;
        totals.time = time;
        totals.flop = flop;
    }
    watch.set_threads_merged(true);
    scratch.lock().unwrap().zero();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HwpcChooser;
    use crate::hwpc::NullBackend;
    use std::sync::Arc;

    fn hwpc(threads: usize) -> HwpcContext {
        HwpcContext::new(
            HwpcChooser::Flops,
            Arc::new(NullBackend),
            threads,
            Some(2.0e9),
            None,
        )
    }

    #[test]
    fn merge_sums_rows_and_zeroes_scratch() {
        let hwpc = hwpc(2);
        let watch = SectionWatch::new(1, "m", 2, hwpc.event_count(), hwpc.slot_count(), 0);
        watch.mark_in_parallel();
        watch.begin(0, 0.0, Some(&[0, 0]));
        watch.end(0, 2.0, Some(&[600, 400]), 1.5);
        watch.begin(1, 0.0, Some(&[0, 0]));
        watch.end(1, 1.0, Some(&[100, 100]), 0.5);

        let scratch = Mutex::new(Scratch::new(2, hwpc.event_count(), hwpc.slot_count()));
        phase1_master(&watch, &scratch, &hwpc);
        phase2_thread(&watch, &scratch, 1, &hwpc);
        phase3_master(&watch, &scratch, &hwpc);

        assert!(watch.threads_merged());
        let totals = watch.totals.lock().unwrap();
        assert_eq!(totals.calls, 2);
        assert!((totals.time - 3.0).abs() < 1e-12);
        assert!((totals.flop - 2.0).abs() < 1e-12);
        assert_eq!(totals.accum, vec![700.0, 500.0]);
        // Master bracket was 2.0 s: 1200 flop / 2 s.
        assert!((totals.sorted[2] - 600.0).abs() < 1e-9);
        drop(totals);

        let scratch = scratch.lock().unwrap();
        assert!(scratch.rows.iter().all(|r| r.calls == 0.0 && r.time == 0.0));
    }

    #[test]
    fn serial_section_merges_master_row_only() {
        let hwpc = hwpc(2);
        let watch = SectionWatch::new(2, "s", 2, hwpc.event_count(), hwpc.slot_count(), 0);
        watch.begin(0, 0.0, Some(&[0, 0]));
        watch.end(0, 1.0, Some(&[100, 0]), 0.0);
        // Fan-out accumulation on the other row, no scalar activity there.
        watch.snapshot_row(1, &[10, 0]);
        watch.accumulate_row(1, &[30, 0]);

        let scratch = Mutex::new(Scratch::new(2, hwpc.event_count(), hwpc.slot_count()));
        phase1_master(&watch, &scratch, &hwpc);
        phase3_master(&watch, &scratch, &hwpc);

        let totals = watch.totals.lock().unwrap();
        assert_eq!(totals.calls, 1);
        assert!((totals.time - 1.0).abs() < 1e-12);
        // Per-core event: both rows contribute.
        assert_eq!(totals.accum[0], 120.0);
    }
}
