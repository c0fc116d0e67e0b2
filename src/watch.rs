//! Per-section measurement records.
//!
//! A [`SectionWatch`] owns one row per thread. Row `t` is written only in
//! thread-`t` context — by the thread itself inside a parallel region, or
//! by the fan-out closure running as thread `t` around a serial-region
//! bracket — so rows never contend. Process-level totals are filled in by
//! the thread merge and only ever touched by the master thread.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

/// What a section spends its time on. COMMUNICATION sections additionally
/// get a straggler (max-across-ranks) statistic in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkKind {
    Computation = 0,
    Communication = 1,
}

impl WorkKind {
    fn from_u8(v: u8) -> WorkKind {
        match v {
            1 => WorkKind::Communication,
            _ => WorkKind::Computation,
        }
    }
}

/// One thread's private slice of a section.
#[derive(Debug, Clone)]
pub(crate) struct ThreadRow {
    /// Between start and stop right now.
    pub running: bool,
    pub start_time: f64,
    /// Counter snapshot taken at the last start, in event-table order.
    pub start_values: Vec<u64>,
    /// Accumulated counter deltas over all completed pairs.
    pub accum: Vec<u64>,
    /// Accumulated elapsed seconds.
    pub time: f64,
    /// Completed start/stop pairs.
    pub calls: u64,
    /// User-declared flop.
    pub flop: f64,
    /// Derived metric vector for this thread, filled by the merge.
    pub sorted: Vec<f64>,
}

impl ThreadRow {
    fn new(events: usize, slots: usize) -> ThreadRow {
        ThreadRow {
            running: false,
            start_time: 0.0,
            start_values: vec![0; events],
            accum: vec![0; events],
            time: 0.0,
            calls: 0,
            flop: 0.0,
            sorted: vec![0.0; slots],
        }
    }

    fn zero(&mut self) {
        self.running = false;
        self.start_time = 0.0;
        for v in self.start_values.iter_mut() {
            *v = 0;
        }
        for v in self.accum.iter_mut() {
            *v = 0;
        }
        self.time = 0.0;
        self.calls = 0;
        self.flop = 0.0;
        for v in self.sorted.iter_mut() {
            *v = 0.0;
        }
    }
}

/// Process-level aggregation of a section, valid once `threads_merged`.
#[derive(Debug, Clone)]
pub(crate) struct Totals {
    /// Merged event accumulation, after the per-event sharing policy.
    pub accum: Vec<f64>,
    /// Derived metric vector over the merged accumulation.
    pub sorted: Vec<f64>,
    pub time: f64,
    pub calls: u64,
    pub flop: f64,
}

impl Totals {
    fn new(events: usize, slots: usize) -> Totals {
        Totals {
            accum: vec![0.0; events],
            sorted: vec![0.0; slots],
            time: 0.0,
            calls: 0,
            flop: 0.0,
        }
    }

    fn zero(&mut self) {
        for v in self.accum.iter_mut() {
            *v = 0.0;
        }
        for v in self.sorted.iter_mut() {
            *v = 0.0;
        }
        self.time = 0.0;
        self.calls = 0;
        self.flop = 0.0;
    }
}

/// Joule snapshots per measured node part.
#[derive(Debug, Clone)]
pub(crate) struct EnergyRow {
    pub at_start: Vec<f64>,
    pub joules: Vec<f64>,
}

/// Outcome of a start transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BeginOutcome {
    Started,
    /// The row was already running: the old interval is discarded and a
    /// fresh one begins. Mis-pair, caller warns.
    Restarted,
}

/// Outcome of a stop transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum EndOutcome {
    Stopped { elapsed: f64 },
    /// The row was idle: the stop is dropped. Mis-pair, caller warns.
    NotRunning,
}

pub(crate) struct SectionWatch {
    /// The authoritative shared ID.
    pub id: usize,
    pub label: String,
    kind: AtomicU8,
    exclusive: AtomicBool,
    in_parallel: AtomicBool,
    healthy: AtomicBool,
    threads_merged: AtomicBool,
    rows: Vec<Mutex<ThreadRow>>,
    pub totals: Mutex<Totals>,
    pub energy: Mutex<EnergyRow>,
}

impl SectionWatch {
    pub fn new(
        id: usize,
        label: &str,
        threads: usize,
        events: usize,
        slots: usize,
        power_parts: usize,
    ) -> SectionWatch {
        SectionWatch {
            id,
            label: label.to_string(),
            kind: AtomicU8::new(WorkKind::Computation as u8),
            exclusive: AtomicBool::new(true),
            in_parallel: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            threads_merged: AtomicBool::new(false),
            rows: (0..threads)
                .map(|_| Mutex::new(ThreadRow::new(events, slots)))
                .collect(),
            totals: Mutex::new(Totals::new(events, slots)),
            energy: Mutex::new(EnergyRow {
                at_start: vec![0.0; power_parts],
                joules: vec![0.0; power_parts],
            }),
        }
    }

    pub fn kind(&self) -> WorkKind {
        WorkKind::from_u8(self.kind.load(Ordering::Relaxed))
    }

    pub fn set_kind(&self, kind: WorkKind) {
        self.kind.store(kind as u8, Ordering::Relaxed);
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Relaxed)
    }

    pub fn set_exclusive(&self, v: bool) {
        self.exclusive.store(v, Ordering::Relaxed);
    }

    pub fn in_parallel(&self) -> bool {
        self.in_parallel.load(Ordering::Relaxed)
    }

    /// Sticks true once observed true.
    pub fn mark_in_parallel(&self) {
        self.in_parallel.store(true, Ordering::Relaxed);
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub fn threads_merged(&self) -> bool {
        self.threads_merged.load(Ordering::Relaxed)
    }

    pub fn set_threads_merged(&self, v: bool) {
        self.threads_merged.store(v, Ordering::Relaxed);
    }

    pub fn thread_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, t: usize) -> MutexGuard<'_, ThreadRow> {
        self.rows[t].lock().unwrap()
    }

    /// IDLE -> RUNNING on row `t`: capture the start time and the counter
    /// snapshot. A RUNNING row is restarted instead.
    pub fn begin(&self, t: usize, now: f64, snapshot: Option<&[u64]>) -> BeginOutcome {
        let mut row = self.row(t);
        let outcome = if row.running {
            BeginOutcome::Restarted
        } else {
            BeginOutcome::Started
        };
        row.running = true;
        row.start_time = now;
        if let Some(values) = snapshot {
            row.start_values.copy_from_slice(values);
        }
        outcome
    }

    /// Record the start snapshot on a non-master row during the serial
    /// fan-out. Does not touch the row's state machine.
    pub fn snapshot_row(&self, t: usize, values: &[u64]) {
        let mut row = self.row(t);
        row.start_values.copy_from_slice(values);
    }

    /// RUNNING -> IDLE on row `t`: accumulate elapsed time, the counter
    /// delta, the call and the user flop. A stop on an idle row is
    /// dropped.
    pub fn end(&self, t: usize, now: f64, values: Option<&[u64]>, flop_add: f64) -> EndOutcome {
        let mut row = self.row(t);
        if !row.running {
            return EndOutcome::NotRunning;
        }
        row.running = false;
        let elapsed = now - row.start_time;
        row.time += elapsed;
        row.calls += 1;
        row.flop += flop_add;
        if let Some(values) = values {
            accumulate(&mut row, values);
        }
        EndOutcome::Stopped { elapsed }
    }

    /// Accumulate the counter delta on a non-master row during the serial
    /// fan-out at stop.
    pub fn accumulate_row(&self, t: usize, values: &[u64]) {
        let mut row = self.row(t);
        accumulate(&mut row, values);
    }

    /// Is any row currently between start and stop?
    pub fn any_running(&self) -> bool {
        self.rows.iter().any(|r| r.lock().unwrap().running)
    }

    /// Close every running row at `now`, without a counter read, and mark
    /// the section unhealthy. Returns true when anything was running.
    pub fn force_stop(&self, now: f64) -> bool {
        let mut stopped = false;
        for r in &self.rows {
            let mut row = r.lock().unwrap();
            if row.running {
                row.running = false;
                let elapsed = now - row.start_time;
                row.time += elapsed;
                row.calls += 1;
                stopped = true;
            }
        }
        if stopped {
            self.mark_unhealthy();
        }
        stopped
    }

    /// Zero every accumulator; properties and flags other than the merge
    /// mark survive.
    pub fn reset(&self) {
        for r in &self.rows {
            r.lock().unwrap().zero();
        }
        self.totals.lock().unwrap().zero();
        let mut energy = self.energy.lock().unwrap();
        for v in energy.at_start.iter_mut() {
            *v = 0.0;
        }
        for v in energy.joules.iter_mut() {
            *v = 0.0;
        }
        self.set_threads_merged(false);
    }

    pub fn energy_begin(&self, now_joules: &[f64]) {
        let mut energy = self.energy.lock().unwrap();
        let n = energy.at_start.len().min(now_joules.len());
        for p in 0..n {
            energy.at_start[p] = now_joules[p];
        }
    }

    pub fn energy_end(&self, now_joules: &[f64]) {
        let mut energy = self.energy.lock().unwrap();
        let n = energy.joules.len().min(now_joules.len());
        for p in 0..n {
            let consumed = now_joules[p] - energy.at_start[p];
            energy.joules[p] += consumed;
        }
    }
}

fn accumulate(row: &mut ThreadRow, values: &[u64]) {
    let n = row.accum.len().min(values.len());
    for e in 0..n {
        let delta = values[e].wrapping_sub(row.start_values[e]);
        row.accum[e] = row.accum[e].wrapping_add(delta);
    }
}
