//! Cross-process gather and the per-section statistics for the report.
//!
//! After the thread merge every rank holds its process-level totals. The
//! aggregator all-gathers the derived metric vector into a rank-major
//! P x S matrix, all-gathers the scalar triple {time, operations,
//! calls}, reduces the whole-run call count, and computes the mean and
//! sample standard deviation used by the report, plus the straggler
//! maximum for COMMUNICATION sections. Collective failures are fatal and
//! handled by the caller.

use crate::error::CollectiveError;
use crate::hwpc::{self, HwpcContext};
use crate::watch::{SectionWatch, WorkKind};
use crate::world::Collectives;

/// One thread's line of the FULL-report breakdown.
#[derive(Debug, Clone)]
pub(crate) struct ThreadLine {
    pub calls: u64,
    pub time: f64,
    pub headline: f64,
}

/// Everything the report needs for one section, gathered on every rank.
#[derive(Debug, Clone)]
pub(crate) struct SectionReport {
    pub id: usize,
    pub label: String,
    pub kind: WorkKind,
    pub exclusive: bool,
    pub in_parallel: bool,
    pub healthy: bool,
    /// Per-rank elapsed seconds.
    pub times: Vec<f64>,
    /// Per-rank operation volume (measured events, or user flop when
    /// nothing was measured).
    pub ops: Vec<f64>,
    /// Per-rank call counts.
    pub calls: Vec<f64>,
    /// Whole-run call count, reduced across ranks.
    pub total_calls: f64,
    pub time_mean: f64,
    pub time_sd: f64,
    pub time_max: f64,
    pub ops_mean: f64,
    pub ops_sd: f64,
    /// Rank-major P x S matrix of derived vectors, when measuring.
    pub hwpc: Option<Vec<f64>>,
    /// This rank's process-level derived vector.
    pub sorted: Vec<f64>,
    /// This rank's average power draw over the section, watts.
    pub watts: f64,
    /// This rank's per-thread breakdown.
    pub threads: Vec<ThreadLine>,
}

/// The gathered data behind one report. Computed once per run; later
/// `report` calls re-render the same data.
#[derive(Debug, Clone)]
pub(crate) struct ReportData {
    /// All sections including Root (ID 0), in rendering order.
    pub sections: Vec<SectionReport>,
    /// Anomalies worth a line in the header (force-stopped sections).
    pub notes: Vec<String>,
}

/// Arithmetic mean; 0 for an empty slice.
pub(crate) fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Sample standard deviation; 0 unless N > 1.
pub(crate) fn stddev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Gather one merged section across the process group.
pub(crate) fn gather_section(
    watch: &SectionWatch,
    hwpc: &HwpcContext,
    world: &dyn Collectives,
) -> Result<SectionReport, CollectiveError> {
    let (totals_time, totals_flop, totals_calls, sorted) = {
        let totals = watch.totals.lock().unwrap();
        (
            totals.time,
            totals.flop,
            totals.calls,
            totals.sorted.clone(),
        )
    };

    // The operation volume is the measured quantity when counters ran;
    // a run without usable counters falls back to the user declaration.
    let measured = hwpc::volume(hwpc.chooser(), &sorted);
    let local_ops = if measured > 0.0 { measured } else { totals_flop };

    let matrix = if hwpc.measuring() {
        Some(world.all_gather(&sorted)?)
    } else {
        None
    };

    let scalars = world.all_gather(&[totals_time, local_ops, totals_calls as f64])?;
    let ranks = world.size();
    let mut times = Vec::with_capacity(ranks);
    let mut ops = Vec::with_capacity(ranks);
    let mut calls = Vec::with_capacity(ranks);
    for r in 0..ranks {
        times.push(scalars[r * 3]);
        ops.push(scalars[r * 3 + 1]);
        calls.push(scalars[r * 3 + 2]);
    }
    let total_calls = world.reduce_sum(totals_calls as f64)?;

    let watts = {
        let energy = watch.energy.lock().unwrap();
        let joules: f64 = energy.joules.iter().sum();
        if totals_time > 0.0 {
            joules / totals_time
        } else {
            0.0
        }
    };

    let mut threads = Vec::with_capacity(watch.thread_count());
    for t in 0..watch.thread_count() {
        let row = watch.row(t);
        threads.push(ThreadLine {
            calls: row.calls,
            time: row.time,
            headline: row.sorted.last().copied().unwrap_or(0.0),
        });
    }

    Ok(SectionReport {
        id: watch.id,
        label: watch.label.clone(),
        kind: watch.kind(),
        exclusive: watch.exclusive(),
        in_parallel: watch.in_parallel(),
        healthy: watch.healthy(),
        time_mean: mean(&times),
        time_sd: stddev(&times),
        time_max: times.iter().cloned().fold(0.0, f64::max),
        ops_mean: mean(&ops),
        ops_sd: stddev(&ops),
        times,
        ops,
        calls,
        total_calls,
        hwpc: matrix,
        sorted,
        watts,
        threads,
    })
}

/// Order sections for rendering: descending mean time, stable on ties so
/// equal sections keep registration order. Root (ID 0) is kept in place
/// by the renderer, not here.
pub(crate) fn sort_for_report(sections: &mut Vec<SectionReport>) {
    sections.sort_by(|a, b| {
        b.time_mean
            .partial_cmp(&a.time_mean)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
