//! Fixed-column text rendering of the gathered statistics.
//!
//! Three levels: BASIC prints the per-section summary table, DETAIL adds
//! per-rank breakdowns, FULL adds the local per-thread breakdown and the
//! HWPC/power legend. Inclusive sections are marked `(*)`, sections that
//! ran inside a parallel region `(+)`, force-stopped sections `(!)`.

use std::io;

use chrono::Local;

use crate::config::{ReportLevel, RunConfig};
use crate::gather::{ReportData, SectionReport};
use crate::hwpc::{self, HwpcContext};
use crate::power::PowerContext;
use crate::watch::WorkKind;
use crate::world::Collectives;

/// Engineering scaling for the rate columns. Percentages and ratios are
/// printed as they are.
fn scaled(value: f64, unit: &str) -> String {
    if unit.contains('%') || unit.contains("/cyc") {
        return format!("{:10.3} {}", value, unit);
    }
    let (v, prefix) = if value.abs() >= 1.0e12 {
        (value / 1.0e12, "T")
    } else if value.abs() >= 1.0e9 {
        (value / 1.0e9, "G")
    } else if value.abs() >= 1.0e6 {
        (value / 1.0e6, "M")
    } else if value.abs() >= 1.0e3 {
        (value / 1.0e3, "K")
    } else {
        (value, "")
    };
    format!("{:10.3} {}{}", v, prefix, unit)
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..len]) {
                return name.to_string();
            }
        }
    }
    "unknown".to_string()
}

fn parallel_mode(ranks: usize, threads: usize) -> &'static str {
    match (ranks > 1, threads > 1) {
        (true, true) => "Hybrid",
        (true, false) => "Process parallel",
        (false, true) => "Thread parallel",
        (false, false) => "Serial",
    }
}

fn marks(section: &SectionReport) -> String {
    let mut label = section.label.clone();
    if !section.exclusive {
        label.push_str(" (*)");
    }
    if section.in_parallel {
        label.push_str(" (+)");
    }
    if !section.healthy {
        label.push_str(" (!)");
    }
    label
}

/// Mean of the headline (last) slot over the gathered P x S matrix, or
/// the local vector when nothing was gathered.
fn headline_mean(section: &SectionReport, slots: usize) -> f64 {
    match &section.hwpc {
        Some(matrix) if slots > 0 => {
            let ranks = matrix.len() / slots;
            let sum: f64 = (0..ranks).map(|r| matrix[r * slots + slots - 1]).sum();
            if ranks > 0 {
                sum / ranks as f64
            } else {
                0.0
            }
        }
        _ => section.sorted.last().copied().unwrap_or(0.0),
    }
}

pub(crate) fn render(
    out: &mut dyn io::Write,
    data: &ReportData,
    cfg: &RunConfig,
    hwpc: &HwpcContext,
    power: &PowerContext,
    world: &dyn Collectives,
    threads: usize,
) -> io::Result<()> {
    let ranks = world.size();
    let unit = hwpc::unit(hwpc.chooser());
    let slots = hwpc.slot_count();
    let root_time = data
        .sections
        .iter()
        .find(|s| s.id == 0)
        .map(|s| s.time_mean)
        .unwrap_or(0.0);

    writeln!(
        out,
        "# PMlib report ------------------------------------------------------- #"
    )?;
    writeln!(
        out,
        "Printed at {} on host '{}'",
        Local::now().format("%Y/%m/%d %H:%M:%S"),
        hostname()
    )?;
    writeln!(
        out,
        "Parallel mode: {} ({} processes x {} threads), HWPC: {}",
        parallel_mode(ranks, threads),
        ranks,
        threads,
        hwpc.chooser().name()
    )?;
    writeln!(out, "Environment:   {}", cfg.summary())?;
    writeln!(out, "Total execution time (Root): {:.6} [s]", root_time)?;
    if !data.notes.is_empty() {
        writeln!(out, "Notes:")?;
        for note in &data.notes {
            writeln!(out, "  {}", note)?;
        }
    }
    writeln!(out)?;

    writeln!(
        out,
        "Sections, ordered by mean time over {} rank(s); \
         (*) inclusive, (+) in parallel, (!) unhealthy",
        ranks
    )?;
    writeln!(
        out,
        "  {:<28}{:>9}{:>12}{:>8}{:>12}{:>11}{:>12}{:>11}{:>16}{:>12}",
        "Label",
        "calls",
        "time[s]",
        "t[%]",
        "t/call[s]",
        "t-sd[s]",
        "volume",
        "vol-sd",
        "rate",
        "max[s]"
    )?;

    let mut sum_time = 0.0;
    let mut sum_volume = 0.0;
    for section in data.sections.iter().filter(|s| s.id != 0) {
        let calls_mean = crate::gather::mean(&section.calls).round();
        let per_call = if calls_mean > 0.0 {
            section.time_mean / calls_mean
        } else {
            0.0
        };
        let percent = if root_time > 0.0 {
            section.time_mean / root_time * 100.0
        } else {
            0.0
        };
        let straggler = match section.kind {
            WorkKind::Communication => format!("{:>11.6}", section.time_max),
            WorkKind::Computation => format!("{:>11}", "-"),
        };
        writeln!(
            out,
            "  {:<28}{:>9}{:>12.6}{:>8.1}{:>12.3e}{:>11.3e}{:>12.3e}{:>11.3e}{:>16} {}",
            marks(section),
            calls_mean as u64,
            section.time_mean,
            percent,
            per_call,
            section.time_sd,
            section.ops_mean,
            section.ops_sd,
            scaled(headline_mean(section, slots), unit),
            straggler
        )?;
        sum_time += section.time_mean;
        sum_volume += section.ops_mean;
    }
    writeln!(
        out,
        "  {:<28}{:>9}{:>12.6}{:>8}{:>12}{:>11}{:>12.3e}",
        "Sections sum", "", sum_time, "", "", "", sum_volume
    )?;

    if cfg.report >= ReportLevel::Detail {
        writeln!(out)?;
        writeln!(out, "Per-rank breakdown")?;
        for section in data.sections.iter().filter(|s| s.id != 0) {
            writeln!(
                out,
                "  {} (whole-run calls {})",
                marks(section),
                section.total_calls as u64
            )?;
            for r in 0..ranks {
                let headline = section
                    .hwpc
                    .as_ref()
                    .and_then(|m| m.get(r * slots + slots.saturating_sub(1)).copied())
                    .unwrap_or(0.0);
                writeln!(
                    out,
                    "    rank {:<4}{:>9}{:>12.6}{:>12.3e}{:>16}",
                    r,
                    section.calls.get(r).copied().unwrap_or(0.0) as u64,
                    section.times.get(r).copied().unwrap_or(0.0),
                    section.ops.get(r).copied().unwrap_or(0.0),
                    scaled(headline, unit)
                )?;
            }
        }
    }

    if cfg.report >= ReportLevel::Full {
        writeln!(out)?;
        writeln!(out, "Per-thread breakdown (rank {})", world.rank())?;
        for section in data.sections.iter().filter(|s| s.id != 0) {
            writeln!(out, "  {}", marks(section))?;
            for (t, line) in section.threads.iter().enumerate() {
                if line.calls == 0 && line.time == 0.0 {
                    continue;
                }
                writeln!(
                    out,
                    "    thread {:<4}{:>7}{:>12.6}{:>16}",
                    t,
                    line.calls,
                    line.time,
                    scaled(line.headline, unit)
                )?;
            }
        }

        writeln!(out)?;
        writeln!(out, "HWPC legend ({})", hwpc.chooser().name())?;
        if hwpc.events().is_empty() {
            writeln!(out, "  no events programmed; rates use user-declared flop")?;
        }
        for e in hwpc.events() {
            writeln!(out, "  event  {}", e.name)?;
        }
        for (i, name) in hwpc::slot_names(hwpc.chooser()).iter().enumerate() {
            writeln!(out, "  slot {}  {}", i, name)?;
        }
        if power.measuring() {
            writeln!(out, "Power: {} part(s) measured", power.parts())?;
            for section in data.sections.iter().filter(|s| s.id != 0) {
                if section.watts > 0.0 {
                    writeln!(out, "  {:<28}{:>10.3} [W]", section.label, section.watts)?;
                }
            }
        }
    }

    writeln!(
        out,
        "# ------------------------------------------------------------------- #"
    )?;
    Ok(())
}
