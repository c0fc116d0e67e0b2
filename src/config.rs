//! Run-time configuration, read from the environment exactly once.
//!
//! Every recognised variable has a documented default; an unrecognised
//! value logs a warning (on rank 0) and falls back to that default. The
//! parsed [`RunConfig`] is handed to each component at construction so
//! that nothing re-reads the process environment later.

use std::env;

use log::warn;

/// Selects the hardware event set and the derived-metric rules.
///
/// Set through `HWPC_CHOOSER`; the default is [`HwpcChooser::Flops`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwpcChooser {
    /// Floating-point operations, with a peak-percentage slot.
    Flops,

    /// Memory traffic in bytes, counted per core-memory group.
    Bandwidth,

    /// Scalar vs. vectorised floating-point operation mix.
    Vector,

    /// Cache hits per level and the overall hit percentage.
    Cache,

    /// Cycles and retired instructions.
    Cycle,

    /// Load and store instruction mix.
    LoadStore,

    /// Nothing is programmed; the rate comes from user-declared flop.
    User,
}

impl HwpcChooser {
    /// Parse the environment spelling. `None` for an unknown value.
    pub fn parse(s: &str) -> Option<HwpcChooser> {
        match s {
            "FLOPS" => Some(HwpcChooser::Flops),
            "BANDWIDTH" => Some(HwpcChooser::Bandwidth),
            "VECTOR" => Some(HwpcChooser::Vector),
            "CACHE" => Some(HwpcChooser::Cache),
            "CYCLE" => Some(HwpcChooser::Cycle),
            "LOADSTORE" => Some(HwpcChooser::LoadStore),
            "USER" => Some(HwpcChooser::User),
            _ => None,
        }
    }

    /// The canonical environment spelling.
    pub fn name(&self) -> &'static str {
        match self {
            HwpcChooser::Flops => "FLOPS",
            HwpcChooser::Bandwidth => "BANDWIDTH",
            HwpcChooser::Vector => "VECTOR",
            HwpcChooser::Cache => "CACHE",
            HwpcChooser::Cycle => "CYCLE",
            HwpcChooser::LoadStore => "LOADSTORE",
            HwpcChooser::User => "USER",
        }
    }
}

/// Granularity of node-power measurement, from `POWER_CHOOSER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerChooser {
    /// No power telemetry (the default).
    Off,
    /// One meter for the whole node.
    Node,
    /// One meter per core-memory group.
    Numa,
    /// Every part the node exposes.
    Parts,
}

impl PowerChooser {
    pub fn parse(s: &str) -> Option<PowerChooser> {
        match s {
            "OFF" => Some(PowerChooser::Off),
            "NODE" => Some(PowerChooser::Node),
            "NUMA" => Some(PowerChooser::Numa),
            "PARTS" => Some(PowerChooser::Parts),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PowerChooser::Off => "OFF",
            PowerChooser::Node => "NODE",
            PowerChooser::Numa => "NUMA",
            PowerChooser::Parts => "PARTS",
        }
    }
}

/// Amount of detail in the final report, from `PMLIB_REPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportLevel {
    /// Per-section summary rows only (the default).
    Basic,
    /// Adds per-rank breakdowns.
    Detail,
    /// Adds the local per-thread breakdown and the HWPC/power legend.
    Full,
}

impl ReportLevel {
    pub fn parse(s: &str) -> Option<ReportLevel> {
        match s {
            "BASIC" => Some(ReportLevel::Basic),
            "DETAIL" => Some(ReportLevel::Detail),
            "FULL" => Some(ReportLevel::Full),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReportLevel::Basic => "BASIC",
            ReportLevel::Detail => "DETAIL",
            ReportLevel::Full => "FULL",
        }
    }
}

/// Event-trace emission level, from `OTF_TRACING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    /// No trace (the default).
    Off,
    /// Enter/leave events with timestamps.
    On,
    /// Enter/leave events carrying the headline counter value.
    Full,
}

impl TraceLevel {
    pub fn parse(s: &str) -> Option<TraceLevel> {
        match s {
            "OFF" => Some(TraceLevel::Off),
            "ON" => Some(TraceLevel::On),
            "FULL" => Some(TraceLevel::Full),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TraceLevel::Off => "OFF",
            TraceLevel::On => "ON",
            TraceLevel::Full => "FULL",
        }
    }
}

/// Node topology used to prorate per-CMG counters.
///
/// Both values come from the environment (`PMLIB_PROCS_PER_NODE`,
/// `PMLIB_RANK_ON_NODE`, 0-based). The proration rules assume packed
/// thread affinity; scattered affinity is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Processes sharing this node.
    pub node_procs: usize,
    /// This process's rank within the node, 0-based.
    pub rank_on_node: usize,
}

/// Everything the library reads from the environment, parsed once.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// `BYPASS_PMLIB` set: every API call is a no-op.
    pub bypass: bool,
    /// `HWPC_CHOOSER`, default FLOPS.
    pub hwpc: HwpcChooser,
    /// `POWER_CHOOSER`, default OFF.
    pub power: PowerChooser,
    /// `PMLIB_REPORT`, default BASIC.
    pub report: ReportLevel,
    /// `OTF_TRACING`, default OFF.
    pub trace: TraceLevel,
    /// `OTF_FILENAME`, default `pmlib_trace`.
    pub trace_base: String,
    /// Per-CMG proration topology, if the hint variables are present.
    pub topology: Option<Topology>,
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig {
            bypass: false,
            hwpc: HwpcChooser::Flops,
            power: PowerChooser::Off,
            report: ReportLevel::Basic,
            trace: TraceLevel::Off,
            trace_base: "pmlib_trace".to_string(),
            topology: None,
        }
    }
}

impl RunConfig {
    /// Read and validate the environment. `quiet` suppresses the
    /// bad-value warnings on non-zero ranks.
    pub fn from_env(quiet: bool) -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.bypass = env::var_os("BYPASS_PMLIB").is_some();

        cfg.hwpc = parse_or_default("HWPC_CHOOSER", cfg.hwpc, HwpcChooser::parse, quiet);
        cfg.power = parse_or_default("POWER_CHOOSER", cfg.power, PowerChooser::parse, quiet);
        cfg.report = parse_or_default("PMLIB_REPORT", cfg.report, ReportLevel::parse, quiet);
        cfg.trace = parse_or_default("OTF_TRACING", cfg.trace, TraceLevel::parse, quiet);
        if let Ok(base) = env::var("OTF_FILENAME") {
            if !base.is_empty() {
                cfg.trace_base = base;
            }
        }

        cfg.topology = read_topology(quiet);
        cfg
    }

    /// One-line rendering of the effective settings for the report header.
    pub fn summary(&self) -> String {
        format!(
            "HWPC_CHOOSER={} POWER_CHOOSER={} PMLIB_REPORT={} OTF_TRACING={}",
            self.hwpc.name(),
            self.power.name(),
            self.report.name(),
            self.trace.name()
        )
    }
}

fn parse_or_default<T: Copy>(
    var: &str,
    default: T,
    parse: fn(&str) -> Option<T>,
    quiet: bool,
) -> T {
    match env::var(var) {
        Ok(raw) => match parse(&raw) {
            Some(v) => v,
            None => {
                if !quiet {
                    warn!("{}={:?} is not recognised, using the default", var, raw);
                }
                default
            }
        },
        Err(_) => default,
    }
}

fn read_topology(quiet: bool) -> Option<Topology> {
    let procs = env::var("PMLIB_PROCS_PER_NODE").ok();
    let rank = env::var("PMLIB_RANK_ON_NODE").ok();
    match (procs, rank) {
        (Some(p), Some(r)) => match (p.parse::<usize>(), r.parse::<usize>()) {
            (Ok(node_procs), Ok(rank_on_node)) if node_procs > 0 && rank_on_node < node_procs => {
                Some(Topology {
                    node_procs,
                    rank_on_node,
                })
            }
            _ => {
                if !quiet {
                    warn!(
                        "topology hints PMLIB_PROCS_PER_NODE={:?} PMLIB_RANK_ON_NODE={:?} \
                         are inconsistent; per-CMG counters will not be prorated",
                        p, r
                    );
                }
                None
            }
        },
        (None, None) => None,
        _ => {
            if !quiet {
                warn!(
                    "only one of PMLIB_PROCS_PER_NODE / PMLIB_RANK_ON_NODE is set; \
                     per-CMG counters will not be prorated"
                );
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chooser_spellings_round_trip() {
        for c in &[
            HwpcChooser::Flops,
            HwpcChooser::Bandwidth,
            HwpcChooser::Vector,
            HwpcChooser::Cache,
            HwpcChooser::Cycle,
            HwpcChooser::LoadStore,
            HwpcChooser::User,
        ] {
            assert_eq!(HwpcChooser::parse(c.name()), Some(*c));
        }
        assert_eq!(HwpcChooser::parse("flops"), None);
        assert_eq!(HwpcChooser::parse(""), None);
    }

    #[test]
    fn power_and_report_spellings() {
        assert_eq!(PowerChooser::parse("NUMA"), Some(PowerChooser::Numa));
        assert_eq!(PowerChooser::parse("numa"), None);
        assert_eq!(ReportLevel::parse("FULL"), Some(ReportLevel::Full));
        assert_eq!(TraceLevel::parse("ON"), Some(TraceLevel::On));
    }

    #[test]
    fn defaults_are_documented_ones() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.hwpc, HwpcChooser::Flops);
        assert_eq!(cfg.power, PowerChooser::Off);
        assert_eq!(cfg.report, ReportLevel::Basic);
        assert_eq!(cfg.trace, TraceLevel::Off);
        assert!(!cfg.bypass);
        assert!(cfg.topology.is_none());
    }
}
