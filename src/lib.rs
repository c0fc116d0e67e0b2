//! A library to instrument code sections of parallel applications and
//! report per-section wall-clock time, user-declared operation volume,
//! hardware performance counters and node power draw, aggregated across
//! threads and processes.
//!
//! Sections are explicit: the application brackets interesting code with
//! `start(label)`/`stop(label, flop, iters)` and asks for a statistical
//! report at the end of the run. A bracket issued from serial code
//! snapshots counters on every thread, so a section wrapping an
//! uninstrumented parallel loop still captures whole-process deltas; a
//! bracket issued inside a parallel region measures just the calling
//! thread.
//!
//! The measurement engine is self-contained. Hardware counters, power
//! telemetry, trace emission, fork-join threading and message-passing
//! collectives are collaborator seams ([`CounterBackend`],
//! [`PowerBackend`], [`TraceBackend`], [`ThreadRuntime`],
//! [`Collectives`]) with null or single-process defaults, so the library
//! measures time and counts on any machine out of the box.
//!
//! # Example
//!
//! ```rust,no_run
//! use pmlib::Monitor;
//!
//! fn main() -> Result<(), pmlib::PmError> {
//!     let monitor = Monitor::initialize()?;
//!     monitor.start("setup");
//!     // ... build the problem ...
//!     monitor.stop("setup", 0.0, 1);
//!
//!     monitor.start("kernel");
//!     // ... 2.0e9 floating point operations ...
//!     monitor.stop("kernel", 2.0e9, 1);
//!
//!     monitor.report(&mut std::io::stdout())?;
//!     Ok(())
//! }
//! ```
//!
//! Behaviour is steered by environment variables: `HWPC_CHOOSER` selects
//! the event set and derived metrics, `PMLIB_REPORT` the report detail,
//! `POWER_CHOOSER` the power telemetry granularity, `OTF_TRACING` /
//! `OTF_FILENAME` the trace emission, and `BYPASS_PMLIB` turns every
//! call into a no-op.

pub mod config;
pub mod error;
mod gather;
pub mod hwpc;
mod merge;
pub mod monitor;
pub mod power;
mod registry;
mod report;
pub mod runtime;
pub mod state;
pub mod timer;
pub mod trace;
mod watch;
pub mod world;

pub use crate::config::{HwpcChooser, PowerChooser, ReportLevel, RunConfig, Topology, TraceLevel};
pub use crate::error::{CollectiveError, HwpcError, PmError, PowerError, StateError};
pub use crate::hwpc::{CounterBackend, EventDesc, EventFlags, NullBackend};
pub use crate::monitor::{Monitor, MonitorBuilder, SectionSnapshot, ROOT_LABEL};
pub use crate::power::{NullPower, PowerBackend, PowerKnob};
pub use crate::runtime::{ScopedRuntime, SerialRuntime, ThreadRuntime};
pub use crate::state::{SavedSection, SavedState};
pub use crate::timer::Timer;
pub use crate::trace::{NullTrace, TraceBackend};
pub use crate::watch::WorkKind;
pub use crate::world::{Collectives, SingleProcess};
