//! The per-process monitor: section lifecycle, the measurement bracket
//! and the report driver.
//!
//! One `Monitor` exists per process. Sections are declared implicitly by
//! their first `start` (or explicitly through `set_properties`) and live
//! until the monitor is dropped. A serial-region bracket fans out over
//! the whole thread team so the section captures whole-process counter
//! deltas even around uninstrumented parallel code; a bracket issued
//! inside a parallel region touches only the calling thread's row.
//! Measurement never panics into the application: mis-paired brackets
//! warn and self-heal.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{error, warn};

use crate::config::RunConfig;
use crate::error::PmError;
use crate::gather::{self, ReportData};
use crate::hwpc::{CounterBackend, HwpcContext, NullBackend};
use crate::merge::{phase1_master, phase2_thread, phase3_master, Scratch};
use crate::power::{NullPower, PowerBackend, PowerContext, PowerKnob};
use crate::registry::{LocalRegistry, SharedRegistry};
use crate::report;
use crate::runtime::{ScopedRuntime, ThreadRuntime};
use crate::state::{default_state_path, SavedSection, SavedState};
use crate::timer::Timer;
use crate::trace::{NullTrace, TraceBackend, TraceContext};
use crate::watch::{BeginOutcome, EndOutcome, SectionWatch, WorkKind};
use crate::world::{Collectives, SingleProcess};

/// The implicit always-on section spanning the monitor's lifetime.
pub const ROOT_LABEL: &str = "Root";

/// The watch array grows in chunks of this many slots.
const WATCH_CHUNK: usize = 100;

static MONITOR_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Assembles a [`Monitor`] with explicit collaborators. Every seam has a
/// default: serial-or-`OMP_NUM_THREADS` threading, a one-process group,
/// and null counter/power/trace back-ends.
pub struct MonitorBuilder {
    runtime: Option<Arc<dyn ThreadRuntime>>,
    world: Option<Arc<dyn Collectives>>,
    counters: Option<Arc<dyn CounterBackend>>,
    power: Option<Arc<dyn PowerBackend>>,
    trace: Option<Arc<dyn TraceBackend>>,
    initial_sections: usize,
}

impl MonitorBuilder {
    pub fn new() -> MonitorBuilder {
        MonitorBuilder {
            runtime: None,
            world: None,
            counters: None,
            power: None,
            trace: None,
            initial_sections: 64,
        }
    }

    pub fn runtime(mut self, runtime: Arc<dyn ThreadRuntime>) -> MonitorBuilder {
        self.runtime = Some(runtime);
        self
    }

    pub fn collectives(mut self, world: Arc<dyn Collectives>) -> MonitorBuilder {
        self.world = Some(world);
        self
    }

    pub fn counters(mut self, backend: Arc<dyn CounterBackend>) -> MonitorBuilder {
        self.counters = Some(backend);
        self
    }

    pub fn power(mut self, backend: Arc<dyn PowerBackend>) -> MonitorBuilder {
        self.power = Some(backend);
        self
    }

    pub fn trace(mut self, backend: Arc<dyn TraceBackend>) -> MonitorBuilder {
        self.trace = Some(backend);
        self
    }

    /// Watch slots to pre-allocate.
    pub fn initial_sections(mut self, n: usize) -> MonitorBuilder {
        self.initial_sections = n.max(1);
        self
    }

    /// Read the environment, wire the collaborators and start Root.
    pub fn initialize(self) -> Result<Monitor, PmError> {
        let world = self.world.unwrap_or_else(|| Arc::new(SingleProcess));
        let cfg = RunConfig::from_env(world.rank() != 0);
        let runtime: Arc<dyn ThreadRuntime> = self
            .runtime
            .unwrap_or_else(|| Arc::new(ScopedRuntime::from_env()));
        let timer = Timer::new();
        let threads = runtime.max_threads();
        let hwpc = HwpcContext::new(
            cfg.hwpc,
            self.counters.unwrap_or_else(|| Arc::new(NullBackend)),
            threads,
            timer.core_frequency(),
            cfg.topology,
        );
        let power = PowerContext::new(
            cfg.power,
            self.power.unwrap_or_else(|| Arc::new(NullPower)),
        );
        let trace = TraceContext::new(
            cfg.trace,
            &cfg.trace_base,
            self.trace.unwrap_or_else(|| Arc::new(NullTrace)),
        );
        let scratch = Scratch::new(threads, hwpc.event_count(), hwpc.slot_count());
        let serial = MONITOR_SERIAL.fetch_add(1, Ordering::Relaxed);

        let monitor = Monitor {
            cfg,
            timer,
            runtime,
            world,
            hwpc,
            power,
            trace,
            registry: SharedRegistry::new(),
            local: LocalRegistry::new(serial),
            watches: RwLock::new(Vec::with_capacity(self.initial_sections)),
            scratch: Mutex::new(scratch),
            report_data: Mutex::new(None),
        };
        if !monitor.cfg.bypass {
            monitor.start(ROOT_LABEL);
        }
        Ok(monitor)
    }
}

impl Default for MonitorBuilder {
    fn default() -> MonitorBuilder {
        MonitorBuilder::new()
    }
}

/// A read-only view of one section's current accumulation, for tests and
/// custom reporters. Scalars are summed over all thread rows; the event
/// accumulation and derived vector are the merged process totals and stay
/// zero until the thread merge has run.
#[derive(Debug, Clone)]
pub struct SectionSnapshot {
    pub label: String,
    pub calls: u64,
    pub time: f64,
    pub user_flop: f64,
    pub exclusive: bool,
    pub in_parallel: bool,
    pub healthy: bool,
    pub accum: Vec<f64>,
    pub sorted: Vec<f64>,
}

pub struct Monitor {
    cfg: RunConfig,
    timer: Timer,
    runtime: Arc<dyn ThreadRuntime>,
    world: Arc<dyn Collectives>,
    hwpc: HwpcContext,
    power: PowerContext,
    trace: TraceContext,
    registry: SharedRegistry,
    local: LocalRegistry,
    watches: RwLock<Vec<Arc<SectionWatch>>>,
    scratch: Mutex<Scratch>,
    report_data: Mutex<Option<ReportData>>,
}

impl Monitor {
    /// The default configuration: environment-driven, null back-ends.
    pub fn initialize() -> Result<Monitor, PmError> {
        MonitorBuilder::new().initialize()
    }

    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::new()
    }

    /// Number of sections in the shared registry.
    pub fn section_count(&self) -> usize {
        self.registry.count()
    }

    /// The shared ID of a registered section, as [`Monitor::merge_threads`]
    /// expects it.
    pub fn section_id(&self, label: &str) -> Option<usize> {
        self.registry.find(label)
    }

    /// Number of sections the calling thread's label cache knows.
    pub fn local_section_count(&self) -> usize {
        self.local.count()
    }

    pub fn rank(&self) -> usize {
        self.world.rank()
    }

    pub fn num_threads(&self) -> usize {
        self.runtime.max_threads()
    }

    /// Pre-declare a section's kind and exclusivity expectation.
    pub fn set_properties(&self, label: &str, kind: WorkKind, exclusive: bool) {
        if self.cfg.bypass {
            return;
        }
        let watch = self.resolve(label);
        watch.set_kind(kind);
        watch.set_exclusive(exclusive);
        if self.runtime.in_parallel() {
            watch.mark_in_parallel();
        }
    }

    /// Open the measurement bracket on `label`.
    pub fn start(&self, label: &str) {
        if self.cfg.bypass {
            return;
        }
        let watch = self.resolve(label);
        let now = self.timer.now();
        self.trace.enter(watch.id, now);
        if self.runtime.in_parallel() {
            watch.mark_in_parallel();
            let me = self.runtime.thread_num();
            let snap = self.hwpc.read_now(me);
            if watch.begin(me, now, snap.as_deref()) == BeginOutcome::Restarted {
                warn!(
                    "section '{}' started while already running on thread {}; interval restarted",
                    label, me
                );
            }
        } else {
            let restarted = AtomicBool::new(false);
            let watch_ref = &watch;
            self.runtime.fan_out(&|t| {
                let snap = self.hwpc.read_now(t);
                if t == 0 {
                    if watch_ref.begin(0, now, snap.as_deref()) == BeginOutcome::Restarted {
                        restarted.store(true, Ordering::Relaxed);
                    }
                } else if let Some(values) = snap {
                    watch_ref.snapshot_row(t, &values);
                }
            });
            if restarted.load(Ordering::Relaxed) {
                warn!(
                    "section '{}' started while already running; interval restarted",
                    label
                );
            }
            if let Some(joules) = self.power.read() {
                watch.energy_begin(&joules);
            }
        }
    }

    /// Close the measurement bracket on `label`, declaring
    /// `flop_per_call * iter_count` operations for the USER chooser and
    /// the no-counter fallback.
    pub fn stop(&self, label: &str, flop_per_call: f64, iter_count: u64) {
        if self.cfg.bypass {
            return;
        }
        let watch = self.resolve(label);
        let now = self.timer.now();
        let flop_add = flop_per_call * iter_count as f64;
        let stopped = if self.runtime.in_parallel() {
            let me = self.runtime.thread_num();
            let snap = self.hwpc.read_at_stop(me);
            match watch.end(me, now, snap.as_deref(), flop_add) {
                EndOutcome::Stopped { .. } => true,
                EndOutcome::NotRunning => false,
            }
        } else {
            self.stop_serial(&watch, now, flop_add)
        };
        if !stopped {
            warn!(
                "section '{}' stopped without a matching start; ignored",
                label
            );
            return;
        }
        self.mark_others_inclusive(watch.id);
        if self.trace.active() {
            let me = if self.runtime.in_parallel() {
                self.runtime.thread_num()
            } else {
                0
            };
            self.trace.leave(watch.id, now, self.row_headline(&watch, me));
        }
    }

    /// Zero one section's accumulators. Root is never reset.
    pub fn reset(&self, label: &str) {
        if self.cfg.bypass {
            return;
        }
        if label == ROOT_LABEL {
            warn!("Root cannot be reset");
            return;
        }
        match self.registry.find(label) {
            Some(id) => {
                self.watch_by_id(id).reset();
                *self.report_data.lock().unwrap() = None;
            }
            None => warn!("reset of unknown section '{}' ignored", label),
        }
    }

    /// Zero every section except Root.
    pub fn reset_all(&self) {
        if self.cfg.bypass {
            return;
        }
        for watch in self.all_watches() {
            if watch.id != 0 {
                watch.reset();
            }
        }
        *self.report_data.lock().unwrap() = None;
    }

    /// Phase-2 merge entry point for sections defined inside an
    /// application-managed parallel region: every region thread calls
    /// this with the section's shared ID.
    pub fn merge_threads(&self, shared_id: usize) {
        if self.cfg.bypass {
            return;
        }
        let watch = {
            let watches = self.watches.read().unwrap();
            match watches.get(shared_id) {
                Some(w) => w.clone(),
                None => {
                    warn!("merge_threads on unknown section ID {}", shared_id);
                    return;
                }
            }
        };
        phase2_thread(&watch, &self.scratch, self.runtime.thread_num(), &self.hwpc);
    }

    /// Stop Root, merge threads, gather across ranks and render the
    /// report. Idempotent: later calls re-render the same gathered data.
    pub fn report(&self, out: &mut dyn io::Write) -> Result<(), PmError> {
        if self.cfg.bypass {
            return Ok(());
        }
        let mut guard = self.report_data.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.build_report_data());
        }
        let data = guard.as_ref().unwrap();
        report::render(
            out,
            data,
            &self.cfg,
            &self.hwpc,
            &self.power,
            self.world.as_ref(),
            self.runtime.max_threads(),
        )?;
        Ok(())
    }

    /// Finalise the trace back-end. Safe to call more than once.
    pub fn post_trace(&self) {
        if self.cfg.bypass {
            return;
        }
        self.trace.post();
    }

    pub fn get_power_knob(&self, knob: PowerKnob) -> Result<u32, PmError> {
        if self.cfg.bypass {
            return Ok(0);
        }
        self.power.get_knob(knob).map_err(PmError::from)
    }

    pub fn set_power_knob(&self, knob: PowerKnob, value: u32) -> Result<(), PmError> {
        if self.cfg.bypass {
            return Ok(());
        }
        self.power.set_knob(knob, value).map_err(PmError::from)
    }

    /// Persist every section's label, start time and per-thread counter
    /// snapshots, for a later process to complete the brackets. Root
    /// stays with this process. Returns the path written.
    pub fn save_state(&self, path: Option<&Path>) -> Result<PathBuf, PmError> {
        if self.cfg.bypass {
            return Ok(PathBuf::new());
        }
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_state_path()?,
        };
        let events = self.hwpc.event_count();
        let mut sections = Vec::new();
        for watch in self.all_watches() {
            if watch.id == 0 {
                continue;
            }
            let threads = watch.thread_count();
            let mut snapshots = Vec::with_capacity(threads * events);
            let mut start_time = 0.0;
            for t in 0..threads {
                let row = watch.row(t);
                snapshots.extend_from_slice(&row.start_values);
                if t == 0 {
                    start_time = row.start_time;
                }
            }
            sections.push(SavedSection {
                label: watch.label.clone(),
                start_time,
                threads,
                events,
                snapshots,
            });
        }
        let state = SavedState {
            chooser: self.cfg.hwpc,
            sections,
        };
        state.save(&path)?;
        Ok(path)
    }

    /// Load a state file written by an earlier process: sections are
    /// registered, their start snapshots restored and their master rows
    /// put back into the running state, so a plain `stop` completes the
    /// pair. Derived values are recomputed from the raw snapshots.
    pub fn load_state(&self, path: Option<&Path>) -> Result<(), PmError> {
        if self.cfg.bypass {
            return Ok(());
        }
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_state_path()?,
        };
        let state = SavedState::load(&path)?;
        if state.chooser != self.cfg.hwpc {
            warn!(
                "state file was written with HWPC_CHOOSER={} but this process runs {}; \
                 counter deltas may be meaningless",
                state.chooser.name(),
                self.cfg.hwpc.name()
            );
        }
        for saved in &state.sections {
            let watch = self.resolve(&saved.label);
            let threads = watch.thread_count().min(saved.threads);
            let events = self.hwpc.event_count().min(saved.events);
            for t in 0..threads {
                let mut row = watch.row(t);
                let snapshot = saved.thread_row(t);
                row.start_values[..events].copy_from_slice(&snapshot[..events]);
                if t == 0 {
                    row.start_time = saved.start_time;
                    row.running = true;
                }
            }
        }
        Ok(())
    }

    /// Current accumulation of one section, if registered.
    pub fn snapshot(&self, label: &str) -> Option<SectionSnapshot> {
        let id = self.registry.find(label)?;
        let watch = self.watch_by_id(id);
        let mut calls = 0u64;
        let mut time = 0.0;
        let mut flop = 0.0;
        for t in 0..watch.thread_count() {
            let row = watch.row(t);
            calls += row.calls;
            time += row.time;
            flop += row.flop;
        }
        let totals = watch.totals.lock().unwrap();
        Some(SectionSnapshot {
            label: watch.label.clone(),
            calls,
            time,
            user_flop: flop,
            exclusive: watch.exclusive(),
            in_parallel: watch.in_parallel(),
            healthy: watch.healthy(),
            accum: totals.accum.clone(),
            sorted: totals.sorted.clone(),
        })
    }

    fn resolve(&self, label: &str) -> Arc<SectionWatch> {
        if let Some(id) = self.local.find(label) {
            return self.watch_by_id(id);
        }
        let id = self.registry.add(label);
        self.ensure_watches_up_to(id);
        self.local.put(label, id);
        let watch = self.watch_by_id(id);
        self.trace.define_section(id, label);
        watch
    }

    /// Make sure a watch exists for every ID up to and including `id`.
    /// IDs are dense, so missing slots are filled in registry order; the
    /// array grows in chunks.
    fn ensure_watches_up_to(&self, id: usize) {
        let mut watches = self.watches.write().unwrap();
        while watches.len() <= id {
            if watches.len() == watches.capacity() {
                watches.reserve(WATCH_CHUNK);
            }
            let next = watches.len();
            let label = self
                .registry
                .label_of(next)
                .unwrap_or_else(|| format!("section#{}", next));
            watches.push(Arc::new(SectionWatch::new(
                next,
                &label,
                self.runtime.max_threads(),
                self.hwpc.event_count(),
                self.hwpc.slot_count(),
                self.power.parts(),
            )));
        }
    }

    fn watch_by_id(&self, id: usize) -> Arc<SectionWatch> {
        self.watches.read().unwrap()[id].clone()
    }

    fn all_watches(&self) -> Vec<Arc<SectionWatch>> {
        self.watches.read().unwrap().clone()
    }

    /// Whole-team bracket close in serial context. Returns false on a
    /// stop without a start, in which case nothing is accumulated.
    fn stop_serial(&self, watch: &Arc<SectionWatch>, now: f64, flop_add: f64) -> bool {
        let running = watch.row(0).running;
        if !running {
            return false;
        }
        let watch_ref = watch;
        self.runtime.fan_out(&|t| {
            let snap = self.hwpc.read_at_stop(t);
            if t == 0 {
                watch_ref.end(0, now, snap.as_deref(), flop_add);
            } else if let Some(values) = snap {
                watch_ref.accumulate_row(t, &values);
            }
        });
        if let Some(joules) = self.power.read() {
            watch.energy_end(&joules);
        }
        true
    }

    /// A completed pair inside any still-running section makes that
    /// section inclusive.
    fn mark_others_inclusive(&self, stopped_id: usize) {
        for watch in self.all_watches() {
            if watch.id != stopped_id && watch.any_running() {
                watch.set_exclusive(false);
            }
        }
    }

    fn row_headline(&self, watch: &Arc<SectionWatch>, t: usize) -> f64 {
        let row = watch.row(t);
        let accum: Vec<f64> = row.accum.iter().map(|&v| v as f64).collect();
        self.hwpc
            .derive(&accum, row.time, row.flop, 1)
            .last()
            .copied()
            .unwrap_or(0.0)
    }

    fn merge_section(&self, watch: &Arc<SectionWatch>) {
        if watch.threads_merged() {
            return;
        }
        phase1_master(watch, &self.scratch, &self.hwpc);
        if watch.in_parallel() {
            let watch_ref = watch;
            self.runtime
                .fan_out(&|t| phase2_thread(watch_ref, &self.scratch, t, &self.hwpc));
        }
        phase3_master(watch, &self.scratch, &self.hwpc);
    }

    fn build_report_data(&self) -> ReportData {
        let now = self.timer.now();
        let mut notes = Vec::new();

        // Sections the master thread never saw exist only in the shared
        // registry; give them watches and mark them in-parallel.
        if self.registry.count() > 0 {
            self.ensure_watches_up_to(self.registry.count() - 1);
        }
        for id in self.local.complete_from(&self.registry) {
            self.watch_by_id(id).mark_in_parallel();
        }

        // Anything still running other than Root is force-stopped at the
        // moment Root stops, flagged unhealthy and noted in the report.
        for watch in self.all_watches() {
            if watch.id != 0 && watch.any_running() {
                watch.force_stop(now);
                warn!(
                    "section '{}' was still running at report time; force-stopped",
                    watch.label
                );
                notes.push(format!(
                    "section '{}' was still running at report time and was force-stopped",
                    watch.label
                ));
            }
        }
        let root = self.watch_by_id(0);
        let root_running = root.row(0).running;
        if root_running {
            self.stop_serial(&root, now, 0.0);
        }

        let watches = self.all_watches();
        for watch in &watches {
            self.merge_section(watch);
        }

        // All ranks enter the gather together.
        if let Err(e) = self.world.barrier() {
            error!("collective failure before gather: {}; aborting", e);
            self.world.abort(1);
        }

        let mut sections = Vec::with_capacity(watches.len());
        for watch in &watches {
            match gather::gather_section(watch, &self.hwpc, self.world.as_ref()) {
                Ok(s) => sections.push(s),
                Err(e) => {
                    error!(
                        "collective failure while gathering section '{}': {}; aborting",
                        watch.label, e
                    );
                    self.world.abort(1);
                }
            }
        }
        gather::sort_for_report(&mut sections);
        ReportData { sections, notes }
    }
}
