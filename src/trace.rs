//! Event-trace emission for OTF-style timeline viewers.
//!
//! The engine emits a define/enter/leave stream through the
//! [`TraceBackend`] seam; writing an actual trace format is the
//! back-end's business. `OTF_TRACING=ON` records timestamps only, `FULL`
//! additionally carries the headline counter value on every leave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::TraceLevel;

/// Seam to the trace writer.
pub trait TraceBackend: Send + Sync {
    /// Announce a section before its first enter.
    fn define_section(&self, id: usize, label: &str);

    fn enter(&self, id: usize, time: f64);

    /// `value` is the headline counter value at FULL level, 0 otherwise.
    fn leave(&self, id: usize, time: f64, value: f64);

    /// Flush and close the trace under the configured base name. Called
    /// exactly once.
    fn finish(&self, base: &str);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullTrace;

impl TraceBackend for NullTrace {
    fn define_section(&self, _id: usize, _label: &str) {}

    fn enter(&self, _id: usize, _time: f64) {}

    fn leave(&self, _id: usize, _time: f64, _value: f64) {}

    fn finish(&self, _base: &str) {}
}

/// Per-process tracing state.
pub(crate) struct TraceContext {
    backend: Arc<dyn TraceBackend>,
    level: TraceLevel,
    base: String,
    finished: AtomicBool,
}

impl TraceContext {
    pub fn new(level: TraceLevel, base: &str, backend: Arc<dyn TraceBackend>) -> TraceContext {
        TraceContext {
            backend,
            level,
            base: base.to_string(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn active(&self) -> bool {
        self.level > TraceLevel::Off
    }

    pub fn define_section(&self, id: usize, label: &str) {
        if self.active() {
            self.backend.define_section(id, label);
        }
    }

    pub fn enter(&self, id: usize, time: f64) {
        if self.active() {
            self.backend.enter(id, time);
        }
    }

    pub fn leave(&self, id: usize, time: f64, headline: f64) {
        if self.active() {
            let value = if self.level == TraceLevel::Full {
                headline
            } else {
                0.0
            };
            self.backend.leave(id, time, value);
        }
    }

    /// Finalise the back-end; later calls are no-ops.
    pub fn post(&self) {
        if self.active() && !self.finished.swap(true, Ordering::Relaxed) {
            self.backend.finish(&self.base);
        }
    }
}
