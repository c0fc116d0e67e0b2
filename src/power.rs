//! Node-power telemetry and control knobs.
//!
//! Power is read as accumulated joules per measured node part; sections
//! record the consumption between their start and stop in serial context.
//! The knob pair gives coarse control over the node's power/performance
//! trade-offs. Both go through the [`PowerBackend`] seam; the default
//! [`NullPower`] reads zeros and rejects knob access, and the first
//! backend failure disables the sub-feature for the rest of the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::config::PowerChooser;
use crate::error::PowerError;

/// The node-power control knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerKnob {
    /// Core clock in MHz.
    CpuFreq,
    /// Memory access throttling level.
    MemoryThrottle,
    /// Instruction issue width.
    Issue,
    /// Floating-point pipelines in use.
    Pipe,
    /// Eco state.
    Eco,
}

impl PowerKnob {
    pub fn name(&self) -> &'static str {
        match self {
            PowerKnob::CpuFreq => "CPU_FREQ",
            PowerKnob::MemoryThrottle => "MEMORY_THROTTLE",
            PowerKnob::Issue => "ISSUE",
            PowerKnob::Pipe => "PIPE",
            PowerKnob::Eco => "ECO",
        }
    }

    /// Human-readable description of the accepted values.
    pub fn valid_values(&self) -> &'static str {
        match self {
            PowerKnob::CpuFreq => "2000 or 2200 (MHz)",
            PowerKnob::MemoryThrottle => "0..=9",
            PowerKnob::Issue => "2 or 4",
            PowerKnob::Pipe => "1 or 2",
            PowerKnob::Eco => "0..=2",
        }
    }

    /// Range check for a knob setting.
    pub fn accepts(&self, value: u32) -> bool {
        match self {
            PowerKnob::CpuFreq => value == 2000 || value == 2200,
            PowerKnob::MemoryThrottle => value <= 9,
            PowerKnob::Issue => value == 2 || value == 4,
            PowerKnob::Pipe => value == 1 || value == 2,
            PowerKnob::Eco => value <= 2,
        }
    }
}

/// Seam to the power telemetry and control back-end.
pub trait PowerBackend: Send + Sync {
    /// Accumulated joules per measured part since an arbitrary origin.
    /// `out.len()` is the part count of the active chooser.
    fn read_joules(&self, out: &mut [f64]) -> Result<(), PowerError>;

    fn get_knob(&self, knob: PowerKnob) -> Result<u32, PowerError>;

    fn set_knob(&self, knob: PowerKnob, value: u32) -> Result<(), PowerError>;
}

/// A node without power telemetry.
#[derive(Debug, Default)]
pub struct NullPower;

impl PowerBackend for NullPower {
    fn read_joules(&self, out: &mut [f64]) -> Result<(), PowerError> {
        for v in out.iter_mut() {
            *v = 0.0;
        }
        Ok(())
    }

    fn get_knob(&self, _knob: PowerKnob) -> Result<u32, PowerError> {
        Err(PowerError::Unsupported)
    }

    fn set_knob(&self, _knob: PowerKnob, _value: u32) -> Result<(), PowerError> {
        Err(PowerError::Unsupported)
    }
}

/// Measured parts per chooser: the whole node, one meter per CMG, or
/// every part the node exposes (node, 4 CMGs, 4 memory groups,
/// interconnect, storage, misc).
pub fn parts_for(chooser: PowerChooser) -> usize {
    match chooser {
        PowerChooser::Off => 0,
        PowerChooser::Node => 1,
        PowerChooser::Numa => 4,
        PowerChooser::Parts => 12,
    }
}

/// Per-process power state.
pub(crate) struct PowerContext {
    backend: Arc<dyn PowerBackend>,
    parts: usize,
    disabled: AtomicBool,
}

impl PowerContext {
    pub fn new(chooser: PowerChooser, backend: Arc<dyn PowerBackend>) -> PowerContext {
        PowerContext {
            backend,
            parts: parts_for(chooser),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn parts(&self) -> usize {
        self.parts
    }

    pub fn measuring(&self) -> bool {
        self.parts > 0 && !self.disabled.load(Ordering::Relaxed)
    }

    /// Joule snapshot, or `None` when power is off or has been disabled
    /// by an earlier failure.
    pub fn read(&self) -> Option<Vec<f64>> {
        if !self.measuring() {
            return None;
        }
        let mut joules = vec![0.0; self.parts];
        match self.backend.read_joules(&mut joules) {
            Ok(()) => Some(joules),
            Err(e) => {
                warn!("power telemetry disabled for this run: {}", e);
                self.disabled.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn get_knob(&self, knob: PowerKnob) -> Result<u32, PowerError> {
        self.backend.get_knob(knob)
    }

    pub fn set_knob(&self, knob: PowerKnob, value: u32) -> Result<(), PowerError> {
        if !knob.accepts(value) {
            return Err(PowerError::OutOfRange {
                knob: knob.name(),
                value,
                valid: knob.valid_values(),
            });
        }
        self.backend.set_knob(knob, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knob_ranges() {
        assert!(PowerKnob::CpuFreq.accepts(2200));
        assert!(!PowerKnob::CpuFreq.accepts(1800));
        assert!(PowerKnob::MemoryThrottle.accepts(0));
        assert!(!PowerKnob::MemoryThrottle.accepts(10));
        assert!(PowerKnob::Issue.accepts(4));
        assert!(!PowerKnob::Issue.accepts(3));
        assert!(PowerKnob::Pipe.accepts(1));
        assert!(!PowerKnob::Pipe.accepts(0));
        assert!(PowerKnob::Eco.accepts(2));
        assert!(!PowerKnob::Eco.accepts(3));
    }

    #[test]
    fn parts_per_chooser() {
        assert_eq!(parts_for(PowerChooser::Off), 0);
        assert_eq!(parts_for(PowerChooser::Node), 1);
        assert_eq!(parts_for(PowerChooser::Numa), 4);
        assert_eq!(parts_for(PowerChooser::Parts), 12);
    }

    #[test]
    fn out_of_range_is_rejected_before_the_backend() {
        let ctx = PowerContext::new(PowerChooser::Node, Arc::new(NullPower));
        match ctx.set_knob(PowerKnob::Eco, 9) {
            Err(PowerError::OutOfRange { knob, value, .. }) => {
                assert_eq!(knob, "ECO");
                assert_eq!(value, 9);
            }
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn off_chooser_never_reads() {
        let ctx = PowerContext::new(PowerChooser::Off, Arc::new(NullPower));
        assert!(!ctx.measuring());
        assert!(ctx.read().is_none());
    }
}
