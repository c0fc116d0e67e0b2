//! Error types, one enum per failure domain.
//!
//! Measurement itself never surfaces errors into user code: `start`/`stop`
//! log and self-heal. The enums here cover the fallible entry points
//! (initialisation, persistence, power knobs, collectives) and the
//! collaborator seams.

use std::io;

use thiserror::Error;

/// Errors raised by the hardware-counter layer.
#[derive(Debug, Error)]
pub enum HwpcError {
    /// The backend could not program the event set on a thread's counter
    /// context.
    #[error("cannot bind {events} events on thread {thread}: {reason}")]
    Bind {
        thread: usize,
        events: usize,
        reason: String,
    },

    /// The counter context ran out of programmable counter space.
    #[error("counter space exhausted on thread {thread}")]
    Exhausted { thread: usize },

    /// A non-destructive snapshot read failed.
    #[error("cannot read counters on thread {thread}: {reason}")]
    Read { thread: usize, reason: String },
}

/// Errors raised by the node-power layer.
#[derive(Debug, Error)]
pub enum PowerError {
    /// The backend has no power telemetry for this node.
    #[error("power measurement is not supported by this backend")]
    Unsupported,

    /// A knob value outside the documented range for that knob.
    #[error("power knob {knob} rejects value {value} (valid: {valid})")]
    OutOfRange {
        knob: &'static str,
        value: u32,
        valid: &'static str,
    },

    /// Any other backend-side failure.
    #[error("power backend failure: {0}")]
    Backend(String),
}

/// Errors raised by the message-passing substrate. These are the only
/// fatal errors in the library: the caller aborts the process group.
#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("all-gather failed: {0}")]
    Gather(String),

    #[error("reduce failed: {0}")]
    Reduce(String),

    #[error("barrier failed: {0}")]
    Barrier(String),
}

/// Errors reading or writing the persisted state file (shell mode).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on state file: {0}")]
    Io(#[from] io::Error),

    /// The header or a section record did not parse.
    #[error("state file is not in the expected format")]
    Format,

    /// Parsing succeeded but bytes remain after the last section.
    #[error("state file carries trailing bytes after the last section")]
    TrailingBytes,

    /// No home directory to derive the default state path from.
    #[error("cannot determine a home directory for the state file")]
    NoHome,
}

/// Top-level error for the fallible `Monitor` entry points.
#[derive(Debug, Error)]
pub enum PmError {
    #[error(transparent)]
    Hwpc(#[from] HwpcError),

    #[error(transparent)]
    Power(#[from] PowerError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A label that has never been registered was named where an existing
    /// section is required.
    #[error("unknown section label: {0}")]
    UnknownSection(String),
}
