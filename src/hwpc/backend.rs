//! The seam to the raw hardware-counter back-end.
//!
//! The engine never touches counter hardware itself: it programs a fixed
//! event set per thread through this trait and takes non-destructive
//! snapshots around every section bracket. A real implementation wraps
//! PAPI or a perf-events binding; the default [`NullBackend`] reads zeros
//! so the time/count side of the library works on any machine.

use crate::error::HwpcError;
use crate::hwpc::EventDesc;

/// Per-thread counter operations.
///
/// `thread` is the logical thread number handed out by the fork-join
/// runtime; implementations key their per-thread contexts on it.
pub trait CounterBackend: Send + Sync {
    /// Bind the event set to this thread's counter context.
    ///
    /// Called once per thread before the first read. An error degrades
    /// that thread to zero HWPC values; time and counts stay valid.
    fn bind_events(&self, thread: usize, events: &[EventDesc]) -> Result<(), HwpcError>;

    /// Non-destructive snapshot of the bound events, in table order.
    /// Must never clear or stop the counters.
    fn read(&self, thread: usize, out: &mut [u64]) -> Result<(), HwpcError>;

    /// Read while quiescing the context, for back-ends that cannot read
    /// a running counter. Must leave the counters running on return.
    fn stop(&self, thread: usize, out: &mut [u64]) -> Result<(), HwpcError> {
        self.read(thread, out)
    }

    /// Re-arm after [`CounterBackend::stop`]; the snapshot taken there is
    /// passed back for back-ends that reload it. Counters keep running.
    fn start(&self, _thread: usize, _snapshot: &[u64]) -> Result<(), HwpcError> {
        Ok(())
    }
}

/// A back-end with no counter hardware: binds always succeed, every
/// snapshot reads zero.
#[derive(Debug, Default)]
pub struct NullBackend;

impl CounterBackend for NullBackend {
    fn bind_events(&self, _thread: usize, _events: &[EventDesc]) -> Result<(), HwpcError> {
        Ok(())
    }

    fn read(&self, _thread: usize, out: &mut [u64]) -> Result<(), HwpcError> {
        for v in out.iter_mut() {
            *v = 0;
        }
        Ok(())
    }
}
