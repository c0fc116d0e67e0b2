//! The fork-join substrate the engine runs on.
//!
//! Measurement code executes both outside and inside parallel regions,
//! so the engine asks the runtime three questions: how wide is the
//! machine, which thread am I, and am I inside a region right now. The
//! one active operation, [`ThreadRuntime::fan_out`], runs a closure once
//! per thread with an implicit barrier on exit; it powers the serial
//! whole-process counter snapshot and phase 2 of the thread merge.

use std::cell::Cell;
use std::thread;

/// Seam to the threading runtime.
pub trait ThreadRuntime: Send + Sync {
    /// Width of the thread team.
    fn max_threads(&self) -> usize;

    /// Logical number of the calling thread; 0 is the master and also the
    /// answer outside any region.
    fn thread_num(&self) -> usize;

    /// Is the calling thread inside a parallel region?
    fn in_parallel(&self) -> bool;

    /// Run `work(t)` once for every thread number `t`, in parallel where
    /// the runtime can. Returns only after every invocation finished.
    fn fan_out(&self, work: &(dyn Fn(usize) + Sync));
}

thread_local! {
    /// The thread number assigned for the duration of a region, if any.
    static REGION: Cell<Option<usize>> = Cell::new(None);
}

/// Single-threaded runtime: no regions, the master is the whole team.
#[derive(Debug, Default)]
pub struct SerialRuntime;

impl ThreadRuntime for SerialRuntime {
    fn max_threads(&self) -> usize {
        1
    }

    fn thread_num(&self) -> usize {
        0
    }

    fn in_parallel(&self) -> bool {
        false
    }

    fn fan_out(&self, work: &(dyn Fn(usize) + Sync)) {
        work(0);
    }
}

/// Fork-join runtime on std scoped threads.
///
/// Every [`ThreadRuntime::fan_out`] spawns a fresh team of `threads - 1`
/// workers plus the caller as thread 0 and joins them all before
/// returning, which doubles as the barrier the thread merge needs.
#[derive(Debug)]
pub struct ScopedRuntime {
    threads: usize,
}

impl ScopedRuntime {
    pub fn new(threads: usize) -> ScopedRuntime {
        ScopedRuntime {
            threads: threads.max(1),
        }
    }

    /// Width from `OMP_NUM_THREADS`, falling back to the core count.
    pub fn from_env() -> ScopedRuntime {
        let threads = std::env::var("OMP_NUM_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(num_cpus::get);
        ScopedRuntime::new(threads)
    }
}

impl ThreadRuntime for ScopedRuntime {
    fn max_threads(&self) -> usize {
        self.threads
    }

    fn thread_num(&self) -> usize {
        REGION.with(|r| r.get()).unwrap_or(0)
    }

    fn in_parallel(&self) -> bool {
        REGION.with(|r| r.get()).is_some()
    }

    fn fan_out(&self, work: &(dyn Fn(usize) + Sync)) {
        if self.threads == 1 {
            run_as(0, work);
            return;
        }
        thread::scope(|s| {
            for t in 1..self.threads {
                s.spawn(move || run_as(t, work));
            }
            run_as(0, work);
        });
    }
}

fn run_as(t: usize, work: &(dyn Fn(usize) + Sync)) {
    let previous = REGION.with(|r| r.replace(Some(t)));
    work(t);
    REGION.with(|r| r.set(previous));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn serial_runtime_is_one_wide() {
        let rt = SerialRuntime;
        assert_eq!(rt.max_threads(), 1);
        assert!(!rt.in_parallel());
        let hits = AtomicUsize::new(0);
        rt.fan_out(&|t| {
            assert_eq!(t, 0);
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fan_out_reaches_every_thread_once() {
        let rt = ScopedRuntime::new(4);
        let mask = AtomicUsize::new(0);
        rt.fan_out(&|t| {
            assert!(rt.in_parallel());
            assert_eq!(rt.thread_num(), t);
            mask.fetch_or(1 << t, Ordering::SeqCst);
        });
        assert_eq!(mask.load(Ordering::SeqCst), 0b1111);
        assert!(!rt.in_parallel());
        assert_eq!(rt.thread_num(), 0);
    }
}
