//! Serial-mode measurement: single sections, nesting, mis-pairing and
//! report idempotency, all on the one-thread runtime with a scripted
//! counter back-end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use pmlib::{
    CounterBackend, EventDesc, HwpcError, Monitor, MonitorBuilder, SerialRuntime, WorkKind,
};

/// Counters that advance by a fixed increment on every read, per thread.
/// One start/stop pair therefore accumulates exactly the increment.
struct StepBackend {
    increments: Vec<u64>,
    counters: Mutex<HashMap<usize, Vec<u64>>>,
}

impl StepBackend {
    fn new(increments: &[u64]) -> StepBackend {
        StepBackend {
            increments: increments.to_vec(),
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl CounterBackend for StepBackend {
    fn bind_events(&self, _thread: usize, _events: &[EventDesc]) -> Result<(), HwpcError> {
        Ok(())
    }

    fn read(&self, thread: usize, out: &mut [u64]) -> Result<(), HwpcError> {
        let mut counters = self.counters.lock().unwrap();
        let state = counters
            .entry(thread)
            .or_insert_with(|| vec![0; out.len()]);
        for (e, v) in out.iter_mut().enumerate() {
            state[e] += self.increments.get(e).copied().unwrap_or(0);
            *v = state[e];
        }
        Ok(())
    }
}

fn serial_monitor(increments: &[u64]) -> Monitor {
    MonitorBuilder::new()
        .runtime(Arc::new(SerialRuntime))
        .counters(Arc::new(StepBackend::new(increments)))
        .initialize()
        .expect("monitor initialises")
}

#[test]
fn single_section_counts_time_flop_and_rate() {
    // With the default FLOPS chooser each pair accumulates 1e9 FP ops.
    let monitor = serial_monitor(&[600_000_000, 400_000_000]);
    monitor.start("A");
    sleep(Duration::from_millis(50));
    monitor.stop("A", 1.0e9, 1);

    let mut out = Vec::new();
    monitor.report(&mut out).expect("report renders");
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("A"));

    let snap = monitor.snapshot("A").expect("A is registered");
    assert_eq!(snap.calls, 1);
    assert!(snap.time >= 0.045, "time {}", snap.time);
    assert!(snap.time < 2.0, "time {}", snap.time);
    assert_eq!(snap.user_flop, 1.0e9);
    assert!(snap.healthy);

    // Merged process totals: 1e9 measured ops, rate = ops / elapsed.
    assert_eq!(snap.accum, vec![600_000_000.0, 400_000_000.0]);
    assert_eq!(snap.sorted[0], 1.0e9);
    let rate = *snap.sorted.last().unwrap();
    let expected = 1.0e9 / snap.time;
    assert!(
        (rate - expected).abs() / expected < 1e-6,
        "rate {} vs {}",
        rate,
        expected
    );
}

#[test]
fn nested_sections_mark_the_outer_inclusive() {
    let monitor = serial_monitor(&[0, 0]);
    monitor.start("outer");
    monitor.start("inner");
    monitor.stop("inner", 0.0, 1);
    monitor.stop("outer", 0.0, 1);

    let mut out = Vec::new();
    monitor.report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    let outer = monitor.snapshot("outer").unwrap();
    let inner = monitor.snapshot("inner").unwrap();
    assert!(!outer.exclusive);
    assert!(inner.exclusive);
    assert!(text.contains("outer (*)"));
    assert!(!text.contains("inner (*)"));
}

#[test]
fn user_flop_sums_exactly() {
    let monitor = serial_monitor(&[0, 0]);
    for _ in 0..3 {
        monitor.start("kernel");
        monitor.stop("kernel", 2.5, 4);
    }
    let snap = monitor.snapshot("kernel").unwrap();
    assert_eq!(snap.calls, 3);
    assert_eq!(snap.user_flop, 30.0);
}

#[test]
fn running_section_is_force_stopped_at_report() {
    let monitor = serial_monitor(&[0, 0]);
    monitor.start("X");
    sleep(Duration::from_millis(10));

    let mut out = Vec::new();
    monitor.report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("force-stopped"));
    assert!(text.contains("'X'"));

    let snap = monitor.snapshot("X").unwrap();
    assert!(!snap.healthy);
    assert!(snap.time > 0.0);
}

#[test]
fn stop_without_start_is_ignored() {
    let monitor = serial_monitor(&[0, 0]);
    monitor.stop("ghost", 1.0, 1);
    let snap = monitor.snapshot("ghost").unwrap();
    assert_eq!(snap.calls, 0);
    assert_eq!(snap.time, 0.0);
    assert_eq!(snap.user_flop, 0.0);
    assert!(snap.healthy);
}

#[test]
fn report_is_idempotent_and_completes_the_registry() {
    let monitor = serial_monitor(&[10, 10]);
    monitor.start("A");
    monitor.stop("A", 1.0, 1);
    monitor.start("B");
    monitor.stop("B", 2.0, 1);

    let mut first = Vec::new();
    monitor.report(&mut first).unwrap();
    let calls_after_first = monitor.snapshot("A").unwrap().calls;
    let accum_after_first = monitor.snapshot("A").unwrap().accum.clone();

    let mut second = Vec::new();
    monitor.report(&mut second).unwrap();

    // No double merge, Root stays stopped, totals unchanged.
    assert_eq!(monitor.snapshot("A").unwrap().calls, calls_after_first);
    assert_eq!(monitor.snapshot("A").unwrap().accum, accum_after_first);
    assert_eq!(
        monitor.snapshot(pmlib::ROOT_LABEL).unwrap().calls,
        1,
        "Root is stopped exactly once"
    );

    // The data-bearing lines agree between the two renderings.
    let strip = |text: &[u8]| -> Vec<String> {
        String::from_utf8_lossy(text)
            .lines()
            .filter(|l| !l.starts_with("Printed at"))
            .map(|l| l.to_string())
            .collect()
    };
    assert_eq!(strip(&first), strip(&second));

    // Registry agreement: the master cache covers the shared map.
    assert_eq!(monitor.section_count(), monitor.local_section_count());
}

#[test]
fn reset_zeroes_a_section_but_never_root() {
    let monitor = serial_monitor(&[5, 5]);
    monitor.start("w");
    monitor.stop("w", 3.0, 1);
    assert_eq!(monitor.snapshot("w").unwrap().calls, 1);

    monitor.reset("w");
    let snap = monitor.snapshot("w").unwrap();
    assert_eq!(snap.calls, 0);
    assert_eq!(snap.user_flop, 0.0);

    monitor.reset(pmlib::ROOT_LABEL);
    // Root keeps running through a reset attempt.
    let mut out = Vec::new();
    monitor.report(&mut out).unwrap();
    assert_eq!(monitor.snapshot(pmlib::ROOT_LABEL).unwrap().calls, 1);
}

#[test]
fn properties_set_kind_and_exclusivity() {
    let monitor = serial_monitor(&[0, 0]);
    monitor.set_properties("halo", WorkKind::Communication, true);
    monitor.start("halo");
    monitor.stop("halo", 0.0, 1);
    let mut out = Vec::new();
    monitor.report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    // COMMUNICATION sections carry the straggler column instead of '-'.
    let line = text
        .lines()
        .find(|l| l.trim_start().starts_with("halo"))
        .expect("halo row present");
    assert!(!line.trim_end().ends_with('-'));
}
