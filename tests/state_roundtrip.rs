//! Shell-mode persistence: a start-timer process hands off to a
//! stop-timer process through the state file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pmlib::{
    CounterBackend, EventDesc, HwpcError, MonitorBuilder, SavedState, SerialRuntime,
};

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

#[test]
fn saved_file_round_trips_bit_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timer.state");

    let monitor = MonitorBuilder::new()
        .runtime(Arc::new(SerialRuntime))
        .counters(Arc::new(StepBackend::new(&[3, 7])))
        .initialize()
        .unwrap();
    monitor.start("job step");
    let written = monitor.save_state(Some(&path)).unwrap();
    assert_eq!(written, path);

    // Parse, re-serialise, compare images: every integer snapshot and
    // the decimal start time survive exactly.
    let bytes = std::fs::read(&path).unwrap();
    let parsed = SavedState::parse(&bytes).unwrap();
    assert_eq!(parsed.sections.len(), 1);
    let section = &parsed.sections[0];
    assert_eq!(section.label, "job step");
    assert_eq!(section.threads, 1);
    assert_eq!(section.events, 2);
    // Root read once, then the bracket's start read: 2 increments each.
    assert_eq!(section.snapshots, vec![6, 14]);

    let mut again = Vec::new();
    parsed.write_to(&mut again).unwrap();
    assert_eq!(again, bytes);
}

#[test]
fn loaded_state_completes_the_bracket_in_a_fresh_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("handoff.state");
    let backend = Arc::new(StepBackend::new(&[10, 1]));

    // "start timer" process.
    let starter = MonitorBuilder::new()
        .runtime(Arc::new(SerialRuntime))
        .counters(backend.clone())
        .initialize()
        .unwrap();
    starter.start("span");
    starter.save_state(Some(&path)).unwrap();
    drop(starter);

    // "stop timer" process, sharing the node's counters.
    let stopper = MonitorBuilder::new()
        .runtime(Arc::new(SerialRuntime))
        .counters(backend)
        .initialize()
        .unwrap();
    stopper.load_state(Some(&path)).unwrap();
    stopper.stop("span", 0.0, 1);

    let mut out = Vec::new();
    stopper.report(&mut out).unwrap();

    let snap = stopper.snapshot("span").unwrap();
    assert_eq!(snap.calls, 1);
    // Counter history: starter read twice (Root, bracket start), the
    // stopper's Root start made it three, the closing read four. The
    // delta against the persisted snapshot spans reads 3 and 4.
    assert_eq!(snap.accum, vec![20.0, 2.0]);
}

#[test]
fn load_rejects_damaged_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.state");
    std::fs::write(&path, b"pmlib-state 1 FLOPS\nk\nnot-a-number 1 2\n").unwrap();

    let monitor = MonitorBuilder::new()
        .runtime(Arc::new(SerialRuntime))
        .initialize()
        .unwrap();
    assert!(monitor.load_state(Some(&path)).is_err());
}
