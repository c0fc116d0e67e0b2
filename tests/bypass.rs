//! `BYPASS_PMLIB` turns the whole API into no-ops. Kept in its own test
//! binary because the variable is process-global.

use std::sync::Arc;

use pmlib::{Monitor, MonitorBuilder, PowerKnob, SerialRuntime};

#[test]
fn every_call_is_a_no_op_under_bypass() {
    std::env::set_var("BYPASS_PMLIB", "1");

    let monitor = MonitorBuilder::new()
        .runtime(Arc::new(SerialRuntime))
        .initialize()
        .expect("bypassed monitor still initialises");

    monitor.start("A");
    monitor.stop("A", 1.0e9, 1);
    monitor.reset("A");
    monitor.reset_all();
    monitor.merge_threads(0);
    monitor.post_trace();
    assert_eq!(monitor.get_power_knob(PowerKnob::Eco).unwrap(), 0);
    monitor.set_power_knob(PowerKnob::Eco, 1).unwrap();

    // Nothing is registered, not even Root.
    assert_eq!(monitor.section_count(), 0);
    assert!(monitor.snapshot("A").is_none());
    assert!(monitor.snapshot(pmlib::ROOT_LABEL).is_none());

    let mut out = Vec::new();
    monitor.report(&mut out).unwrap();
    assert!(out.is_empty());

    let path = monitor.save_state(None).unwrap();
    assert_eq!(path, std::path::PathBuf::new());

    std::env::remove_var("BYPASS_PMLIB");
    drop(monitor);
    let _ = Monitor::initialize();
}
