/// Host-target tests for the boot sequence and the release hand-off.
///
/// Run with: cargo test --lib
///
/// The host console is one shared capture buffer, so tests that assert
/// output hold `console::OUT_LOCK` and only check their own substrings.
use super::mock_hw::{MockHardware, Op};
use super::*;
use crate::console;
use crate::thread::{worker_entry, ParkMode, ThreadContext};

#[test]
fn release_happens_strictly_after_vm_init() {
    let mut hw = MockHardware::new();
    let idle = run(&mut hw, ThreadContext::primary(), BootConfig::default());
    assert_eq!(idle.mode(), ParkMode::Spin);

    let vm_at = hw
        .ops
        .iter()
        .position(|op| *op == Op::VmInit)
        .expect("vm init never ran");
    let release_at = hw
        .ops
        .iter()
        .position(|op| matches!(op, Op::Release(_)))
        .expect("release never issued");
    assert!(vm_at < release_at);
}

#[test]
fn full_sequence_runs_in_order() {
    let mut hw = MockHardware::new();
    let _ = run(&mut hw, ThreadContext::primary(), BootConfig::default());
    assert_eq!(
        hw.ops,
        [Op::VmInit, Op::AllocPage, Op::Release(0xFFFF_FFFF)]
    );
}

#[test]
fn smoke_pattern_lands_in_the_page() {
    let mut hw = MockHardware::new();
    let _ = run(&mut hw, ThreadContext::primary(), BootConfig::default());
    assert_eq!(hw.page_word(), TEST_PATTERN);
}

#[test]
fn vm_init_failure_parks_without_releasing() {
    let mut hw = MockHardware::failing_vm_init();
    let idle = run(&mut hw, ThreadContext::primary(), BootConfig::default());

    // Default fatal policy waits; nothing after the failed step may run.
    assert_eq!(idle.mode(), ParkMode::Wait);
    assert_eq!(hw.ops, [Op::VmInit]);
}

#[test]
fn alloc_failure_parks_without_releasing() {
    let mut hw = MockHardware::failing_alloc();
    let config = BootConfig {
        on_fatal: ParkMode::Spin,
    };
    let idle = run(&mut hw, ThreadContext::primary(), config);

    assert_eq!(idle.mode(), ParkMode::Spin);
    assert_eq!(hw.ops, [Op::VmInit, Op::AllocPage]);
}

#[test]
fn boot_emits_greeting_and_pattern() {
    let _guard = console::OUT_LOCK.lock();
    let _ = console::captured();

    let mut hw = MockHardware::new();
    let _ = run(&mut hw, ThreadContext::primary(), BootConfig::default());

    let out = console::captured();
    assert!(out.contains("Hello kernel land"));
    assert!(out.contains("abcdef12"));
}

#[test]
fn fatal_path_is_logged() {
    let _guard = console::OUT_LOCK.lock();
    let _ = console::captured();

    let mut hw = MockHardware::failing_vm_init();
    let _ = run(&mut hw, ThreadContext::primary(), BootConfig::default());

    assert!(console::captured().contains("boot: fatal: virtual memory init failed"));
}

#[test]
fn worker_emits_its_own_id() {
    let _guard = console::OUT_LOCK.lock();
    let _ = console::captured();

    let idle = worker_entry(ThreadContext::worker(57005));
    assert_eq!(idle.mode(), ParkMode::Spin);
    assert!(console::captured().contains("57005"));
}

#[test]
fn workers_emit_distinct_ids_in_some_interleaving() {
    let _guard = console::OUT_LOCK.lock();
    let _ = console::captured();

    for id in [91001, 91002, 91003] {
        let _ = worker_entry(ThreadContext::worker(id));
    }

    let out = console::captured();
    for id in ["91001", "91002", "91003"] {
        assert!(out.contains(id));
    }
}
