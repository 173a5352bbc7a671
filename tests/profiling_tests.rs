//! Profiler behavior: hot-spot ranking, candidate selection, the
//! optimization analysis, and profile data export/import.

use ember::compiler;
use ember::vm::{ExecutionProfiler, Machine, OptimizationKind, OptimizationLevel, SourceKind};

#[test]
fn test_profiler_starts_empty() {
    let profiler = ExecutionProfiler::new(10);
    assert_eq!(profiler.total_visits(), 0);
    assert!(profiler.hot_spots().is_empty());
    assert!(profiler.compilation_candidates().is_empty());
}

#[test]
fn test_visit_counting() {
    let mut profiler = ExecutionProfiler::new(10);
    profiler.record_visit(1);
    profiler.record_visit(1);
    profiler.record_visit(2);
    profiler.record_visit(1);

    assert_eq!(profiler.visit_count(1), 3);
    assert_eq!(profiler.visit_count(2), 1);
    assert_eq!(profiler.visit_count(99), 0);
    assert_eq!(profiler.total_visits(), 4);
}

#[test]
fn test_hot_spot_ordering() {
    let mut profiler = ExecutionProfiler::new(0);
    for _ in 0..5 {
        profiler.record_visit(7);
    }
    for _ in 0..9 {
        profiler.record_visit(2);
    }
    for _ in 0..5 {
        profiler.record_visit(3);
    }

    let spots = profiler.hot_spots();
    let order: Vec<(usize, u64)> = spots.iter().map(|s| (s.pc, s.count)).collect();
    // Count descending; equal counts fall back to ascending pc.
    assert_eq!(order, vec![(2, 9), (3, 5), (7, 5)]);
}

#[test]
fn test_threshold_selects_candidates() {
    let mut profiler = ExecutionProfiler::new(100);
    for _ in 0..150 {
        profiler.record_visit(4);
    }
    for _ in 0..100 {
        profiler.record_visit(9);
    }

    // 100 visits does not exceed a threshold of 100.
    assert_eq!(profiler.compilation_candidates(), vec![4]);
}

#[test]
fn test_optimization_level_scaling() {
    let mut profiler = ExecutionProfiler::new(10);
    for (pc, visits) in [(0u64, 10u64), (1, 100), (2, 1000), (3, 10000)] {
        for _ in 0..visits {
            profiler.record_visit(pc as usize);
        }
    }

    assert_eq!(profiler.suggested_optimization_level(0), OptimizationLevel::None);
    assert_eq!(profiler.suggested_optimization_level(1), OptimizationLevel::O1);
    assert_eq!(profiler.suggested_optimization_level(2), OptimizationLevel::O2);
    assert_eq!(profiler.suggested_optimization_level(3), OptimizationLevel::O3);
}

#[test]
fn test_run_profile_finds_loop_patterns() {
    let source = r#"
        PUSH 30
    loop:
        PUSH 1
        SUB
        DUP
        PUSH 0
        GT
        JT loop
        HALT
    "#;
    let program = compiler::compile(source, SourceKind::Assembly).unwrap();
    let mut machine = Machine::new();
    machine.load(program);
    let report = machine.run();

    let kinds: Vec<OptimizationKind> = report
        .profile
        .optimizations
        .iter()
        .map(|o| o.kind)
        .collect();

    // The backward JT is a loop, PUSH/PUSH/SUB folds, and the branch is
    // taken 29 times out of 30.
    assert!(kinds.contains(&OptimizationKind::LoopInvariantHoisting));
    assert!(kinds.contains(&OptimizationKind::ConstantFolding));
    assert!(kinds.contains(&OptimizationKind::BranchStraightening));

    // Suggestions anchor at candidate pcs.
    for optimization in &report.profile.optimizations {
        assert!(
            report
                .profile
                .compilation_candidates
                .contains(&optimization.pc)
        );
    }
}

#[test]
fn test_straight_line_code_suggests_nothing() {
    let program =
        compiler::compile("PUSH 1\nPUSH 2\nADD\nHALT", SourceKind::Assembly).unwrap();
    let mut machine = Machine::new();
    machine.load(program);
    let report = machine.run();

    // Each pc runs once: nothing crosses the threshold.
    assert!(report.profile.compilation_candidates.is_empty());
    assert!(report.profile.optimizations.is_empty());
}

#[test]
fn test_profile_export_import_roundtrip() {
    let mut profiler = ExecutionProfiler::new(10);
    for _ in 0..100 {
        profiler.record_visit(5);
        profiler.record_branch(8, true);
    }

    let data = profiler.export_profile_data();
    assert!(data.contains("visit_counts"));
    assert!(data.contains("branch_profiles"));

    let mut restored = ExecutionProfiler::new(10);
    restored.import_profile_data(&data).unwrap();
    assert_eq!(restored.visit_count(5), 100);
    assert_eq!(restored.total_visits(), 100);
    assert_eq!(restored.compilation_candidates(), vec![5]);

    assert!(restored.import_profile_data("not json").is_err());
}

#[test]
fn test_profiler_reset() {
    let mut profiler = ExecutionProfiler::new(10);
    profiler.record_visit(1);
    profiler.record_branch(2, false);
    assert!(profiler.total_visits() > 0);

    profiler.reset();
    assert_eq!(profiler.total_visits(), 0);
    assert_eq!(profiler.visit_count(1), 0);
    assert!(profiler.branch_profile(2).is_none());
}

#[test]
fn test_independent_machines_do_not_share_profiles() {
    let hot = compiler::compile(
        "PUSH 20\nloop:\nPUSH 1\nSUB\nDUP\nPUSH 0\nGT\nJT loop\nHALT",
        SourceKind::Assembly,
    )
    .unwrap();
    let cold = compiler::compile("PUSH 1\nHALT", SourceKind::Assembly).unwrap();

    let mut first = Machine::new();
    let mut second = Machine::new();
    first.load(hot);
    second.load(cold);

    let hot_report = first.run();
    let cold_report = second.run();

    assert!(!hot_report.profile.compilation_candidates.is_empty());
    assert!(cold_report.profile.compilation_candidates.is_empty());
}
