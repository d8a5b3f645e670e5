use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gridcalc_dag::DagError;
use gridcalc_formulas::{
    CalculationMode, ConfigError, EngineConfig, FormulaEngine, FormulaError, FunctionCategory,
    FunctionInfo, FunctionRegistry,
};
use gridcalc_primitives::{Cell, CellCoordinate, ErrorValue, Value};
use gridcalc_storage::StorageEngine;

fn c(a1: &str) -> CellCoordinate {
    CellCoordinate::from_a1(a1).expect("valid coordinate")
}

fn engine_with(config: EngineConfig) -> FormulaEngine {
    FormulaEngine::new(config).expect("create engine")
}

fn engine() -> FormulaEngine {
    engine_with(EngineConfig::default())
}

fn manual() -> EngineConfig {
    EngineConfig {
        calculation_mode: CalculationMode::Manual,
        ..EngineConfig::default()
    }
}

fn engine_with_registry(config: EngineConfig, registry: FunctionRegistry) -> FormulaEngine {
    let storage = Arc::new(StorageEngine::new(config.storage.clone()));
    FormulaEngine::with_parts(config, storage, Arc::new(registry)).expect("create engine")
}

fn value(engine: &FormulaEngine, a1: &str) -> Value {
    engine.get_value(c(a1)).expect("read cell")
}

#[test]
fn test_sum_recalculates_only_dependents() {
    let engine = engine();
    engine.set_cell_value(c("A1"), 1.0).expect("set A1");
    engine.set_cell_value(c("A2"), 2.0).expect("set A2");
    engine.set_cell_value(c("A3"), 3.0).expect("set A3");

    let result = engine
        .set_cell_formula(c("B1"), "=SUM(A1:A3)")
        .expect("set B1");
    assert_eq!(result.value, Value::Number(6.0));
    assert!(!result.is_error);

    engine.set_cell_value(c("A2"), 10.0).expect("update A2");
    assert_eq!(value(&engine, "B1"), Value::Number(14.0));
    let stats = engine.last_recalculation();
    assert_eq!(stats.cells_calculated, 1);
    assert_eq!(stats.errors, 0);
    assert!(engine.dirty_cells().is_empty());
}

#[test]
fn test_circular_formula_is_rejected() {
    let engine = engine();
    engine.set_cell_formula(c("A1"), "=B1").expect("set A1");
    let err = engine
        .set_cell_formula(c("B1"), "=A1")
        .expect_err("cycle must be rejected");
    assert!(err.is_circular());
    match err {
        FormulaError::Dependency(DagError::CircularDependency { cycle }) => {
            assert_eq!(cycle.first(), Some(&c("B1")));
            assert_eq!(cycle.last(), Some(&c("B1")));
        }
        other => panic!("unexpected error: {other}"),
    }

    let graph = engine.export_graph();
    let b1 = graph.nodes.iter().find(|node| node.cell == c("B1"));
    assert!(b1.map_or(true, |node| node.dependencies.is_empty()));
    assert!(engine.compiled_formula(c("B1")).is_none());
    assert!(engine.get_cell(c("B1")).expect("read").is_none());
    assert_eq!(engine.statistics().formulas_rejected, 1);
}

#[test]
fn test_self_reference_is_rejected() {
    let engine = engine();
    let err = engine
        .set_cell_formula(c("A1"), "=A1+1")
        .expect_err("self reference must be rejected");
    assert!(err.is_circular());
}

#[test]
fn test_error_values() {
    let engine = engine();
    let result = engine.set_cell_formula(c("A1"), "=1/0").expect("set");
    assert_eq!(result.value, Value::Error(ErrorValue::DivZero));
    assert_eq!(result.error_message.as_deref(), Some("#DIV/0!"));

    let result = engine.set_cell_formula(c("B1"), "=C1").expect("set");
    assert_eq!(result.value, Value::Number(0.0));

    let result = engine.set_cell_formula(c("B2"), "=A1+1").expect("set");
    assert_eq!(result.value, Value::Error(ErrorValue::DivZero));

    let result = engine.set_cell_formula(c("B3"), "=FOO(1)").expect("set");
    assert_eq!(
        result.value.to_string(),
        "#NAME: Unknown function: FOO"
    );
}

#[test]
fn test_diamond_evaluates_each_cell_once() {
    let engine = engine_with(manual());
    engine.set_cell_value(c("A1"), 1.0).expect("set");
    engine.set_cell_formula(c("B1"), "=A1*2").expect("set");
    engine.set_cell_formula(c("C1"), "=A1*3").expect("set");
    engine.set_cell_formula(c("D1"), "=B1+C1").expect("set");
    engine.recalculate_dirty().expect("settle");

    engine.set_cell_value(c("A1"), 2.0).expect("update");
    let stats = engine.recalculate_dirty().expect("recalculate");
    assert_eq!(stats.cells_calculated, 3);
    assert_eq!(value(&engine, "D1"), Value::Number(10.0));
}

#[test]
fn test_manual_mode_defers_recalculation() {
    let engine = engine_with(manual());
    engine.set_cell_value(c("A1"), 1.0).expect("set");
    engine.set_cell_formula(c("B1"), "=A1+1").expect("set");
    assert_eq!(value(&engine, "B1"), Value::Number(2.0));

    engine.set_cell_value(c("A1"), 5.0).expect("update");
    assert_eq!(value(&engine, "B1"), Value::Number(2.0));
    assert!(engine.is_dirty(c("B1")));

    let stats = engine.recalculate_dirty().expect("recalculate");
    assert_eq!(stats.cells_calculated, 1);
    assert_eq!(value(&engine, "B1"), Value::Number(6.0));

    engine.set_cell_value(c("A1"), 7.0).expect("update");
    engine
        .set_calculation_mode(CalculationMode::Automatic)
        .expect("switch mode");
    assert_eq!(value(&engine, "B1"), Value::Number(8.0));
}

#[test]
fn test_formula_entered_before_its_inputs() {
    let engine = engine_with(manual());
    engine
        .set_cell_formula(c("B1"), "=SUM(A1:A3)")
        .expect("set B1");
    assert_eq!(value(&engine, "B1"), Value::Number(0.0));

    engine.set_cell_value(c("A1"), 1.0).expect("set A1");
    engine.set_cell_value(c("A2"), 2.0).expect("set A2");
    engine.set_cell_value(c("A3"), 3.0).expect("set A3");
    assert!(engine.is_dirty(c("B1")));
    engine.recalculate_dirty().expect("recalculate");
    assert_eq!(value(&engine, "B1"), Value::Number(6.0));

    engine.set_cell_value(c("A2"), 10.0).expect("update A2");
    let stats = engine.recalculate_dirty().expect("recalculate");
    assert_eq!(stats.cells_calculated, 1);
    assert_eq!(value(&engine, "B1"), Value::Number(14.0));
}

#[test]
fn test_direct_storage_writes_need_notification() {
    let engine = engine();
    engine.set_cell_value(c("A1"), 1.0).expect("set A1");
    engine.set_cell_formula(c("B1"), "=A1*2").expect("set B1");

    engine
        .storage()
        .set_cell(c("A1"), Cell::with_value(5.0))
        .expect("direct write");
    assert_eq!(value(&engine, "B1"), Value::Number(2.0));

    engine.notify_cell_changed(c("A1")).expect("notify");
    assert_eq!(value(&engine, "B1"), Value::Number(10.0));

    engine
        .storage()
        .set_cell(c("C1"), Cell::with_formula("=B1+1"))
        .expect("direct formula write");
    engine.notify_cell_changed(c("C1")).expect("notify formula");
    assert!(engine.compiled_formula(c("C1")).is_some());
    assert_eq!(value(&engine, "C1"), Value::Number(11.0));

    engine
        .storage()
        .set_cell(c("B1"), Cell::with_value(3.0))
        .expect("overwrite formula");
    engine.notify_cell_changed(c("B1")).expect("notify overwrite");
    assert!(engine.compiled_formula(c("B1")).is_none());
    assert_eq!(value(&engine, "C1"), Value::Number(4.0));
}

#[test]
fn test_volatile_cells_recalculate_every_pass() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let registry = FunctionRegistry::default();
    registry.register_function(
        FunctionInfo::new("TICK", FunctionCategory::Custom, move |_: &[Value]| {
            Value::Number(counter.fetch_add(1, Ordering::SeqCst) as f64)
        })
        .args(0, Some(0))
        .volatile(),
    );
    let engine = engine_with_registry(manual(), registry);

    engine.set_cell_formula(c("A1"), "=TICK()").expect("set");
    engine.set_cell_formula(c("B1"), "=A1*10").expect("set");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = engine.recalculate_dirty().expect("first pass");
    assert_eq!(stats.cells_calculated, 2);
    assert_eq!(value(&engine, "B1"), Value::Number(10.0));

    engine.recalculate_dirty().expect("second pass");
    assert_eq!(value(&engine, "B1"), Value::Number(20.0));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_slow_formula_times_out() {
    let registry = FunctionRegistry::default();
    registry.register_function(
        FunctionInfo::new("SLOW", FunctionCategory::Custom, |_: &[Value]| {
            thread::sleep(Duration::from_millis(50));
            Value::Number(1.0)
        })
        .volatile(),
    );
    let mut config = manual();
    config.performance.calculation_timeout_ms = 10;
    let engine = engine_with_registry(config, registry);

    let result = engine.set_cell_formula(c("A1"), "=SLOW()+1").expect("set");
    assert_eq!(
        result.value,
        Value::Error(ErrorValue::error("calculation timed out"))
    );
    let stats = engine.recalculate_dirty().expect("recalculate");
    assert_eq!(stats.errors, 1);
}

#[test]
fn test_panicking_function_becomes_error() {
    let registry = FunctionRegistry::default();
    registry.register_function(FunctionInfo::new(
        "EXPLODE",
        FunctionCategory::Custom,
        |_: &[Value]| -> Value { panic!("exploded") },
    ));
    let engine = engine_with_registry(EngineConfig::default(), registry);
    engine.set_cell_value(c("A1"), 1.0).expect("set");
    engine.set_cell_formula(c("B1"), "=A1+1").expect("set");

    let result = engine.set_cell_formula(c("C1"), "=EXPLODE()").expect("set");
    assert_eq!(result.value, Value::Error(ErrorValue::error("exploded")));

    engine.set_cell_value(c("A1"), 2.0).expect("update");
    assert_eq!(value(&engine, "B1"), Value::Number(3.0));
}

#[test]
fn test_wide_level_evaluates_in_parallel() {
    let mut config = manual();
    config.performance.max_worker_threads = 4;
    config.performance.parallel_threshold = 4;
    let engine = engine_with(config);
    engine.set_cell_value(c("A1"), 3.0).expect("set");
    for row in 1..=20 {
        let coord = CellCoordinate::new(row - 1, 1).expect("coordinate");
        engine
            .set_cell_formula(coord, &format!("=A1*{row}"))
            .expect("set");
    }

    engine.set_cell_value(c("A1"), 2.0).expect("update");
    let stats = engine.recalculate_dirty().expect("recalculate");
    assert_eq!(stats.cells_calculated, 20);
    assert_eq!(stats.parallel_calculations, 20);
    assert_eq!(value(&engine, "B20"), Value::Number(40.0));

    let stats = engine.recalculate_all().expect("recalculate all");
    assert_eq!(stats.cells_calculated, 20);
}

#[test]
fn test_sequential_engine_never_uses_pool() {
    let mut config = manual();
    config.performance.parallel_calculation = false;
    config.performance.parallel_threshold = 1;
    let engine = engine_with(config);
    for row in 0..10 {
        let coord = CellCoordinate::new(row, 0).expect("coordinate");
        engine.set_cell_formula(coord, "=1+Z1").expect("set");
    }
    let stats = engine.recalculate_all().expect("recalculate");
    assert_eq!(stats.cells_calculated, 10);
    assert_eq!(stats.parallel_calculations, 0);
}

#[test]
fn test_overlapping_pass_returns_previous_stats() {
    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    let registry = FunctionRegistry::default();
    registry.register_function(
        FunctionInfo::new("WAIT", FunctionCategory::Custom, move |_: &[Value]| {
            flag.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            Value::Number(1.0)
        })
        .volatile(),
    );
    let engine = Arc::new(engine_with_registry(manual(), registry));
    engine.set_cell_formula(c("A1"), "=WAIT()").expect("set");
    started.store(false, Ordering::SeqCst);

    let background = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.recalculate_all().expect("recalculate"))
    };
    while !started.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    let overlapping = engine.recalculate_dirty().expect("overlapping pass");
    assert_eq!(overlapping.cells_calculated, 0);

    let finished = background.join().expect("join");
    assert_eq!(finished.cells_calculated, 1);
    assert_eq!(engine.last_recalculation(), finished);
}

#[test]
fn test_delete_cell_updates_dependents() {
    let engine = engine();
    engine.set_cell_value(c("A1"), 4.0).expect("set");
    engine.set_cell_formula(c("B1"), "=A1*2").expect("set");
    assert!(engine.delete_cell(c("A1")).expect("delete"));
    assert_eq!(value(&engine, "B1"), Value::Number(0.0));
    assert!(!engine.delete_cell(c("Q9")).expect("delete missing"));

    assert!(engine.delete_cell(c("B1")).expect("delete formula"));
    assert!(engine.compiled_formula(c("B1")).is_none());
    assert!(engine.export_graph().nodes.is_empty());
}

#[test]
fn test_oversized_range_is_rejected() {
    let mut config = EngineConfig::default();
    config.performance.max_range_cells = 100;
    let engine = engine_with(config);
    let err = engine
        .set_cell_formula(c("B1"), "=SUM(A1:A200)")
        .expect_err("range too large");
    assert!(matches!(
        err,
        FormulaError::Dependency(DagError::RangeTooLarge { .. })
    ));
}

#[test]
fn test_config_file_drives_engine() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gridcalc.yaml");
    std::fs::write(
        &path,
        "calculation_mode: manual\nperformance:\n  max_worker_threads: 2\n  formula_cache_size: 64\nstorage:\n  cell_cache_size: 500\n",
    )
    .expect("write config");

    let config = EngineConfig::load(&path).expect("load config");
    assert_eq!(config.performance.formula_cache_size, 64);
    assert_eq!(config.storage.cell_cache_size, 500);
    let engine = engine_with(config);
    assert_eq!(engine.calculation_mode(), CalculationMode::Manual);

    let bad = dir.path().join("bad.json");
    std::fs::write(&bad, r#"{"performance": {"max_worker_threads": 0}}"#).expect("write");
    assert!(matches!(
        EngineConfig::load(&bad),
        Err(ConfigError::Invalid(_))
    ));

    let mut invalid = EngineConfig::default();
    invalid.performance.formula_cache_size = 0;
    assert!(matches!(
        FormulaEngine::new(invalid),
        Err(FormulaError::Config(ConfigError::Invalid(_)))
    ));
}

#[test]
fn test_statistics_snapshot() {
    let engine = engine();
    engine.set_cell_value(c("A1"), 1.0).expect("set");
    engine.set_cell_formula(c("B1"), "=A1+0").expect("set");
    engine.set_cell_formula(c("B2"), "=B1*2").expect("set");

    let stats = engine.statistics();
    assert_eq!(stats.formula_cells, 2);
    assert_eq!(stats.formulas_set, 2);
    assert_eq!(stats.graph.edge_count, 2);
    assert_eq!(stats.optimizer.trees_changed, 1);
    assert!(stats.storage.cell_count >= 3);
    let json = serde_json::to_value(&stats).expect("serialize");
    assert_eq!(json["calculation_mode"], "automatic");

    engine.clear_caches();
    assert_eq!(engine.statistics().parser.cached_formulas, 0);
}
