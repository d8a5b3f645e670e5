use gridcalc_primitives::{Cell, CellCoordinate, CellFormat, CellRange, ErrorValue, Value};
use gridcalc_storage::{CellStore, Residency, StorageConfig, StorageEngine};
use proptest::prelude::*;

fn coord(a1: &str) -> CellCoordinate {
    CellCoordinate::from_a1(a1).expect("valid coordinate")
}

fn tiny_engine() -> StorageEngine {
    StorageEngine::new(StorageConfig {
        cell_cache_size: 2,
        max_cells_in_memory: 2,
        pressure_check_interval: 1,
        ..StorageConfig::default()
    })
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-1e9f64..1e9).prop_map(Value::Number),
        "[a-z ]{0,200}".prop_map(Value::Text),
        any::<bool>().prop_map(Value::Boolean),
        Just(Value::Error(ErrorValue::DivZero)),
        prop::collection::vec((-100.0f64..100.0).prop_map(Value::Number), 0..40)
            .prop_map(Value::Array),
    ]
}

proptest! {
    #[test]
    fn eviction_roundtrip_is_lossless(value in value_strategy()) {
        let engine = tiny_engine();
        let target = coord("C3");
        engine.set_cell(target, Cell::with_value(value.clone())).expect("write target");
        for row in 10..20 {
            engine
                .set_cell(coord(&format!("A{row}")), Cell::with_value(f64::from(row)))
                .expect("write filler");
        }
        prop_assert_eq!(engine.residency(target), Residency::Evicted);
        let back = engine.get_cell(target).expect("read").expect("present");
        prop_assert_eq!(back.value(), &value);
    }
}

#[test]
fn infinite_numbers_survive_eviction() {
    let engine = tiny_engine();
    engine
        .set_cell(coord("A1"), Cell::with_value(f64::INFINITY))
        .expect("write");
    engine
        .set_cell(
            coord("A2"),
            Cell::with_value(Value::Array(vec![Value::Number(f64::NEG_INFINITY); 40])),
        )
        .expect("write");
    engine
        .evict_range(&CellRange::from_a1("A1:A2").expect("range"))
        .expect("evict");

    assert_eq!(engine.residency(coord("A1")), Residency::Evicted);
    let back = engine.get_cell(coord("A1")).expect("read").expect("present");
    assert_eq!(back.value(), &Value::Number(f64::INFINITY));
    let back = engine.get_cell(coord("A2")).expect("read").expect("present");
    assert_eq!(
        back.value(),
        &Value::Array(vec![Value::Number(f64::NEG_INFINITY); 40])
    );
}

#[test]
fn formulas_and_formats_survive_eviction() {
    let engine = tiny_engine();
    let mut cell = Cell::with_formula("=SUM(A1:A3)");
    cell.set_computed_value(Value::Number(6.0));
    cell.set_format(Some(CellFormat {
        italic: true,
        font_color: Some("#ff0000".into()),
        ..CellFormat::default()
    }));
    engine.set_cell(coord("B1"), cell.clone()).expect("write");
    engine
        .evict_range(&CellRange::from_a1("A1:Z100").expect("range"))
        .expect("evict");

    assert_eq!(engine.residency(coord("B1")), Residency::Evicted);
    assert_eq!(engine.get_cell(coord("B1")).expect("read"), Some(cell));
}

#[test]
fn used_range_spans_all_tiers() {
    let engine = tiny_engine();
    for a1 in ["B2", "H40", "C5", "D6", "E7"] {
        engine.set_cell(coord(a1), Cell::with_value(1.0)).expect("write");
    }
    assert_eq!(engine.residency(coord("B2")), Residency::Evicted);
    assert_eq!(
        engine.used_range(),
        Some(CellRange::from_a1("B2:H40").expect("range"))
    );
}

#[test]
fn range_scan_reads_hot_cells_without_decompressing() {
    let engine = StorageEngine::default();
    for a1 in ["A1", "A2", "A3", "Z900", "B500"] {
        engine.set_cell(coord(a1), Cell::with_value(1.0)).expect("write");
    }
    engine.compression().reset_statistics();

    let cells = engine
        .cells_in_range(&CellRange::from_a1("A1:A3").expect("range"))
        .expect("scan");
    assert_eq!(cells.len(), 3);
    assert_eq!(engine.compression().statistics().decompressions, 0);
}

#[test]
fn len_and_used_range_follow_deletes() {
    let engine = tiny_engine();
    for a1 in ["B2", "H40", "C5", "D6"] {
        engine.set_cell(coord(a1), Cell::with_value(1.0)).expect("write");
    }
    assert_eq!(engine.len(), 4);
    assert!(engine.delete_cell(coord("H40")));
    assert_eq!(engine.len(), 3);
    assert_eq!(
        engine.used_range(),
        Some(CellRange::from_a1("B2:D6").expect("range"))
    );
    engine.clear_range(&CellRange::from_a1("A1:Z100").expect("range"));
    assert!(engine.is_empty());
    assert_eq!(engine.used_range(), None);
}

#[test]
fn clear_range_removes_cold_and_hot_cells() {
    let engine = tiny_engine();
    for row in 1..=8 {
        engine
            .set_cell(coord(&format!("A{row}")), Cell::with_value(f64::from(row)))
            .expect("write");
    }
    let removed = engine.clear_range(&CellRange::from_a1("A1:A5").expect("range"));
    assert_eq!(removed, 5);

    let remaining: Vec<String> = engine
        .cells_in_range(&CellRange::from_a1("A1:A10").expect("range"))
        .expect("scan")
        .into_iter()
        .map(|(c, _)| c.to_a1())
        .collect();
    assert_eq!(remaining, vec!["A6", "A7", "A8"]);
}

#[test]
fn trait_object_access() {
    let engine = StorageEngine::default();
    let store: &dyn CellStore = &engine;
    store
        .set_cell(coord("A1"), Cell::with_value("hello"))
        .expect("write");
    assert!(store.get_cell(coord("A1")).expect("read").is_some());
    assert!(store.delete_cell(coord("A1")));
    assert_eq!(store.used_range(), None);
}

#[test]
fn preload_and_optimize_memory() {
    let engine = StorageEngine::new(StorageConfig {
        cell_cache_size: 4,
        ..StorageConfig::default()
    });
    for row in 1..=10 {
        engine
            .set_cell(coord(&format!("B{row}")), Cell::with_value(f64::from(row)))
            .expect("write");
    }
    let report = engine.optimize_memory().expect("optimize");
    assert_eq!(report.hot_evicted, 5);
    assert_eq!(engine.memory_usage().hot_cells, 5);

    let loaded = engine
        .preload_range(&CellRange::from_a1("B1:B10").expect("range"))
        .expect("preload");
    assert_eq!(loaded, 5);
    assert_eq!(engine.memory_usage().hot_cells, 10);
}
