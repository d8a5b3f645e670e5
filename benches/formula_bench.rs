use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gridcalc_formulas::{
    parse_formula, CalculationMode, EngineConfig, EvaluationContext, Evaluator, FormulaEngine,
    FunctionRegistry,
};
use gridcalc_primitives::{CellCoordinate, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn coord(row: u32, col: u32) -> CellCoordinate {
    CellCoordinate::new(row, col).expect("coordinate in range")
}

fn column_values(size: u32) -> HashMap<CellCoordinate, Value> {
    (0..size)
        .map(|row| (coord(row, 0), Value::Number(f64::from(row) * 1.5)))
        .collect()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for formula in [
        "=A1+B1*2",
        "=SUM(A1:A100)/COUNT(A1:A100)",
        "=IF(AND(A1>0, B1<10), CONCAT(\"ok\", C1), ROUND(A1^2 - B1 % 3, 2))",
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(formula.len()), formula, |b, f| {
            b.iter(|| parse_formula(black_box(f)));
        });
    }
    group.finish();
}

fn bench_evaluate_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate_sum");
    let registry = Arc::new(FunctionRegistry::default());
    for size in [10_u32, 100, 1_000] {
        let cells = column_values(size);
        let ast = parse_formula(&format!("=SUM(A1:A{size})"));
        let evaluator = Evaluator::new(Arc::clone(&registry), 16, 100_000);
        // No current cell, so results are never cached.
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut ctx = EvaluationContext::new(&cells);
                black_box(evaluator.evaluate(&ast, &mut ctx))
            });
        });
    }
    group.finish();
}

fn bench_recalculate_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("recalculate_chain");
    group.sample_size(20);
    for length in [50_u32, 200] {
        let config = EngineConfig {
            calculation_mode: CalculationMode::Manual,
            ..EngineConfig::default()
        };
        let engine = FormulaEngine::new(config).expect("engine");
        engine
            .set_cell_value(coord(0, 0), 1.0)
            .expect("seed value");
        for row in 1..length {
            engine
                .set_cell_formula(coord(row, 0), &format!("=A{row}+1"))
                .expect("chain formula");
        }
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| black_box(engine.recalculate_all().expect("recalculate")));
        });
    }
    group.finish();
}

fn bench_recalculate_wide(c: &mut Criterion) {
    let mut group = c.benchmark_group("recalculate_wide");
    group.sample_size(20);
    for parallel in [false, true] {
        let mut config = EngineConfig {
            calculation_mode: CalculationMode::Manual,
            ..EngineConfig::default()
        };
        config.performance.parallel_calculation = parallel;
        let engine = FormulaEngine::new(config).expect("engine");
        engine
            .set_cell_value(coord(0, 0), 2.0)
            .expect("seed value");
        for row in 0..500 {
            engine
                .set_cell_formula(coord(row, 1), "=SQRT(A1)*EXP(A1)/LN(A1+1)")
                .expect("wide formula");
        }
        let label = if parallel { "parallel" } else { "sequential" };
        group.bench_function(label, |b| {
            b.iter(|| black_box(engine.recalculate_all().expect("recalculate")));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_evaluate_sum,
    bench_recalculate_chain,
    bench_recalculate_wide
);
criterion_main!(benches);
