use gridcalc_primitives::{CellCoordinate, CellRange, MAX_COLS, MAX_ROWS};
use proptest::prelude::*;

fn coord(a1: &str) -> CellCoordinate {
    CellCoordinate::from_a1(a1).expect("valid coordinate")
}

proptest! {
    #[test]
    fn a1_roundtrip_for_every_coordinate(row in 0..MAX_ROWS, col in 0..MAX_COLS) {
        let c = CellCoordinate::new(row, col).expect("in bounds");
        let parsed = CellCoordinate::from_a1(&c.to_a1()).expect("parse back");
        prop_assert_eq!(parsed, c);
    }

    #[test]
    fn intersection_is_contained_in_both(
        r1 in 0u32..50, c1 in 0u32..50, r2 in 0u32..50, c2 in 0u32..50,
        r3 in 0u32..50, c3 in 0u32..50, r4 in 0u32..50, c4 in 0u32..50,
    ) {
        let a = CellRange::new(
            CellCoordinate::new(r1, c1).expect("a start"),
            CellCoordinate::new(r2, c2).expect("a end"),
        );
        let b = CellRange::new(
            CellCoordinate::new(r3, c3).expect("b start"),
            CellCoordinate::new(r4, c4).expect("b end"),
        );
        match a.intersection(&b) {
            Some(overlap) => {
                prop_assert!(a.contains_range(&overlap));
                prop_assert!(b.contains_range(&overlap));
            }
            None => prop_assert!(!a.intersects(&b)),
        }
        let hull = a.union(&b);
        prop_assert!(hull.contains_range(&a) && hull.contains_range(&b));
    }
}

#[test]
fn single_coordinate_parses_as_unit_range() {
    let range = CellRange::from_a1("C7").expect("unit range");
    assert_eq!(range.cell_count(), 1);
    assert_eq!(range.start(), coord("C7"));
    assert_eq!(range.end(), coord("C7"));
}

#[test]
fn range_iteration_covers_every_cell_once() {
    let range = CellRange::from_a1("B2:D5").expect("range");
    let by_rows: Vec<_> = range.iter_rows().collect();
    let mut by_cols: Vec<_> = range.iter_cols().collect();
    assert_eq!(by_rows.len() as u64, range.cell_count());
    by_cols.sort();
    assert_eq!(by_rows, by_cols);
    assert!(by_rows.iter().all(|c| range.contains(c)));
}

#[test]
fn absolute_markers_are_ignored() {
    assert_eq!(coord("$C$3"), coord("C3"));
    assert_eq!(coord("C$3"), coord("c3"));
}
