//! Deterministic plan costs.
//!
//! Every ordered access path prices a predicate mask set with the same
//! range-index formula; the per-variant adjustments (scan baseline,
//! covering credit, sort penalty) are applied on top, and the virtual
//! indexes answer with constants.

use crate::index::condition::{ALWAYS_FALSE, EQUALITY, END, RANGE, SPATIAL_INTERSECTS, START};
use crate::schema::column::IndexColumn;

/// Baseline added to every row count so small tables do not round to zero.
pub const COST_ROW_OFFSET: f64 = 1000.0;

/// Penalty when the query orders and the index cannot supply that order.
pub const SORT_COST: f64 = 100.0;

/// Sentinel returned by paths that cannot serve the masks at all.
pub const COST_INFEASIBLE: f64 = f64::MAX;

/// Which step-4 adjustment applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    /// Pure table scan over the data index.
    Scan,
    /// Secondary index that must resolve rows through the data index.
    Secondary,
}

pub struct CostParams<'a> {
    pub masks: Option<&'a [u8]>,
    pub row_count: i64,
    pub columns: &'a [IndexColumn],
    /// Selectivity (0-100) per index column, aligned with `columns`.
    pub selectivity: &'a [u8],
    pub unique_column_count: usize,
    pub sort_order: Option<&'a [IndexColumn]>,
    pub projected: Option<&'a [usize]>,
    pub kind: CostKind,
}

/// True when the index's column list starts with the requested order.
pub fn can_supply_order(index_columns: &[IndexColumn], order: &[IndexColumn]) -> bool {
    if order.len() > index_columns.len() {
        return false;
    }
    order
        .iter()
        .zip(index_columns.iter())
        .all(|(o, ic)| o.column == ic.column && o.sort == ic.sort)
}

fn covers(index_columns: &[IndexColumn], projected: &[usize]) -> bool {
    projected
        .iter()
        .all(|c| index_columns.iter().any(|ic| ic.column == *c))
}

/// The shared range-index cost function.
pub fn cost_range_index(p: &CostParams) -> f64 {
    // A null mask array means always-false: the cursor is empty.
    let masks = match p.masks {
        None => return 1.0,
        Some(m) => m,
    };

    let base = p.row_count.max(0) as f64 + COST_ROW_OFFSET;
    let mut rows = base;
    let mut cost = base;
    let mut total_selectivity = 0u32;
    let mut unique_hit = false;

    let mut i = 0;
    while i < p.columns.len() {
        let column = p.columns[i].column;
        let mask = masks.get(column).copied().unwrap_or(0);
        if mask == 0 || mask & ALWAYS_FALSE != 0 {
            break;
        }
        if mask & EQUALITY == EQUALITY {
            if p.unique_column_count > 0 && i + 1 == p.unique_column_count {
                cost = 3.0;
                unique_hit = true;
                break;
            }
            let selectivity = p.selectivity.get(i).copied().unwrap_or(50) as u32;
            total_selectivity = 100 - (100 - total_selectivity) * (100 - selectivity) / 100;
            let distinct_rows = (base * total_selectivity as f64 / 100.0).max(1.0);
            rows = (base / distinct_rows).max(1.0);
            cost = 2.0 + rows;
            i += 1;
            continue;
        }
        if mask & RANGE == RANGE {
            rows = 2.0 + rows / 4.0;
            // Additional constrained columns tighten the range further.
            let further = p.columns[i + 1..]
                .iter()
                .filter(|ic| masks.get(ic.column).copied().unwrap_or(0) != 0)
                .count();
            rows = (rows - further as f64).max(2.0);
        } else if mask & START == START {
            rows = 2.0 + rows / 3.0;
        } else if mask & END == END {
            rows /= 3.0;
        } else if mask & SPATIAL_INTERSECTS != 0 {
            rows = 2.0 + rows / 4.0;
        }
        cost = rows;
        break;
    }

    if let Some(order) = p.sort_order {
        if !can_supply_order(p.columns, order) {
            cost += SORT_COST;
        }
    }

    match p.kind {
        CostKind::Scan => cost += 20.0,
        CostKind::Secondary => {
            let covering = p
                .projected
                .map(|projected| covers(p.columns, projected))
                .unwrap_or(false);
            if covering {
                // Smaller indexes win among covering ties.
                cost += p.columns.len() as f64;
            } else if !unique_hit {
                cost += rows + 20.0;
            } else {
                cost += 20.0;
            }
        }
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::condition::{END, EQUALITY, RANGE, START};

    fn params<'a>(
        masks: Option<&'a [u8]>,
        columns: &'a [IndexColumn],
        selectivity: &'a [u8],
        unique: usize,
    ) -> CostParams<'a> {
        CostParams {
            masks,
            row_count: 10_000,
            columns,
            selectivity,
            unique_column_count: unique,
            sort_order: None,
            projected: None,
            kind: CostKind::Secondary,
        }
    }

    #[test]
    fn test_unique_equality_short_circuits() {
        let columns = [IndexColumn::asc(0)];
        let masks = [EQUALITY];
        let cost = cost_range_index(&params(Some(&masks), &columns, &[50], 1));
        // 3 for the lookup plus the data-index resolution constant.
        assert_eq!(cost, 23.0);
    }

    #[test]
    fn test_equality_beats_range_beats_none() {
        let columns = [IndexColumn::asc(0)];
        let eq = cost_range_index(&params(Some(&[EQUALITY]), &columns, &[50], 0));
        let range = cost_range_index(&params(Some(&[RANGE]), &columns, &[50], 0));
        let start = cost_range_index(&params(Some(&[START]), &columns, &[50], 0));
        let end = cost_range_index(&params(Some(&[END]), &columns, &[50], 0));
        let none = cost_range_index(&params(Some(&[0]), &columns, &[50], 0));
        assert!(eq < range, "{} < {}", eq, range);
        assert!(range < start);
        assert!(end < start);
        assert!(start < none);
    }

    #[test]
    fn test_more_matched_columns_never_cost_more() {
        let columns = [IndexColumn::asc(0), IndexColumn::asc(1)];
        let one = cost_range_index(&params(Some(&[EQUALITY, 0]), &columns, &[50, 50], 0));
        let two = cost_range_index(&params(
            Some(&[EQUALITY, EQUALITY]),
            &columns,
            &[50, 50],
            0,
        ));
        assert!(two <= one);
    }

    #[test]
    fn test_sort_penalty() {
        let columns = [IndexColumn::asc(0)];
        let order_ok = [IndexColumn::asc(0)];
        let order_bad = [IndexColumn::asc(1)];
        let mut p = params(Some(&[EQUALITY]), &columns, &[50], 0);
        p.sort_order = Some(&order_ok);
        let supplied = cost_range_index(&p);
        let mut p = params(Some(&[EQUALITY]), &columns, &[50], 0);
        p.sort_order = Some(&order_bad);
        let unsupplied = cost_range_index(&p);
        assert_eq!(unsupplied - supplied, SORT_COST);
    }

    #[test]
    fn test_covering_projection_is_cheap() {
        let columns = [IndexColumn::asc(0), IndexColumn::asc(1)];
        let projected = [0usize, 1usize];
        let mut p = params(Some(&[EQUALITY, 0]), &columns, &[50, 50], 0);
        p.projected = Some(&projected);
        let covering = cost_range_index(&p);
        let p = params(Some(&[EQUALITY, 0]), &columns, &[50, 50], 0);
        let non_covering = cost_range_index(&p);
        assert!(covering < non_covering);
    }

    #[test]
    fn test_null_masks_mean_always_false() {
        let columns = [IndexColumn::asc(0)];
        let cost = cost_range_index(&params(None, &columns, &[50], 0));
        assert_eq!(cost, 1.0);
    }
}
