/// Order values for positioning tasks inside a column.
///
/// `move` never renumbers siblings. Callers place a task with
/// `order_between`; when two neighbours are adjacent integers there is no
/// gap left and the column is re-spaced with `respace` (see
/// `TaskStore::compact_column`).
use crate::types::Task;

/// Distance between neighbours after a column is re-spaced.
pub const ORDER_GAP: i64 = 1000;

/// Order for a task dropped between `before` and `after` (either may be
/// missing at the column edges). `None` means no integer fits in between.
pub fn order_between(before: Option<i64>, after: Option<i64>) -> Option<i64> {
    match (before, after) {
        (None, None) => Some(0),
        (Some(b), None) => b.checked_add(ORDER_GAP),
        (None, Some(a)) => a.checked_sub(ORDER_GAP),
        (Some(b), Some(a)) => {
            let (lo, hi) = (b.min(a) as i128, b.max(a) as i128);
            if hi - lo < 2 {
                return None;
            }
            Some((lo + (hi - lo) / 2) as i64)
        }
    }
}

/// New orders for an already sorted column, as `(id, order)` pairs for the
/// tasks whose order actually changes.
pub fn respace(sorted: &[Task]) -> Vec<(String, i64)> {
    sorted
        .iter()
        .enumerate()
        .filter_map(|(index, task)| {
            let order = index as i64 * ORDER_GAP;
            (task.order != order).then(|| (task.id.clone(), order))
        })
        .collect()
}
