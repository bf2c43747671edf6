//! Range pseudo-index: generates the SYSTEM_RANGE(min, max, step) value
//! sequence on demand. Nothing is stored; first/last lookups are O(1).

use crate::error::{OpalError, Result};
use crate::index::cursor::{Cursor, EmptyCursor, SingletonCursor};
use crate::index::{Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::session::Session;
use crate::types::Value;

pub struct RangeIndex {
    index_id: u32,
    name: String,
    min: i64,
    max: i64,
    step: i64,
    columns: Vec<IndexColumn>,
    comparator: RowComparator,
}

impl RangeIndex {
    pub fn new(index_id: u32, name: &str, min: i64, max: i64, step: i64) -> Result<Self> {
        if step == 0 {
            return Err(OpalError::StepSizeZero);
        }
        let columns = vec![IndexColumn::asc(0)];
        Ok(RangeIndex {
            index_id,
            name: name.to_string(),
            min,
            max,
            step,
            comparator: RowComparator::new(columns.clone()),
            columns,
        })
    }

    fn value_count(&self) -> i64 {
        if self.step > 0 {
            if self.max < self.min {
                0
            } else {
                (self.max - self.min) / self.step + 1
            }
        } else if self.max > self.min {
            0
        } else {
            (self.min - self.max) / (-self.step) + 1
        }
    }

    fn last_value(&self) -> i64 {
        self.min + (self.value_count() - 1) * self.step
    }

    fn bound_value(probe: Option<&SearchRow>) -> Option<i64> {
        let probe = probe?;
        probe.value(0).and_then(|v| v.as_i64()).or(probe.key)
    }

    fn row_for(value: i64) -> Row {
        Row::new(value, vec![Value::BigInt(value)])
    }
}

impl Index for RangeIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Range
    }

    fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("add on range pseudo-index"))
    }

    fn remove(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("remove on range pseudo-index"))
    }

    fn find(
        &self,
        _session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        if self.value_count() == 0 {
            return Ok(Box::new(EmptyCursor));
        }

        // Normalise to the ascending sequence [lo, hi] regardless of step
        // sign, then clamp the requested bounds to sequence members.
        let (lo, hi) = if self.step > 0 {
            (self.min, self.last_value())
        } else {
            (self.last_value(), self.min)
        };
        let step = self.step.abs();

        let mut from = lo;
        if let Some(bound) = Self::bound_value(first) {
            if bound > from {
                // Round up to the next sequence member.
                let offset = bound - lo;
                from = lo + (offset + step - 1) / step * step;
            }
        }
        let mut to = hi;
        if let Some(bound) = Self::bound_value(last) {
            if bound < to {
                let offset = bound - lo;
                if offset < 0 {
                    return Ok(Box::new(EmptyCursor));
                }
                to = lo + offset / step * step;
            }
        }
        if from > to {
            return Ok(Box::new(EmptyCursor));
        }

        Ok(Box::new(RangeCursor {
            next: if reverse { to } else { from },
            from,
            to,
            step,
            reverse,
            current: None,
            done: false,
        }))
    }

    fn find_first_or_last(&self, _session: &mut Session, first: bool) -> Result<Box<dyn Cursor>> {
        if self.value_count() == 0 {
            return Ok(Box::new(EmptyCursor));
        }
        let (lo, hi) = if self.step > 0 {
            (self.min, self.last_value())
        } else {
            (self.last_value(), self.min)
        };
        let value = if first { lo } else { hi };
        Ok(Box::new(SingletonCursor::new(Some(Self::row_for(value)))))
    }

    fn get_cost(
        &self,
        _session: &mut Session,
        _masks: Option<&[u8]>,
        _sort_order: Option<&[IndexColumn]>,
        _projected_columns: Option<&[usize]>,
    ) -> f64 {
        1.0
    }

    fn row_count(&self, _session: &mut Session) -> i64 {
        self.value_count()
    }

    fn row_count_approximation(&self) -> i64 {
        self.value_count()
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        Err(OpalError::Unsupported("truncate on range pseudo-index"))
    }

    fn can_get_first_or_last(&self) -> bool {
        true
    }
}

struct RangeCursor {
    next: i64,
    from: i64,
    to: i64,
    step: i64,
    reverse: bool,
    current: Option<Row>,
    done: bool,
}

impl Cursor for RangeCursor {
    fn next(&mut self, session: &mut Session) -> Result<bool> {
        session.check_cancelled()?;
        if self.done {
            return Ok(false);
        }
        if self.next < self.from || self.next > self.to {
            self.done = true;
            self.current = None;
            return Ok(false);
        }
        self.current = Some(RangeIndex::row_for(self.next));
        if self.reverse {
            self.next -= self.step;
        } else {
            self.next += self.step;
        }
        Ok(true)
    }

    fn get(&self) -> Option<&Row> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Options, Pager};
    use tempfile::TempDir;

    fn session() -> (Session, TempDir) {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), Options::default()).unwrap();
        (Session::new(pager), dir)
    }

    fn values(cursor: &mut Box<dyn Cursor>, session: &mut Session) -> Vec<i64> {
        let mut out = Vec::new();
        while cursor.next(session).unwrap() {
            out.push(cursor.get().unwrap().value(0).as_i64().unwrap());
        }
        out
    }

    #[test]
    fn test_step_zero_is_error() {
        match RangeIndex::new(1, "range", 1, 5, 0) {
            Err(OpalError::StepSizeZero) => {}
            other => panic!("expected StepSizeZero, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sequence_with_step() {
        let (mut s, _d) = session();
        let idx = RangeIndex::new(1, "range", 1, 5, 2).unwrap();
        assert_eq!(idx.row_count_approximation(), 3);
        let mut cursor = idx.find(&mut s, None, None, false).unwrap();
        assert_eq!(values(&mut cursor, &mut s), vec![1, 3, 5]);
    }

    #[test]
    fn test_bounds_snap_to_members() {
        let (mut s, _d) = session();
        let idx = RangeIndex::new(1, "range", 1, 5, 2).unwrap();
        let mut first = SearchRow::with_columns(1);
        first.set_value(0, Value::BigInt(2));
        let mut last = SearchRow::with_columns(1);
        last.set_value(0, Value::BigInt(4));
        let mut cursor = idx.find(&mut s, Some(&first), Some(&last), false).unwrap();
        assert_eq!(values(&mut cursor, &mut s), vec![3]);
    }

    #[test]
    fn test_negative_step() {
        let (mut s, _d) = session();
        let idx = RangeIndex::new(1, "range", 10, 4, -3).unwrap();
        let mut cursor = idx.find(&mut s, None, None, false).unwrap();
        assert_eq!(values(&mut cursor, &mut s), vec![4, 7, 10]);
    }

    #[test]
    fn test_first_and_last_constant_time() {
        let (mut s, _d) = session();
        let idx = RangeIndex::new(1, "range", 0, i32::MAX as i64, 1).unwrap();
        let mut first = idx.find_first_or_last(&mut s, true).unwrap();
        assert!(first.next(&mut s).unwrap());
        assert_eq!(first.get().unwrap().value(0).as_i64(), Some(0));
        let mut last = idx.find_first_or_last(&mut s, false).unwrap();
        assert!(last.next(&mut s).unwrap());
        assert_eq!(last.get().unwrap().value(0).as_i64(), Some(i32::MAX as i64));
    }

    #[test]
    fn test_empty_range() {
        let (mut s, _d) = session();
        let idx = RangeIndex::new(1, "range", 5, 1, 1).unwrap();
        assert_eq!(idx.row_count_approximation(), 0);
        let mut cursor = idx.find(&mut s, None, None, false).unwrap();
        assert!(values(&mut cursor, &mut s).is_empty());
    }
}
