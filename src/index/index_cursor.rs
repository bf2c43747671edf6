//! The IndexCursor driver: folds the planner's conditions into (start,
//! end, intersection) search rows, materialises IN lists, and drives the
//! chosen access path's native cursor — re-opening it per IN element.

use std::cmp::Ordering;

use crate::error::{OpalError, Result};
use crate::index::condition::{CompareType, IndexCondition, ROWID_COLUMN};
use crate::index::condition::SubqueryResult;
use crate::index::cursor::Cursor;
use crate::index::Index;
use crate::row::{Row, SearchRow};
use crate::schema::column::SortType;
use crate::session::Session;
use crate::types::{compare_values, Mbr, Value};

enum InState {
    List {
        /// Index columns the tuple elements bind to; one entry for a
        /// plain IN.
        columns: Vec<usize>,
        /// Materialised, de-duplicated values, iterated in list order.
        values: Vec<Value>,
        pos: usize,
    },
    Subquery {
        column: usize,
        result: Box<dyn SubqueryResult>,
        pos: usize,
    },
}

pub struct IndexCursor<'a> {
    index: &'a dyn Index,
    table_columns: usize,
    start: Option<SearchRow>,
    end: Option<SearchRow>,
    intersection: Option<Mbr>,
    in_state: Option<InState>,
    always_false: bool,
    reverse: bool,
    inner: Option<Box<dyn Cursor>>,
    plain_opened: bool,
}

impl<'a> IndexCursor<'a> {
    /// Classify the conditions and bind the cursor to the index. The
    /// conditions' expressions are evaluated here, once.
    pub fn prepare(
        session: &mut Session,
        index: &'a dyn Index,
        table_columns: usize,
        conditions: Vec<IndexCondition>,
        reverse: bool,
    ) -> Result<Self> {
        let mut cursor = IndexCursor {
            index,
            table_columns,
            start: None,
            end: None,
            intersection: None,
            in_state: None,
            always_false: false,
            reverse,
            inner: None,
            plain_opened: false,
        };

        for condition in conditions {
            if condition.compare_type == CompareType::AlwaysFalse {
                cursor.always_false = true;
                return Ok(cursor);
            }
            // When every find is a full scan anyway, non-trivial
            // conditions are ignored entirely.
            if index.find_requires_full_scan() {
                continue;
            }
            if !condition.columns.is_empty() && condition.compare_type != CompareType::InList {
                return Err(OpalError::Internal(
                    "compound condition outside IN-list".into(),
                ));
            }

            match condition.compare_type {
                CompareType::InList | CompareType::InArray => {
                    cursor.prepare_in_list(session, condition)?;
                }
                CompareType::InSubquery => {
                    cursor.prepare_in_subquery(condition)?;
                }
                CompareType::SpatialIntersects => {
                    let expression = condition
                        .expression
                        .ok_or_else(|| OpalError::Internal("spatial condition without expression".into()))?;
                    let value = expression.evaluate(session)?;
                    if let Value::Geometry(envelope) = value {
                        cursor.intersection = Some(match cursor.intersection {
                            None => envelope,
                            Some(existing) => existing.union(&envelope),
                        });
                    }
                }
                _ => {
                    let expression = condition
                        .expression
                        .as_ref()
                        .ok_or_else(|| OpalError::Internal("condition without expression".into()))?;
                    let value = expression.evaluate(session)?;
                    cursor.apply_bound(&condition, value);
                }
            }
        }
        Ok(cursor)
    }

    fn sort_of_column(&self, column: usize) -> SortType {
        self.index
            .columns()
            .iter()
            .find(|ic| ic.column == column)
            .map(|ic| ic.sort)
            .unwrap_or(SortType::ASC)
    }

    fn apply_bound(&mut self, condition: &IndexCondition, value: Value) {
        let column = condition.column;

        if column == ROWID_COLUMN {
            // NULL targeting the row-id column means "from the beginning".
            let key = value.as_i64().unwrap_or(i64::MIN);
            if condition.is_start() {
                let start = self
                    .start
                    .get_or_insert_with(|| SearchRow::with_columns(self.table_columns));
                start.key = Some(start.key.map_or(key, |old| old.max(key)));
            }
            if condition.is_end() {
                let end = self
                    .end
                    .get_or_insert_with(|| SearchRow::with_columns(self.table_columns));
                end.key = Some(end.key.map_or(key, |old| old.min(key)));
            }
            return;
        }

        let sort = self.sort_of_column(column);
        // A descending index column swaps which side of the scan a
        // start/end condition binds.
        let binds_start = (condition.is_start() && !sort.descending)
            || (condition.is_end() && sort.descending)
            || condition.is_equality();
        let binds_end = (condition.is_end() && !sort.descending)
            || (condition.is_start() && sort.descending)
            || condition.is_equality();

        if binds_start {
            let start = self
                .start
                .get_or_insert_with(|| SearchRow::with_columns(self.table_columns));
            let keep_new = match start.value(column) {
                None => true,
                // The scan begins at the sort-largest lower bound.
                Some(old) => sort.compare(&value, old) == Ordering::Greater,
            };
            if keep_new {
                start.set_value(column, value.clone());
            }
        }
        if binds_end {
            let end = self
                .end
                .get_or_insert_with(|| SearchRow::with_columns(self.table_columns));
            let keep_new = match end.value(column) {
                None => true,
                Some(old) => sort.compare(&value, old) == Ordering::Less,
            };
            if keep_new {
                end.set_value(column, value);
            }
        }
    }

    fn prepare_in_list(&mut self, session: &mut Session, condition: IndexCondition) -> Result<()> {
        // At most one IN participates; later ones are discarded.
        if self.in_state.is_some() {
            return Ok(());
        }
        let columns = if condition.columns.is_empty() {
            vec![condition.column]
        } else {
            condition.columns.clone()
        };
        if !self.in_usable(&columns) {
            return Ok(());
        }

        let mut values = Vec::with_capacity(condition.expression_list.len());
        for expression in &condition.expression_list {
            let value = expression.evaluate(session)?;
            // De-duplicate under the value comparison, keeping list order.
            if !values
                .iter()
                .any(|existing| compare_values(existing, &value) == Ordering::Equal)
            {
                values.push(value);
            }
        }
        self.in_state = Some(InState::List {
            columns,
            values,
            pos: 0,
        });
        Ok(())
    }

    fn prepare_in_subquery(&mut self, condition: IndexCondition) -> Result<()> {
        if self.in_state.is_some() {
            return Ok(());
        }
        if !self.in_usable(&[condition.column]) {
            return Ok(());
        }
        let result = condition
            .subquery
            .ok_or_else(|| OpalError::Internal("IN subquery without result".into()))?;
        self.in_state = Some(InState::Subquery {
            column: condition.column,
            result,
            pos: 0,
        });
        Ok(())
    }

    /// An IN can drive the index only from its first column (or the exact
    /// leading column tuple for compound IN).
    fn in_usable(&self, columns: &[usize]) -> bool {
        let index_columns = self.index.columns();
        if columns.len() > index_columns.len() {
            return false;
        }
        columns
            .iter()
            .zip(index_columns.iter())
            .all(|(c, ic)| *c == ic.column)
    }

    fn point_probes(&self, columns: &[usize], value: &Value) -> Option<(SearchRow, SearchRow)> {
        let mut start = self
            .start
            .clone()
            .unwrap_or_else(|| SearchRow::with_columns(self.table_columns));
        let mut end = self
            .end
            .clone()
            .unwrap_or_else(|| SearchRow::with_columns(self.table_columns));
        match value {
            Value::Null => return None,
            Value::Row(tuple) => {
                if tuple.len() != columns.len() || tuple.iter().any(|v| v.is_null()) {
                    return None;
                }
                for (c, v) in columns.iter().zip(tuple.iter()) {
                    start.set_value(*c, v.clone());
                    end.set_value(*c, v.clone());
                }
            }
            scalar => {
                start.set_value(columns[0], scalar.clone());
                end.set_value(columns[0], scalar.clone());
            }
        }
        Some((start, end))
    }

    /// Open the next inner cursor; false when the drive is finished.
    fn open_next(&mut self, session: &mut Session) -> Result<bool> {
        loop {
            // Pull the next IN element (or note a plain open) before any
            // call back into the index.
            let probe = match &mut self.in_state {
                None => {
                    if self.plain_opened {
                        return Ok(false);
                    }
                    self.plain_opened = true;
                    None
                }
                Some(InState::List {
                    columns,
                    values,
                    pos,
                }) => {
                    if *pos >= values.len() {
                        return Ok(false);
                    }
                    let value = values[*pos].clone();
                    *pos += 1;
                    Some((columns.clone(), value))
                }
                Some(InState::Subquery {
                    column,
                    result,
                    pos,
                }) => {
                    if *pos >= result.row_count() {
                        return Ok(false);
                    }
                    let value = result.value_at(*pos);
                    *pos += 1;
                    Some((vec![*column], value))
                }
            };

            match probe {
                None => {
                    let cursor = if let Some(window) = self.intersection {
                        self.index.find_by_geometry(
                            session,
                            self.start.as_ref(),
                            self.end.as_ref(),
                            &window,
                        )?
                    } else {
                        self.index.find(
                            session,
                            self.start.as_ref(),
                            self.end.as_ref(),
                            self.reverse,
                        )?
                    };
                    self.inner = Some(cursor);
                    return Ok(true);
                }
                Some((columns, value)) => {
                    if let Some((start, end)) = self.point_probes(&columns, &value) {
                        self.inner =
                            Some(self.index.find(session, Some(&start), Some(&end), false)?);
                        return Ok(true);
                    }
                    // NULL (or a tuple with a NULL): no point lookup, take
                    // the next element.
                }
            }
        }
    }

    pub fn is_always_false(&self) -> bool {
        self.always_false
    }
}

impl Cursor for IndexCursor<'_> {
    fn next(&mut self, session: &mut Session) -> Result<bool> {
        if self.always_false {
            return Ok(false);
        }
        loop {
            if self.inner.is_none() && !self.open_next(session)? {
                return Ok(false);
            }
            if self
                .inner
                .as_mut()
                .expect("inner cursor open")
                .next(session)?
            {
                return Ok(true);
            }
            self.inner = None;
        }
    }

    fn get(&self) -> Option<&Row> {
        self.inner.as_ref().and_then(|c| c.get())
    }

    fn get_search_row(&self) -> Option<SearchRow> {
        self.inner.as_ref().and_then(|c| c.get_search_row())
    }
}
