//! Cursor contract and the shared cursor shapes.
//!
//! Cursors are pull-based state machines: before-first until the first
//! `next`, positioned while `next` returns true, exhausted afterwards. A
//! cursor holds no page latches; it re-reads pages through the session as
//! it advances.

use crate::error::Result;
use crate::row::{Row, SearchRow};
use crate::session::Session;

pub trait Cursor {
    /// Advance; true iff a new row is available.
    fn next(&mut self, session: &mut Session) -> Result<bool>;

    /// The current row; None before the first `next` and after exhaustion.
    fn get(&self) -> Option<&Row>;

    /// The sparse form, when cheaper than the full row.
    fn get_search_row(&self) -> Option<SearchRow> {
        self.get().map(|r| r.to_search_row())
    }
}

/// The always-empty cursor.
pub struct EmptyCursor;

impl Cursor for EmptyCursor {
    fn next(&mut self, _session: &mut Session) -> Result<bool> {
        Ok(false)
    }

    fn get(&self) -> Option<&Row> {
        None
    }
}

/// A cursor over exactly one row (or zero when constructed empty).
pub struct SingletonCursor {
    row: Option<Row>,
    state: SingletonState,
}

enum SingletonState {
    BeforeFirst,
    Positioned,
    Exhausted,
}

impl SingletonCursor {
    pub fn new(row: Option<Row>) -> Self {
        SingletonCursor {
            row,
            state: SingletonState::BeforeFirst,
        }
    }
}

impl Cursor for SingletonCursor {
    fn next(&mut self, _session: &mut Session) -> Result<bool> {
        match self.state {
            SingletonState::BeforeFirst if self.row.is_some() => {
                self.state = SingletonState::Positioned;
                Ok(true)
            }
            _ => {
                self.state = SingletonState::Exhausted;
                Ok(false)
            }
        }
    }

    fn get(&self) -> Option<&Row> {
        match self.state {
            SingletonState::Positioned => self.row.as_ref(),
            _ => None,
        }
    }
}

/// A cursor over rows collected up front. Virtual indexes whose source is
/// already materialized (function results, meta rows, view results) use
/// this shape.
pub struct MaterializedCursor {
    rows: Vec<Row>,
    /// usize::MAX encodes before-first.
    position: usize,
}

impl MaterializedCursor {
    pub fn new(rows: Vec<Row>) -> Self {
        MaterializedCursor {
            rows,
            position: usize::MAX,
        }
    }

    pub fn reversed(mut rows: Vec<Row>) -> Self {
        rows.reverse();
        MaterializedCursor::new(rows)
    }
}

impl Cursor for MaterializedCursor {
    fn next(&mut self, session: &mut Session) -> Result<bool> {
        session.check_cancelled()?;
        let next = if self.position == usize::MAX {
            0
        } else {
            self.position + 1
        };
        if next < self.rows.len() {
            self.position = next;
            Ok(true)
        } else {
            self.position = self.rows.len();
            Ok(false)
        }
    }

    fn get(&self) -> Option<&Row> {
        if self.position == usize::MAX {
            return None;
        }
        self.rows.get(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Options, Pager};
    use crate::types::Value;
    use tempfile::TempDir;

    fn test_session() -> (Session, TempDir) {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), Options::default()).unwrap();
        (Session::new(pager), dir)
    }

    #[test]
    fn test_empty_cursor() {
        let (mut session, _dir) = test_session();
        let mut c = EmptyCursor;
        assert!(!c.next(&mut session).unwrap());
        assert!(c.get().is_none());
    }

    #[test]
    fn test_singleton_cursor() {
        let (mut session, _dir) = test_session();
        let mut c = SingletonCursor::new(Some(Row::new(1, vec![Value::Int(7)])));
        assert!(c.get().is_none()); // before-first
        assert!(c.next(&mut session).unwrap());
        assert_eq!(c.get().unwrap().key, 1);
        assert!(!c.next(&mut session).unwrap());
        assert!(c.get().is_none()); // exhausted
    }

    #[test]
    fn test_materialized_cursor_order() {
        let (mut session, _dir) = test_session();
        let rows = vec![
            Row::new(1, vec![Value::Int(1)]),
            Row::new(2, vec![Value::Int(2)]),
        ];
        let mut c = MaterializedCursor::new(rows);
        let mut seen = Vec::new();
        while c.next(&mut session).unwrap() {
            seen.push(c.get().unwrap().key);
        }
        assert_eq!(seen, vec![1, 2]);
    }
}
