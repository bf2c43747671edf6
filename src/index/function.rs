//! Scan view over a table function or external result set: full
//! iteration, no lookup.

use crate::error::{OpalError, Result};
use crate::index::cursor::{Cursor, MaterializedCursor};
use crate::index::{Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::session::Session;

/// Produces the rows of the backing result; invoked once per scan.
pub trait ResultSource {
    fn rows(&self, session: &mut Session) -> Result<Vec<Row>>;
}

/// A result that was already materialized by the caller.
pub struct MaterializedResult(pub Vec<Row>);

impl ResultSource for MaterializedResult {
    fn rows(&self, _session: &mut Session) -> Result<Vec<Row>> {
        Ok(self.0.clone())
    }
}

pub struct FunctionIndex {
    index_id: u32,
    name: String,
    source: Box<dyn ResultSource>,
    expected_rows: i64,
    comparator: RowComparator,
}

impl FunctionIndex {
    pub fn new(
        index_id: u32,
        name: &str,
        source: Box<dyn ResultSource>,
        expected_rows: i64,
    ) -> Self {
        FunctionIndex {
            index_id,
            name: name.to_string(),
            source,
            expected_rows,
            comparator: RowComparator::default(),
        }
    }
}

impl Index for FunctionIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Function
    }

    fn columns(&self) -> &[IndexColumn] {
        &[]
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("add on function index"))
    }

    fn remove(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("remove on function index"))
    }

    fn find(
        &self,
        session: &mut Session,
        _first: Option<&SearchRow>,
        _last: Option<&SearchRow>,
        _reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MaterializedCursor::new(self.source.rows(session)?)))
    }

    fn get_cost(
        &self,
        _session: &mut Session,
        _masks: Option<&[u8]>,
        _sort_order: Option<&[IndexColumn]>,
        _projected_columns: Option<&[usize]>,
    ) -> f64 {
        self.expected_rows as f64 * 10.0
    }

    fn row_count(&self, _session: &mut Session) -> i64 {
        self.expected_rows
    }

    fn row_count_approximation(&self) -> i64 {
        self.expected_rows
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        Err(OpalError::Unsupported("truncate on function index"))
    }

    fn find_requires_full_scan(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Options, Pager};
    use crate::types::Value;
    use tempfile::TempDir;

    #[test]
    fn test_full_iteration() {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), Options::default()).unwrap();
        let mut session = Session::new(pager);

        let rows = vec![
            Row::new(1, vec![Value::Int(10)]),
            Row::new(2, vec![Value::Int(20)]),
        ];
        let idx = FunctionIndex::new(1, "fn", Box::new(MaterializedResult(rows)), 2);
        assert!(idx.find_requires_full_scan());
        assert_eq!(idx.get_cost(&mut session, Some(&[0]), None, None), 20.0);

        let mut cursor = idx.find(&mut session, None, None, false).unwrap();
        let mut seen = Vec::new();
        while cursor.next(&mut session).unwrap() {
            seen.push(cursor.get().unwrap().value(0).as_i64().unwrap());
        }
        assert_eq!(seen, vec![10, 20]);
    }
}
