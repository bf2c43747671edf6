//! Recursive view index: evaluates the anchor branch once, then applies
//! the recursive branch to the previous batch until it produces no rows,
//! accumulating everything in a local result. The session row limit
//! guards against unbounded recursion.

use crate::error::{OpalError, Result};
use crate::index::cursor::{Cursor, MaterializedCursor};
use crate::index::{Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::session::Session;

/// The two branches of a recursive query.
pub trait RecursiveQuery {
    /// The non-recursive (anchor) branch.
    fn anchor(&self, session: &mut Session) -> Result<Vec<Row>>;

    /// One application of the recursive branch to the previous batch.
    fn step(&self, session: &mut Session, previous: &[Row]) -> Result<Vec<Row>>;
}

pub struct RecursiveIndex {
    index_id: u32,
    name: String,
    query: Box<dyn RecursiveQuery>,
    expected_rows: i64,
    comparator: RowComparator,
}

impl RecursiveIndex {
    pub fn new(
        index_id: u32,
        name: &str,
        query: Box<dyn RecursiveQuery>,
        expected_rows: i64,
    ) -> Self {
        RecursiveIndex {
            index_id,
            name: name.to_string(),
            query,
            expected_rows,
            comparator: RowComparator::default(),
        }
    }

    fn evaluate(&self, session: &mut Session) -> Result<Vec<Row>> {
        let mut result = self.query.anchor(session)?;
        let mut batch = result.clone();
        while !batch.is_empty() {
            session.check_cancelled()?;
            if let Some(limit) = session.row_limit() {
                if result.len() > limit {
                    return Err(OpalError::Internal(format!(
                        "recursive query in {} exceeded row limit {}",
                        self.name, limit
                    )));
                }
            }
            batch = self.query.step(session, &batch)?;
            result.extend(batch.iter().cloned());
        }
        Ok(result)
    }
}

impl Index for RecursiveIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Recursive
    }

    fn columns(&self) -> &[IndexColumn] {
        &[]
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("add on recursive view index"))
    }

    fn remove(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("remove on recursive view index"))
    }

    fn find(
        &self,
        session: &mut Session,
        _first: Option<&SearchRow>,
        _last: Option<&SearchRow>,
        _reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MaterializedCursor::new(self.evaluate(session)?)))
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
        Err(OpalError::Unsupported("truncate on recursive view index"))
    }

    fn find_requires_full_scan(&self) -> bool {
        true
    }
}
