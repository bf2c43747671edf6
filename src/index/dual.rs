//! Dual pseudo-index: exactly one empty row.

use crate::error::{OpalError, Result};
use crate::index::cursor::{Cursor, SingletonCursor};
use crate::index::{Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::session::Session;

pub struct DualIndex {
    index_id: u32,
    name: String,
    comparator: RowComparator,
}

impl DualIndex {
    pub fn new(index_id: u32, name: &str) -> Self {
        DualIndex {
            index_id,
            name: name.to_string(),
            comparator: RowComparator::default(),
        }
    }
}

impl Index for DualIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Dual
    }

    fn columns(&self) -> &[IndexColumn] {
        &[]
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("add on dual pseudo-index"))
    }

    fn remove(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("remove on dual pseudo-index"))
    }

    fn find(
        &self,
        _session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        _reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        // The single row has key 0; only a key bound can exclude it.
        let row = Row::new(0, Vec::new());
        let excluded = first.and_then(|f| f.key).map(|k| k > 0).unwrap_or(false)
            || last.and_then(|l| l.key).map(|k| k < 0).unwrap_or(false);
        Ok(Box::new(SingletonCursor::new(if excluded {
            None
        } else {
            Some(row)
        })))
    }

    fn find_first_or_last(&self, _session: &mut Session, _first: bool) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(SingletonCursor::new(Some(Row::new(0, Vec::new())))))
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
        1
    }

    fn row_count_approximation(&self) -> i64 {
        1
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        Err(OpalError::Unsupported("truncate on dual pseudo-index"))
    }

    fn can_get_first_or_last(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Options, Pager};
    use tempfile::TempDir;

    #[test]
    fn test_single_empty_row() {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), Options::default()).unwrap();
        let mut session = Session::new(pager);

        let mut idx = DualIndex::new(1, "dual");
        let mut cursor = idx.find(&mut session, None, None, false).unwrap();
        assert!(cursor.next(&mut session).unwrap());
        assert_eq!(cursor.get().unwrap().column_count(), 0);
        assert!(!cursor.next(&mut session).unwrap());

        let row = Row::new(0, Vec::new());
        assert!(idx.remove(&mut session, &row).is_err());
        assert!(idx.add(&mut session, &row).is_err());
    }
}
