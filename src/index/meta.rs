//! Meta-table index: materialises rows of the schema meta table (the
//! index head records) over a (first, last) window. A dedicated scan
//! variant forbids column-index lookup and always reads everything.

use crate::error::{OpalError, Result};
use crate::index::cursor::{Cursor, MaterializedCursor};
use crate::index::data::DataIndex;
use crate::index::{check_bounds, BoundsCheck, Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::session::Session;
use crate::storage::page::PageId;

pub struct MetaIndex {
    index_id: u32,
    name: String,
    /// Head page of the catalog's backing data tree.
    catalog_head: PageId,
    columns: Vec<IndexColumn>,
    comparator: RowComparator,
    /// The scan variant ignores bounds and refuses column lookups.
    scan_only: bool,
}

impl MetaIndex {
    pub fn new(index_id: u32, name: &str, catalog_head: PageId, scan_only: bool) -> Self {
        // Meta rows lead with the index id column.
        let columns = if scan_only {
            Vec::new()
        } else {
            vec![IndexColumn::asc(0)]
        };
        MetaIndex {
            index_id,
            name: name.to_string(),
            catalog_head,
            comparator: RowComparator::new(columns.clone()),
            columns,
            scan_only,
        }
    }

    fn materialize(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
    ) -> Result<Vec<Row>> {
        let mut cursor = DataIndex::scan_head(self.catalog_head, None, None, false);
        let mut rows = Vec::new();
        while cursor.next(session)? {
            let row = cursor.get().expect("positioned");
            if self.scan_only {
                rows.push(row.clone());
                continue;
            }
            // The backing tree is ordered by row key, not by the meta id
            // column, so out-of-range rows are skipped rather than ending
            // the scan.
            match check_bounds(&self.comparator, row, first, last, false) {
                BoundsCheck::Within => rows.push(row.clone()),
                BoundsCheck::Skip | BoundsCheck::Exhausted => {}
            }
        }
        if !self.scan_only {
            rows.sort_by(|a, b| self.comparator.compare_rows(a, b));
        }
        Ok(rows)
    }
}

impl Index for MetaIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Meta
    }

    fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("add on meta index"))
    }

    fn remove(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("remove on meta index"))
    }

    fn find(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        let (first, last) = if self.scan_only {
            (None, None)
        } else {
            (first, last)
        };
        let rows = self.materialize(session, first, last)?;
        Ok(Box::new(if reverse {
            MaterializedCursor::reversed(rows)
        } else {
            MaterializedCursor::new(rows)
        }))
    }

    fn get_cost(
        &self,
        _session: &mut Session,
        _masks: Option<&[u8]>,
        _sort_order: Option<&[IndexColumn]>,
        _projected_columns: Option<&[usize]>,
    ) -> f64 {
        10.0 * self.row_count_approximation() as f64
    }

    fn row_count(&self, session: &mut Session) -> i64 {
        let mut cursor = DataIndex::scan_head(self.catalog_head, None, None, false);
        let mut count = 0;
        while cursor.next(session).unwrap_or(false) {
            count += 1;
        }
        count
    }

    fn row_count_approximation(&self) -> i64 {
        // The catalog is small; a fixed guess keeps the cost deterministic
        // without I/O.
        16
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        Err(OpalError::Unsupported("truncate on meta index"))
    }

    fn find_requires_full_scan(&self) -> bool {
        self.scan_only
    }
}
