//! Access paths: a uniform interface over every structure that can satisfy
//! row lookups and scans — the data index, secondary B-trees, in-memory
//! tree/hash indexes, the virtual pseudo-indexes and the linked index.

pub mod btree;
pub mod condition;
pub mod cost;
pub mod cursor;
pub mod data;
pub mod dual;
pub mod function;
pub mod hash;
pub mod index_cursor;
pub mod linked;
pub mod meta;
pub mod range;
pub mod recursive;
pub mod spatial;
pub mod tree;
pub mod view;

use std::cmp::Ordering;

use crate::error::{OpalError, Result};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::session::Session;
use crate::types::{Mbr, Value};
use cursor::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// The data index: full-table scan path keyed by the row key.
    Scan,
    Secondary,
    PrimaryKey,
    Hash,
    /// Ordered in-memory (AVL) index.
    InMemory,
    Spatial,
    Meta,
    Range,
    Dual,
    Function,
    View,
    Recursive,
    Linked,
}

/// Whether rows with NULLs in the unique columns collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsDistinct {
    /// NULLs collide like ordinary values.
    NotDistinct,
    /// Rows with any NULL in the unique prefix never collide.
    Distinct,
    /// Rows collide unless every unique-prefix value is NULL.
    AllDistinct,
}

impl NullsDistinct {
    /// A single-column ALL DISTINCT index behaves exactly like DISTINCT;
    /// normalize at creation.
    pub fn normalize(self, unique_column_count: usize) -> Self {
        if unique_column_count == 1 && self == NullsDistinct::AllDistinct {
            NullsDistinct::Distinct
        } else {
            self
        }
    }

    /// True when an equal composite prefix constitutes a duplicate.
    pub fn is_conflict(&self, unique_prefix: &[&Value]) -> bool {
        match self {
            NullsDistinct::NotDistinct => true,
            NullsDistinct::Distinct => !unique_prefix.iter().any(|v| v.is_null()),
            NullsDistinct::AllDistinct => unique_prefix.iter().any(|v| !v.is_null()),
        }
    }
}

/// Ordering over rows induced by an index's column list, with the row key
/// as the final tiebreaker.
#[derive(Debug, Clone, Default)]
pub struct RowComparator {
    columns: Vec<IndexColumn>,
}

impl RowComparator {
    pub fn new(columns: Vec<IndexColumn>) -> Self {
        RowComparator { columns }
    }

    pub fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    /// Full ordering over dense rows: indexed columns, then the row key.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for ic in &self.columns {
            let ord = ic.sort.compare(a.value(ic.column), b.value(ic.column));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.key.cmp(&b.key)
    }

    /// Compare a row against a sparse probe. Absent probe slots end the
    /// comparison: the row is equal to the probe on its constrained prefix.
    pub fn compare_to_probe(&self, row: &Row, probe: &SearchRow) -> Ordering {
        for ic in &self.columns {
            match probe.value(ic.column) {
                None => return Ordering::Equal,
                Some(pv) => {
                    let ord = ic.sort.compare(row.value(ic.column), pv);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
        match probe.key {
            None => Ordering::Equal,
            Some(k) => row.key.cmp(&k),
        }
    }

    /// True when the row carries a NULL in a column the probe constrains
    /// with a non-null value; such rows are incomparable against the bound
    /// and are skipped by range scans.
    pub fn has_null_on_constrained(&self, row: &Row, probe: &SearchRow) -> bool {
        for ic in &self.columns {
            match probe.value(ic.column) {
                None => return false,
                Some(pv) => {
                    if !pv.is_null() && row.value(ic.column).is_null() {
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Outcome of checking a row against a scan's [first, last] bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsCheck {
    /// Inside the closed interval.
    Within,
    /// Before the interval in scan direction; keep scanning.
    Skip,
    /// Past the interval in scan direction; the cursor is exhausted.
    Exhausted,
}

/// Shared boundary check for ordered cursors. `reverse` flips which side
/// terminates the scan.
pub fn check_bounds(
    comparator: &RowComparator,
    row: &Row,
    first: Option<&SearchRow>,
    last: Option<&SearchRow>,
    reverse: bool,
) -> BoundsCheck {
    if let Some(first) = first {
        if comparator.has_null_on_constrained(row, first) {
            return BoundsCheck::Skip;
        }
        if comparator.compare_to_probe(row, first) == Ordering::Less {
            return if reverse {
                BoundsCheck::Exhausted
            } else {
                BoundsCheck::Skip
            };
        }
    }
    if let Some(last) = last {
        if comparator.has_null_on_constrained(row, last) {
            return BoundsCheck::Skip;
        }
        if comparator.compare_to_probe(row, last) == Ordering::Greater {
            return if reverse {
                BoundsCheck::Skip
            } else {
                BoundsCheck::Exhausted
            };
        }
    }
    BoundsCheck::Within
}

/// The access-path contract. Every variant the planner can pick implements
/// this; dispatch is through trait objects.
pub trait Index {
    fn index_id(&self) -> u32;
    fn name(&self) -> &str;
    fn index_type(&self) -> IndexType;

    /// Ordered list of indexed columns; empty for scan-style paths.
    fn columns(&self) -> &[IndexColumn];

    fn comparator(&self) -> &RowComparator;

    /// Number of leading columns forming a unique key; 0 when not unique.
    fn unique_column_count(&self) -> usize {
        0
    }

    /// Insert a row. Fails with `DuplicateKey` when a unique constraint
    /// fires.
    fn add(&mut self, session: &mut Session, row: &Row) -> Result<()>;

    /// Delete a row. Fails with `RowNotFound` if no matching row exists.
    fn remove(&mut self, session: &mut Session, row: &Row) -> Result<()>;

    /// Defined as remove(old) + add(new) unless a path overrides.
    fn update(&mut self, session: &mut Session, old: &Row, new: &Row) -> Result<()> {
        self.remove(session, old)?;
        self.add(session, new)
    }

    /// Ordered scan of rows with keys in the closed interval
    /// [first, last]; None is unbounded on that side.
    fn find(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>>;

    /// Capability-gated single-row cursor at the extreme.
    fn find_first_or_last(&self, _session: &mut Session, _first: bool) -> Result<Box<dyn Cursor>> {
        Err(OpalError::Unsupported("find first or last"))
    }

    /// Spatial variant only: rows whose MBR intersects `intersection`
    /// within [first, last].
    fn find_by_geometry(
        &self,
        _session: &mut Session,
        _first: Option<&SearchRow>,
        _last: Option<&SearchRow>,
        _intersection: &Mbr,
    ) -> Result<Box<dyn Cursor>> {
        Err(OpalError::Unsupported("spatial lookup"))
    }

    /// Deterministic plan cost; see the cost module.
    fn get_cost(
        &self,
        session: &mut Session,
        masks: Option<&[u8]>,
        sort_order: Option<&[IndexColumn]>,
        projected_columns: Option<&[usize]>,
    ) -> f64;

    fn row_count(&self, session: &mut Session) -> i64;

    fn row_count_approximation(&self) -> i64;

    fn truncate(&mut self, session: &mut Session) -> Result<()>;

    /// Set after an unclean shutdown detected at open.
    fn needs_rebuild(&self) -> bool {
        false
    }

    // Capability flags.
    fn can_scan(&self) -> bool {
        true
    }
    fn can_get_first_or_last(&self) -> bool {
        false
    }
    fn can_find_next(&self) -> bool {
        false
    }
    /// When true, the planner's conditions are useless: every find is a
    /// full scan.
    fn find_requires_full_scan(&self) -> bool {
        false
    }

    /// True when the index stores every column in `projected`.
    fn covers(&self, projected: &[usize]) -> bool {
        projected
            .iter()
            .all(|c| self.columns().iter().any(|ic| ic.column == *c))
    }
}

/// Render the indexed values of a row as the key tuple of a duplicate-key
/// error message.
pub fn render_key(columns: &[IndexColumn], row: &Row) -> String {
    let parts: Vec<String> = columns
        .iter()
        .map(|ic| row.value(ic.column).to_sql())
        .collect();
    format!("({})", parts.join(", "))
}

pub fn duplicate_key_error(index_name: &str, columns: &[IndexColumn], row: &Row) -> OpalError {
    OpalError::DuplicateKey {
        index: index_name.to_string(),
        key: render_key(columns, row),
    }
}

pub fn row_not_found_error(index_name: &str, row: &Row) -> OpalError {
    OpalError::RowNotFound {
        index: index_name.to_string(),
        key: format!("key {}", row.key),
    }
}
