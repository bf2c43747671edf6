use std::cmp::Ordering;

use crate::types::{compare_values, Value};

/// Default selectivity assumed for a column without statistics (percent of
/// distinct values, 0-100).
pub const DEFAULT_SELECTIVITY: u8 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: crate::types::DataType,
    pub nullable: bool,
    pub selectivity: u8,
}

impl ColumnDef {
    pub fn new(name: &str, data_type: crate::types::DataType) -> Self {
        ColumnDef {
            name: name.to_string(),
            data_type,
            nullable: true,
            selectivity: DEFAULT_SELECTIVITY,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_selectivity(mut self, selectivity: u8) -> Self {
        self.selectivity = selectivity.min(100);
        self
    }
}

/// Sort direction and null placement for one index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortType {
    pub descending: bool,
    pub nulls_last: bool,
}

impl SortType {
    pub const ASC: SortType = SortType {
        descending: false,
        nulls_last: false,
    };
    pub const DESC: SortType = SortType {
        descending: true,
        nulls_last: false,
    };

    /// Compare two values under this sort type. Ascending with nulls first
    /// is the base ordering.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if self.nulls_last {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, true) => {
                if self.nulls_last {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, false) => {
                let ord = compare_values(a, b);
                if self.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

/// A table column participating in an index, with its sort type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexColumn {
    pub column: usize,
    pub sort: SortType,
}

impl IndexColumn {
    pub fn asc(column: usize) -> Self {
        IndexColumn {
            column,
            sort: SortType::ASC,
        }
    }

    pub fn desc(column: usize) -> Self {
        IndexColumn {
            column,
            sort: SortType::DESC,
        }
    }

    pub fn with_nulls_last(mut self) -> Self {
        self.sort.nulls_last = true;
        self
    }
}
