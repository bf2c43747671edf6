//! Hash index: equality-only in-memory access path. A single integer
//! column uses a primitive i64 map; any other shape hashes the serialized
//! composite key. Rows are resolved through the data index.

use std::collections::HashMap;

use crate::error::{OpalError, Result};
use crate::index::cost::COST_INFEASIBLE;
use crate::index::condition::EQUALITY;
use crate::index::cursor::{Cursor, MaterializedCursor};
use crate::index::data::DataIndex;
use crate::index::{
    duplicate_key_error, row_not_found_error, Index, IndexType, NullsDistinct, RowComparator,
};
use crate::row::{serialize_values, Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::schema::table::TableDef;
use crate::session::Session;
use crate::storage::page::PageId;
use crate::types::{DataType, Value};

enum Shape {
    /// Single integer column: primitive key map. NULL keys live aside.
    Int {
        map: HashMap<i64, Vec<i64>>,
        null_rows: Vec<i64>,
    },
    /// Serialized composite key map (the null bitmap is part of the key).
    Composite { map: HashMap<Vec<u8>, Vec<i64>> },
}

pub struct HashIndex {
    index_id: u32,
    name: String,
    table: TableDef,
    columns: Vec<IndexColumn>,
    comparator: RowComparator,
    unique: bool,
    nulls_distinct: NullsDistinct,
    data_head: PageId,
    shape: Shape,
    row_count: i64,
}

impl HashIndex {
    pub fn new(
        index_id: u32,
        name: &str,
        table: TableDef,
        columns: Vec<IndexColumn>,
        unique: bool,
        nulls_distinct: NullsDistinct,
        data_head: PageId,
    ) -> Self {
        let int_shape = columns.len() == 1
            && matches!(
                table.columns.get(columns[0].column).map(|c| c.data_type),
                Some(DataType::Int) | Some(DataType::BigInt)
            );
        let shape = if int_shape {
            Shape::Int {
                map: HashMap::new(),
                null_rows: Vec::new(),
            }
        } else {
            Shape::Composite {
                map: HashMap::new(),
            }
        };
        let ucc = if unique { columns.len() } else { 0 };
        HashIndex {
            index_id,
            name: name.to_string(),
            comparator: RowComparator::new(columns.clone()),
            unique,
            nulls_distinct: nulls_distinct.normalize(ucc),
            data_head,
            shape,
            row_count: 0,
            columns,
            table,
        }
    }

    fn key_values<'a>(&self, row: &'a Row) -> Vec<&'a Value> {
        self.columns.iter().map(|ic| row.value(ic.column)).collect()
    }

    fn bucket_of_row(&mut self, row: &Row) -> &mut Vec<i64> {
        match &mut self.shape {
            Shape::Int { map, null_rows } => {
                let v = row.value(self.columns[0].column);
                match v.as_i64() {
                    Some(k) => map.entry(k).or_default(),
                    None => null_rows,
                }
            }
            Shape::Composite { map } => {
                let values: Vec<Value> = self
                    .columns
                    .iter()
                    .map(|ic| row.value(ic.column).clone())
                    .collect();
                map.entry(serialize_values(&values)).or_default()
            }
        }
    }

    fn bucket_for_probe(&self, probe: &SearchRow) -> Option<&Vec<i64>> {
        match &self.shape {
            Shape::Int { map, null_rows } => {
                let v = probe.value(self.columns[0].column)?;
                match v.as_i64() {
                    Some(k) => map.get(&k),
                    None => Some(null_rows),
                }
            }
            Shape::Composite { map } => {
                let mut values = Vec::with_capacity(self.columns.len());
                for ic in &self.columns {
                    values.push(probe.value(ic.column)?.clone());
                }
                map.get(&serialize_values(&values))
            }
        }
    }
}

impl Index for HashIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Hash
    }

    fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn unique_column_count(&self) -> usize {
        if self.unique {
            self.columns.len()
        } else {
            0
        }
    }

    fn add(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        if self.unique {
            let key = self.key_values(row);
            if self.nulls_distinct.is_conflict(&key) {
                let probe = row.to_search_row();
                if let Some(bucket) = self.bucket_for_probe(&probe) {
                    if !bucket.is_empty() {
                        return Err(duplicate_key_error(&self.name, &self.columns, row));
                    }
                }
            }
        }
        self.bucket_of_row(row).push(row.key);
        self.row_count += 1;
        Ok(())
    }

    fn remove(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        let key = row.key;
        let bucket = self.bucket_of_row(row);
        match bucket.iter().position(|&k| k == key) {
            Some(pos) => {
                bucket.remove(pos);
                self.row_count -= 1;
                Ok(())
            }
            None => Err(row_not_found_error(&self.name, row)),
        }
    }

    fn find(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        _reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        // Equality-only: both bounds must name the same point.
        let probe = match (first, last) {
            (Some(f), Some(l)) if f == l => f,
            _ => return Err(OpalError::Unsupported("hash index range scan")),
        };
        let keys: Vec<i64> = self
            .bucket_for_probe(probe)
            .map(|b| b.clone())
            .unwrap_or_default();
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let row =
                DataIndex::lookup_row(session, self.data_head, key)?.ok_or_else(|| {
                    OpalError::Corruption(format!("hash entry without base row, key {}", key))
                })?;
            rows.push(row);
        }
        Ok(Box::new(MaterializedCursor::new(rows)))
    }

    fn get_cost(
        &self,
        _session: &mut Session,
        masks: Option<&[u8]>,
        _sort_order: Option<&[IndexColumn]>,
        _projected_columns: Option<&[usize]>,
    ) -> f64 {
        // Feasible only when every index column is constrained by pure
        // equality.
        let masks = match masks {
            None => return 1.0,
            Some(m) => m,
        };
        for ic in &self.columns {
            let mask = masks.get(ic.column).copied().unwrap_or(0);
            if mask != EQUALITY {
                return COST_INFEASIBLE;
            }
        }
        2.0 + self.columns.len() as f64
    }

    fn row_count(&self, session: &mut Session) -> i64 {
        self.row_count + session.row_count_diff(self.index_id)
    }

    fn row_count_approximation(&self) -> i64 {
        self.row_count
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        match &mut self.shape {
            Shape::Int { map, null_rows } => {
                map.clear();
                null_rows.clear();
            }
            Shape::Composite { map } => map.clear(),
        }
        self.row_count = 0;
        Ok(())
    }

    fn can_scan(&self) -> bool {
        false
    }
}
