//! Linked index: delegates local access-path operations to a remote SQL
//! source by emitting SQL text. Errors from the remote are wrapped with
//! the SQL that caused them.

use parking_lot::Mutex;

use crate::error::{OpalError, Result};
use crate::index::cost::{cost_range_index, CostKind, CostParams};
use crate::index::cursor::{Cursor, MaterializedCursor};
use crate::index::{Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::schema::table::TableDef;
use crate::session::Session;
use crate::types::{DataType, Value};

/// Guessed remote size; the linked index deliberately does not maintain a
/// row count (the remote is authoritative).
const ROW_COUNT_GUESS: i64 = 1000;

/// A connection to the remote SQL source. Implementations translate the
/// placeholder parameters to their own wire protocol.
pub trait RemoteConnection: Send {
    /// Execute a statement; returns the affected row count.
    fn execute_update(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> std::result::Result<u64, String>;

    /// Execute a query; returns the result rows.
    fn execute_query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> std::result::Result<Vec<Vec<Value>>, String>;

    /// Identifier quote character of the remote dialect.
    fn quote_char(&self) -> char {
        '"'
    }

    /// Legacy remotes comparing fixed-width CHAR with trailing blanks need
    /// an explicit CAST around bound character parameters.
    fn requires_char_cast(&self) -> bool {
        false
    }
}

pub struct LinkedIndex {
    index_id: u32,
    name: String,
    table: TableDef,
    remote_table: String,
    conn: Mutex<Box<dyn RemoteConnection>>,
    comparator: RowComparator,
}

impl LinkedIndex {
    pub fn new(
        index_id: u32,
        name: &str,
        table: TableDef,
        remote_table: &str,
        conn: Box<dyn RemoteConnection>,
    ) -> Self {
        LinkedIndex {
            index_id,
            name: name.to_string(),
            table,
            remote_table: remote_table.to_string(),
            conn: Mutex::new(conn),
            comparator: RowComparator::default(),
        }
    }

    fn quote(&self, identifier: &str) -> String {
        let q = self.conn.lock().quote_char();
        let mut out = String::with_capacity(identifier.len() + 2);
        out.push(q);
        for c in identifier.chars() {
            if c == q {
                out.push(q);
            }
            out.push(c);
        }
        out.push(q);
        out
    }

    fn parameter(&self, column: usize) -> String {
        let char_cast = self.conn.lock().requires_char_cast();
        if char_cast && self.table.columns[column].data_type == DataType::Text {
            "CAST(? AS CHAR)".to_string()
        } else {
            "?".to_string()
        }
    }

    fn run_update(&self, sql: String, params: &[Value]) -> Result<u64> {
        self.conn
            .lock()
            .execute_update(&sql, params)
            .map_err(|cause| OpalError::LinkedTable { sql, cause })
    }

    fn run_query(&self, sql: String, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        self.conn
            .lock()
            .execute_query(&sql, params)
            .map_err(|cause| OpalError::LinkedTable { sql, cause })
    }

    /// `"col" IS NULL` or `"col" = ?` per column of the given row.
    fn row_match_clause(&self, row: &Row, params: &mut Vec<Value>) -> String {
        let mut parts = Vec::with_capacity(self.table.columns.len());
        for (i, column) in self.table.columns.iter().enumerate() {
            let value = row.value(i);
            if value.is_null() {
                parts.push(format!("{} IS NULL", self.quote(&column.name)));
            } else {
                parts.push(format!("{} = {}", self.quote(&column.name), self.parameter(i)));
                params.push(value.clone());
            }
        }
        parts.join(" AND ")
    }
}

impl Index for LinkedIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Linked
    }

    fn columns(&self) -> &[IndexColumn] {
        &[]
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        let placeholders: Vec<String> = (0..self.table.columns.len())
            .map(|i| self.parameter(i))
            .collect();
        let sql = format!(
            "INSERT INTO {} VALUES({})",
            self.quote(&self.remote_table),
            placeholders.join(", ")
        );
        self.run_update(sql, &row.values)?;
        Ok(())
    }

    fn remove(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        let mut params = Vec::new();
        let clause = self.row_match_clause(row, &mut params);
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.quote(&self.remote_table),
            clause
        );
        let affected = self.run_update(sql, &params)?;
        if affected == 0 {
            return Err(OpalError::RowNotFound {
                index: self.name.clone(),
                key: row
                    .values
                    .iter()
                    .map(|v| v.to_sql())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(())
    }

    /// Direct UPDATE instead of the default remove + add round trip.
    fn update(&mut self, _session: &mut Session, old: &Row, new: &Row) -> Result<()> {
        let mut params = Vec::new();
        let mut sets = Vec::with_capacity(self.table.columns.len());
        for (i, column) in self.table.columns.iter().enumerate() {
            sets.push(format!("{} = {}", self.quote(&column.name), self.parameter(i)));
            params.push(new.value(i).clone());
        }
        let clause = self.row_match_clause(old, &mut params);
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.quote(&self.remote_table),
            sets.join(", "),
            clause
        );
        let affected = self.run_update(sql, &params)?;
        if affected == 0 {
            return Err(OpalError::RowNotFound {
                index: self.name.clone(),
                key: old
                    .values
                    .iter()
                    .map(|v| v.to_sql())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(())
    }

    fn find(
        &self,
        _session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        _reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (i, column) in self.table.columns.iter().enumerate() {
            if let Some(v) = first.and_then(|f| f.value(i)) {
                if !v.is_null() {
                    clauses.push(format!("{} >= {}", self.quote(&column.name), self.parameter(i)));
                    params.push(v.clone());
                }
            }
            if let Some(v) = last.and_then(|l| l.value(i)) {
                if !v.is_null() {
                    clauses.push(format!("{} <= {}", self.quote(&column.name), self.parameter(i)));
                    params.push(v.clone());
                }
            }
        }
        let mut sql = format!("SELECT * FROM {}", self.quote(&self.remote_table));
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let result = self.run_query(sql, &params)?;
        let rows = result
            .into_iter()
            .enumerate()
            .map(|(i, values)| Row::new(i as i64 + 1, values))
            .collect();
        Ok(Box::new(MaterializedCursor::new(rows)))
    }

    fn get_cost(
        &self,
        _session: &mut Session,
        masks: Option<&[u8]>,
        sort_order: Option<&[IndexColumn]>,
        projected_columns: Option<&[usize]>,
    ) -> f64 {
        cost_range_index(&CostParams {
            masks,
            row_count: ROW_COUNT_GUESS,
            columns: &[],
            selectivity: &[],
            unique_column_count: 0,
            sort_order,
            projected: projected_columns,
            kind: CostKind::Scan,
        })
    }

    fn row_count(&self, _session: &mut Session) -> i64 {
        ROW_COUNT_GUESS
    }

    fn row_count_approximation(&self) -> i64 {
        ROW_COUNT_GUESS
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        let sql = format!("DELETE FROM {}", self.quote(&self.remote_table));
        self.run_update(sql, &[])?;
        Ok(())
    }
}
