//! System catalog: one head record per index, stored as rows of a
//! dedicated data index whose head page is recorded in the store header.
//! Head pages never move, so records are written once at creation and
//! removed at drop; there is nothing to update in between.

use crate::error::{OpalError, Result};
use crate::index::cursor::Cursor;
use crate::index::data::DataIndex;
use crate::index::IndexType;
use crate::row::Row;
use crate::schema::column::{ColumnDef, IndexColumn, SortType};
use crate::schema::table::TableDef;
use crate::session::Session;
use crate::storage::page::PageId;
use crate::types::{DataType, Value};

/// Index id reserved for the catalog itself.
pub const CATALOG_INDEX_ID: u32 = 0;

fn meta_table() -> TableDef {
    TableDef::new(
        0,
        "sys.indexes",
        vec![
            ColumnDef::new("id", DataType::Int),
            ColumnDef::new("name", DataType::Text),
            ColumnDef::new("table_id", DataType::Int),
            ColumnDef::new("index_type", DataType::Int),
            ColumnDef::new("head_page", DataType::BigInt),
            ColumnDef::new("columns", DataType::Text),
            ColumnDef::new("comment", DataType::Text),
        ],
    )
}

fn index_type_code(t: IndexType) -> i32 {
    match t {
        IndexType::Scan => 0,
        IndexType::Secondary => 1,
        IndexType::PrimaryKey => 2,
        IndexType::Hash => 3,
        IndexType::InMemory => 4,
        IndexType::Spatial => 5,
        IndexType::Meta => 6,
        IndexType::Range => 7,
        IndexType::Dual => 8,
        IndexType::Function => 9,
        IndexType::View => 10,
        IndexType::Recursive => 11,
        IndexType::Linked => 12,
    }
}

fn index_type_from_code(code: i32) -> Result<IndexType> {
    Ok(match code {
        0 => IndexType::Scan,
        1 => IndexType::Secondary,
        2 => IndexType::PrimaryKey,
        3 => IndexType::Hash,
        4 => IndexType::InMemory,
        5 => IndexType::Spatial,
        6 => IndexType::Meta,
        7 => IndexType::Range,
        8 => IndexType::Dual,
        9 => IndexType::Function,
        10 => IndexType::View,
        11 => IndexType::Recursive,
        12 => IndexType::Linked,
        _ => {
            return Err(OpalError::Corruption(format!(
                "unknown index type code {}",
                code
            )))
        }
    })
}

/// Column list as stored in the head record: `0a`, `1dn`, ... (ordinal,
/// a/d for direction, trailing n for nulls-last).
fn encode_columns(columns: &[IndexColumn]) -> String {
    columns
        .iter()
        .map(|ic| {
            let mut s = ic.column.to_string();
            s.push(if ic.sort.descending { 'd' } else { 'a' });
            if ic.sort.nulls_last {
                s.push('n');
            }
            s
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_columns(text: &str) -> Result<Vec<IndexColumn>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in text.split(',') {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        let rest = &part[digits.len()..];
        let column: usize = digits
            .parse()
            .map_err(|_| OpalError::Corruption(format!("bad column list entry '{}'", part)))?;
        let descending = match rest.chars().next() {
            Some('a') => false,
            Some('d') => true,
            _ => {
                return Err(OpalError::Corruption(format!(
                    "bad column list entry '{}'",
                    part
                )))
            }
        };
        let nulls_last = rest.len() > 1 && rest.ends_with('n');
        out.push(IndexColumn {
            column,
            sort: SortType {
                descending,
                nulls_last,
            },
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHeadRecord {
    pub id: u32,
    pub name: String,
    pub table_id: u32,
    pub index_type: IndexType,
    pub head_page: PageId,
    pub columns: Vec<IndexColumn>,
    pub comment: String,
}

impl IndexHeadRecord {
    fn to_row_values(&self) -> Vec<Value> {
        vec![
            Value::Int(self.id as i32),
            Value::Text(self.name.clone()),
            Value::Int(self.table_id as i32),
            Value::Int(index_type_code(self.index_type)),
            Value::BigInt(self.head_page as i64),
            Value::Text(encode_columns(&self.columns)),
            Value::Text(self.comment.clone()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        let int = |i: usize| -> Result<i64> {
            row.values
                .get(i)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| OpalError::Corruption("malformed index head record".into()))
        };
        let text = |i: usize| -> Result<String> {
            row.values
                .get(i)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| OpalError::Corruption("malformed index head record".into()))
        };
        Ok(IndexHeadRecord {
            id: int(0)? as u32,
            name: text(1)?,
            table_id: int(2)? as u32,
            index_type: index_type_from_code(int(3)? as i32)?,
            head_page: int(4)? as PageId,
            columns: decode_columns(&text(5)?)?,
            comment: text(6)?,
        })
    }
}

pub struct SystemCatalog {
    meta: DataIndex,
}

impl SystemCatalog {
    /// Create the catalog in a fresh store and record its head page.
    pub fn create(session: &mut Session) -> Result<Self> {
        let meta = DataIndex::create(session, CATALOG_INDEX_ID, "sys.indexes", meta_table())?;
        session.pager_mut().set_catalog_root(meta.head_page());
        Ok(SystemCatalog { meta })
    }

    /// Open the catalog at the head page recorded in the store header.
    pub fn open(session: &mut Session) -> Result<Self> {
        let head = session.pager().catalog_root();
        if head == 0 {
            return Err(OpalError::Corruption("store has no catalog root".into()));
        }
        let meta = DataIndex::open(session, CATALOG_INDEX_ID, "sys.indexes", meta_table(), head)?;
        Ok(SystemCatalog { meta })
    }

    /// Head page of the catalog's backing tree (the meta index scans it).
    pub fn head_page(&self) -> PageId {
        self.meta.head_page()
    }

    /// Write the head record of a newly created index.
    pub fn register(&mut self, session: &mut Session, record: &IndexHeadRecord) -> Result<()> {
        self.meta
            .add_row(session, &Row::new(0, record.to_row_values()))?;
        Ok(())
    }

    /// Remove the head record of a dropped index.
    pub fn unregister(&mut self, session: &mut Session, id: u32) -> Result<()> {
        let mut cursor = DataIndex::scan_head(self.meta.head_page(), None, None, false);
        while cursor.next(session)? {
            let row = cursor.get().expect("positioned");
            let record = IndexHeadRecord::from_row(row)?;
            if record.id == id {
                let key = row.key;
                self.meta.remove_key(session, key)?;
                return Ok(());
            }
        }
        Err(OpalError::Internal(format!(
            "no head record for index id {}",
            id
        )))
    }

    pub fn get(&self, session: &mut Session, id: u32) -> Result<Option<IndexHeadRecord>> {
        Ok(self
            .list(session)?
            .into_iter()
            .find(|record| record.id == id))
    }

    pub fn find_by_name(
        &self,
        session: &mut Session,
        name: &str,
    ) -> Result<Option<IndexHeadRecord>> {
        Ok(self
            .list(session)?
            .into_iter()
            .find(|record| record.name == name))
    }

    pub fn list(&self, session: &mut Session) -> Result<Vec<IndexHeadRecord>> {
        let mut cursor = DataIndex::scan_head(self.meta.head_page(), None, None, false);
        let mut records = Vec::new();
        while cursor.next(session)? {
            records.push(IndexHeadRecord::from_row(cursor.get().expect("positioned"))?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Options, Pager};
    use tempfile::TempDir;

    fn record(id: u32, name: &str) -> IndexHeadRecord {
        IndexHeadRecord {
            id,
            name: name.to_string(),
            table_id: 7,
            index_type: IndexType::Secondary,
            head_page: 42,
            columns: vec![
                IndexColumn::asc(0),
                IndexColumn::desc(3).with_nulls_last(),
            ],
            comment: String::new(),
        }
    }

    #[test]
    fn test_register_list_unregister() {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), Options::default()).unwrap();
        let mut session = Session::new(pager);
        let mut catalog = SystemCatalog::create(&mut session).unwrap();

        catalog.register(&mut session, &record(1, "t.a_idx")).unwrap();
        catalog.register(&mut session, &record(2, "t.b_idx")).unwrap();

        let listed = catalog.list(&mut session).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], record(1, "t.a_idx"));

        let by_name = catalog
            .find_by_name(&mut session, "t.b_idx")
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, 2);

        catalog.unregister(&mut session, 1).unwrap();
        assert!(catalog.get(&mut session, 1).unwrap().is_none());
        assert!(catalog.get(&mut session, 2).unwrap().is_some());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        {
            let pager = Pager::create(&path, Options::default()).unwrap();
            let mut session = Session::new(pager);
            let mut catalog = SystemCatalog::create(&mut session).unwrap();
            catalog.register(&mut session, &record(1, "t.a_idx")).unwrap();
            session.pager_mut().close().unwrap();
        }
        {
            let pager = Pager::open(&path, Options::default()).unwrap();
            let mut session = Session::new(pager);
            let catalog = SystemCatalog::open(&mut session).unwrap();
            let listed = catalog.list(&mut session).unwrap();
            assert_eq!(listed, vec![record(1, "t.a_idx")]);
        }
    }

    #[test]
    fn test_column_list_roundtrip() {
        let columns = vec![
            IndexColumn::asc(0),
            IndexColumn::desc(12),
            IndexColumn::asc(3).with_nulls_last(),
        ];
        let encoded = encode_columns(&columns);
        assert_eq!(encoded, "0a,12d,3an");
        assert_eq!(decode_columns(&encoded).unwrap(), columns);
        assert!(decode_columns("").unwrap().is_empty());
    }
}
