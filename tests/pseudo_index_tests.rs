//! The virtual access paths end to end: SYSTEM_RANGE generation, the
//! dual row, meta-table materialization, and recursive view evaluation.

use opaldb::error::OpalError;
use opaldb::index::condition::{CompareType, ConstExpression, IndexCondition};
use opaldb::index::cursor::Cursor;
use opaldb::index::dual::DualIndex;
use opaldb::index::index_cursor::IndexCursor;
use opaldb::index::meta::MetaIndex;
use opaldb::index::range::RangeIndex;
use opaldb::index::recursive::{RecursiveIndex, RecursiveQuery};
use opaldb::index::{Index, NullsDistinct};
use opaldb::row::Row;
use opaldb::schema::column::{ColumnDef, IndexColumn};
use opaldb::schema::table::TableDef;
use opaldb::session::Session;
use opaldb::storage::pager::Options;
use opaldb::types::{DataType, Value};
use opaldb::Database;
use tempfile::TempDir;

fn table() -> TableDef {
    TableDef::new(
        1,
        "t",
        vec![
            ColumnDef::new("a", DataType::Int),
            ColumnDef::new("b", DataType::Int),
        ],
    )
}

#[test]
fn test_system_range_with_step() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(&dir.path().join("t.db"), Options::default()).unwrap();

    // SYSTEM_RANGE(1, 5, 2) yields 1, 3, 5.
    let range = RangeIndex::new(1, "system_range", 1, 5, 2).unwrap();
    let mut cursor = range.find(db.session(), None, None, false).unwrap();
    let mut seen = Vec::new();
    while cursor.next(db.session()).unwrap() {
        seen.push(cursor.get().unwrap().value(0).as_i64().unwrap());
    }
    assert_eq!(seen, vec![1, 3, 5]);

    // v >= 2 AND v <= 4 yields just 3, driven through the IndexCursor.
    let conditions = vec![
        IndexCondition::compare(
            CompareType::BiggerEqual,
            0,
            Box::new(ConstExpression(Value::BigInt(2))),
        ),
        IndexCondition::compare(
            CompareType::SmallerEqual,
            0,
            Box::new(ConstExpression(Value::BigInt(4))),
        ),
    ];
    let mut cursor = IndexCursor::prepare(db.session(), &range, 1, conditions, false).unwrap();
    let mut seen = Vec::new();
    while cursor.next(db.session()).unwrap() {
        seen.push(cursor.get().unwrap().value(0).as_i64().unwrap());
    }
    assert_eq!(seen, vec![3]);
}

#[test]
fn test_range_step_zero() {
    match RangeIndex::new(1, "system_range", 1, 5, 0) {
        Err(OpalError::StepSizeZero) => {}
        other => panic!("expected StepSizeZero, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_dual_yields_one_row_and_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(&dir.path().join("t.db"), Options::default()).unwrap();

    let mut dual = DualIndex::new(1, "dual");
    assert_eq!(dual.row_count_approximation(), 1);
    let mut cursor = dual.find(db.session(), None, None, false).unwrap();
    assert!(cursor.next(db.session()).unwrap());
    assert_eq!(cursor.get().unwrap().column_count(), 0);
    assert!(!cursor.next(db.session()).unwrap());

    let row = Row::new(0, Vec::new());
    match dual.add(db.session(), &row) {
        Err(OpalError::Unsupported(_)) => {}
        other => panic!("expected Unsupported, got {:?}", other),
    }
    match dual.truncate(db.session()) {
        Err(OpalError::Unsupported(_)) => {}
        other => panic!("expected Unsupported, got {:?}", other),
    }
}

#[test]
fn test_meta_index_materializes_head_records() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(&dir.path().join("t.db"), Options::default()).unwrap();
    let table = table();
    let data = db.create_data_index(&table).unwrap();
    let _index = db
        .create_btree_index(
            &table,
            "t.a_idx",
            vec![IndexColumn::asc(0)],
            0,
            NullsDistinct::Distinct,
            false,
            &data,
        )
        .unwrap();

    let catalog_head = db.catalog().head_page();
    let meta = MetaIndex::new(99, "sys.meta_idx", catalog_head, false);
    let mut cursor = meta.find(db.session(), None, None, false).unwrap();
    let mut names = Vec::new();
    while cursor.next(db.session()).unwrap() {
        names.push(cursor.get().unwrap().value(1).as_str().unwrap().to_string());
    }
    assert_eq!(names, vec!["t.scan", "t.a_idx"]);

    // The scan-only variant ignores the planner's conditions entirely.
    let scan = MetaIndex::new(100, "sys.meta_scan", catalog_head, true);
    assert!(scan.find_requires_full_scan());
    let conditions = vec![IndexCondition::equality(
        0,
        Box::new(ConstExpression(Value::Int(-1))),
    )];
    let mut cursor = IndexCursor::prepare(db.session(), &scan, 7, conditions, false).unwrap();
    let mut count = 0;
    while cursor.next(db.session()).unwrap() {
        count += 1;
    }
    assert_eq!(count, 2);
}

/// r(n) AS (SELECT 1 UNION ALL SELECT n+1 FROM r WHERE n < 3)
struct CountToThree;

impl RecursiveQuery for CountToThree {
    fn anchor(&self, _session: &mut Session) -> Result<Vec<Row>, OpalError> {
        Ok(vec![Row::new(1, vec![Value::BigInt(1)])])
    }

    fn step(&self, _session: &mut Session, previous: &[Row]) -> Result<Vec<Row>, OpalError> {
        Ok(previous
            .iter()
            .filter_map(|r| {
                let n = r.value(0).as_i64().unwrap();
                if n < 3 {
                    Some(Row::new(n + 1, vec![Value::BigInt(n + 1)]))
                } else {
                    None
                }
            })
            .collect())
    }
}

#[test]
fn test_recursive_view_rows_exactly_once_in_order() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(&dir.path().join("t.db"), Options::default()).unwrap();

    let idx = RecursiveIndex::new(1, "r", Box::new(CountToThree), 3);
    let mut cursor = idx.find(db.session(), None, None, false).unwrap();
    let mut seen = Vec::new();
    while cursor.next(db.session()).unwrap() {
        seen.push(cursor.get().unwrap().value(0).as_i64().unwrap());
    }
    assert_eq!(seen, vec![1, 2, 3]);
}
