//! Crash and rollback behavior over real files: the undo journal rolls
//! torn transactions back, the clean-shutdown handshake drives secondary
//! rebuild, and committed data survives everything.

use opaldb::index::cursor::Cursor;
use opaldb::index::{Index, NullsDistinct};
use opaldb::row::Row;
use opaldb::schema::column::{ColumnDef, IndexColumn};
use opaldb::schema::table::TableDef;
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
            ColumnDef::new("b", DataType::Text),
        ],
    )
}

fn row(a: i32, b: &str) -> Row {
    Row::new(0, vec![Value::Int(a), Value::Text(b.to_string())])
}

#[test]
fn test_clean_close_no_rebuild() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.db");
    let table = table();
    {
        let mut db = Database::create(&path, Options::default()).unwrap();
        let mut data = db.create_data_index(&table).unwrap();
        for i in 0..50 {
            data.add_row(db.session(), &row(i, "v")).unwrap();
        }
        db.commit().unwrap();
        db.close().unwrap();
    }
    {
        let mut db = Database::open(&path, Options::default()).unwrap();
        let data = db.open_data_index(&table).unwrap();
        assert!(!data.needs_rebuild());
        assert_eq!(data.row_count_approximation(), 50);
    }
}

#[test]
fn test_crash_rolls_back_to_committed_prefix() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.db");
    let table = table();
    {
        let mut db = Database::create(&path, Options::default()).unwrap();
        let mut data = db.create_data_index(&table).unwrap();
        // Enough rows to split leaves several times.
        for i in 0..500 {
            data.add_row(db.session(), &row(i, "committed")).unwrap();
        }
        db.commit().unwrap();

        // A second batch that never commits; dropping the database
        // without close() stands in for a crash.
        for i in 500..800 {
            data.add_row(db.session(), &row(i, "torn")).unwrap();
        }
    }
    {
        let mut db = Database::open(&path, Options::default()).unwrap();
        let data = db.open_data_index(&table).unwrap();
        assert_eq!(data.row_count_approximation(), 500);

        // Traversal is ordered and complete over the committed prefix.
        let mut cursor = data.find(db.session(), None, None, false).unwrap();
        let mut keys = Vec::new();
        while cursor.next(db.session()).unwrap() {
            let current = cursor.get().unwrap();
            assert_eq!(current.value(1).as_str(), Some("committed"));
            keys.push(current.key);
        }
        assert_eq!(keys.len(), 500);
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}

#[test]
fn test_unclean_open_flags_and_rebuilds_secondary() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.db");
    let table = table();
    {
        let mut db = Database::create(&path, Options::default()).unwrap();
        let mut data = db.create_data_index(&table).unwrap();
        let mut index = db
            .create_btree_index(
                &table,
                "t.a_idx",
                vec![IndexColumn::asc(0)],
                1,
                NullsDistinct::Distinct,
                false,
                &data,
            )
            .unwrap();
        for i in 0..100 {
            let key = data.add_row(db.session(), &row(i, "v")).unwrap();
            index
                .add(
                    db.session(),
                    &Row::new(key, vec![Value::Int(i), Value::Text("v".into())]),
                )
                .unwrap();
        }
        db.commit().unwrap();
        // No close(): the clean flag stays unset on disk.
    }
    {
        let mut db = Database::open(&path, Options::default()).unwrap();
        let data = db.open_data_index(&table).unwrap();
        let mut index = db
            .open_btree_index("t.a_idx", &table, 1, NullsDistinct::Distinct, &data)
            .unwrap();
        assert!(index.needs_rebuild());

        db.rebuild_index(&mut index, &data).unwrap();
        assert!(!index.needs_rebuild());
        assert_eq!(index.row_count_approximation(), 100);

        // The rebuilt index is ordered and complete.
        let mut cursor = index.find(db.session(), None, None, false).unwrap();
        let mut previous = i64::MIN;
        let mut count = 0;
        while cursor.next(db.session()).unwrap() {
            let a = cursor.get().unwrap().value(0).as_i64().unwrap();
            assert!(previous <= a);
            previous = a;
            count += 1;
        }
        assert_eq!(count, 100);
    }
}

#[test]
fn test_in_process_rollback_restores_indexes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.db");
    let table = table();

    let mut db = Database::create(&path, Options::default()).unwrap();
    let mut data = db.create_data_index(&table).unwrap();
    for i in 0..200 {
        data.add_row(db.session(), &row(i, "keep")).unwrap();
    }
    db.commit().unwrap();

    for i in 200..300 {
        data.add_row(db.session(), &row(i, "discard")).unwrap();
    }
    db.rollback().unwrap();
    data.refresh(db.session()).unwrap();

    assert_eq!(data.row_count_approximation(), 200);
    let mut cursor = data.find(db.session(), None, None, false).unwrap();
    let mut count = 0;
    while cursor.next(db.session()).unwrap() {
        assert_eq!(cursor.get().unwrap().value(1).as_str(), Some("keep"));
        count += 1;
    }
    assert_eq!(count, 200);

    // The store keeps working after the rollback.
    let key = data.add_row(db.session(), &row(999, "after")).unwrap();
    assert!(data.get_row(db.session(), key).unwrap().is_some());
    db.close().unwrap();
}

#[test]
fn test_catalog_survives_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.db");
    let table = table();
    {
        let mut db = Database::create(&path, Options::default()).unwrap();
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
        db.commit().unwrap();
        // Crash.
    }
    {
        let mut db = Database::open(&path, Options::default()).unwrap();
        let data = db.open_data_index(&table).unwrap();
        let index = db
            .open_btree_index("t.a_idx", &table, 0, NullsDistinct::Distinct, &data)
            .unwrap();
        assert!(index.needs_rebuild());
    }
}
