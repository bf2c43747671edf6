//! OpalDB: embedded relational storage and indexing core.
//!
//! A single-file page store with:
//! - Data index: paged B+Tree keyed by engine-minted row keys, full rows
//!   in the leaves
//! - Secondary B+Tree indexes over user columns with row-key tiebreak
//! - In-memory tree/hash/spatial access paths behind the same interface
//! - Predicate-driven IndexCursor with IN fan-out and a deterministic
//!   cost model
//! - Undo-journal crash recovery and a clean-shutdown handshake
//! - Multiple readers / single writer concurrency

pub mod concurrency;
pub mod error;
pub mod index;
pub mod row;
pub mod schema;
pub mod session;
pub mod storage;
pub mod types;

use std::path::Path;

use crate::concurrency::DatabaseLock;
use crate::error::{OpalError, Result};
use crate::index::btree::BTreeIndex;
use crate::index::data::DataIndex;
use crate::index::{Index, IndexType, NullsDistinct};
use crate::schema::catalog::{IndexHeadRecord, SystemCatalog};
use crate::schema::column::IndexColumn;
use crate::schema::table::TableDef;
use crate::session::Session;
use crate::storage::pager::{Options, Pager};

/// Main database handle: owns the session (pager), the catalog, and the
/// coarse-grained lock every public entry point takes.
pub struct Database {
    session: Session,
    catalog: SystemCatalog,
    lock: DatabaseLock,
}

impl Database {
    /// Create a new database at the given path. The process-level lock
    /// is taken first and lives as long as the handle.
    pub fn create(path: &Path, options: Options) -> Result<Self> {
        let lock = DatabaseLock::acquire(path, false)?;
        let pager = Pager::create(path, options)?;
        let mut session = Session::new(pager);
        let catalog = SystemCatalog::create(&mut session)?;
        session.pager_mut().commit()?;
        Ok(Database {
            session,
            catalog,
            lock,
        })
    }

    /// Open an existing database. A torn transaction in the undo journal
    /// is rolled back first; if the previous session did not close
    /// cleanly, every persistent secondary index reports `needs_rebuild`
    /// until it is rebuilt from its data index.
    pub fn open(path: &Path, options: Options) -> Result<Self> {
        // Lock before recovery: a second handle must not replay the undo
        // journal under a live writer.
        let lock = DatabaseLock::acquire(path, false)?;
        let pager = Pager::open(path, options)?;
        let mut session = Session::new(pager);
        let catalog = SystemCatalog::open(&mut session)?;
        Ok(Database {
            session,
            catalog,
            lock,
        })
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn catalog(&self) -> &SystemCatalog {
        &self.catalog
    }

    /// Create the data index (table scan path) for a table and record it.
    pub fn create_data_index(&mut self, table: &TableDef) -> Result<DataIndex> {
        let _guard = self.lock.exclusive();
        let id = self.session.pager_mut().next_index_id();
        let name = format!("{}.scan", table.name);
        let data = DataIndex::create(&mut self.session, id, &name, table.clone())?;
        self.catalog.register(
            &mut self.session,
            &IndexHeadRecord {
                id,
                name,
                table_id: table.id,
                index_type: IndexType::Scan,
                head_page: data.head_page(),
                columns: Vec::new(),
                comment: String::new(),
            },
        )?;
        Ok(data)
    }

    /// Open a table's data index from its head record.
    pub fn open_data_index(&mut self, table: &TableDef) -> Result<DataIndex> {
        let _guard = self.lock.shared();
        let record = self
            .catalog
            .list(&mut self.session)?
            .into_iter()
            .find(|r| r.table_id == table.id && r.index_type == IndexType::Scan)
            .ok_or_else(|| {
                OpalError::Internal(format!("no data index for table {}", table.name))
            })?;
        DataIndex::open(
            &mut self.session,
            record.id,
            &record.name,
            table.clone(),
            record.head_page,
        )
    }

    /// Create a secondary B-tree index and record it.
    #[allow(clippy::too_many_arguments)]
    pub fn create_btree_index(
        &mut self,
        table: &TableDef,
        name: &str,
        columns: Vec<IndexColumn>,
        unique_column_count: usize,
        nulls_distinct: NullsDistinct,
        primary_key: bool,
        data: &DataIndex,
    ) -> Result<BTreeIndex> {
        let _guard = self.lock.exclusive();
        let id = self.session.pager_mut().next_index_id();
        let index = BTreeIndex::create(
            &mut self.session,
            id,
            name,
            table.clone(),
            columns.clone(),
            unique_column_count,
            nulls_distinct,
            primary_key,
            data.head_page(),
        )?;
        self.catalog.register(
            &mut self.session,
            &IndexHeadRecord {
                id,
                name: name.to_string(),
                table_id: table.id,
                index_type: index.index_type(),
                head_page: index.head_page(),
                columns,
                comment: String::new(),
            },
        )?;
        Ok(index)
    }

    /// Open a secondary index from its head record. After an unclean
    /// shutdown the returned index reports `needs_rebuild`; pass it to
    /// [`Database::rebuild_index`].
    pub fn open_btree_index(
        &mut self,
        name: &str,
        table: &TableDef,
        unique_column_count: usize,
        nulls_distinct: NullsDistinct,
        data: &DataIndex,
    ) -> Result<BTreeIndex> {
        let _guard = self.lock.shared();
        let record = self
            .catalog
            .find_by_name(&mut self.session, name)?
            .ok_or_else(|| OpalError::Internal(format!("no head record for index {}", name)))?;
        BTreeIndex::open(
            &mut self.session,
            record.id,
            &record.name,
            table.clone(),
            record.columns,
            unique_column_count,
            nulls_distinct,
            record.index_type == IndexType::PrimaryKey,
            record.head_page,
            data.head_page(),
        )
    }

    /// Truncate and repopulate a secondary index from the data index.
    pub fn rebuild_index(&mut self, index: &mut BTreeIndex, data: &DataIndex) -> Result<()> {
        let _guard = self.lock.exclusive();
        index.rebuild_from(&mut self.session, data)
    }

    /// Drop a secondary index: free its pages and remove the head record.
    pub fn drop_btree_index(&mut self, index: BTreeIndex) -> Result<()> {
        let _guard = self.lock.exclusive();
        let id = index.index_id();
        index.destroy(&mut self.session)?;
        self.catalog.unregister(&mut self.session, id)
    }

    /// Drop a table's data index: free its pages and remove the record.
    pub fn drop_data_index(&mut self, data: DataIndex) -> Result<()> {
        let _guard = self.lock.exclusive();
        let id = data.index_id();
        data.destroy(&mut self.session)?;
        self.catalog.unregister(&mut self.session, id)
    }

    /// Commit the open transaction (truncates the undo journal durably).
    pub fn commit(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.session.commit()
    }

    /// Roll back the open transaction by replaying page pre-images.
    /// Index handles held by the caller are stale afterwards and must be
    /// refreshed.
    pub fn rollback(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.session.rollback()
    }

    /// Orderly shutdown: commit and mark the store clean.
    pub fn close(mut self) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.session.pager_mut().close()
    }
}
