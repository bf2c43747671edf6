//! Secondary B+-tree index: keyed by the indexed column values with the
//! row key as tiebreaker. Leaves store only the indexed columns plus the
//! row key; full rows are resolved through the data index.
//!
//! Page layout (on slotted pages):
//!
//! B-tree node (`PAGE_BTREE_NODE`): header cell 0 is `[right_child: u64]`;
//! entry cells are `[child: u64][pivot entry]` where the pivot is the first
//! entry of the subtree to the child's right. Deletions may leave pivots
//! stale; a stale pivot is still a valid separator, so they are never
//! repaired.
//!
//! B-tree leaf (`PAGE_BTREE_LEAF`): header cell 0 is `[mode: u8]`. In
//! normal mode entry cells carry `[key: varint][indexed values]`; in
//! only-position mode they carry just `[key: varint]` and the composite is
//! re-fetched from the data index on demand. Only-position is terminal for
//! a leaf: once flipped it stays flipped until the leaf is rewritten by a
//! truncate or rebuild.
//!
//! Like the data index, the head page never moves.

use std::cmp::Ordering;

use crate::error::{OpalError, Result};
use crate::index::cost::{cost_range_index, CostKind, CostParams};
use crate::index::cursor::{Cursor, EmptyCursor, SingletonCursor};
use crate::index::data::{build_page, cells_fit, DataIndex, MAX_TREE_DEPTH};
use crate::index::{
    check_bounds, duplicate_key_error, row_not_found_error, BoundsCheck, Index, IndexType,
    NullsDistinct, RowComparator,
};
use crate::row::{
    deserialize_values, read_varint_key, serialize_values, write_varint_key, Row, SearchRow,
};
use crate::schema::column::IndexColumn;
use crate::schema::table::TableDef;
use crate::session::Session;
use crate::storage::page::{
    Page, PageId, PAGE_BTREE_LEAF, PAGE_BTREE_NODE, ROOT_PARENT,
};

/// Entries larger than this flip their leaf into only-position mode.
const MAX_ENTRY_PAYLOAD: usize = 1000;

const LEAF_MODE_NORMAL: u8 = 0;
const LEAF_MODE_ONLY_POSITION: u8 = 1;

/// One index entry: the indexed column values (in index-column order) and
/// the row key. `full_row` is populated when decoding already resolved the
/// base row (only-position leaves).
#[derive(Debug, Clone)]
struct Entry {
    key: i64,
    values: Vec<crate::types::Value>,
    full_row: Option<Row>,
}

fn encode_entry(key: i64, values: &[crate::types::Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varint_key(&mut buf, key);
    buf.extend_from_slice(&serialize_values(values));
    buf
}

fn decode_entry(bytes: &[u8]) -> Result<Entry> {
    let (key, used) = read_varint_key(bytes)?;
    let (values, _) = deserialize_values(&bytes[used..])?;
    Ok(Entry {
        key,
        values,
        full_row: None,
    })
}

fn encode_key_only(key: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varint_key(&mut buf, key);
    buf
}

fn entry_count(page: &Page) -> u16 {
    page.cell_count().saturating_sub(1)
}

fn node_right_child(page: &Page) -> Result<PageId> {
    let cell = page.cell(0).ok_or(OpalError::InvalidPage)?;
    if cell.len() < 8 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "node header".into(),
        });
    }
    Ok(u64::from_le_bytes(cell[0..8].try_into().unwrap()))
}

fn node_child_at(page: &Page, pos: u16) -> Result<PageId> {
    let n = entry_count(page);
    let child = if pos < n {
        let cell = page.cell(pos + 1).ok_or(OpalError::InvalidPage)?;
        u64::from_le_bytes(cell[0..8].try_into().unwrap())
    } else {
        node_right_child(page)?
    };
    if child == 0 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "zero child pointer".into(),
        });
    }
    Ok(child)
}

fn node_pivot(page: &Page, idx: u16) -> Result<Entry> {
    let cell = page.cell(idx + 1).ok_or(OpalError::InvalidPage)?;
    if cell.len() < 9 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "node entry".into(),
        });
    }
    decode_entry(&cell[8..])
}

fn node_entry_cell(child: PageId, pivot_bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + pivot_bytes.len());
    buf.extend_from_slice(&child.to_le_bytes());
    buf.extend_from_slice(pivot_bytes);
    buf
}

fn leaf_mode(page: &Page) -> Result<u8> {
    let cell = page.cell(0).ok_or(OpalError::InvalidPage)?;
    if cell.is_empty() {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "leaf mode".into(),
        });
    }
    Ok(cell[0])
}

struct SplitResult {
    /// Encoded first entry of the right page.
    pivot: Vec<u8>,
    right: PageId,
}

enum DeleteOutcome {
    NotFound,
    Deleted { now_empty: bool },
}

pub struct BTreeIndex {
    index_id: u32,
    name: String,
    table: TableDef,
    columns: Vec<IndexColumn>,
    comparator: RowComparator,
    selectivity: Vec<u8>,
    unique_column_count: usize,
    nulls_distinct: NullsDistinct,
    index_type: IndexType,
    head: PageId,
    /// Head page of the table's data index, for row resolution.
    data_head: PageId,
    row_count: i64,
    needs_rebuild: bool,
}

impl BTreeIndex {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        session: &mut Session,
        index_id: u32,
        name: &str,
        table: TableDef,
        columns: Vec<IndexColumn>,
        unique_column_count: usize,
        nulls_distinct: NullsDistinct,
        primary_key: bool,
        data_head: PageId,
    ) -> Result<Self> {
        let page = session
            .pager_mut()
            .allocate_page(index_id, PAGE_BTREE_LEAF)?;
        let head = page.page_id();
        let leaf = build_page(
            head,
            PAGE_BTREE_LEAF,
            ROOT_PARENT,
            index_id,
            &[LEAF_MODE_NORMAL],
            &[],
        )?;
        session.pager_mut().write_page(&leaf)?;
        Ok(Self::handle(
            index_id,
            name,
            table,
            columns,
            unique_column_count,
            nulls_distinct,
            primary_key,
            head,
            data_head,
            false,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open(
        session: &mut Session,
        index_id: u32,
        name: &str,
        table: TableDef,
        columns: Vec<IndexColumn>,
        unique_column_count: usize,
        nulls_distinct: NullsDistinct,
        primary_key: bool,
        head: PageId,
        data_head: PageId,
    ) -> Result<Self> {
        let needs_rebuild = session.pager().needs_rebuild();
        let mut index = Self::handle(
            index_id,
            name,
            table,
            columns,
            unique_column_count,
            nulls_distinct,
            primary_key,
            head,
            data_head,
            needs_rebuild,
        );
        if !needs_rebuild {
            index.refresh(session)?;
        }
        Ok(index)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle(
        index_id: u32,
        name: &str,
        table: TableDef,
        columns: Vec<IndexColumn>,
        unique_column_count: usize,
        nulls_distinct: NullsDistinct,
        primary_key: bool,
        head: PageId,
        data_head: PageId,
        needs_rebuild: bool,
    ) -> Self {
        let selectivity = columns
            .iter()
            .map(|ic| {
                table
                    .columns
                    .get(ic.column)
                    .map(|c| c.selectivity)
                    .unwrap_or(50)
            })
            .collect();
        BTreeIndex {
            index_id,
            name: name.to_string(),
            comparator: RowComparator::new(columns.clone()),
            selectivity,
            unique_column_count,
            nulls_distinct: nulls_distinct.normalize(unique_column_count),
            index_type: if primary_key {
                IndexType::PrimaryKey
            } else {
                IndexType::Secondary
            },
            head,
            data_head,
            row_count: 0,
            needs_rebuild,
            columns,
            table,
        }
    }

    pub fn head_page(&self) -> PageId {
        self.head
    }

    pub fn nulls_distinct(&self) -> NullsDistinct {
        self.nulls_distinct
    }

    /// Recompute the row count by walking the leaves.
    pub fn refresh(&mut self, session: &mut Session) -> Result<()> {
        self.row_count = self.count_leaf_entries(session, self.head, 0)?;
        Ok(())
    }

    fn count_leaf_entries(
        &self,
        session: &mut Session,
        page_id: PageId,
        depth: usize,
    ) -> Result<i64> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("btree index depth exceeded".into()));
        }
        let page = session.pager_mut().read_page(page_id)?;
        match page.base_type() {
            PAGE_BTREE_LEAF => Ok(entry_count(&page) as i64),
            PAGE_BTREE_NODE => {
                let n = entry_count(&page);
                let mut total = 0i64;
                for pos in 0..=n {
                    let child = node_child_at(&page, pos)?;
                    total += self.count_leaf_entries(session, child, depth + 1)?;
                }
                Ok(total)
            }
            _ => Err(OpalError::FileCorrupted {
                page_id,
                field: "page type".into(),
            }),
        }
    }

    // --- entry access and ordering ---

    fn project_entry(&self, row: &Row) -> Entry {
        Entry {
            key: row.key,
            values: self
                .columns
                .iter()
                .map(|ic| row.value(ic.column).clone())
                .collect(),
            full_row: None,
        }
    }

    fn entry_at(&self, session: &mut Session, page: &Page, idx: u16) -> Result<Entry> {
        let cell = page.cell(idx + 1).ok_or(OpalError::InvalidPage)?;
        if leaf_mode(page)? == LEAF_MODE_ONLY_POSITION {
            let (key, _) = read_varint_key(cell)?;
            let row = DataIndex::lookup_row(session, self.data_head, key)?.ok_or_else(|| {
                OpalError::FileCorrupted {
                    page_id: page.page_id(),
                    field: format!("index entry without base row, key {}", key),
                }
            })?;
            let mut entry = self.project_entry(&row);
            entry.full_row = Some(row);
            Ok(entry)
        } else {
            decode_entry(cell)
        }
    }

    fn compare_entries(&self, a: &Entry, b: &Entry) -> Ordering {
        for (j, ic) in self.columns.iter().enumerate() {
            let ord = ic.sort.compare(&a.values[j], &b.values[j]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.key.cmp(&b.key)
    }

    fn compare_entry_to_probe(&self, e: &Entry, probe: &SearchRow) -> Ordering {
        for (j, ic) in self.columns.iter().enumerate() {
            match probe.value(ic.column) {
                None => return Ordering::Equal,
                Some(pv) => {
                    let ord = ic.sort.compare(&e.values[j], pv);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
        match probe.key {
            None => Ordering::Equal,
            Some(k) => e.key.cmp(&k),
        }
    }

    /// A dense row with the indexed values in place and NULL elsewhere;
    /// lets entry-level code share the row comparator and bounds check.
    fn pseudo_row(&self, entry: &Entry) -> Row {
        let mut values = vec![crate::types::Value::Null; self.table.column_count()];
        for (j, ic) in self.columns.iter().enumerate() {
            values[ic.column] = entry.values[j].clone();
        }
        Row::new(entry.key, values)
    }

    /// First leaf position whose entry is not Less than the target under
    /// the full entry order.
    fn leaf_lower_bound_entry(
        &self,
        session: &mut Session,
        page: &Page,
        target: &Entry,
    ) -> Result<(u16, bool)> {
        let n = entry_count(page);
        let mut lo = 0u16;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let e = self.entry_at(session, page, mid)?;
            if self.compare_entries(&e, target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let found = if lo < n {
            let e = self.entry_at(session, page, lo)?;
            self.compare_entries(&e, target) == Ordering::Equal
        } else {
            false
        };
        Ok((lo, found))
    }

    /// Child position for inserting/deleting an exact entry: the first
    /// pivot greater than the target.
    fn node_position_entry(&self, page: &Page, target: &Entry) -> Result<u16> {
        let n = entry_count(page);
        let mut lo = 0u16;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let pivot = node_pivot(page, mid)?;
            if self.compare_entries(target, &pivot) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    // --- uniqueness ---

    fn check_unique(&self, session: &mut Session, row: &Row) -> Result<()> {
        if self.unique_column_count == 0 {
            return Ok(());
        }
        let prefix: Vec<&crate::types::Value> = self.columns[..self.unique_column_count]
            .iter()
            .map(|ic| row.value(ic.column))
            .collect();

        if self.index_type == IndexType::PrimaryKey {
            for (ic, value) in self.columns[..self.unique_column_count].iter().zip(&prefix) {
                if value.is_null() {
                    return Err(OpalError::NullInPrimaryKey(
                        self.table.columns[ic.column].name.clone(),
                    ));
                }
            }
        }

        if !self.nulls_distinct.is_conflict(&prefix) {
            return Ok(());
        }

        let mut probe = SearchRow::with_columns(self.table.column_count());
        for ic in &self.columns[..self.unique_column_count] {
            probe.set_value(ic.column, row.value(ic.column).clone());
        }
        let mut cursor = self.entry_cursor(Some(probe.clone()), Some(probe));
        if cursor.next(session)? {
            let existing = cursor.get().expect("positioned");
            if existing.key != row.key {
                return Err(duplicate_key_error(
                    &self.name,
                    &self.columns[..self.unique_column_count],
                    row,
                ));
            }
        }
        Ok(())
    }

    // --- structural insert ---

    fn insert_entry(&self, session: &mut Session, entry: &Entry) -> Result<()> {
        if let Some(split) = self.insert_into_page(session, self.head, entry, 0)? {
            self.grow_root(session, split)?;
        }
        Ok(())
    }

    fn grow_root(&self, session: &mut Session, split: SplitResult) -> Result<()> {
        let head_page = session.pager_mut().read_page(self.head)?;
        let page_type = head_page.page_type();

        let left_alloc = session
            .pager_mut()
            .allocate_page(self.index_id, page_type)?;
        let left_id = left_alloc.page_id();
        let mut left = head_page.clone();
        left.set_page_id(left_id);
        left.set_parent(self.head);
        session.pager_mut().write_page(&left)?;
        if left.base_type() == PAGE_BTREE_NODE {
            self.reparent_children(session, &left)?;
        }

        let mut right = session.pager_mut().read_page(split.right)?;
        session.pager_mut().log_undo(&right)?;
        right.set_parent(self.head);
        session.pager_mut().write_page(&right)?;

        let header = split_right_header(split.right);
        let entry_cell = node_entry_cell(left_id, &split.pivot);
        let new_root = build_page(
            self.head,
            PAGE_BTREE_NODE,
            ROOT_PARENT,
            self.index_id,
            &header,
            &[entry_cell],
        )?;
        session.pager_mut().log_undo(&head_page)?;
        session.pager_mut().write_page(&new_root)?;
        Ok(())
    }

    fn reparent_children(&self, session: &mut Session, node: &Page) -> Result<()> {
        let n = entry_count(node);
        let parent_id = node.page_id();
        for pos in 0..=n {
            let child_id = node_child_at(node, pos)?;
            let child = session.pager_mut().read_page(child_id)?;
            if child.parent() != parent_id {
                session.pager_mut().log_undo(&child)?;
                let mut updated = child.clone();
                updated.set_parent(parent_id);
                session.pager_mut().write_page(&updated)?;
            }
        }
        Ok(())
    }

    fn insert_into_page(
        &self,
        session: &mut Session,
        page_id: PageId,
        entry: &Entry,
        depth: usize,
    ) -> Result<Option<SplitResult>> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("btree index depth exceeded".into()));
        }
        let page = session.pager_mut().read_page(page_id)?;
        match page.base_type() {
            PAGE_BTREE_LEAF => self.insert_into_leaf(session, page, entry),
            PAGE_BTREE_NODE => self.insert_into_node(session, page, entry, depth),
            _ => Err(OpalError::FileCorrupted {
                page_id,
                field: "page type".into(),
            }),
        }
    }

    fn insert_into_leaf(
        &self,
        session: &mut Session,
        page: Page,
        entry: &Entry,
    ) -> Result<Option<SplitResult>> {
        let page_id = page.page_id();
        let n = entry_count(&page);
        let (pos, found) = self.leaf_lower_bound_entry(session, &page, entry)?;
        if found {
            return Err(OpalError::Internal(format!(
                "duplicate entry for row key {} in index {}",
                entry.key, self.name
            )));
        }

        let mut mode = leaf_mode(&page)?;
        let entry_bytes = encode_entry(entry.key, &entry.values);

        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
        }

        if mode == LEAF_MODE_NORMAL && entry_bytes.len() > MAX_ENTRY_PAYLOAD {
            // The composite is too large to keep inline: flip the whole
            // leaf to only-position. The flip is terminal.
            mode = LEAF_MODE_ONLY_POSITION;
            for cell in cells.iter_mut() {
                let decoded = decode_entry(cell)?;
                *cell = encode_key_only(decoded.key);
            }
        }

        let new_cell = if mode == LEAF_MODE_ONLY_POSITION {
            encode_key_only(entry.key)
        } else {
            entry_bytes
        };
        cells.insert(pos as usize, new_cell);

        let header = [mode];
        if cells_fit(header.len(), &cells) {
            let rebuilt = build_page(
                page_id,
                PAGE_BTREE_LEAF,
                page.parent(),
                self.index_id,
                &header,
                &cells,
            )?;
            session.pager_mut().log_undo(&page)?;
            session.pager_mut().write_page(&rebuilt)?;
            return Ok(None);
        }

        self.split_leaf(session, &page, cells, pos as usize, mode)
    }

    /// Split a leaf, biased toward the insertion index (one-third /
    /// two-thirds, clamped) so monotonic workloads pack pages.
    fn split_leaf(
        &self,
        session: &mut Session,
        page: &Page,
        cells: Vec<Vec<u8>>,
        insert_pos: usize,
        mode: u8,
    ) -> Result<Option<SplitResult>> {
        let total = cells.len();
        let header = [mode];
        let mut split = insert_pos.clamp(total / 3, (total * 2) / 3);
        split = split.clamp(1, total - 1);
        while split > 1 && !cells_fit(header.len(), &cells[..split]) {
            split -= 1;
        }
        while split < total - 1 && !cells_fit(header.len(), &cells[split..]) {
            split += 1;
        }
        if !cells_fit(header.len(), &cells[..split]) || !cells_fit(header.len(), &cells[split..])
        {
            return Err(OpalError::PageOverflow);
        }

        let page_id = page.page_id();
        let right_alloc = session
            .pager_mut()
            .allocate_page(self.index_id, PAGE_BTREE_LEAF)?;
        let right_id = right_alloc.page_id();

        let left = build_page(
            page_id,
            PAGE_BTREE_LEAF,
            page.parent(),
            self.index_id,
            &header,
            &cells[..split],
        )?;
        let right = build_page(
            right_id,
            PAGE_BTREE_LEAF,
            page.parent(),
            self.index_id,
            &header,
            &cells[split..],
        )?;

        session.pager_mut().log_undo(page)?;
        session.pager_mut().write_page(&left)?;
        session.pager_mut().write_page(&right)?;

        // The parent pivot is the right page's first entry, fully encoded
        // even when the leaf stores only positions.
        let pivot = if mode == LEAF_MODE_ONLY_POSITION {
            let first = self.entry_at(session, &right, 0)?;
            encode_entry(first.key, &first.values)
        } else {
            cells[split].clone()
        };

        Ok(Some(SplitResult {
            pivot,
            right: right_id,
        }))
    }

    fn insert_into_node(
        &self,
        session: &mut Session,
        page: Page,
        entry: &Entry,
        depth: usize,
    ) -> Result<Option<SplitResult>> {
        let page_id = page.page_id();
        let pos = self.node_position_entry(&page, entry)?;
        let child_id = node_child_at(&page, pos)?;

        let split = match self.insert_into_page(session, child_id, entry, depth + 1)? {
            None => return Ok(None),
            Some(split) => split,
        };

        let page = session.pager_mut().read_page(page_id)?;
        session.pager_mut().log_undo(&page)?;
        let n = entry_count(&page);
        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
        }

        let mut right_child = node_right_child(&page)?;
        if pos < n {
            let old_cell = cells[pos as usize].clone();
            let old_pivot = &old_cell[8..];
            cells[pos as usize] = node_entry_cell(child_id, &split.pivot);
            cells.insert(
                pos as usize + 1,
                node_entry_cell(split.right, old_pivot),
            );
        } else {
            cells.push(node_entry_cell(child_id, &split.pivot));
            right_child = split.right;
        }

        let header = split_right_header(right_child);
        if cells_fit(header.len(), &cells) {
            let rebuilt = build_page(
                page_id,
                PAGE_BTREE_NODE,
                page.parent(),
                self.index_id,
                &header,
                &cells,
            )?;
            session.pager_mut().write_page(&rebuilt)?;
            let mut right = session.pager_mut().read_page(split.right)?;
            if right.parent() != page_id {
                session.pager_mut().log_undo(&right)?;
                right.set_parent(page_id);
                session.pager_mut().write_page(&right)?;
            }
            return Ok(None);
        }

        self.split_node(session, &page, cells, right_child)
    }

    fn split_node(
        &self,
        session: &mut Session,
        page: &Page,
        cells: Vec<Vec<u8>>,
        pending_right: PageId,
    ) -> Result<Option<SplitResult>> {
        let total = cells.len();
        let split = (total / 2).clamp(1, total - 1);

        // The boundary entry's pivot moves up; its child becomes the left
        // page's rightmost child.
        let boundary = &cells[split - 1];
        let boundary_child = u64::from_le_bytes(boundary[0..8].try_into().unwrap());
        let pivot = boundary[8..].to_vec();

        let page_id = page.page_id();
        let right_alloc = session
            .pager_mut()
            .allocate_page(self.index_id, PAGE_BTREE_NODE)?;
        let right_id = right_alloc.page_id();

        let left = build_page(
            page_id,
            PAGE_BTREE_NODE,
            page.parent(),
            self.index_id,
            &split_right_header(boundary_child),
            &cells[..split - 1],
        )?;
        let right = build_page(
            right_id,
            PAGE_BTREE_NODE,
            page.parent(),
            self.index_id,
            &split_right_header(pending_right),
            &cells[split..],
        )?;

        session.pager_mut().log_undo(page)?;
        session.pager_mut().write_page(&left)?;
        session.pager_mut().write_page(&right)?;
        self.reparent_children(session, &right)?;

        Ok(Some(SplitResult {
            pivot,
            right: right_id,
        }))
    }

    // --- structural delete ---

    fn delete_entry(&self, session: &mut Session, entry: &Entry) -> Result<bool> {
        match self.delete_from_page(session, self.head, entry, 0)? {
            DeleteOutcome::NotFound => Ok(false),
            DeleteOutcome::Deleted { now_empty } => {
                if now_empty {
                    let head_page = session.pager_mut().read_page(self.head)?;
                    let empty = build_page(
                        self.head,
                        PAGE_BTREE_LEAF,
                        ROOT_PARENT,
                        self.index_id,
                        &[LEAF_MODE_NORMAL],
                        &[],
                    )?;
                    session.pager_mut().log_undo(&head_page)?;
                    session.pager_mut().write_page(&empty)?;
                }
                Ok(true)
            }
        }
    }

    fn delete_from_page(
        &self,
        session: &mut Session,
        page_id: PageId,
        entry: &Entry,
        depth: usize,
    ) -> Result<DeleteOutcome> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("btree index depth exceeded".into()));
        }
        let page = session.pager_mut().read_page(page_id)?;
        match page.base_type() {
            PAGE_BTREE_LEAF => {
                let n = entry_count(&page);
                let (pos, found) = self.leaf_lower_bound_entry(session, &page, entry)?;
                if !found {
                    return Ok(DeleteOutcome::NotFound);
                }
                let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize - 1);
                for i in 0..n {
                    if i != pos {
                        cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
                    }
                }
                let now_empty = cells.is_empty();
                if now_empty && page_id != self.head {
                    session.pager_mut().free_page(page_id)?;
                } else {
                    let rebuilt = build_page(
                        page_id,
                        PAGE_BTREE_LEAF,
                        page.parent(),
                        self.index_id,
                        &[leaf_mode(&page)?],
                        &cells,
                    )?;
                    session.pager_mut().log_undo(&page)?;
                    session.pager_mut().write_page(&rebuilt)?;
                }
                Ok(DeleteOutcome::Deleted { now_empty })
            }
            PAGE_BTREE_NODE => {
                let pos = self.node_position_entry(&page, entry)?;
                let child_id = node_child_at(&page, pos)?;
                let outcome = self.delete_from_page(session, child_id, entry, depth + 1)?;
                let child_empty = match outcome {
                    DeleteOutcome::NotFound => return Ok(DeleteOutcome::NotFound),
                    DeleteOutcome::Deleted { now_empty } => now_empty,
                };
                if !child_empty {
                    return Ok(DeleteOutcome::Deleted { now_empty: false });
                }

                // Drop the emptied child. Pivots around it remain valid
                // separators, so only the child slot is removed.
                let page = session.pager_mut().read_page(page_id)?;
                let n = entry_count(&page);
                let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize);
                for i in 0..n {
                    cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
                }
                let mut right_child = node_right_child(&page)?;

                if pos < n {
                    cells.remove(pos as usize);
                } else if n > 0 {
                    let boundary = cells.pop().expect("entries present");
                    right_child = u64::from_le_bytes(boundary[0..8].try_into().unwrap());
                } else {
                    if page_id != self.head {
                        session.pager_mut().free_page(page_id)?;
                    }
                    return Ok(DeleteOutcome::Deleted { now_empty: true });
                }

                let rebuilt = build_page(
                    page_id,
                    PAGE_BTREE_NODE,
                    page.parent(),
                    self.index_id,
                    &split_right_header(right_child),
                    &cells,
                )?;
                session.pager_mut().log_undo(&page)?;
                session.pager_mut().write_page(&rebuilt)?;
                Ok(DeleteOutcome::Deleted { now_empty: false })
            }
            _ => Err(OpalError::FileCorrupted {
                page_id,
                field: "page type".into(),
            }),
        }
    }

    // --- maintenance ---

    fn collect_pages(
        &self,
        session: &mut Session,
        page_id: PageId,
        pages: &mut Vec<PageId>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("btree index depth exceeded".into()));
        }
        pages.push(page_id);
        let page = session.pager_mut().read_page(page_id)?;
        if page.base_type() == PAGE_BTREE_NODE {
            let n = entry_count(&page);
            for pos in 0..=n {
                let child = node_child_at(&page, pos)?;
                self.collect_pages(session, child, pages, depth + 1)?;
            }
        }
        Ok(())
    }

    pub fn truncate_entries(&mut self, session: &mut Session) -> Result<()> {
        let mut pages = Vec::new();
        self.collect_pages(session, self.head, &mut pages, 0)?;
        for page_id in pages {
            if page_id != self.head {
                session.pager_mut().free_page(page_id)?;
            }
        }
        let head_page = session.pager_mut().read_page(self.head)?;
        let empty = build_page(
            self.head,
            PAGE_BTREE_LEAF,
            ROOT_PARENT,
            self.index_id,
            &[LEAF_MODE_NORMAL],
            &[],
        )?;
        session.pager_mut().log_undo(&head_page)?;
        session.pager_mut().write_page(&empty)?;
        self.row_count = 0;
        Ok(())
    }

    /// Free every page including the head (index drop).
    pub fn destroy(mut self, session: &mut Session) -> Result<()> {
        self.truncate_entries(session)?;
        session.pager_mut().free_page(self.head)?;
        Ok(())
    }

    /// Rebuild from the data index after an unclean shutdown.
    pub fn rebuild_from(&mut self, session: &mut Session, data: &DataIndex) -> Result<()> {
        self.truncate_entries(session)?;
        let mut cursor = data.find(session, None, None, false)?;
        while cursor.next(session)? {
            let row = cursor.get().expect("positioned").clone();
            let entry = self.project_entry(&row);
            self.insert_entry(session, &entry)?;
            self.row_count += 1;
        }
        self.needs_rebuild = false;
        Ok(())
    }

    fn entry_cursor(
        &self,
        first: Option<SearchRow>,
        last: Option<SearchRow>,
    ) -> BTreeCursor {
        self.entry_cursor_dir(first, last, false)
    }

    fn entry_cursor_dir(
        &self,
        first: Option<SearchRow>,
        last: Option<SearchRow>,
        reverse: bool,
    ) -> BTreeCursor {
        BTreeCursor {
            index: BTreeCursorIndex {
                head: self.head,
                data_head: self.data_head,
                columns: self.columns.clone(),
                comparator: self.comparator.clone(),
                table_columns: self.table.column_count(),
            },
            first,
            last,
            reverse,
            started: false,
            exhausted: false,
            stack: Vec::new(),
            leaf: 0,
            leaf_pos: 0,
            current: None,
            current_sparse: None,
        }
    }
}

fn split_right_header(right_child: PageId) -> Vec<u8> {
    right_child.to_le_bytes().to_vec()
}

impl Index for BTreeIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        self.index_type
    }

    fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn unique_column_count(&self) -> usize {
        self.unique_column_count
    }

    fn add(&mut self, session: &mut Session, row: &Row) -> Result<()> {
        self.check_unique(session, row)?;
        let entry = self.project_entry(row);
        self.insert_entry(session, &entry)?;
        self.row_count += 1;
        Ok(())
    }

    fn remove(&mut self, session: &mut Session, row: &Row) -> Result<()> {
        let entry = self.project_entry(row);
        if !self.delete_entry(session, &entry)? {
            return Err(row_not_found_error(&self.name, row));
        }
        self.row_count -= 1;
        Ok(())
    }

    fn find(
        &self,
        _session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(self.entry_cursor_dir(
            first.cloned(),
            last.cloned(),
            reverse,
        )))
    }

    fn find_first_or_last(&self, session: &mut Session, first: bool) -> Result<Box<dyn Cursor>> {
        // MIN/MAX lookup: leading NULLs do not participate.
        let mut cursor = self.entry_cursor_dir(None, None, !first);
        while cursor.next(session)? {
            let row = cursor.get().expect("positioned");
            if !row.value(self.columns[0].column).is_null() {
                let row = row.clone();
                return Ok(Box::new(SingletonCursor::new(Some(row))));
            }
        }
        Ok(Box::new(EmptyCursor))
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
            row_count: self.row_count,
            columns: &self.columns,
            selectivity: &self.selectivity,
            unique_column_count: self.unique_column_count,
            sort_order,
            projected: projected_columns,
            kind: CostKind::Secondary,
        })
    }

    fn row_count(&self, session: &mut Session) -> i64 {
        self.row_count + session.row_count_diff(self.index_id)
    }

    fn row_count_approximation(&self) -> i64 {
        self.row_count
    }

    fn truncate(&mut self, session: &mut Session) -> Result<()> {
        self.truncate_entries(session)
    }

    fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    fn can_get_first_or_last(&self) -> bool {
        true
    }

    fn can_find_next(&self) -> bool {
        true
    }
}

/// Immutable parts of the index a cursor needs; keeps the cursor free of
/// lifetimes against the index object.
struct BTreeCursorIndex {
    head: PageId,
    data_head: PageId,
    columns: Vec<IndexColumn>,
    comparator: RowComparator,
    table_columns: usize,
}

impl BTreeCursorIndex {
    fn entry_at(&self, session: &mut Session, page: &Page, idx: u16) -> Result<Entry> {
        let cell = page.cell(idx + 1).ok_or(OpalError::InvalidPage)?;
        if leaf_mode(page)? == LEAF_MODE_ONLY_POSITION {
            let (key, _) = read_varint_key(cell)?;
            let row = DataIndex::lookup_row(session, self.data_head, key)?.ok_or_else(|| {
                OpalError::FileCorrupted {
                    page_id: page.page_id(),
                    field: format!("index entry without base row, key {}", key),
                }
            })?;
            let values = self
                .columns
                .iter()
                .map(|ic| row.value(ic.column).clone())
                .collect();
            Ok(Entry {
                key,
                values,
                full_row: Some(row),
            })
        } else {
            decode_entry(cell)
        }
    }

    fn compare_entry_to_probe(&self, e: &Entry, probe: &SearchRow) -> Ordering {
        for (j, ic) in self.columns.iter().enumerate() {
            match probe.value(ic.column) {
                None => return Ordering::Equal,
                Some(pv) => {
                    let ord = ic.sort.compare(&e.values[j], pv);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
        match probe.key {
            None => Ordering::Equal,
            Some(k) => e.key.cmp(&k),
        }
    }

    fn pseudo_row(&self, entry: &Entry) -> Row {
        let mut values = vec![crate::types::Value::Null; self.table_columns];
        for (j, ic) in self.columns.iter().enumerate() {
            values[ic.column] = entry.values[j].clone();
        }
        Row::new(entry.key, values)
    }
}

/// Pull-based cursor over the secondary tree: an explicit stack of
/// (page id, child position) frames plus the current leaf position. Rows
/// are resolved through the data index as the cursor advances.
pub struct BTreeCursor {
    index: BTreeCursorIndex,
    first: Option<SearchRow>,
    last: Option<SearchRow>,
    reverse: bool,
    started: bool,
    exhausted: bool,
    stack: Vec<(PageId, u16)>,
    leaf: PageId,
    leaf_pos: i64,
    current: Option<Row>,
    current_sparse: Option<SearchRow>,
}

impl BTreeCursor {
    fn node_bound(&self, page: &Page) -> Result<u16> {
        let n = entry_count(page);
        let probe = if self.reverse {
            self.last.as_ref()
        } else {
            self.first.as_ref()
        };
        let probe = match probe {
            None => return Ok(if self.reverse { n } else { 0 }),
            Some(p) => p,
        };
        let mut lo = 0u16;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let pivot = node_pivot(page, mid)?;
            let ord = self.index.compare_entry_to_probe(&pivot, probe);
            let descend_right = if self.reverse {
                ord != Ordering::Greater
            } else {
                ord == Ordering::Less
            };
            if descend_right {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn leaf_bound(&self, session: &mut Session, page: &Page) -> Result<i64> {
        let n = entry_count(page);
        let probe = if self.reverse {
            self.last.as_ref()
        } else {
            self.first.as_ref()
        };
        let probe = match probe {
            None => {
                return Ok(if self.reverse { n as i64 - 1 } else { 0 });
            }
            Some(p) => p,
        };
        let mut lo = 0u16;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let e = self.index.entry_at(session, page, mid)?;
            let ord = self.index.compare_entry_to_probe(&e, probe);
            let keep_right = if self.reverse {
                ord != Ordering::Greater
            } else {
                ord == Ordering::Less
            };
            if keep_right {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(if self.reverse { lo as i64 - 1 } else { lo as i64 })
    }

    fn position(&mut self, session: &mut Session) -> Result<()> {
        let mut page_id = self.index.head;
        for _ in 0..MAX_TREE_DEPTH {
            let page = session.pager_mut().read_page(page_id)?;
            match page.base_type() {
                PAGE_BTREE_LEAF => {
                    self.leaf = page_id;
                    self.leaf_pos = self.leaf_bound(session, &page)?;
                    return Ok(());
                }
                PAGE_BTREE_NODE => {
                    let pos = self.node_bound(&page)?;
                    self.stack.push((page_id, pos));
                    page_id = node_child_at(&page, pos)?;
                }
                _ => {
                    return Err(OpalError::FileCorrupted {
                        page_id,
                        field: "page type".into(),
                    })
                }
            }
        }
        Err(OpalError::Corruption("btree index depth exceeded".into()))
    }

    fn advance_leaf(&mut self, session: &mut Session) -> Result<bool> {
        while let Some((page_id, pos)) = self.stack.pop() {
            let page = session.pager_mut().read_page(page_id)?;
            let n = entry_count(&page);
            let next = if self.reverse {
                if pos == 0 {
                    continue;
                }
                pos - 1
            } else {
                if pos >= n {
                    continue;
                }
                pos + 1
            };
            self.stack.push((page_id, next));

            let mut child = node_child_at(&page, next)?;
            for _ in 0..MAX_TREE_DEPTH {
                let cpage = session.pager_mut().read_page(child)?;
                match cpage.base_type() {
                    PAGE_BTREE_LEAF => {
                        self.leaf = child;
                        self.leaf_pos = if self.reverse {
                            entry_count(&cpage) as i64 - 1
                        } else {
                            0
                        };
                        return Ok(true);
                    }
                    PAGE_BTREE_NODE => {
                        let cn = entry_count(&cpage);
                        let cpos = if self.reverse { cn } else { 0 };
                        self.stack.push((child, cpos));
                        child = node_child_at(&cpage, cpos)?;
                    }
                    _ => {
                        return Err(OpalError::FileCorrupted {
                            page_id: child,
                            field: "page type".into(),
                        })
                    }
                }
            }
            return Err(OpalError::Corruption("btree index depth exceeded".into()));
        }
        Ok(false)
    }
}

impl Cursor for BTreeCursor {
    fn next(&mut self, session: &mut Session) -> Result<bool> {
        session.check_cancelled()?;
        if self.exhausted {
            return Ok(false);
        }
        if !self.started {
            self.position(session)?;
            self.started = true;
        } else {
            self.leaf_pos += if self.reverse { -1 } else { 1 };
        }

        loop {
            let page = session.pager_mut().read_page(self.leaf)?;
            let n = entry_count(&page) as i64;
            // Delete frees leaves the moment they empty, so an empty
            // non-root leaf can only be corruption.
            if n == 0 && self.leaf != self.index.head {
                return Err(OpalError::FileCorrupted {
                    page_id: self.leaf,
                    field: "empty non-root leaf".into(),
                });
            }
            if self.leaf_pos >= 0 && self.leaf_pos < n {
                let entry = self.index.entry_at(session, &page, self.leaf_pos as u16)?;
                let pseudo = self.index.pseudo_row(&entry);
                match check_bounds(
                    &self.index.comparator,
                    &pseudo,
                    self.first.as_ref(),
                    self.last.as_ref(),
                    self.reverse,
                ) {
                    BoundsCheck::Within => {
                        let row = match entry.full_row {
                            Some(row) => row,
                            None => DataIndex::lookup_row(session, self.index.data_head, entry.key)?
                                .ok_or_else(|| OpalError::FileCorrupted {
                                    page_id: self.leaf,
                                    field: format!(
                                        "index entry without base row, key {}",
                                        entry.key
                                    ),
                                })?,
                        };
                        self.current_sparse = Some(pseudo.to_search_row());
                        self.current = Some(row);
                        return Ok(true);
                    }
                    BoundsCheck::Skip => {
                        self.leaf_pos += if self.reverse { -1 } else { 1 };
                        continue;
                    }
                    BoundsCheck::Exhausted => {
                        self.exhausted = true;
                        self.current = None;
                        self.current_sparse = None;
                        return Ok(false);
                    }
                }
            }
            if !self.advance_leaf(session)? {
                self.exhausted = true;
                self.current = None;
                self.current_sparse = None;
                return Ok(false);
            }
        }
    }

    fn get(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    fn get_search_row(&self) -> Option<SearchRow> {
        self.current_sparse.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::column::ColumnDef;
    use crate::storage::pager::{Options, Pager};
    use crate::types::{DataType, Value};
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

    struct Fixture {
        session: Session,
        data: DataIndex,
        _dir: TempDir,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), Options::default()).unwrap();
        let mut session = Session::new(pager);
        let data = DataIndex::create(&mut session, 1, "t.scan", table()).unwrap();
        Fixture {
            session,
            data,
            _dir: dir,
        }
    }

    fn unique_on_a(fx: &mut Fixture) -> BTreeIndex {
        BTreeIndex::create(
            &mut fx.session,
            2,
            "t.a_idx",
            table(),
            vec![IndexColumn::asc(0)],
            1,
            NullsDistinct::Distinct,
            false,
            fx.data.head_page(),
        )
        .unwrap()
    }

    fn insert(fx: &mut Fixture, index: &mut BTreeIndex, a: Value, b: &str) -> Result<i64> {
        let key = fx
            .data
            .add_row(&mut fx.session, &Row::new(0, vec![a.clone(), Value::Text(b.into())]))?;
        let row = Row::new(key, vec![a, Value::Text(b.into())]);
        match index.add(&mut fx.session, &row) {
            Ok(()) => Ok(key),
            Err(e) => {
                fx.data.remove_key(&mut fx.session, key)?;
                Err(e)
            }
        }
    }

    fn collect_a(index: &BTreeIndex, session: &mut Session, reverse: bool) -> Vec<Option<i64>> {
        let mut cursor = index.find(session, None, None, reverse).unwrap();
        let mut out = Vec::new();
        while cursor.next(session).unwrap() {
            out.push(cursor.get().unwrap().value(0).as_i64());
        }
        out
    }

    #[test]
    fn test_ordered_scan_and_range() {
        let mut fx = setup();
        let mut index = unique_on_a(&mut fx);
        for a in [5, 1, 4, 2, 3] {
            insert(&mut fx, &mut index, Value::Int(a), "v").unwrap();
        }
        assert_eq!(
            collect_a(&index, &mut fx.session, false),
            vec![Some(1), Some(2), Some(3), Some(4), Some(5)]
        );
        assert_eq!(
            collect_a(&index, &mut fx.session, true),
            vec![Some(5), Some(4), Some(3), Some(2), Some(1)]
        );

        let mut first = SearchRow::with_columns(2);
        first.set_value(0, Value::Int(2));
        let mut last = SearchRow::with_columns(2);
        last.set_value(0, Value::Int(4));
        let mut cursor = fx_find(&index, &mut fx.session, Some(&first), Some(&last));
        let mut seen = Vec::new();
        while cursor.next(&mut fx.session).unwrap() {
            seen.push(cursor.get().unwrap().value(0).as_i64().unwrap());
        }
        assert_eq!(seen, vec![2, 3, 4]);
    }

    fn fx_find(
        index: &BTreeIndex,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
    ) -> Box<dyn Cursor> {
        index.find(session, first, last, false).unwrap()
    }

    #[test]
    fn test_duplicate_key() {
        let mut fx = setup();
        let mut index = unique_on_a(&mut fx);
        insert(&mut fx, &mut index, Value::Int(2), "first").unwrap();
        match insert(&mut fx, &mut index, Value::Int(2), "second") {
            Err(OpalError::DuplicateKey { index: name, key }) => {
                assert_eq!(name, "t.a_idx");
                assert_eq!(key, "(2)");
            }
            other => panic!("expected DuplicateKey, got {:?}", other),
        }
    }

    #[test]
    fn test_nulls_distinct() {
        let mut fx = setup();
        let mut index = unique_on_a(&mut fx);
        // DISTINCT: any number of NULLs coexist.
        insert(&mut fx, &mut index, Value::Null, "n1").unwrap();
        insert(&mut fx, &mut index, Value::Null, "n2").unwrap();
        insert(&mut fx, &mut index, Value::Null, "n3").unwrap();
        insert(&mut fx, &mut index, Value::Int(1), "v1").unwrap();
        assert!(insert(&mut fx, &mut index, Value::Int(1), "v2").is_err());
        assert_eq!(index.row_count_approximation(), 4);
    }

    #[test]
    fn test_not_distinct_nulls_collide() {
        let mut fx = setup();
        let mut index = BTreeIndex::create(
            &mut fx.session,
            2,
            "t.a_nd",
            table(),
            vec![IndexColumn::asc(0)],
            1,
            NullsDistinct::NotDistinct,
            false,
            fx.data.head_page(),
        )
        .unwrap();
        insert(&mut fx, &mut index, Value::Null, "n1").unwrap();
        assert!(insert(&mut fx, &mut index, Value::Null, "n2").is_err());
    }

    #[test]
    fn test_descending_order() {
        let mut fx = setup();
        let mut index = BTreeIndex::create(
            &mut fx.session,
            2,
            "t.a_desc",
            table(),
            vec![IndexColumn::desc(0)],
            0,
            NullsDistinct::Distinct,
            false,
            fx.data.head_page(),
        )
        .unwrap();
        for a in [1, 3, 2] {
            insert(&mut fx, &mut index, Value::Int(a), "v").unwrap();
        }
        assert_eq!(
            collect_a(&index, &mut fx.session, false),
            vec![Some(3), Some(2), Some(1)]
        );
    }

    #[test]
    fn test_non_unique_duplicates_and_remove() {
        let mut fx = setup();
        let mut index = BTreeIndex::create(
            &mut fx.session,
            2,
            "t.a_multi",
            table(),
            vec![IndexColumn::asc(0)],
            0,
            NullsDistinct::Distinct,
            false,
            fx.data.head_page(),
        )
        .unwrap();
        let k1 = insert(&mut fx, &mut index, Value::Int(7), "x").unwrap();
        let _k2 = insert(&mut fx, &mut index, Value::Int(7), "y").unwrap();
        assert_eq!(index.row_count_approximation(), 2);

        let row = fx.data.get_row(&mut fx.session, k1).unwrap().unwrap();
        index.remove(&mut fx.session, &row).unwrap();
        assert_eq!(index.row_count_approximation(), 1);

        // Removing again reports row-not-found.
        match index.remove(&mut fx.session, &row) {
            Err(OpalError::RowNotFound { .. }) => {}
            other => panic!("expected RowNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_many_rows_split_ordering() {
        let mut fx = setup();
        let mut index = BTreeIndex::create(
            &mut fx.session,
            2,
            "t.a_many",
            table(),
            vec![IndexColumn::asc(0)],
            0,
            NullsDistinct::Distinct,
            false,
            fx.data.head_page(),
        )
        .unwrap();
        // Insert in a scrambled deterministic order.
        for i in 0..400 {
            let a = (i * 37) % 400;
            insert(&mut fx, &mut index, Value::Int(a), "v").unwrap();
        }
        let seen = collect_a(&index, &mut fx.session, false);
        assert_eq!(seen.len(), 400);
        for w in seen.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn test_only_position_flip() {
        let mut fx = setup();
        let mut index = BTreeIndex::create(
            &mut fx.session,
            2,
            "t.b_idx",
            table(),
            vec![IndexColumn::asc(1)],
            0,
            NullsDistinct::Distinct,
            false,
            fx.data.head_page(),
        )
        .unwrap();
        // A composite far beyond the inline entry limit forces the leaf
        // into only-position mode.
        let huge = "z".repeat(2000);
        insert(&mut fx, &mut index, Value::Int(1), &huge).unwrap();
        insert(&mut fx, &mut index, Value::Int(2), "aaa").unwrap();
        insert(&mut fx, &mut index, Value::Int(3), "mmm").unwrap();

        let head = fx.session.pager_mut().read_page(index.head_page()).unwrap();
        assert_eq!(leaf_mode(&head).unwrap(), LEAF_MODE_ONLY_POSITION);

        // Order is still by the indexed column, re-fetched from the data
        // index.
        let mut cursor = index.find(&mut fx.session, None, None, false).unwrap();
        let mut seen = Vec::new();
        while cursor.next(&mut fx.session).unwrap() {
            seen.push(cursor.get().unwrap().value(1).as_str().unwrap().to_string());
        }
        assert_eq!(seen[0], "aaa");
        assert_eq!(seen[1], "mmm");
        assert_eq!(seen[2].len(), 2000);
    }

    #[test]
    fn test_rebuild_from_data() {
        let mut fx = setup();
        let mut index = unique_on_a(&mut fx);
        for a in [3, 1, 2] {
            insert(&mut fx, &mut index, Value::Int(a), "v").unwrap();
        }
        // Wreck and rebuild.
        index.truncate_entries(&mut fx.session).unwrap();
        assert_eq!(index.row_count_approximation(), 0);
        let data = std::mem::replace(
            &mut fx.data,
            DataIndex::create(&mut fx.session, 9, "tmp", table()).unwrap(),
        );
        index.rebuild_from(&mut fx.session, &data).unwrap();
        assert_eq!(index.row_count_approximation(), 3);
        assert_eq!(
            collect_a(&index, &mut fx.session, false),
            vec![Some(1), Some(2), Some(3)]
        );
    }
}
