//! The data index: a persistent B+-tree keyed by the engine-assigned row
//! key, carrying full rows in its leaves. One instance per table; also the
//! table-scan access path.
//!
//! Page layout (on slotted pages):
//!
//! Data node (`PAGE_DATA_NODE`): header cell 0 is
//! `[right_child: u64][subtree row count: i64, -1 = unknown]`; entry cells
//! are `[child: u64][pivot: varint key]` where the pivot equals the largest
//! key in the child. A node with n entries has n+1 children.
//!
//! Data leaf (`PAGE_DATA_LEAF`): header cell 0 is empty; entry cells are
//! `[flag: u8][key: varint][payload]`. Flag 0 stores the serialized row
//! inline; flag 1 stores `[overflow head: u64][total len: u32]` and the row
//! lives in a chain of overflow pages.
//!
//! The head page never moves: a root split pushes both halves down into
//! fresh children and rewrites the head in place, so handles to the index
//! stay valid across arbitrary mutations.

use crate::error::{OpalError, Result};
use crate::index::cost::{cost_range_index, CostKind, CostParams};
use crate::index::cursor::{Cursor, EmptyCursor, SingletonCursor};
use crate::index::{
    row_not_found_error, BoundsCheck, Index, IndexType, RowComparator,
};
use crate::row::{
    deserialize_values, read_varint_key, serialize_values, write_varint_key, Row, SearchRow,
};
use crate::schema::column::IndexColumn;
use crate::schema::table::TableDef;
use crate::session::Session;
use crate::storage::page::{
    Page, PageId, FLAG_LAST, PAGE_DATA_LEAF, PAGE_DATA_NODE, PAGE_DATA_OVERFLOW,
    PAGE_DATA_OVERFLOW_LAST, PAGE_HEADER_SIZE, PAGE_SIZE, ROOT_PARENT,
};

/// Subtree row count sentinel: not currently known.
pub const ROW_COUNT_UNKNOWN: i64 = -1;

/// Rows whose serialized payload exceeds this move to an overflow chain.
const MAX_INLINE_PAYLOAD: usize = 1000;

/// Payload bytes per overflow page.
const OVERFLOW_CHUNK: usize = 4000;

/// Maximum tree depth guard against corrupted parent/child cycles.
pub(crate) const MAX_TREE_DEPTH: usize = 64;

// --- header cell and entry codecs ---

fn node_header_cell(right_child: PageId, row_count: i64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&right_child.to_le_bytes());
    buf[8..16].copy_from_slice(&row_count.to_le_bytes());
    buf
}

fn node_right_child(page: &Page) -> Result<PageId> {
    let cell = page.cell(0).ok_or(OpalError::InvalidPage)?;
    if cell.len() < 16 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "node header".into(),
        });
    }
    Ok(u64::from_le_bytes(cell[0..8].try_into().unwrap()))
}

fn node_row_count(page: &Page) -> Result<i64> {
    let cell = page.cell(0).ok_or(OpalError::InvalidPage)?;
    if cell.len() < 16 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "node header".into(),
        });
    }
    Ok(i64::from_le_bytes(cell[8..16].try_into().unwrap()))
}

fn set_node_header(page: &mut Page, right_child: PageId, row_count: i64) {
    if let Some((offset, len)) = page.cell_offset_and_len(0) {
        debug_assert!(len >= 16);
        page.data[offset..offset + 8].copy_from_slice(&right_child.to_le_bytes());
        page.data[offset + 8..offset + 16].copy_from_slice(&row_count.to_le_bytes());
    }
}

/// Number of key-bearing entries (excluding the header cell at index 0).
fn entry_count(page: &Page) -> u16 {
    page.cell_count().saturating_sub(1)
}

fn node_entry_cell(child: PageId, pivot: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18);
    buf.extend_from_slice(&child.to_le_bytes());
    write_varint_key(&mut buf, pivot);
    buf
}

fn node_entry(page: &Page, idx: u16) -> Result<(PageId, i64)> {
    let cell = page.cell(idx + 1).ok_or(OpalError::InvalidPage)?;
    if cell.len() < 9 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "node entry".into(),
        });
    }
    let child = u64::from_le_bytes(cell[0..8].try_into().unwrap());
    let (pivot, _) = read_varint_key(&cell[8..])?;
    Ok((child, pivot))
}

/// Child at position `pos` in 0..=n; position n is the rightmost child.
fn node_child_at(page: &Page, pos: u16) -> Result<PageId> {
    let n = entry_count(page);
    let child = if pos < n {
        node_entry(page, pos)?.0
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

/// Smallest position whose pivot is >= key; n when the key belongs under
/// the rightmost child.
fn node_position_of(page: &Page, key: i64) -> Result<u16> {
    let n = entry_count(page);
    let mut lo = 0u16;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let (_, pivot) = node_entry(page, mid)?;
        if pivot >= key {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

const LEAF_INLINE: u8 = 0;
const LEAF_OVERFLOW: u8 = 1;

fn leaf_entry_cell_inline(key: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11 + payload.len());
    buf.push(LEAF_INLINE);
    write_varint_key(&mut buf, key);
    buf.extend_from_slice(payload);
    buf
}

fn leaf_entry_cell_overflow(key: i64, overflow_head: PageId, total_len: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(23);
    buf.push(LEAF_OVERFLOW);
    write_varint_key(&mut buf, key);
    buf.extend_from_slice(&overflow_head.to_le_bytes());
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf
}

fn leaf_entry_key(page: &Page, idx: u16) -> Result<i64> {
    let cell = page.cell(idx + 1).ok_or(OpalError::InvalidPage)?;
    if cell.len() < 2 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "leaf entry".into(),
        });
    }
    let (key, _) = read_varint_key(&cell[1..])?;
    Ok(key)
}

/// Overflow chain reference of a leaf entry, if it has one.
fn leaf_entry_overflow(page: &Page, idx: u16) -> Result<Option<PageId>> {
    let cell = page.cell(idx + 1).ok_or(OpalError::InvalidPage)?;
    if cell[0] != LEAF_OVERFLOW {
        return Ok(None);
    }
    let (_, used) = read_varint_key(&cell[1..])?;
    let rest = &cell[1 + used..];
    if rest.len() < 12 {
        return Err(OpalError::FileCorrupted {
            page_id: page.page_id(),
            field: "overflow reference".into(),
        });
    }
    Ok(Some(u64::from_le_bytes(rest[0..8].try_into().unwrap())))
}

/// Smallest position whose key is >= the given key, plus whether the exact
/// key was found.
fn leaf_position_of(page: &Page, key: i64) -> Result<(u16, bool)> {
    let n = entry_count(page);
    let mut lo = 0u16;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let k = leaf_entry_key(page, mid)?;
        if k >= key {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let found = lo < n && leaf_entry_key(page, lo)? == key;
    Ok((lo, found))
}

// --- overflow chains ---

fn write_overflow_chain(
    session: &mut Session,
    index_id: u32,
    data: &[u8],
) -> Result<PageId> {
    let chunks: Vec<&[u8]> = data.chunks(OVERFLOW_CHUNK).collect();
    debug_assert!(!chunks.is_empty());

    // Allocate the whole chain first so each page can point at the next.
    let mut pages = Vec::with_capacity(chunks.len());
    for (i, _) in chunks.iter().enumerate() {
        let page_type = if i + 1 == chunks.len() {
            PAGE_DATA_OVERFLOW_LAST
        } else {
            PAGE_DATA_OVERFLOW
        };
        pages.push(session.pager_mut().allocate_page(index_id, page_type)?);
    }
    let next_ids: Vec<PageId> = pages
        .iter()
        .skip(1)
        .map(|p| p.page_id())
        .chain(std::iter::once(0))
        .collect();

    let head = pages[0].page_id();
    for ((mut page, chunk), next) in pages.into_iter().zip(chunks).zip(next_ids) {
        page.insert_cell(&next.to_le_bytes())?;
        page.insert_cell(chunk)?;
        session.pager_mut().write_page(&page)?;
    }
    Ok(head)
}

fn read_overflow_chain(session: &mut Session, head: PageId) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut page_id = head;
    // A chain longer than the page count is a cycle.
    for _ in 0..session.pager().page_count() {
        let page = session.pager_mut().read_page(page_id)?;
        if page.base_type() != PAGE_DATA_OVERFLOW {
            return Err(OpalError::FileCorrupted {
                page_id,
                field: "overflow page type".into(),
            });
        }
        let chunk = page.cell(1).ok_or(OpalError::FileCorrupted {
            page_id,
            field: "overflow chunk".into(),
        })?;
        data.extend_from_slice(chunk);
        if page.page_type() & FLAG_LAST != 0 {
            return Ok(data);
        }
        let next_cell = page.cell(0).ok_or(OpalError::InvalidPage)?;
        page_id = u64::from_le_bytes(next_cell[0..8].try_into().unwrap());
        if page_id == 0 {
            return Err(OpalError::FileCorrupted {
                page_id: page.page_id(),
                field: "overflow chain terminator".into(),
            });
        }
    }
    Err(OpalError::Corruption("overflow chain cycle".into()))
}

fn free_overflow_chain(session: &mut Session, head: PageId) -> Result<()> {
    let mut page_id = head;
    loop {
        let page = session.pager_mut().read_page(page_id)?;
        let last = page.page_type() & FLAG_LAST != 0;
        let next = page
            .cell(0)
            .map(|c| u64::from_le_bytes(c[0..8].try_into().unwrap()))
            .unwrap_or(0);
        session.pager_mut().free_page(page_id)?;
        if last || next == 0 {
            return Ok(());
        }
        page_id = next;
    }
}

/// Decode the full row of a leaf entry, following the overflow chain when
/// needed.
fn leaf_entry_row(session: &mut Session, page: &Page, idx: u16) -> Result<Row> {
    let cell = page.cell(idx + 1).ok_or(OpalError::InvalidPage)?;
    let flag = cell[0];
    let (key, used) = read_varint_key(&cell[1..])?;
    let rest = &cell[1 + used..];
    let values = match flag {
        LEAF_INLINE => deserialize_values(rest)?.0,
        LEAF_OVERFLOW => {
            if rest.len() < 12 {
                return Err(OpalError::FileCorrupted {
                    page_id: page.page_id(),
                    field: "overflow reference".into(),
                });
            }
            let head = u64::from_le_bytes(rest[0..8].try_into().unwrap());
            let total = u32::from_le_bytes(rest[8..12].try_into().unwrap()) as usize;
            let data = read_overflow_chain(session, head)?;
            if data.len() < total {
                return Err(OpalError::FileCorrupted {
                    page_id: head,
                    field: "overflow length".into(),
                });
            }
            deserialize_values(&data[..total])?.0
        }
        _ => {
            return Err(OpalError::FileCorrupted {
                page_id: page.page_id(),
                field: "leaf entry flag".into(),
            })
        }
    };
    Ok(Row::new(key, values))
}

// --- page building ---

pub(crate) fn build_page(
    page_id: PageId,
    page_type: u8,
    parent: PageId,
    index_id: u32,
    header_cell: &[u8],
    cells: &[Vec<u8>],
) -> Result<Page> {
    let mut page = Page::new(page_id, page_type);
    page.set_parent(parent);
    page.set_index_id(index_id);
    page.insert_cell(header_cell)?;
    for cell in cells {
        page.insert_cell(cell)?;
    }
    Ok(page)
}

/// Whether a set of cells fits one page alongside a header cell.
pub(crate) fn cells_fit(header_cell_len: usize, cells: &[Vec<u8>]) -> bool {
    let mut used = PAGE_HEADER_SIZE + 4 + header_cell_len;
    for cell in cells {
        used += 4 + cell.len();
    }
    used <= PAGE_SIZE
}

struct SplitResult {
    /// Largest key remaining in the left (original) page.
    pivot: i64,
    right: PageId,
}

enum DeleteOutcome {
    NotFound,
    Deleted {
        /// The page ran empty (or childless) and the parent must drop it.
        now_empty: bool,
        /// The subtree's largest key changed; the parent pivot is stale.
        new_max: Option<i64>,
    },
}

/// The data index handle. All tree state lives in pages; this struct only
/// caches the head page id, the key high-water mark and the row count.
pub struct DataIndex {
    index_id: u32,
    name: String,
    table: TableDef,
    head: PageId,
    last_key: i64,
    row_count: i64,
    needs_rebuild: bool,
    comparator: RowComparator,
}

impl DataIndex {
    /// Create a new data index with an empty root leaf at a fresh head
    /// page.
    pub fn create(
        session: &mut Session,
        index_id: u32,
        name: &str,
        table: TableDef,
    ) -> Result<Self> {
        let page = session
            .pager_mut()
            .allocate_page(index_id, PAGE_DATA_LEAF)?;
        let head = page.page_id();
        let leaf = build_page(head, PAGE_DATA_LEAF, ROOT_PARENT, index_id, &[], &[])?;
        session.pager_mut().write_page(&leaf)?;
        Ok(DataIndex {
            index_id,
            name: name.to_string(),
            table,
            head,
            last_key: 0,
            row_count: 0,
            needs_rebuild: false,
            comparator: RowComparator::default(),
        })
    }

    /// Open an existing data index at its head page, recomputing the key
    /// high-water mark and row count from the tree.
    pub fn open(
        session: &mut Session,
        index_id: u32,
        name: &str,
        table: TableDef,
        head: PageId,
    ) -> Result<Self> {
        let needs_rebuild = session.pager().needs_rebuild();
        let mut index = DataIndex {
            index_id,
            name: name.to_string(),
            table,
            head,
            last_key: 0,
            row_count: 0,
            needs_rebuild,
            comparator: RowComparator::default(),
        };
        index.refresh(session)?;
        Ok(index)
    }

    pub fn head_page(&self) -> PageId {
        self.head
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    pub fn last_key(&self) -> i64 {
        self.last_key
    }

    /// Recompute row count and last key from the tree (after open or
    /// rollback).
    pub fn refresh(&mut self, session: &mut Session) -> Result<()> {
        self.row_count = self.compute_row_count(session, self.head, 0)?;
        self.last_key = self.find_max_key(session)?;
        Ok(())
    }

    fn find_max_key(&self, session: &mut Session) -> Result<i64> {
        let mut page_id = self.head;
        for _ in 0..MAX_TREE_DEPTH {
            let page = session.pager_mut().read_page(page_id)?;
            match page.base_type() {
                PAGE_DATA_LEAF => {
                    let n = entry_count(&page);
                    return if n == 0 {
                        Ok(0)
                    } else {
                        leaf_entry_key(&page, n - 1)
                    };
                }
                PAGE_DATA_NODE => {
                    page_id = node_right_child(&page)?;
                }
                _ => {
                    return Err(OpalError::FileCorrupted {
                        page_id,
                        field: "page type".into(),
                    })
                }
            }
        }
        Err(OpalError::Corruption("data index depth exceeded".into()))
    }

    fn compute_row_count(
        &self,
        session: &mut Session,
        page_id: PageId,
        depth: usize,
    ) -> Result<i64> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("data index depth exceeded".into()));
        }
        let page = session.pager_mut().read_page(page_id)?;
        match page.base_type() {
            PAGE_DATA_LEAF => Ok(entry_count(&page) as i64),
            PAGE_DATA_NODE => {
                let stored = node_row_count(&page)?;
                if stored != ROW_COUNT_UNKNOWN {
                    return Ok(stored);
                }
                let n = entry_count(&page);
                let mut total = 0i64;
                for i in 0..n {
                    let (child, _) = node_entry(&page, i)?;
                    total += self.compute_row_count(session, child, depth + 1)?;
                }
                total +=
                    self.compute_row_count(session, node_right_child(&page)?, depth + 1)?;
                // Cache the recomputed count in the node header.
                let mut updated = page.clone();
                session.pager_mut().log_undo(&page)?;
                set_node_header(&mut updated, node_right_child(&page)?, total);
                session.pager_mut().write_page(&updated)?;
                Ok(total)
            }
            _ => Err(OpalError::FileCorrupted {
                page_id,
                field: "page type".into(),
            }),
        }
    }

    /// Insert a row, minting its key when presented as 0. Returns the key
    /// under which the row was stored. This is the only place row keys are
    /// assigned.
    pub fn add_row(&mut self, session: &mut Session, row: &Row) -> Result<i64> {
        let key = if row.key == 0 {
            self.last_key += 1;
            self.last_key
        } else {
            self.last_key = self.last_key.max(row.key + 1);
            row.key
        };

        let payload = serialize_values(&row.values);
        let cell = if payload.len() > MAX_INLINE_PAYLOAD {
            let head = write_overflow_chain(session, self.index_id, &payload)?;
            leaf_entry_cell_overflow(key, head, payload.len() as u32)
        } else {
            leaf_entry_cell_inline(key, &payload)
        };

        if let Some(split) = self.insert_into_page(session, self.head, key, &cell, 0)? {
            self.grow_root(session, split)?;
        }
        self.row_count += 1;
        Ok(key)
    }

    /// A root split: both halves move into fresh children and the head is
    /// rewritten in place as a node, so the head page id never changes.
    fn grow_root(&self, session: &mut Session, split: SplitResult) -> Result<()> {
        let head_page = session.pager_mut().read_page(self.head)?;
        let page_type = head_page.page_type();

        // Move the left half out of the head.
        let left_alloc = session.pager_mut().allocate_page(self.index_id, page_type)?;
        let left_id = left_alloc.page_id();
        let mut left = head_page.clone();
        left.set_page_id(left_id);
        left.set_parent(self.head);
        session.pager_mut().write_page(&left)?;
        if left.base_type() == PAGE_DATA_NODE {
            self.reparent_children(session, &left)?;
        }

        let mut right = session.pager_mut().read_page(split.right)?;
        session.pager_mut().log_undo(&right)?;
        right.set_parent(self.head);
        session.pager_mut().write_page(&right)?;

        let header = node_header_cell(split.right, ROW_COUNT_UNKNOWN);
        let entry = node_entry_cell(left_id, split.pivot);
        let new_root = build_page(
            self.head,
            PAGE_DATA_NODE,
            ROOT_PARENT,
            self.index_id,
            &header,
            &[entry],
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
        key: i64,
        cell: &[u8],
        depth: usize,
    ) -> Result<Option<SplitResult>> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("data index depth exceeded".into()));
        }
        let page = session.pager_mut().read_page(page_id)?;
        match page.base_type() {
            PAGE_DATA_LEAF => self.insert_into_leaf(session, page, key, cell),
            PAGE_DATA_NODE => self.insert_into_node(session, page, key, cell, depth),
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
        key: i64,
        cell: &[u8],
    ) -> Result<Option<SplitResult>> {
        let page_id = page.page_id();
        let n = entry_count(&page);
        let (pos, found) = leaf_position_of(&page, key)?;
        if found {
            return Err(OpalError::Internal(format!(
                "duplicate row key {} in data index {}",
                key, self.name
            )));
        }

        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
        }
        cells.insert(pos as usize, cell.to_vec());

        if cells_fit(0, &cells) {
            let rebuilt = build_page(
                page_id,
                PAGE_DATA_LEAF,
                page.parent(),
                self.index_id,
                &[],
                &cells,
            )?;
            session.pager_mut().log_undo(&page)?;
            session.pager_mut().write_page(&rebuilt)?;
            return Ok(None);
        }

        self.split_page(session, &page, cells, pos as usize, 0)
    }

    /// Split a page whose rebuilt cell list no longer fits. The split point
    /// is biased toward the insertion index (one-third / two-thirds,
    /// clamped) so monotonic workloads pack pages.
    fn split_page(
        &self,
        session: &mut Session,
        page: &Page,
        cells: Vec<Vec<u8>>,
        insert_pos: usize,
        header_len: usize,
    ) -> Result<Option<SplitResult>> {
        let total = cells.len();
        debug_assert!(total >= 2);
        let mut split = insert_pos.clamp(total / 3, (total * 2) / 3);
        split = split.clamp(1, total - 1);
        // Both halves must fit their pages.
        while split > 1 && !cells_fit(header_len, &cells[..split]) {
            split -= 1;
        }
        while split < total - 1 && !cells_fit(header_len, &cells[split..]) {
            split += 1;
        }
        if !cells_fit(header_len, &cells[..split]) || !cells_fit(header_len, &cells[split..]) {
            return Err(OpalError::PageOverflow);
        }

        let is_leaf = page.base_type() == PAGE_DATA_LEAF;
        let page_id = page.page_id();

        let right_alloc = session
            .pager_mut()
            .allocate_page(self.index_id, page.page_type())?;
        let right_id = right_alloc.page_id();

        let (left_page, right_page, pivot) = if is_leaf {
            let left = build_page(
                page_id,
                PAGE_DATA_LEAF,
                page.parent(),
                self.index_id,
                &[],
                &cells[..split],
            )?;
            let right = build_page(
                right_id,
                PAGE_DATA_LEAF,
                page.parent(),
                self.index_id,
                &[],
                &cells[split..],
            )?;
            let pivot = leaf_entry_key(&left, (split - 1) as u16)?;
            (left, right, pivot)
        } else {
            // Node split: the boundary entry's pivot moves up; its child
            // becomes the left page's rightmost child.
            let boundary = &cells[split - 1];
            let boundary_child = u64::from_le_bytes(boundary[0..8].try_into().unwrap());
            let (pivot, _) = read_varint_key(&boundary[8..])?;
            let old_right = node_right_child(page)?;

            let left_header = node_header_cell(boundary_child, ROW_COUNT_UNKNOWN);
            let left = build_page(
                page_id,
                PAGE_DATA_NODE,
                page.parent(),
                self.index_id,
                &left_header,
                &cells[..split - 1],
            )?;
            let right_header = node_header_cell(old_right, ROW_COUNT_UNKNOWN);
            let right = build_page(
                right_id,
                PAGE_DATA_NODE,
                page.parent(),
                self.index_id,
                &right_header,
                &cells[split..],
            )?;
            (left, right, pivot)
        };

        session.pager_mut().log_undo(page)?;
        session.pager_mut().write_page(&left_page)?;
        session.pager_mut().write_page(&right_page)?;
        if !is_leaf {
            self.reparent_children(session, &right_page)?;
        }

        Ok(Some(SplitResult {
            pivot,
            right: right_id,
        }))
    }

    fn insert_into_node(
        &self,
        session: &mut Session,
        page: Page,
        key: i64,
        cell: &[u8],
        depth: usize,
    ) -> Result<Option<SplitResult>> {
        let page_id = page.page_id();

        // Every mutation invalidates the cached subtree count on the way
        // down.
        if node_row_count(&page)? != ROW_COUNT_UNKNOWN {
            session.pager_mut().log_undo(&page)?;
            let mut updated = page.clone();
            set_node_header(&mut updated, node_right_child(&page)?, ROW_COUNT_UNKNOWN);
            session.pager_mut().write_page(&updated)?;
        }

        let pos = node_position_of(&page, key)?;
        let child_id = node_child_at(&page, pos)?;

        let split = match self.insert_into_page(session, child_id, key, cell, depth + 1)? {
            None => return Ok(None),
            Some(split) => split,
        };

        // The child split: child_id kept the left half, split.right holds
        // the right half, split.pivot is the left half's largest key.
        let page = session.pager_mut().read_page(page_id)?;
        // Capture the pre-image before any in-place header edits below.
        session.pager_mut().log_undo(&page)?;
        let n = entry_count(&page);
        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
        }

        let mut right_child = node_right_child(&page)?;
        if pos < n {
            // The old entry's pivot still bounds the right half.
            let (_, old_pivot) = node_entry(&page, pos)?;
            cells[pos as usize] = node_entry_cell(child_id, split.pivot);
            cells.insert(pos as usize + 1, node_entry_cell(split.right, old_pivot));
        } else {
            cells.push(node_entry_cell(child_id, split.pivot));
            right_child = split.right;
        }

        let header = node_header_cell(right_child, ROW_COUNT_UNKNOWN);
        if cells_fit(header.len(), &cells) {
            let rebuilt = build_page(
                page_id,
                PAGE_DATA_NODE,
                page.parent(),
                self.index_id,
                &header,
                &cells,
            )?;
            session.pager_mut().log_undo(&page)?;
            session.pager_mut().write_page(&rebuilt)?;
            // The right half is a fresh page under this node.
            let mut right = session.pager_mut().read_page(split.right)?;
            if right.parent() != page_id {
                session.pager_mut().log_undo(&right)?;
                right.set_parent(page_id);
                session.pager_mut().write_page(&right)?;
            }
            return Ok(None);
        }

        // Rebuild with the pending right child recorded, then split.
        let mut with_header = page.clone();
        set_node_header(&mut with_header, right_child, ROW_COUNT_UNKNOWN);
        self.split_page(session, &with_header, cells, pos as usize + 1, header.len())
    }

    /// Remove the row with the given key.
    pub fn remove_key(&mut self, session: &mut Session, key: i64) -> Result<()> {
        match self.delete_from_page(session, self.head, key, 0)? {
            DeleteOutcome::NotFound => Err(OpalError::RowNotFound {
                index: self.name.clone(),
                key: format!("key {}", key),
            }),
            DeleteOutcome::Deleted { now_empty, .. } => {
                if now_empty {
                    // The root emptied: reinitialize it as an empty leaf.
                    let head_page = session.pager_mut().read_page(self.head)?;
                    let empty = build_page(
                        self.head,
                        PAGE_DATA_LEAF,
                        ROOT_PARENT,
                        self.index_id,
                        &[],
                        &[],
                    )?;
                    session.pager_mut().log_undo(&head_page)?;
                    session.pager_mut().write_page(&empty)?;
                }
                self.row_count -= 1;
                Ok(())
            }
        }
    }

    fn delete_from_page(
        &self,
        session: &mut Session,
        page_id: PageId,
        key: i64,
        depth: usize,
    ) -> Result<DeleteOutcome> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("data index depth exceeded".into()));
        }
        let page = session.pager_mut().read_page(page_id)?;
        match page.base_type() {
            PAGE_DATA_LEAF => {
                let n = entry_count(&page);
                let (pos, found) = leaf_position_of(&page, key)?;
                if !found {
                    return Ok(DeleteOutcome::NotFound);
                }
                if let Some(overflow_head) = leaf_entry_overflow(&page, pos)? {
                    free_overflow_chain(session, overflow_head)?;
                }

                let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize - 1);
                for i in 0..n {
                    if i != pos {
                        cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
                    }
                }
                let now_empty = cells.is_empty();
                let new_max = if !now_empty && pos == n - 1 {
                    let (k, _) = read_varint_key(&cells[cells.len() - 1][1..])?;
                    Some(k)
                } else {
                    None
                };

                if now_empty && page_id != self.head {
                    // The parent drops the page; free it here.
                    session.pager_mut().free_page(page_id)?;
                } else {
                    let rebuilt = build_page(
                        page_id,
                        PAGE_DATA_LEAF,
                        page.parent(),
                        self.index_id,
                        &[],
                        &cells,
                    )?;
                    session.pager_mut().log_undo(&page)?;
                    session.pager_mut().write_page(&rebuilt)?;
                }
                Ok(DeleteOutcome::Deleted { now_empty, new_max })
            }
            PAGE_DATA_NODE => {
                if node_row_count(&page)? != ROW_COUNT_UNKNOWN {
                    session.pager_mut().log_undo(&page)?;
                    let mut updated = page.clone();
                    set_node_header(
                        &mut updated,
                        node_right_child(&page)?,
                        ROW_COUNT_UNKNOWN,
                    );
                    session.pager_mut().write_page(&updated)?;
                }

                let pos = node_position_of(&page, key)?;
                let child_id = node_child_at(&page, pos)?;
                let outcome = self.delete_from_page(session, child_id, key, depth + 1)?;
                let (child_empty, child_new_max) = match outcome {
                    DeleteOutcome::NotFound => return Ok(DeleteOutcome::NotFound),
                    DeleteOutcome::Deleted { now_empty, new_max } => (now_empty, new_max),
                };

                let page = session.pager_mut().read_page(page_id)?;
                let n = entry_count(&page);
                let mut cells: Vec<Vec<u8>> = Vec::with_capacity(n as usize);
                for i in 0..n {
                    cells.push(page.cell(i + 1).ok_or(OpalError::InvalidPage)?.to_vec());
                }
                let mut right_child = node_right_child(&page)?;
                let mut new_max = None;

                if child_empty {
                    if pos < n {
                        cells.remove(pos as usize);
                    } else if n > 0 {
                        // Promote the last entry's child to rightmost; its
                        // pivot becomes the node's new largest key.
                        let boundary = cells.pop().expect("entries present");
                        right_child = u64::from_le_bytes(boundary[0..8].try_into().unwrap());
                        let (pivot, _) = read_varint_key(&boundary[8..])?;
                        new_max = Some(pivot);
                    } else {
                        // The only child is gone: this node is empty too.
                        if page_id != self.head {
                            session.pager_mut().free_page(page_id)?;
                        }
                        return Ok(DeleteOutcome::Deleted {
                            now_empty: true,
                            new_max: None,
                        });
                    }
                } else if let Some(child_max) = child_new_max {
                    if pos < n {
                        cells[pos as usize] = node_entry_cell(child_id, child_max);
                    } else {
                        // The rightmost subtree shrank: the stale pivot
                        // lives in this node's parent.
                        new_max = Some(child_max);
                    }
                }

                let header = node_header_cell(right_child, ROW_COUNT_UNKNOWN);
                let rebuilt = build_page(
                    page_id,
                    PAGE_DATA_NODE,
                    page.parent(),
                    self.index_id,
                    &header,
                    &cells,
                )?;
                session.pager_mut().log_undo(&page)?;
                session.pager_mut().write_page(&rebuilt)?;
                Ok(DeleteOutcome::Deleted {
                    now_empty: false,
                    new_max,
                })
            }
            _ => Err(OpalError::FileCorrupted {
                page_id,
                field: "page type".into(),
            }),
        }
    }

    /// Point lookup through an arbitrary head page; secondary indexes use
    /// this to resolve full rows without holding a reference to the data
    /// index object.
    pub fn lookup_row(
        session: &mut Session,
        head: PageId,
        key: i64,
    ) -> Result<Option<Row>> {
        let mut page_id = head;
        for _ in 0..MAX_TREE_DEPTH {
            let page = session.pager_mut().read_page(page_id)?;
            match page.base_type() {
                PAGE_DATA_LEAF => {
                    let (pos, found) = leaf_position_of(&page, key)?;
                    if !found {
                        return Ok(None);
                    }
                    return Ok(Some(leaf_entry_row(session, &page, pos)?));
                }
                PAGE_DATA_NODE => {
                    let pos = node_position_of(&page, key)?;
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
        Err(OpalError::Corruption("data index depth exceeded".into()))
    }

    pub fn get_row(&self, session: &mut Session, key: i64) -> Result<Option<Row>> {
        Self::lookup_row(session, self.head, key)
    }

    /// Cursor over an arbitrary data tree head; the catalog and the meta
    /// index scan through this without holding an index handle.
    pub fn scan_head(
        head: PageId,
        first: Option<i64>,
        last: Option<i64>,
        reverse: bool,
    ) -> DataCursor {
        DataCursor {
            head,
            first,
            last,
            reverse,
            started: false,
            exhausted: false,
            stack: Vec::new(),
            leaf: 0,
            leaf_pos: 0,
            current: None,
        }
    }

    fn collect_pages(
        &self,
        session: &mut Session,
        page_id: PageId,
        pages: &mut Vec<PageId>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(OpalError::Corruption("data index depth exceeded".into()));
        }
        pages.push(page_id);
        let page = session.pager_mut().read_page(page_id)?;
        match page.base_type() {
            PAGE_DATA_LEAF => {
                for i in 0..entry_count(&page) {
                    if let Some(head) = leaf_entry_overflow(&page, i)? {
                        let mut chain = head;
                        loop {
                            pages.push(chain);
                            let p = session.pager_mut().read_page(chain)?;
                            if p.page_type() & FLAG_LAST != 0 {
                                break;
                            }
                            let next = p
                                .cell(0)
                                .map(|c| u64::from_le_bytes(c[0..8].try_into().unwrap()))
                                .unwrap_or(0);
                            if next == 0 {
                                break;
                            }
                            chain = next;
                        }
                    }
                }
                Ok(())
            }
            PAGE_DATA_NODE => {
                let n = entry_count(&page);
                for pos in 0..=n {
                    let child = node_child_at(&page, pos)?;
                    self.collect_pages(session, child, pages, depth + 1)?;
                }
                Ok(())
            }
            _ => Err(OpalError::FileCorrupted {
                page_id,
                field: "page type".into(),
            }),
        }
    }

    /// Drop all rows, freeing every page below the head. The key
    /// high-water mark survives so truncated tables never reuse row keys.
    pub fn truncate_rows(&mut self, session: &mut Session) -> Result<()> {
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
            PAGE_DATA_LEAF,
            ROOT_PARENT,
            self.index_id,
            &[],
            &[],
        )?;
        session.pager_mut().log_undo(&head_page)?;
        session.pager_mut().write_page(&empty)?;
        self.row_count = 0;
        Ok(())
    }

    /// Free every page including the head (index drop).
    pub fn destroy(mut self, session: &mut Session) -> Result<()> {
        self.truncate_rows(session)?;
        session.pager_mut().free_page(self.head)?;
        Ok(())
    }

    fn cursor(
        &self,
        first: Option<i64>,
        last: Option<i64>,
        reverse: bool,
    ) -> DataCursor {
        DataCursor {
            head: self.head,
            first,
            last,
            reverse,
            started: false,
            exhausted: false,
            stack: Vec::new(),
            leaf: 0,
            leaf_pos: 0,
            current: None,
        }
    }
}

impl Index for DataIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Scan
    }

    fn columns(&self) -> &[IndexColumn] {
        &[]
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, session: &mut Session, row: &Row) -> Result<()> {
        self.add_row(session, row)?;
        Ok(())
    }

    fn remove(&mut self, session: &mut Session, row: &Row) -> Result<()> {
        if row.key == 0 {
            return Err(row_not_found_error(&self.name, row));
        }
        self.remove_key(session, row.key)
    }

    fn find(
        &self,
        _session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        let first_key = first.and_then(|f| f.key);
        let last_key = last.and_then(|l| l.key);
        if let (Some(f), Some(l)) = (first_key, last_key) {
            if f > l {
                return Ok(Box::new(EmptyCursor));
            }
        }
        Ok(Box::new(self.cursor(first_key, last_key, reverse)))
    }

    fn find_first_or_last(&self, session: &mut Session, first: bool) -> Result<Box<dyn Cursor>> {
        let mut cursor = self.cursor(None, None, !first);
        if cursor.next(session)? {
            let row = cursor.get().expect("positioned").clone();
            Ok(Box::new(SingletonCursor::new(Some(row))))
        } else {
            Ok(Box::new(EmptyCursor))
        }
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
            columns: &[],
            selectivity: &[],
            unique_column_count: 0,
            sort_order,
            projected: projected_columns,
            kind: CostKind::Scan,
        })
    }

    fn row_count(&self, session: &mut Session) -> i64 {
        self.row_count + session.row_count_diff(self.index_id)
    }

    fn row_count_approximation(&self) -> i64 {
        self.row_count
    }

    fn truncate(&mut self, session: &mut Session) -> Result<()> {
        self.truncate_rows(session)
    }

    fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    fn can_get_first_or_last(&self) -> bool {
        true
    }
}

/// Pull-based cursor over the data index: an explicit stack of
/// (page id, child position) frames plus the current leaf position.
pub struct DataCursor {
    head: PageId,
    first: Option<i64>,
    last: Option<i64>,
    reverse: bool,
    started: bool,
    exhausted: bool,
    stack: Vec<(PageId, u16)>,
    leaf: PageId,
    leaf_pos: i64,
    current: Option<Row>,
}

impl DataCursor {
    /// Descend from the head to the boundary leaf, pushing node frames.
    fn position(&mut self, session: &mut Session) -> Result<()> {
        let mut page_id = self.head;
        for _ in 0..MAX_TREE_DEPTH {
            let page = session.pager_mut().read_page(page_id)?;
            match page.base_type() {
                PAGE_DATA_LEAF => {
                    self.leaf = page_id;
                    self.leaf_pos = if self.reverse {
                        match self.last {
                            None => entry_count(&page) as i64 - 1,
                            Some(last) => {
                                let (pos, found) = leaf_position_of(&page, last)?;
                                if found {
                                    pos as i64
                                } else {
                                    pos as i64 - 1
                                }
                            }
                        }
                    } else {
                        match self.first {
                            None => 0,
                            Some(first) => leaf_position_of(&page, first)?.0 as i64,
                        }
                    };
                    return Ok(());
                }
                PAGE_DATA_NODE => {
                    let n = entry_count(&page);
                    let pos = if self.reverse {
                        match self.last {
                            None => n,
                            Some(last) => node_position_of(&page, last)?,
                        }
                    } else {
                        match self.first {
                            None => 0,
                            Some(first) => node_position_of(&page, first)?,
                        }
                    };
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
        Err(OpalError::Corruption("data index depth exceeded".into()))
    }

    /// Move to the adjacent leaf in scan direction via the frame stack.
    /// Returns false when the tree is exhausted.
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

            // Descend to the extreme leaf of the new child.
            let mut child = node_child_at(&page, next)?;
            for _ in 0..MAX_TREE_DEPTH {
                let cpage = session.pager_mut().read_page(child)?;
                match cpage.base_type() {
                    PAGE_DATA_LEAF => {
                        self.leaf = child;
                        self.leaf_pos = if self.reverse {
                            entry_count(&cpage) as i64 - 1
                        } else {
                            0
                        };
                        return Ok(true);
                    }
                    PAGE_DATA_NODE => {
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
            return Err(OpalError::Corruption("data index depth exceeded".into()));
        }
        Ok(false)
    }
}

impl Cursor for DataCursor {
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
            if n == 0 && self.leaf != self.head {
                return Err(OpalError::FileCorrupted {
                    page_id: self.leaf,
                    field: "empty non-root leaf".into(),
                });
            }
            if self.leaf_pos >= 0 && self.leaf_pos < n {
                let key = leaf_entry_key(&page, self.leaf_pos as u16)?;
                let in_bounds = if self.reverse {
                    match self.first {
                        Some(first) if key < first => BoundsCheck::Exhausted,
                        _ => match self.last {
                            Some(last) if key > last => BoundsCheck::Skip,
                            _ => BoundsCheck::Within,
                        },
                    }
                } else {
                    match self.last {
                        Some(last) if key > last => BoundsCheck::Exhausted,
                        _ => match self.first {
                            Some(first) if key < first => BoundsCheck::Skip,
                            _ => BoundsCheck::Within,
                        },
                    }
                };
                match in_bounds {
                    BoundsCheck::Within => {
                        self.current = Some(leaf_entry_row(session, &page, self.leaf_pos as u16)?);
                        return Ok(true);
                    }
                    BoundsCheck::Skip => {
                        self.leaf_pos += if self.reverse { -1 } else { 1 };
                        continue;
                    }
                    BoundsCheck::Exhausted => {
                        self.exhausted = true;
                        self.current = None;
                        return Ok(false);
                    }
                }
            }
            if !self.advance_leaf(session)? {
                self.exhausted = true;
                self.current = None;
                return Ok(false);
            }
        }
    }

    fn get(&self) -> Option<&Row> {
        self.current.as_ref()
    }
}
