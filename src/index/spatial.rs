//! Spatial access path: an in-memory R-tree over the minimum bounding
//! rectangles of one geometry column. Nodes live in an arena; splits use
//! the quadratic heuristic; lookups prune whole subtrees by MBR
//! intersection and resolve rows through the data index.

use crate::error::{OpalError, Result};
use crate::index::cost::{cost_range_index, CostKind, CostParams};
use crate::index::cursor::{Cursor, MaterializedCursor};
use crate::index::data::DataIndex;
use crate::index::{check_bounds, row_not_found_error, BoundsCheck, Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::schema::table::TableDef;
use crate::session::Session;
use crate::storage::page::PageId;
use crate::types::Mbr;

/// Entries per node before a quadratic split.
const MAX_NODE_ENTRIES: usize = 8;

#[derive(Clone)]
enum RNode {
    Leaf { entries: Vec<(Mbr, i64)> },
    Inner { entries: Vec<(Mbr, usize)> },
}

pub struct SpatialIndex {
    index_id: u32,
    name: String,
    table: TableDef,
    columns: Vec<IndexColumn>,
    comparator: RowComparator,
    data_head: PageId,
    nodes: Vec<RNode>,
    root: usize,
    row_count: i64,
}

fn union_all(entries: &[(Mbr, usize)]) -> Mbr {
    let mut mbr = entries[0].0;
    for (m, _) in &entries[1..] {
        mbr = mbr.union(m);
    }
    mbr
}

/// Quadratic split: seed with the pair wasting the most area together,
/// then assign the rest by least enlargement.
fn quadratic_split<T: Copy>(entries: Vec<(Mbr, T)>) -> (Vec<(Mbr, T)>, Vec<(Mbr, T)>) {
    let mut best = (0usize, 1usize);
    let mut worst_waste = f64::NEG_INFINITY;
    for i in 0..entries.len() {
        for j in i + 1..entries.len() {
            let waste =
                entries[i].0.union(&entries[j].0).area() - entries[i].0.area() - entries[j].0.area();
            if waste > worst_waste {
                worst_waste = waste;
                best = (i, j);
            }
        }
    }

    let mut left = vec![entries[best.0]];
    let mut right = vec![entries[best.1]];
    let mut left_mbr = entries[best.0].0;
    let mut right_mbr = entries[best.1].0;
    for (i, entry) in entries.into_iter().enumerate() {
        if i == best.0 || i == best.1 {
            continue;
        }
        let grow_left = left_mbr.enlargement(&entry.0);
        let grow_right = right_mbr.enlargement(&entry.0);
        if grow_left <= grow_right {
            left_mbr = left_mbr.union(&entry.0);
            left.push(entry);
        } else {
            right_mbr = right_mbr.union(&entry.0);
            right.push(entry);
        }
    }
    (left, right)
}

impl SpatialIndex {
    pub fn new(
        index_id: u32,
        name: &str,
        table: TableDef,
        columns: Vec<IndexColumn>,
        data_head: PageId,
    ) -> Self {
        SpatialIndex {
            index_id,
            name: name.to_string(),
            comparator: RowComparator::new(columns.clone()),
            data_head,
            nodes: vec![RNode::Leaf {
                entries: Vec::new(),
            }],
            root: 0,
            row_count: 0,
            columns,
            table,
        }
    }

    fn row_mbr(&self, row: &Row) -> Result<Mbr> {
        row.value(self.columns[0].column)
            .as_mbr()
            .copied()
            .ok_or_else(|| OpalError::Internal(format!("non-geometry value in index {}", self.name)))
    }

    fn node_mbr(&self, node: usize) -> Mbr {
        match &self.nodes[node] {
            RNode::Leaf { entries } => {
                let mut mbr = entries[0].0;
                for (m, _) in &entries[1..] {
                    mbr = mbr.union(m);
                }
                mbr
            }
            RNode::Inner { entries } => union_all(entries),
        }
    }

    /// Insert into the subtree, returning Some((mbr, node)) when the node
    /// split.
    fn insert_at(&mut self, node: usize, mbr: Mbr, key: i64) -> Option<(Mbr, usize)> {
        if let RNode::Leaf { entries } = &mut self.nodes[node] {
            entries.push((mbr, key));
            if entries.len() <= MAX_NODE_ENTRIES {
                return None;
            }
            let all = std::mem::take(entries);
            let (left, right) = quadratic_split(all);
            let mut right_mbr = right[0].0;
            for (m, _) in &right[1..] {
                right_mbr = right_mbr.union(m);
            }
            self.nodes[node] = RNode::Leaf { entries: left };
            self.nodes.push(RNode::Leaf { entries: right });
            return Some((right_mbr, self.nodes.len() - 1));
        }

        // Inner node: descend into the least-enlargement child.
        let child = {
            let entries = match &mut self.nodes[node] {
                RNode::Inner { entries } => entries,
                RNode::Leaf { .. } => unreachable!(),
            };
            let mut best = 0usize;
            let mut best_grow = f64::INFINITY;
            for (i, (m, _)) in entries.iter().enumerate() {
                let grow = m.enlargement(&mbr);
                if grow < best_grow {
                    best_grow = grow;
                    best = i;
                }
            }
            entries[best].0 = entries[best].0.union(&mbr);
            entries[best].1
        };

        let split = self.insert_at(child, mbr, key)?;
        let overflow = {
            let entries = match &mut self.nodes[node] {
                RNode::Inner { entries } => entries,
                RNode::Leaf { .. } => unreachable!(),
            };
            entries.push(split);
            entries.len() > MAX_NODE_ENTRIES
        };
        if !overflow {
            return None;
        }
        let all = match &mut self.nodes[node] {
            RNode::Inner { entries } => std::mem::take(entries),
            RNode::Leaf { .. } => unreachable!(),
        };
        let (left, right) = quadratic_split(all);
        let right_mbr = union_all(&right);
        self.nodes[node] = RNode::Inner { entries: left };
        self.nodes.push(RNode::Inner { entries: right });
        Some((right_mbr, self.nodes.len() - 1))
    }

    fn insert(&mut self, mbr: Mbr, key: i64) {
        if let Some((split_mbr, split_node)) = self.insert_at(self.root, mbr, key) {
            let old_root = self.root;
            let old_mbr = self.node_mbr(old_root);
            self.nodes.push(RNode::Inner {
                entries: vec![(old_mbr, old_root), (split_mbr, split_node)],
            });
            self.root = self.nodes.len() - 1;
        }
    }

    fn remove_entry(&mut self, node: usize, mbr: &Mbr, key: i64) -> bool {
        match &mut self.nodes[node] {
            RNode::Leaf { entries } => {
                if let Some(pos) = entries.iter().position(|(m, k)| *k == key && m.intersects(mbr))
                {
                    entries.remove(pos);
                    true
                } else {
                    false
                }
            }
            RNode::Inner { entries } => {
                let children: Vec<usize> = entries
                    .iter()
                    .filter(|(m, _)| m.intersects(mbr))
                    .map(|(_, c)| *c)
                    .collect();
                for child in children {
                    if self.remove_entry(child, mbr, key) {
                        return true;
                    }
                }
                false
            }
        }
    }

    fn collect_intersecting(&self, node: usize, window: &Mbr, out: &mut Vec<i64>) {
        match &self.nodes[node] {
            RNode::Leaf { entries } => {
                for (m, key) in entries {
                    if m.intersects(window) {
                        out.push(*key);
                    }
                }
            }
            RNode::Inner { entries } => {
                for (m, child) in entries {
                    if m.intersects(window) {
                        self.collect_intersecting(*child, window, out);
                    }
                }
            }
        }
    }

    fn collect_all(&self, node: usize, out: &mut Vec<i64>) {
        match &self.nodes[node] {
            RNode::Leaf { entries } => out.extend(entries.iter().map(|(_, k)| *k)),
            RNode::Inner { entries } => {
                for (_, child) in entries {
                    self.collect_all(*child, out);
                }
            }
        }
    }

    fn resolve(
        &self,
        session: &mut Session,
        keys: Vec<i64>,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let row =
                DataIndex::lookup_row(session, self.data_head, key)?.ok_or_else(|| {
                    OpalError::Corruption(format!("spatial entry without base row, key {}", key))
                })?;
            if check_bounds(&self.comparator, &row, first, last, false) == BoundsCheck::Within {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| self.comparator.compare_rows(a, b));
        if reverse {
            rows.reverse();
        }
        Ok(rows)
    }
}

impl Index for SpatialIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::Spatial
    }

    fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        let mbr = self.row_mbr(row)?;
        self.insert(mbr, row.key);
        self.row_count += 1;
        Ok(())
    }

    fn remove(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        let mbr = self.row_mbr(row)?;
        if !self.remove_entry(self.root, &mbr, row.key) {
            return Err(row_not_found_error(&self.name, row));
        }
        self.row_count -= 1;
        Ok(())
    }

    fn find(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        let mut keys = Vec::new();
        self.collect_all(self.root, &mut keys);
        let rows = self.resolve(session, keys, first, last, reverse)?;
        Ok(Box::new(MaterializedCursor::new(rows)))
    }

    fn find_by_geometry(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        intersection: &Mbr,
    ) -> Result<Box<dyn Cursor>> {
        let mut keys = Vec::new();
        self.collect_intersecting(self.root, intersection, &mut keys);
        let rows = self.resolve(session, keys, first, last, false)?;
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
            row_count: self.row_count,
            columns: &self.columns,
            selectivity: &[50],
            unique_column_count: 0,
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

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        self.nodes = vec![RNode::Leaf {
            entries: Vec::new(),
        }];
        self.root = 0;
        self.row_count = 0;
        Ok(())
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
        TableDef::new(1, "t", vec![ColumnDef::new("g", DataType::Geometry)])
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

    fn insert(fx: &mut Fixture, idx: &mut SpatialIndex, mbr: Mbr) -> i64 {
        let key = fx
            .data
            .add_row(&mut fx.session, &Row::new(0, vec![Value::Geometry(mbr)]))
            .unwrap();
        idx.add(&mut fx.session, &Row::new(key, vec![Value::Geometry(mbr)]))
            .unwrap();
        key
    }

    #[test]
    fn test_intersection_query() {
        let mut fx = setup();
        let mut idx = SpatialIndex::new(2, "t.g_idx", table(), vec![IndexColumn::asc(0)], fx.data.head_page());

        // A 10x10 grid of unit squares.
        for x in 0..10 {
            for y in 0..10 {
                insert(
                    &mut fx,
                    &mut idx,
                    Mbr::new(x as f64, y as f64, x as f64 + 1.0, y as f64 + 1.0),
                );
            }
        }
        assert_eq!(idx.row_count_approximation(), 100);

        // A window covering the 2x2 block at the origin, touching the
        // squares one further out along each edge.
        let window = Mbr::new(0.0, 0.0, 2.0, 2.0);
        let mut cursor = idx
            .find_by_geometry(&mut fx.session, None, None, &window)
            .unwrap();
        let mut hits = 0;
        while cursor.next(&mut fx.session).unwrap() {
            let m = *cursor.get().unwrap().value(0).as_mbr().unwrap();
            assert!(m.intersects(&window));
            hits += 1;
        }
        assert_eq!(hits, 9);
    }

    #[test]
    fn test_remove_and_full_scan() {
        let mut fx = setup();
        let mut idx = SpatialIndex::new(2, "t.g_idx", table(), vec![IndexColumn::asc(0)], fx.data.head_page());
        let m1 = Mbr::new(0.0, 0.0, 1.0, 1.0);
        let m2 = Mbr::new(5.0, 5.0, 6.0, 6.0);
        let k1 = insert(&mut fx, &mut idx, m1);
        insert(&mut fx, &mut idx, m2);

        idx.remove(&mut fx.session, &Row::new(k1, vec![Value::Geometry(m1)]))
            .unwrap();
        assert_eq!(idx.row_count_approximation(), 1);

        let mut cursor = idx.find(&mut fx.session, None, None, false).unwrap();
        assert!(cursor.next(&mut fx.session).unwrap());
        assert_eq!(
            cursor.get().unwrap().value(0).as_mbr().unwrap().min_x,
            5.0
        );
        assert!(!cursor.next(&mut fx.session).unwrap());
    }

    #[test]
    fn test_remove_missing() {
        let mut fx = setup();
        let mut idx = SpatialIndex::new(2, "t.g_idx", table(), vec![IndexColumn::asc(0)], fx.data.head_page());
        let m = Mbr::new(0.0, 0.0, 1.0, 1.0);
        match idx.remove(&mut fx.session, &Row::new(1, vec![Value::Geometry(m)])) {
            Err(OpalError::RowNotFound { .. }) => {}
            other => panic!("expected RowNotFound, got {:?}", other),
        }
    }
}
