//! Ordered in-memory index: an AVL tree over (indexed columns, row key).
//! Nodes live in an arena and reference each other by index, never by
//! owning pointers; traversal walks parent links for successor and
//! predecessor.

use std::cmp::Ordering;

use crate::error::Result;
use crate::index::cost::{cost_range_index, CostKind, CostParams};
use crate::index::cursor::{Cursor, EmptyCursor, MaterializedCursor, SingletonCursor};
use crate::index::{
    check_bounds, duplicate_key_error, row_not_found_error, BoundsCheck, Index, IndexType,
    NullsDistinct, RowComparator,
};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::schema::table::TableDef;
use crate::session::Session;

const NIL: usize = usize::MAX;

struct Node {
    row: Row,
    left: usize,
    right: usize,
    parent: usize,
    height: i32,
}

pub struct TreeIndex {
    index_id: u32,
    name: String,
    table: TableDef,
    columns: Vec<IndexColumn>,
    comparator: RowComparator,
    selectivity: Vec<u8>,
    unique_column_count: usize,
    nulls_distinct: NullsDistinct,
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: usize,
}

impl TreeIndex {
    pub fn new(
        index_id: u32,
        name: &str,
        table: TableDef,
        columns: Vec<IndexColumn>,
        unique_column_count: usize,
        nulls_distinct: NullsDistinct,
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
        TreeIndex {
            index_id,
            name: name.to_string(),
            comparator: RowComparator::new(columns.clone()),
            selectivity,
            unique_column_count,
            nulls_distinct: nulls_distinct.normalize(unique_column_count),
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            columns,
            table,
        }
    }

    fn height(&self, n: usize) -> i32 {
        if n == NIL {
            0
        } else {
            self.nodes[n].height
        }
    }

    fn update_height(&mut self, n: usize) {
        let h = 1 + self.height(self.nodes[n].left).max(self.height(self.nodes[n].right));
        self.nodes[n].height = h;
    }

    fn balance_factor(&self, n: usize) -> i32 {
        self.height(self.nodes[n].left) - self.height(self.nodes[n].right)
    }

    fn alloc(&mut self, row: Row, parent: usize) -> usize {
        let node = Node {
            row,
            left: NIL,
            right: NIL,
            parent,
            height: 1,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    /// Replace `old` with `new` in old's parent (or as root).
    fn replace_child(&mut self, old: usize, new: usize) {
        let parent = self.nodes[old].parent;
        if new != NIL {
            self.nodes[new].parent = parent;
        }
        if parent == NIL {
            self.root = new;
        } else if self.nodes[parent].left == old {
            self.nodes[parent].left = new;
        } else {
            self.nodes[parent].right = new;
        }
    }

    fn rotate_left(&mut self, n: usize) -> usize {
        let r = self.nodes[n].right;
        let rl = self.nodes[r].left;
        self.replace_child(n, r);
        self.nodes[n].right = rl;
        if rl != NIL {
            self.nodes[rl].parent = n;
        }
        self.nodes[r].left = n;
        self.nodes[n].parent = r;
        self.update_height(n);
        self.update_height(r);
        r
    }

    fn rotate_right(&mut self, n: usize) -> usize {
        let l = self.nodes[n].left;
        let lr = self.nodes[l].right;
        self.replace_child(n, l);
        self.nodes[n].left = lr;
        if lr != NIL {
            self.nodes[lr].parent = n;
        }
        self.nodes[l].right = n;
        self.nodes[n].parent = l;
        self.update_height(n);
        self.update_height(l);
        l
    }

    /// Rebalance from `n` toward the root after an insert or delete.
    fn retrace(&mut self, mut n: usize) {
        while n != NIL {
            self.update_height(n);
            let balance = self.balance_factor(n);
            if balance > 1 {
                if self.balance_factor(self.nodes[n].left) < 0 {
                    self.rotate_left(self.nodes[n].left);
                }
                n = self.rotate_right(n);
            } else if balance < -1 {
                if self.balance_factor(self.nodes[n].right) > 0 {
                    self.rotate_right(self.nodes[n].right);
                }
                n = self.rotate_left(n);
            }
            n = self.nodes[n].parent;
        }
    }

    fn insert_node(&mut self, row: Row) {
        if self.root == NIL {
            self.root = self.alloc(row, NIL);
            return;
        }
        let mut n = self.root;
        loop {
            let go_left =
                self.comparator.compare_rows(&row, &self.nodes[n].row) == Ordering::Less;
            let next = if go_left {
                self.nodes[n].left
            } else {
                self.nodes[n].right
            };
            if next == NIL {
                let child = self.alloc(row, n);
                if go_left {
                    self.nodes[n].left = child;
                } else {
                    self.nodes[n].right = child;
                }
                self.retrace(n);
                return;
            }
            n = next;
        }
    }

    fn find_node(&self, row: &Row) -> usize {
        let mut n = self.root;
        while n != NIL {
            match self.comparator.compare_rows(row, &self.nodes[n].row) {
                Ordering::Equal => return n,
                Ordering::Less => n = self.nodes[n].left,
                Ordering::Greater => n = self.nodes[n].right,
            }
        }
        NIL
    }

    fn remove_node(&mut self, n: usize) {
        let (left, right) = (self.nodes[n].left, self.nodes[n].right);
        if left != NIL && right != NIL {
            // Swap rows with the in-order predecessor, then delete that
            // node (which has at most one child).
            let mut pred = left;
            while self.nodes[pred].right != NIL {
                pred = self.nodes[pred].right;
            }
            let (lo, hi) = if n < pred { (n, pred) } else { (pred, n) };
            let (a, b) = self.nodes.split_at_mut(hi);
            std::mem::swap(&mut a[lo].row, &mut b[0].row);
            self.remove_node(pred);
            return;
        }

        let child = if left != NIL { left } else { right };
        let parent = self.nodes[n].parent;
        self.replace_child(n, child);
        self.free.push(n);
        if parent != NIL {
            self.retrace(parent);
        }
    }

    fn min_node(&self, mut n: usize) -> usize {
        while n != NIL && self.nodes[n].left != NIL {
            n = self.nodes[n].left;
        }
        n
    }

    fn max_node(&self, mut n: usize) -> usize {
        while n != NIL && self.nodes[n].right != NIL {
            n = self.nodes[n].right;
        }
        n
    }

    /// In-order successor via parent links.
    fn successor(&self, n: usize) -> usize {
        if self.nodes[n].right != NIL {
            return self.min_node(self.nodes[n].right);
        }
        let mut n = n;
        let mut parent = self.nodes[n].parent;
        while parent != NIL && self.nodes[parent].right == n {
            n = parent;
            parent = self.nodes[n].parent;
        }
        parent
    }

    fn predecessor(&self, n: usize) -> usize {
        if self.nodes[n].left != NIL {
            return self.max_node(self.nodes[n].left);
        }
        let mut n = n;
        let mut parent = self.nodes[n].parent;
        while parent != NIL && self.nodes[parent].left == n {
            n = parent;
            parent = self.nodes[n].parent;
        }
        parent
    }

    /// Leftmost node not Less than the probe.
    fn lower_bound(&self, probe: &SearchRow) -> usize {
        let mut n = self.root;
        let mut best = NIL;
        while n != NIL {
            if self.comparator.compare_to_probe(&self.nodes[n].row, probe) == Ordering::Less {
                n = self.nodes[n].right;
            } else {
                best = n;
                n = self.nodes[n].left;
            }
        }
        best
    }

    /// Rightmost node not Greater than the probe.
    fn upper_bound(&self, probe: &SearchRow) -> usize {
        let mut n = self.root;
        let mut best = NIL;
        while n != NIL {
            if self.comparator.compare_to_probe(&self.nodes[n].row, probe) == Ordering::Greater {
                n = self.nodes[n].left;
            } else {
                best = n;
                n = self.nodes[n].right;
            }
        }
        best
    }

    fn collect(
        &self,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Vec<Row> {
        let mut out = Vec::new();
        if !reverse {
            let mut n = match first {
                Some(f) => self.lower_bound(f),
                None => self.min_node(self.root),
            };
            while n != NIL {
                let row = &self.nodes[n].row;
                match check_bounds(&self.comparator, row, first, last, false) {
                    BoundsCheck::Within => out.push(row.clone()),
                    BoundsCheck::Skip => {}
                    BoundsCheck::Exhausted => break,
                }
                n = self.successor(n);
            }
        } else {
            let mut n = match last {
                Some(l) => self.upper_bound(l),
                None => self.max_node(self.root),
            };
            while n != NIL {
                let row = &self.nodes[n].row;
                match check_bounds(&self.comparator, row, first, last, true) {
                    BoundsCheck::Within => out.push(row.clone()),
                    BoundsCheck::Skip => {}
                    BoundsCheck::Exhausted => break,
                }
                n = self.predecessor(n);
            }
        }
        out
    }

    #[cfg(test)]
    fn tree_height(&self) -> i32 {
        self.height(self.root)
    }
}

impl Index for TreeIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::InMemory
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

    fn add(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        if self.unique_column_count > 0 {
            let prefix: Vec<&crate::types::Value> = self.columns[..self.unique_column_count]
                .iter()
                .map(|ic| row.value(ic.column))
                .collect();
            if self.nulls_distinct.is_conflict(&prefix) {
                let mut probe = SearchRow::with_columns(self.table.column_count());
                for ic in &self.columns[..self.unique_column_count] {
                    probe.set_value(ic.column, row.value(ic.column).clone());
                }
                let n = self.lower_bound(&probe);
                if n != NIL
                    && self
                        .comparator
                        .compare_to_probe(&self.nodes[n].row, &probe)
                        == Ordering::Equal
                {
                    return Err(duplicate_key_error(
                        &self.name,
                        &self.columns[..self.unique_column_count],
                        row,
                    ));
                }
            }
        }
        self.insert_node(row.clone());
        Ok(())
    }

    fn remove(&mut self, _session: &mut Session, row: &Row) -> Result<()> {
        let n = self.find_node(row);
        if n == NIL {
            return Err(row_not_found_error(&self.name, row));
        }
        self.remove_node(n);
        Ok(())
    }

    fn find(
        &self,
        _session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MaterializedCursor::new(
            self.collect(first, last, reverse),
        )))
    }

    fn find_first_or_last(&self, _session: &mut Session, first: bool) -> Result<Box<dyn Cursor>> {
        let mut n = if first {
            self.min_node(self.root)
        } else {
            self.max_node(self.root)
        };
        // MIN/MAX lookup: leading NULLs do not participate.
        while n != NIL {
            let row = &self.nodes[n].row;
            if self
                .columns
                .first()
                .map(|ic| !row.value(ic.column).is_null())
                .unwrap_or(true)
            {
                return Ok(Box::new(SingletonCursor::new(Some(row.clone()))));
            }
            n = if first {
                self.successor(n)
            } else {
                self.predecessor(n)
            };
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
            row_count: self.row_count_approximation(),
            columns: &self.columns,
            selectivity: &self.selectivity,
            unique_column_count: self.unique_column_count,
            sort_order,
            projected: projected_columns,
            kind: CostKind::Secondary,
        })
    }

    fn row_count(&self, session: &mut Session) -> i64 {
        self.row_count_approximation() + session.row_count_diff(self.index_id)
    }

    fn row_count_approximation(&self) -> i64 {
        (self.nodes.len() - self.free.len()) as i64
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        self.nodes.clear();
        self.free.clear();
        self.root = NIL;
        Ok(())
    }

    fn can_get_first_or_last(&self) -> bool {
        true
    }
}
