//! Session: the explicit context handle threaded through every access-path
//! call. Owns the pager, carries the cooperative cancel flag, the optional
//! row limit that guards recursive queries, and the per-index row-count
//! diffs an MVCC layer above maintains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{OpalError, Result};
use crate::storage::pager::Pager;

pub struct Session {
    pager: Pager,
    cancelled: Arc<AtomicBool>,
    row_limit: Option<usize>,
    /// Uncommitted row-count delta per index id, maintained by the
    /// transaction layer above the core.
    row_count_diff: HashMap<u32, i64>,
}

impl Session {
    pub fn new(pager: Pager) -> Self {
        Session {
            pager,
            cancelled: Arc::new(AtomicBool::new(false)),
            row_limit: None,
            row_count_diff: HashMap::new(),
        }
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    /// Handle another thread can use to request cancellation.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Cursors call this between rows; in-flight page I/O is not
    /// interrupted.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            Err(OpalError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn clear_cancelled(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }

    /// Row limit for recursive query evaluation; None means unlimited.
    pub fn row_limit(&self) -> Option<usize> {
        self.row_limit
    }

    pub fn set_row_limit(&mut self, limit: Option<usize>) {
        self.row_limit = limit;
    }

    /// MVCC hook: adjust the uncommitted row-count delta of an index.
    pub fn add_row_count_diff(&mut self, index_id: u32, delta: i64) {
        *self.row_count_diff.entry(index_id).or_insert(0) += delta;
    }

    pub fn row_count_diff(&self, index_id: u32) -> i64 {
        self.row_count_diff.get(&index_id).copied().unwrap_or(0)
    }

    /// Called on commit/rollback by the transaction layer.
    pub fn clear_row_count_diffs(&mut self) {
        self.row_count_diff.clear();
    }

    pub fn commit(&mut self) -> Result<()> {
        self.pager.commit()?;
        self.row_count_diff.clear();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.pager.rollback()?;
        self.row_count_diff.clear();
        Ok(())
    }
}
