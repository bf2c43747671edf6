use crate::error::Result;
use crate::storage::page::{Page, PageId};

/// Abstraction over page I/O.
///
/// Implemented by `Pager` (direct disk I/O with undo journaling); tree code
/// is written against this trait so tests can interpose.
pub trait PageStore {
    fn read_page(&mut self, page_id: PageId) -> Result<Page>;
    fn write_page(&mut self, page: &Page) -> Result<()>;
    fn allocate_page(&mut self, index_id: u32, page_type: u8) -> Result<Page>;
    fn free_page(&mut self, page_id: PageId) -> Result<()>;

    /// Record the page's pre-image before an in-place modification.
    /// Idempotent within a transaction.
    fn log_undo(&mut self, page: &Page) -> Result<()>;
}
