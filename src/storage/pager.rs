use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;

use crate::error::{OpalError, Result};
use crate::storage::freelist::FreeList;
use crate::storage::header::{StoreHeader, BLOCK_SIZE};
use crate::storage::page::{Page, PageId, PAGE_FREE_LIST, PAGE_SIZE};
use crate::storage::page_store::PageStore;
use crate::storage::undo::{self, UndoLog};

/// Default LRU cache capacity.
const DEFAULT_CACHE_CAPACITY: usize = 256;

/// At most this many free-page ids survive in the persisted free-list page;
/// the remainder stay usable in memory but are lost across a restart.
const FREELIST_PERSIST_MAX: usize = 500;

/// Pager configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub cache_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// File-backed page store: block 0 is the store header, every other block
/// is one page. Pages are updated in place; the undo journal captures
/// pre-images so an abort (or a crash before commit) can restore them.
pub struct Pager {
    file: File,
    undo_path: PathBuf,
    header: StoreHeader,
    freelist: FreeList,
    cache: LruCache<PageId, Page>,
    undo: UndoLog,
    needs_rebuild: bool,
    /// Header snapshot from the start of the open transaction.
    tx_header: StoreHeader,
    /// Free-list snapshot from the start of the open transaction.
    tx_freelist: Vec<PageId>,
}

fn undo_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("undo")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Pager {
    /// Create a new database file.
    pub fn create(path: &Path, options: Options) -> Result<Self> {
        debug_assert_eq!(PAGE_SIZE, BLOCK_SIZE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let cache = LruCache::new(
            NonZeroUsize::new(options.cache_capacity.max(1)).expect("nonzero cache capacity"),
        );

        let mut header = StoreHeader::new();
        header.clean = false; // store is open
        header.time = now_secs();

        let up = undo_path(path);
        let undo = UndoLog::create(&up)?;

        let mut pager = Pager {
            file,
            undo_path: up,
            tx_header: header.clone(),
            tx_freelist: Vec::new(),
            header,
            freelist: FreeList::new(),
            cache,
            undo,
            needs_rebuild: false,
        };
        pager.write_header()?;
        pager.file.sync_all()?;
        Ok(pager)
    }

    /// Open an existing database file, rolling back any torn transaction
    /// left in the undo journal.
    pub fn open(path: &Path, options: Options) -> Result<Self> {
        let up = undo_path(path);

        // Roll back pre-images of an interrupted transaction before
        // trusting any page content.
        let frames = UndoLog::read_frames(&up)?;
        if !frames.is_empty() {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            for (page_id, data) in frames.iter().rev() {
                file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
                file.write_all(data.as_ref())?;
            }
            file.sync_all()?;
        }
        undo::truncate_journal_durably(&up)?;

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut block = [0u8; BLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut block)?;
        let mut header = StoreHeader::decode(&block)?;

        let needs_rebuild = !header.clean;
        header.clean = false;

        let cache = LruCache::new(
            NonZeroUsize::new(options.cache_capacity.max(1)).expect("nonzero cache capacity"),
        );
        let undo = UndoLog::create(&up)?;

        let mut pager = Pager {
            file,
            undo_path: up,
            tx_header: header.clone(),
            tx_freelist: Vec::new(),
            header,
            freelist: FreeList::new(),
            cache,
            undo,
            needs_rebuild,
        };

        if pager.header.free != 0 {
            let fl_page = pager.read_page(pager.header.free)?;
            let data = fl_page.cell(0).ok_or(OpalError::FileCorrupted {
                page_id: pager.header.free,
                field: "free list".into(),
            })?;
            pager.freelist = FreeList::deserialize(data);
        }
        pager.tx_freelist = pager.freelist.serialize_ids();

        // Mark the store dirty on disk so a crash without a clean close is
        // detected at the next open.
        pager.write_header()?;
        pager.file.sync_all()?;
        Ok(pager)
    }

    fn write_header(&mut self) -> Result<()> {
        let block = self.header.encode();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&block)?;
        Ok(())
    }

    /// Allocate a new page of the given type for the given index.
    /// The page is not written until the caller writes it.
    pub fn allocate_page(&mut self, index_id: u32, page_type: u8) -> Result<Page> {
        let page_id = if let Some(free_id) = self.freelist.allocate() {
            free_id
        } else {
            let id = self.header.pages;
            self.header.pages += 1;
            id
        };
        if page_id > self.header.max {
            self.header.max = page_id;
        }

        let mut page = Page::new(page_id, page_type);
        page.set_index_id(index_id);
        Ok(page)
    }

    /// Free a page, returning it to the freelist. The current content is
    /// undo-logged so an abort restores the page.
    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if let Ok(page) = self.read_page(page_id) {
            self.undo.log(page_id, page.as_bytes())?;
        }
        self.cache.pop(&page_id);
        self.freelist.free(page_id);
        Ok(())
    }

    /// Read a page (from cache or disk).
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        if page_id == 0 || page_id >= self.header.pages {
            return Err(OpalError::PageNotFound(page_id));
        }
        if let Some(page) = self.cache.get(&page_id) {
            return Ok(page.clone());
        }

        let page = self.read_page_from_disk(page_id)?;
        self.cache.put(page_id, page.clone());
        Ok(page)
    }

    /// Write a page (to cache and disk), stamping the checksum.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let mut page = page.clone();
        page.set_checksum(page.compute_checksum());
        self.write_page_to_disk(&page)?;
        self.cache.put(page.page_id(), page);
        Ok(())
    }

    fn read_page_from_disk(&mut self, page_id: PageId) -> Result<Page> {
        let offset = page_id * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut data = [0u8; PAGE_SIZE];
        self.file.read_exact(&mut data)?;
        let page = Page::from_bytes(data);

        if page.compute_checksum() != page.checksum() {
            return Err(OpalError::FileCorrupted {
                page_id,
                field: "checksum".into(),
            });
        }
        if page.page_id() != page_id {
            return Err(OpalError::FileCorrupted {
                page_id,
                field: "page id".into(),
            });
        }
        Ok(page)
    }

    fn write_page_to_disk(&mut self, page: &Page) -> Result<()> {
        let offset = page.page_id() * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(page.as_bytes())?;
        Ok(())
    }

    /// Record the pre-image of a page about to be modified in place.
    pub fn log_undo(&mut self, page: &Page) -> Result<()> {
        self.undo.log(page.page_id(), page.as_bytes())
    }

    /// Commit the open transaction: persist the free list, flush the
    /// header, fsync, and durably truncate the undo journal.
    pub fn commit(&mut self) -> Result<()> {
        if !self.freelist.is_empty() || self.header.free != 0 {
            if self.header.free == 0 {
                let fl_page = self.allocate_page(0, PAGE_FREE_LIST)?;
                self.header.free = fl_page.page_id();
            }
            let data = self.freelist.serialize_capped(FREELIST_PERSIST_MAX);
            let mut fl_page = Page::new(self.header.free, PAGE_FREE_LIST);
            fl_page.insert_cell(&data)?;
            self.write_page(&fl_page)?;
        }

        self.header.version += 1;
        self.header.time = now_secs();
        self.write_header()?;
        self.file.sync_all()?;
        self.undo.truncate()?;

        self.tx_header = self.header.clone();
        self.tx_freelist = self.freelist.serialize_ids();
        Ok(())
    }

    /// Roll back the open transaction by replaying pre-images in reverse
    /// and restoring the header and free-list snapshots.
    pub fn rollback(&mut self) -> Result<()> {
        for (_, data) in self.undo.take_records_reversed() {
            let page = Page::from_bytes(*data);
            self.write_page(&page)?;
        }
        self.cache.clear();

        let clean = self.header.clean;
        self.header = self.tx_header.clone();
        self.header.clean = clean;
        self.freelist = FreeList::from_ids(self.tx_freelist.clone());

        self.file.sync_all()?;
        self.undo.truncate()?;
        Ok(())
    }

    /// Orderly shutdown: commit, then mark the store clean.
    pub fn close(&mut self) -> Result<()> {
        self.commit()?;
        self.header.clean = true;
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// True when the previous session did not close cleanly; secondary
    /// indexes must be rebuilt from the data index.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn clear_needs_rebuild(&mut self) {
        self.needs_rebuild = false;
    }

    /// Head page of the catalog index.
    pub fn catalog_root(&self) -> PageId {
        self.header.root
    }

    pub fn set_catalog_root(&mut self, root: PageId) {
        self.header.root = root;
    }

    /// Hand out the next index id.
    pub fn next_index_id(&mut self) -> u32 {
        let id = self.header.map;
        self.header.map += 1;
        id
    }

    pub fn page_count(&self) -> u64 {
        self.header.pages
    }

    pub fn undo_journal_path(&self) -> &Path {
        &self.undo_path
    }

    /// Sync file to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl PageStore for Pager {
    fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        Pager::read_page(self, page_id)
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        Pager::write_page(self, page)
    }

    fn allocate_page(&mut self, index_id: u32, page_type: u8) -> Result<Page> {
        Pager::allocate_page(self, index_id, page_type)
    }

    fn free_page(&mut self, page_id: PageId) -> Result<()> {
        Pager::free_page(self, page_id)
    }

    fn log_undo(&mut self, page: &Page) -> Result<()> {
        Pager::log_undo(self, page)
    }
}
