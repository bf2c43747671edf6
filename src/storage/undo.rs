//! Undo journal: page pre-images for in-place update atomicity.
//!
//! Before the first in-place modification of a page inside a transaction
//! the pager appends the page's pre-image here. Commit truncates the
//! journal durably; abort replays the pre-images in reverse. On open, a
//! non-empty journal means the previous process died mid-transaction: the
//! surviving records are replayed in reverse, rolling the store back to
//! the last committed state.
//!
//! Framing on disk:
//!   [frame_len: u32] [page_id: u64] [page bytes] [crc32: u32]
//!
//! A torn tail (short frame or CRC mismatch) ends the replay; everything
//! before it is still applied.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{OpalError, Result};
use crate::storage::page::{PageId, PAGE_SIZE};

/// CRC32 for record integrity (corruption detection, not cryptographic).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

pub struct UndoLog {
    file: File,
    /// Pages with a pre-image already captured in the current transaction.
    logged: HashSet<PageId>,
    /// In-memory copy of the journal for in-process rollback.
    records: Vec<(PageId, Box<[u8; PAGE_SIZE]>)>,
}

impl UndoLog {
    /// Create (truncating) the journal file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(UndoLog {
            file,
            logged: HashSet::new(),
            records: Vec::new(),
        })
    }

    /// Read all intact pre-image frames from an existing journal.
    /// Returns them in append order; the caller applies them in reverse.
    pub fn read_frames(path: &Path) -> Result<Vec<(PageId, Box<[u8; PAGE_SIZE]>)>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut frames = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let frame_len = u32::from_le_bytes(len_buf) as usize;
            if frame_len != 8 + PAGE_SIZE {
                break; // torn or foreign tail
            }
            let mut payload = vec![0u8; frame_len];
            let mut crc_buf = [0u8; 4];
            if file.read_exact(&mut payload).is_err() || file.read_exact(&mut crc_buf).is_err() {
                break;
            }
            if crc32(&payload) != u32::from_le_bytes(crc_buf) {
                break;
            }
            let page_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
            let mut data = Box::new([0u8; PAGE_SIZE]);
            data.copy_from_slice(&payload[8..]);
            frames.push((page_id, data));
        }
        Ok(frames)
    }

    /// Record a pre-image, once per page per transaction.
    /// The frame is synced so it reaches disk before the page overwrite.
    pub fn log(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if !self.logged.insert(page_id) {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(8 + PAGE_SIZE);
        payload.extend_from_slice(&page_id.to_le_bytes());
        payload.extend_from_slice(data);
        let crc = crc32(&payload);

        self.file
            .write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.sync_data()?;

        self.records.push((page_id, Box::new(*data)));
        Ok(())
    }

    pub fn is_page_logged(&self, page_id: PageId) -> bool {
        self.logged.contains(&page_id)
    }

    /// Pre-images of the current transaction, newest first.
    pub fn take_records_reversed(&mut self) -> Vec<(PageId, Box<[u8; PAGE_SIZE]>)> {
        let mut records = std::mem::take(&mut self.records);
        self.logged.clear();
        records.reverse();
        records
    }

    /// Durably discard the journal (transaction committed).
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        self.logged.clear();
        self.records.clear();
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Truncate a journal file on disk and fsync so the truncation is durable.
pub fn truncate_journal_durably(path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    file.sync_all()?;

    // Best-effort directory fsync to persist metadata updates.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

impl std::fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLog")
            .field("records", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_once_per_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.undo");
        let mut undo = UndoLog::create(&path).unwrap();

        let data = [0xAAu8; PAGE_SIZE];
        undo.log(5, &data).unwrap();
        undo.log(5, &[0xBBu8; PAGE_SIZE]).unwrap(); // ignored, already logged
        undo.log(6, &data).unwrap();
        assert_eq!(undo.record_count(), 2);
    }

    #[test]
    fn test_read_frames_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.undo");
        {
            let mut undo = UndoLog::create(&path).unwrap();
            undo.log(1, &[0x11u8; PAGE_SIZE]).unwrap();
            undo.log(2, &[0x22u8; PAGE_SIZE]).unwrap();
        }
        let frames = UndoLog::read_frames(&path).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 1);
        assert_eq!(frames[1].0, 2);
        assert_eq!(frames[0].1[0], 0x11);
    }

    #[test]
    fn test_torn_tail_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.undo");
        {
            let mut undo = UndoLog::create(&path).unwrap();
            undo.log(1, &[0x11u8; PAGE_SIZE]).unwrap();
            undo.log(2, &[0x22u8; PAGE_SIZE]).unwrap();
        }
        // Chop bytes off the second frame.
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 100).unwrap();

        let frames = UndoLog::read_frames(&path).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 1);
    }

    #[test]
    fn test_truncate_clears_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.undo");
        let mut undo = UndoLog::create(&path).unwrap();
        undo.log(1, &[0u8; PAGE_SIZE]).unwrap();
        undo.truncate().unwrap();
        assert_eq!(undo.record_count(), 0);
        assert!(UndoLog::read_frames(&path).unwrap().is_empty());
        // The same page can be logged again in the next transaction.
        undo.log(1, &[1u8; PAGE_SIZE]).unwrap();
        assert_eq!(undo.record_count(), 1);
    }
}
