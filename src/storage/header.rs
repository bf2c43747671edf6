//! Store file header block.
//!
//! The first 4096-byte block of the database file carries a text header and
//! a checksummed footer; pages start at the next block.
//!
//! Header (bytes 0..1024): a newline-terminated ISO-8859-1 small-map of
//! `key:value` pairs (`chunk, block, len, pages, map, max, root, time,
//! version, free, clean`), space-padded to 1024 bytes.
//!
//! Footer (last 128 bytes of the block): `chunk, block, version, fletcher`
//! where `fletcher` is the Fletcher-32 checksum of the padded header text,
//! space-padded and newline-terminated.

use crate::error::{OpalError, Result};

pub const BLOCK_SIZE: usize = 4096;
pub const HEADER_MAX: usize = 1024;
pub const FOOTER_SIZE: usize = 128;

/// Fletcher-32 over the given bytes (odd trailing byte zero-padded).
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut s1: u32 = 0xffff;
    let mut s2: u32 = 0xffff;
    let mut i = 0;
    let len = data.len();
    while i < len {
        // 359 words per round keeps the sums below u32 overflow
        let block_end = (i + 718).min(len);
        while i < block_end {
            let hi = data[i] as u32;
            let lo = if i + 1 < len { data[i + 1] as u32 } else { 0 };
            s1 = s1.wrapping_add((hi << 8) | lo);
            s2 = s2.wrapping_add(s1);
            i += 2;
        }
        s1 = (s1 & 0xffff) + (s1 >> 16);
        s2 = (s2 & 0xffff) + (s2 >> 16);
    }
    s1 = (s1 & 0xffff) + (s1 >> 16);
    s2 = (s2 & 0xffff) + (s2 >> 16);
    (s2 << 16) | s1
}

/// Parsed store header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    /// Block size in bytes.
    pub block: u32,
    /// Total page count (including the header block as page 0).
    pub pages: u64,
    /// Next index id to assign.
    pub map: u32,
    /// Largest page id ever used.
    pub max: u64,
    /// Head page of the catalog (meta) index.
    pub root: u64,
    /// Wall-clock write time, seconds since the epoch.
    pub time: u64,
    /// Header version, incremented on every flush.
    pub version: u64,
    /// Free-list page id, 0 if none.
    pub free: u64,
    /// Consistent-shutdown flag; cleared while the store is open.
    pub clean: bool,
}

impl StoreHeader {
    pub fn new() -> Self {
        StoreHeader {
            block: BLOCK_SIZE as u32,
            pages: 1,
            map: 1,
            max: 0,
            root: 0,
            time: 0,
            version: 0,
            free: 0,
            clean: true,
        }
    }

    /// Encode header text + footer into one store block.
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [b' '; BLOCK_SIZE];

        // len is the unpadded line length; fixed width so the second
        // formatting pass cannot change it.
        let line = |len: usize| {
            format!(
                "chunk:0,block:{},len:{:04},pages:{},map:{},max:{},root:{},time:{},version:{},free:{},clean:{}\n",
                self.block,
                len,
                self.pages,
                self.map,
                self.max,
                self.root,
                self.time,
                self.version,
                self.free,
                if self.clean { 1 } else { 0 }
            )
        };
        let probe = line(0);
        let text = line(probe.len());
        debug_assert!(text.len() <= HEADER_MAX);
        block[..text.len()].copy_from_slice(text.as_bytes());
        block[HEADER_MAX - 1] = b'\n';

        let sum = fletcher32(&block[..HEADER_MAX]);
        let footer = format!(
            "chunk:0,block:{},version:{},fletcher:{:08x}\n",
            self.block, self.version, sum
        );
        let footer_start = BLOCK_SIZE - FOOTER_SIZE;
        block[footer_start..footer_start + footer.len()].copy_from_slice(footer.as_bytes());
        block[BLOCK_SIZE - 1] = b'\n';
        block
    }

    /// Decode and verify one store block.
    pub fn decode(block: &[u8]) -> Result<StoreHeader> {
        if block.len() < BLOCK_SIZE {
            return Err(OpalError::FileCorrupted {
                page_id: 0,
                field: "header block truncated".into(),
            });
        }

        let footer = parse_small_map(&block[BLOCK_SIZE - FOOTER_SIZE..])?;
        let stored_sum = footer
            .iter()
            .find(|(k, _)| k == "fletcher")
            .and_then(|(_, v)| u32::from_str_radix(v, 16).ok())
            .ok_or_else(|| OpalError::FileCorrupted {
                page_id: 0,
                field: "fletcher".into(),
            })?;
        let actual = fletcher32(&block[..HEADER_MAX]);
        if stored_sum != actual {
            return Err(OpalError::FileCorrupted {
                page_id: 0,
                field: "fletcher".into(),
            });
        }

        let map = parse_small_map(&block[..HEADER_MAX])?;
        let get = |key: &str| -> Result<u64> {
            map.iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| v.parse::<u64>().ok())
                .ok_or_else(|| OpalError::FileCorrupted {
                    page_id: 0,
                    field: key.to_string(),
                })
        };

        Ok(StoreHeader {
            block: get("block")? as u32,
            pages: get("pages")?,
            map: get("map")? as u32,
            max: get("max")?,
            root: get("root")?,
            time: get("time")?,
            version: get("version")?,
            free: get("free")?,
            clean: get("clean")? != 0,
        })
    }
}

impl Default for StoreHeader {
    fn default() -> Self {
        StoreHeader::new()
    }
}

/// Parse a `key:value,key:value` line, stopping at the first newline.
fn parse_small_map(data: &[u8]) -> Result<Vec<(String, String)>> {
    let end = data
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(OpalError::FileCorrupted {
            page_id: 0,
            field: "header line terminator".into(),
        })?;
    let line: String = data[..end].iter().map(|&b| b as char).collect();
    let mut pairs = Vec::new();
    for part in line.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        let (k, v) = part.split_once(':').ok_or_else(|| OpalError::FileCorrupted {
            page_id: 0,
            field: format!("header entry '{}'", part),
        })?;
        pairs.push((k.to_string(), v.to_string()));
    }
    Ok(pairs)
}
