//! Row and search-row representations plus the on-page value codec.
//!
//! A `Row` is dense: every table column has a value and the row key is
//! definite. A `SearchRow` is sparse: slots may be absent, which means
//! "unconstrained on this column" to every comparator. `Value::Null` in a
//! slot is a real SQL NULL and is not the same thing as an absent slot.

use rust_decimal::Decimal;

use crate::error::{OpalError, Result};
use crate::types::{Mbr, Value};

/// Dense row: the unit of storage in data-index leaves and the unit
/// returned by cursors.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: i64,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(key: i64, values: Vec<Value>) -> Self {
        Row { key, values }
    }

    pub fn value(&self, column: usize) -> &Value {
        &self.values[column]
    }

    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    pub fn to_search_row(&self) -> SearchRow {
        SearchRow {
            values: self.values.iter().cloned().map(Some).collect(),
            key: Some(self.key),
        }
    }
}

/// Sparse probe row. Absent slots are unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRow {
    pub values: Vec<Option<Value>>,
    pub key: Option<i64>,
}

impl SearchRow {
    pub fn with_columns(column_count: usize) -> Self {
        SearchRow {
            values: vec![None; column_count],
            key: None,
        }
    }

    pub fn value(&self, column: usize) -> Option<&Value> {
        self.values.get(column).and_then(|v| v.as_ref())
    }

    pub fn set_value(&mut self, column: usize, value: Value) {
        if column >= self.values.len() {
            self.values.resize(column + 1, None);
        }
        self.values[column] = Some(value);
    }

    pub fn is_set(&self, column: usize) -> bool {
        self.value(column).is_some()
    }

    /// True when no column slot and no key is constrained.
    pub fn is_unbounded(&self) -> bool {
        self.key.is_none() && self.values.iter().all(|v| v.is_none())
    }
}

// --- varint key encoding ---

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Append a row key as a zigzag LEB128 varint.
pub fn write_varint_key(buf: &mut Vec<u8>, key: i64) {
    let mut v = zigzag(key);
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Read a row key varint, returning (key, bytes consumed).
pub fn read_varint_key(data: &[u8]) -> Result<(i64, usize)> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(OpalError::InvalidPage);
        }
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((unzigzag(v), i + 1));
        }
        shift += 7;
    }
    Err(OpalError::InvalidPage)
}

// --- value codec ---
//
// Cell payload format: u16 value count, null bitmap (1 bit per value),
// then each non-null value as a tag byte plus a typed payload. The tag
// makes the encoding self-describing, which nested ROW values need.

const TAG_INT: u8 = 1;
const TAG_BIGINT: u8 = 2;
const TAG_DECIMAL: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_GEOMETRY: u8 = 6;
const TAG_ROW: u8 = 7;

pub fn serialize_values(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_values(&mut buf, values);
    buf
}

fn write_values(buf: &mut Vec<u8>, values: &[Value]) {
    buf.extend_from_slice(&(values.len() as u16).to_le_bytes());

    let bitmap_bytes = values.len().div_ceil(8);
    let bitmap_start = buf.len();
    buf.resize(buf.len() + bitmap_bytes, 0);
    for (i, val) in values.iter().enumerate() {
        if val.is_null() {
            buf[bitmap_start + i / 8] |= 1 << (i % 8);
        }
    }

    for val in values {
        match val {
            Value::Null => {}
            Value::Int(n) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Value::BigInt(n) => {
                buf.push(TAG_BIGINT);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Value::Decimal(d) => {
                buf.push(TAG_DECIMAL);
                buf.extend_from_slice(&d.mantissa().to_le_bytes());
                buf.extend_from_slice(&d.scale().to_le_bytes());
            }
            Value::Text(s) => {
                buf.push(TAG_TEXT);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(TAG_BYTES);
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
            Value::Geometry(m) => {
                buf.push(TAG_GEOMETRY);
                buf.extend_from_slice(&m.min_x.to_le_bytes());
                buf.extend_from_slice(&m.min_y.to_le_bytes());
                buf.extend_from_slice(&m.max_x.to_le_bytes());
                buf.extend_from_slice(&m.max_y.to_le_bytes());
            }
            Value::Row(vs) => {
                buf.push(TAG_ROW);
                write_values(buf, vs);
            }
        }
    }
}

/// Decode values, returning them together with the number of bytes read.
pub fn deserialize_values(data: &[u8]) -> Result<(Vec<Value>, usize)> {
    let mut offset = 0usize;
    let values = read_values(data, &mut offset)?;
    Ok((values, offset))
}

fn need(data: &[u8], offset: usize, len: usize) -> Result<()> {
    if offset + len > data.len() {
        Err(OpalError::InvalidPage)
    } else {
        Ok(())
    }
}

fn read_values(data: &[u8], offset: &mut usize) -> Result<Vec<Value>> {
    need(data, *offset, 2)?;
    let count = u16::from_le_bytes(data[*offset..*offset + 2].try_into().unwrap()) as usize;
    *offset += 2;

    let bitmap_bytes = count.div_ceil(8);
    need(data, *offset, bitmap_bytes)?;
    let bitmap = data[*offset..*offset + bitmap_bytes].to_vec();
    *offset += bitmap_bytes;

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        need(data, *offset, 1)?;
        let tag = data[*offset];
        *offset += 1;
        match tag {
            TAG_INT => {
                need(data, *offset, 4)?;
                let n = i32::from_le_bytes(data[*offset..*offset + 4].try_into().unwrap());
                *offset += 4;
                values.push(Value::Int(n));
            }
            TAG_BIGINT => {
                need(data, *offset, 8)?;
                let n = i64::from_le_bytes(data[*offset..*offset + 8].try_into().unwrap());
                *offset += 8;
                values.push(Value::BigInt(n));
            }
            TAG_DECIMAL => {
                need(data, *offset, 20)?;
                let mantissa = i128::from_le_bytes(data[*offset..*offset + 16].try_into().unwrap());
                let scale =
                    u32::from_le_bytes(data[*offset + 16..*offset + 20].try_into().unwrap());
                *offset += 20;
                values.push(Value::Decimal(Decimal::from_i128_with_scale(
                    mantissa, scale,
                )));
            }
            TAG_TEXT => {
                need(data, *offset, 4)?;
                let len =
                    u32::from_le_bytes(data[*offset..*offset + 4].try_into().unwrap()) as usize;
                *offset += 4;
                need(data, *offset, len)?;
                let s = String::from_utf8(data[*offset..*offset + len].to_vec())
                    .map_err(|_| OpalError::InvalidPage)?;
                *offset += len;
                values.push(Value::Text(s));
            }
            TAG_BYTES => {
                need(data, *offset, 4)?;
                let len =
                    u32::from_le_bytes(data[*offset..*offset + 4].try_into().unwrap()) as usize;
                *offset += 4;
                need(data, *offset, len)?;
                values.push(Value::Bytes(data[*offset..*offset + len].to_vec()));
                *offset += len;
            }
            TAG_GEOMETRY => {
                need(data, *offset, 32)?;
                let mut coords = [0f64; 4];
                for (j, c) in coords.iter_mut().enumerate() {
                    *c = f64::from_le_bytes(
                        data[*offset + j * 8..*offset + j * 8 + 8].try_into().unwrap(),
                    );
                }
                *offset += 32;
                values.push(Value::Geometry(Mbr::new(
                    coords[0], coords[1], coords[2], coords[3],
                )));
            }
            TAG_ROW => {
                values.push(Value::Row(read_values(data, offset)?));
            }
            _ => return Err(OpalError::InvalidPage),
        }
    }
    Ok(values)
}
