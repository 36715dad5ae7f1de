//src/store.rs

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;

use crate::error::{BlastaxError, Result};

/// File type code for mapping store files.
pub const STORE_FILE_TYPE: &[u8; 8] = b"TAXMAP01";

/// Byte length of the fixed store header: signature, record count,
/// offset-array position.
const HEADER_LEN: usize = 24;

/// Narrow lookup capability the assignment engine depends on. Any backing
/// map can be injected behind it; the on-disk `MapStore` is the production
/// implementation and a plain hash map serves in tests.
pub trait KvLookup: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl KvLookup for ahash::AHashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        // deref to the inner std HashMap's inherent `get`
        (**self).get(key).cloned()
    }
}

/// A read-only, binary, sorted-record mapping store.
///
/// Layout:
/// ```text
/// [0..8)   signature "TAXMAP01"
/// [8..16)  u64 LE record count
/// [16..24) u64 LE byte offset of the offset array
/// [24..)   records: u32 LE key_len, u32 LE val_len, key bytes, val bytes
///          (sorted by key), then `count` u64 LE record offsets
/// ```
#[derive(Clone)]
pub struct MapStore {
    /// Entire store file loaded in memory, shared across workers.
    data: Arc<[u8]>,
    /// Byte offset of each record, in key order.
    offsets: Arc<[u64]>,
}

impl MapStore {
    /// Opens a store file, reads it fully into memory, validates the
    /// signature, and parses the offset array.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read(path)?;

        if buf.len() < HEADER_LEN {
            return Err(BlastaxError::StoreFormat(format!(
                "{} too small to be a valid mapping store",
                path.display()
            )));
        }
        if &buf[..8] != STORE_FILE_TYPE {
            return Err(BlastaxError::StoreFormat(format!(
                "{} is not a mapping store (bad signature)",
                path.display()
            )));
        }

        let count = read_u64_le(&buf[8..16]) as usize;
        let index_offset = read_u64_le(&buf[16..24]) as usize;

        let index_end = index_offset
            .checked_add(count.checked_mul(8).ok_or_else(|| {
                BlastaxError::StoreFormat("overflow in offset array size".to_string())
            })?)
            .ok_or_else(|| BlastaxError::StoreFormat("overflow in offset array end".to_string()))?;
        if index_end > buf.len() {
            return Err(BlastaxError::StoreFormat(format!(
                "{} truncated: offset array extends past EOF",
                path.display()
            )));
        }

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let start = index_offset + i * 8;
            offsets.push(read_u64_le(&buf[start..start + 8]));
        }

        log::info!("Opened store {} with {} records", path.display(), count);

        Ok(MapStore {
            data: Arc::from(buf),
            offsets: Arc::from(offsets),
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Returns the `(key, value)` byte slices of record `i`, or `None` when
    /// the record is out of bounds (corrupt/truncated file).
    fn record_at(&self, i: usize) -> Option<(&[u8], &[u8])> {
        let off = *self.offsets.get(i)? as usize;
        if off + 8 > self.data.len() {
            return None;
        }
        let key_len = read_u32_le(&self.data[off..off + 4]) as usize;
        let val_len = read_u32_le(&self.data[off + 4..off + 8]) as usize;
        let key_start = off + 8;
        let val_end = key_start.checked_add(key_len)?.checked_add(val_len)?;
        if val_end > self.data.len() {
            return None;
        }
        Some((
            &self.data[key_start..key_start + key_len],
            &self.data[key_start + key_len..val_end],
        ))
    }

    /// Binary search for `key` among the sorted records.
    fn lookup(&self, key: &[u8]) -> Option<String> {
        let mut left = 0i64;
        let mut right = self.offsets.len() as i64 - 1;

        while left <= right {
            let mid = (left + right) / 2;
            let (rec_key, rec_val) = self.record_at(mid as usize)?;
            match key.cmp(rec_key) {
                std::cmp::Ordering::Greater => left = mid + 1,
                std::cmp::Ordering::Less => right = mid - 1,
                std::cmp::Ordering::Equal => {
                    return String::from_utf8(rec_val.to_vec()).ok();
                }
            }
        }
        None
    }
}

impl KvLookup for MapStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lookup(key.as_bytes())
    }
}

/// Bulk-loads a delimited mapping file into a store file. `key_col` and
/// `val_col` select the tab-separated columns; lines with too few columns
/// are skipped. Input may be gzip-compressed (`.gz`). Duplicate keys keep
/// their first occurrence. Returns the number of records written.
pub fn build_store<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    key_col: usize,
    val_col: usize,
) -> Result<u64> {
    let input = input.as_ref();
    let file = File::open(input)?;

    let is_gz = input
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);
    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let needed = key_col.max(val_col);
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut skipped = 0u64;

    for line in reader.lines() {
        let line = line?;
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() <= needed {
            skipped += 1;
            continue;
        }
        let key = fields[key_col].trim();
        let val = fields[val_col].trim();
        if key.is_empty() || val.is_empty() {
            skipped += 1;
            continue;
        }
        entries.push((key.to_string(), val.to_string()));
    }

    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    entries.dedup_by(|a, b| a.0 == b.0);

    if skipped > 0 {
        log::debug!("build_store: skipped {} malformed lines in {}", skipped, input.display());
    }

    // Record section starts right after the header; the offset array follows
    // the last record.
    let mut index_offset = HEADER_LEN as u64;
    for (key, val) in &entries {
        index_offset += 8 + key.len() as u64 + val.len() as u64;
    }

    let mut writer = BufWriter::new(File::create(output)?);
    writer.write_all(STORE_FILE_TYPE)?;
    writer.write_all(&(entries.len() as u64).to_le_bytes())?;
    writer.write_all(&index_offset.to_le_bytes())?;

    let mut offsets = Vec::with_capacity(entries.len());
    let mut pos = HEADER_LEN as u64;
    for (key, val) in &entries {
        offsets.push(pos);
        writer.write_all(&(key.len() as u32).to_le_bytes())?;
        writer.write_all(&(val.len() as u32).to_le_bytes())?;
        writer.write_all(key.as_bytes())?;
        writer.write_all(val.as_bytes())?;
        pos += 8 + key.len() as u64 + val.len() as u64;
    }
    for off in &offsets {
        writer.write_all(&off.to_le_bytes())?;
    }
    writer.flush()?;

    log::info!("Built store with {} records", entries.len());
    Ok(entries.len() as u64)
}

/// Reads a `u64` from a little-endian byte slice.
fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    u64::from_le_bytes(arr)
}

/// Reads a `u32` from a little-endian byte slice.
fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    u32::from_le_bytes(arr)
}
