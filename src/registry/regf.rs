//! Windows registry hive (regf) reader
//!
//! The whole hive is held in memory. Cells are addressed relative to the
//! first hive bin at 0x1000; a negative cell size marks an allocated cell.

use std::fmt;
use std::path::Path;

use tracing::{debug, trace};

use crate::common::binary::{le_u16, le_u32, le_u64, utf16le_to_string};

use super::{HiveParser, RegValue};

const REGF_SIGNATURE: &[u8] = b"regf";
const HBIN_START: usize = 0x1000;
const ROOT_CELL_OFFSET: usize = 0x24;

const NK_HEADER_LEN: usize = 76;
const VK_HEADER_LEN: usize = 20;
const KEY_COMP_NAME: u16 = 0x0020;
const VALUE_COMP_NAME: u16 = 0x0001;
const RESIDENT_DATA: u32 = 0x8000_0000;
const BIG_DATA_SEGMENT: usize = 16344;
const MAX_LIST_DEPTH: usize = 8;
const NO_CELL: u32 = u32::MAX;

// Value types
const REG_SZ: u32 = 1;
const REG_EXPAND_SZ: u32 = 2;
const REG_BINARY: u32 = 3;
const REG_DWORD: u32 = 4;
const REG_DWORD_BIG_ENDIAN: u32 = 5;
const REG_MULTI_SZ: u32 = 7;
const REG_QWORD: u32 = 11;

/// Parsed `nk` record
#[derive(Debug, Clone)]
struct KeyNode {
    name: String,
    subkey_count: u32,
    subkey_list: u32,
    value_count: u32,
    value_list: u32,
}

/// An open hive file
pub struct RegfHive {
    data: Vec<u8>,
    root: u32,
}

impl fmt::Debug for RegfHive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegfHive")
            .field("len", &self.data.len())
            .field("root", &self.root)
            .finish()
    }
}

fn compare_names(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

impl RegfHive {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, String> {
        if data.len() < HBIN_START + 32 || !data.starts_with(REGF_SIGNATURE) {
            return Err("Not a registry hive (missing regf signature)".to_string());
        }
        if &data[HBIN_START..HBIN_START + 4] != b"hbin" {
            return Err("First hive bin missing at 0x1000".to_string());
        }
        let root = le_u32(&data, ROOT_CELL_OFFSET);
        let hive = Self { data, root };
        let root_key = hive.key_node(root)?;
        debug!(root = %root_key.name, "Opened registry hive");
        Ok(hive)
    }

    /// Cell payload without the 4-byte size field
    fn cell(&self, offset: u32) -> Result<&[u8], String> {
        if offset == NO_CELL {
            return Err("Null cell reference".to_string());
        }
        let start = HBIN_START + offset as usize;
        let header = self
            .data
            .get(start..start + 4)
            .ok_or_else(|| format!("Cell offset 0x{:x} beyond hive", offset))?;
        let size = i32::from_le_bytes([header[0], header[1], header[2], header[3]]).unsigned_abs() as usize;
        if size < 4 {
            return Err(format!("Cell at 0x{:x} has invalid size {}", offset, size));
        }
        self.data
            .get(start + 4..start + size)
            .ok_or_else(|| format!("Cell at 0x{:x} overruns hive", offset))
    }

    fn key_node(&self, offset: u32) -> Result<KeyNode, String> {
        let nk = self.cell(offset)?;
        if nk.len() < NK_HEADER_LEN || &nk[0..2] != b"nk" {
            return Err(format!("Expected key node at 0x{:x}", offset));
        }
        let flags = le_u16(nk, 2);
        let name_len = le_u16(nk, 72) as usize;
        let raw_name = nk
            .get(NK_HEADER_LEN..NK_HEADER_LEN + name_len)
            .ok_or_else(|| format!("Key name at 0x{:x} truncated", offset))?;
        let name = if flags & KEY_COMP_NAME != 0 {
            latin1(raw_name)
        } else {
            utf16le_to_string(raw_name)
        };
        Ok(KeyNode {
            name,
            subkey_count: le_u32(nk, 20),
            subkey_list: le_u32(nk, 28),
            value_count: le_u32(nk, 36),
            value_list: le_u32(nk, 40),
        })
    }

    /// Key node offsets referenced by a subkey list, following `ri` indirection
    fn subkey_offsets(&self, list: u32, depth: usize, out: &mut Vec<u32>) -> Result<(), String> {
        if depth > MAX_LIST_DEPTH {
            return Err("Subkey index nested too deeply".to_string());
        }
        let cell = self.cell(list)?;
        if cell.len() < 4 {
            return Err(format!("Subkey list at 0x{:x} truncated", list));
        }
        let count = le_u16(cell, 2) as usize;
        match &cell[0..2] {
            b"lf" | b"lh" => {
                out.extend((0..count).map(|i| le_u32(cell, 4 + i * 8)));
            }
            b"li" => {
                out.extend((0..count).map(|i| le_u32(cell, 4 + i * 4)));
            }
            b"ri" => {
                for i in 0..count {
                    self.subkey_offsets(le_u32(cell, 4 + i * 4), depth + 1, out)?;
                }
            }
            other => {
                return Err(format!("Unknown subkey list type {:?} at 0x{:x}", String::from_utf8_lossy(other), list));
            }
        }
        Ok(())
    }

    fn child(&self, parent: &KeyNode, name: &str) -> Result<Option<KeyNode>, String> {
        if parent.subkey_count == 0 || parent.subkey_list == NO_CELL {
            return Ok(None);
        }
        let mut offsets = Vec::with_capacity(parent.subkey_count as usize);
        self.subkey_offsets(parent.subkey_list, 0, &mut offsets)?;
        for offset in offsets {
            match self.key_node(offset) {
                Ok(node) if compare_names(&node.name, name) => return Ok(Some(node)),
                Ok(_) => {}
                Err(e) => debug!(offset, error = %e, "Skipping unreadable subkey"),
            }
        }
        Ok(None)
    }

    /// Key at a backslash-separated path relative to the root key
    fn open_key(&self, path: &str) -> Result<KeyNode, String> {
        let mut key = self.key_node(self.root)?;
        for part in path.split('\\').filter(|p| !p.is_empty()) {
            key = self
                .child(&key, part)?
                .ok_or_else(|| format!("Registry key not found: {}", path))?;
        }
        Ok(key)
    }

    /// Subkey names of the key at `path`
    pub fn subkeys(&self, path: &str) -> Result<Vec<String>, String> {
        let key = self.open_key(path)?;
        if key.subkey_count == 0 || key.subkey_list == NO_CELL {
            return Ok(Vec::new());
        }
        let mut offsets = Vec::new();
        self.subkey_offsets(key.subkey_list, 0, &mut offsets)?;
        Ok(offsets
            .into_iter()
            .filter_map(|offset| self.key_node(offset).ok())
            .map(|node| node.name)
            .collect())
    }

    fn value_data(&self, vk: &[u8]) -> Result<Vec<u8>, String> {
        let raw_size = le_u32(vk, 4);
        let data_offset = le_u32(vk, 8);
        if raw_size & RESIDENT_DATA != 0 {
            let size = ((raw_size & !RESIDENT_DATA) as usize).min(4);
            return Ok(vk[8..8 + size].to_vec());
        }
        let size = raw_size as usize;
        let cell = self.cell(data_offset)?;
        if size > BIG_DATA_SEGMENT && cell.starts_with(b"db") {
            return self.big_data(cell, size);
        }
        cell.get(..size)
            .map(|d| d.to_vec())
            .ok_or_else(|| format!("Value data at 0x{:x} truncated", data_offset))
    }

    /// Data split across `db` segments
    fn big_data(&self, db: &[u8], size: usize) -> Result<Vec<u8>, String> {
        let segments = le_u16(db, 2) as usize;
        let list = self.cell(le_u32(db, 4))?;
        let mut data = Vec::with_capacity(size);
        for i in 0..segments {
            let segment = self.cell(le_u32(list, i * 4))?;
            let take = (size - data.len()).min(BIG_DATA_SEGMENT).min(segment.len());
            data.extend_from_slice(&segment[..take]);
            if data.len() >= size {
                break;
            }
        }
        trace!(segments, bytes = data.len(), "Reassembled big data value");
        Ok(data)
    }

    fn decode(kind: u32, data: Vec<u8>) -> Result<RegValue, String> {
        Ok(match kind {
            REG_SZ | REG_EXPAND_SZ => RegValue::Text(utf16le_to_string(&data)),
            REG_MULTI_SZ => {
                let units: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
                RegValue::MultiText(
                    units
                        .split(|&u| u == 0)
                        .filter(|s| !s.is_empty())
                        .map(String::from_utf16_lossy)
                        .collect(),
                )
            }
            REG_DWORD if data.len() >= 4 => RegValue::Dword(le_u32(&data, 0)),
            REG_DWORD_BIG_ENDIAN if data.len() >= 4 => {
                RegValue::Dword(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            REG_QWORD if data.len() >= 8 => RegValue::Qword(le_u64(&data, 0)),
            REG_DWORD | REG_DWORD_BIG_ENDIAN | REG_QWORD => {
                return Err(format!("Value of type {} has only {} bytes", kind, data.len()));
            }
            REG_BINARY => RegValue::Binary(data),
            other => {
                trace!(kind = other, "Unrecognised value type kept as binary");
                RegValue::Binary(data)
            }
        })
    }
}

impl HiveParser for RegfHive {
    fn open(path: &Path) -> Result<Self, String> {
        let data = std::fs::read(path).map_err(|e| format!("Failed to read hive {}: {}", path.display(), e))?;
        Self::from_bytes(data)
    }

    fn value(&self, key_path: &str, name: &str) -> Result<Option<RegValue>, String> {
        let key = self.open_key(key_path)?;
        if key.value_count == 0 || key.value_list == NO_CELL {
            return Ok(None);
        }
        let list = self.cell(key.value_list)?;
        for i in 0..key.value_count as usize {
            let offset = le_u32(list, i * 4);
            let vk = match self.cell(offset) {
                Ok(vk) if vk.len() >= VK_HEADER_LEN && &vk[0..2] == b"vk" => vk,
                _ => {
                    debug!(offset, "Skipping unreadable value record");
                    continue;
                }
            };
            let name_len = le_u16(vk, 2) as usize;
            let Some(raw_name) = vk.get(VK_HEADER_LEN..VK_HEADER_LEN + name_len) else {
                continue;
            };
            let value_name = if le_u16(vk, 16) & VALUE_COMP_NAME != 0 {
                latin1(raw_name)
            } else {
                utf16le_to_string(raw_name)
            };
            if compare_names(&value_name, name) {
                let decoded = self.value_data(vk).and_then(|data| Self::decode(le_u32(vk, 12), data));
                return match decoded {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        debug!(value = name, error = %e, "Unreadable value data");
                        Ok(None)
                    }
                };
            }
        }
        Ok(None)
    }
}
