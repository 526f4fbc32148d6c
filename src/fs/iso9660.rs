// ISO9660 reader (primary volume descriptor, level 1-3 names).
// A record's inode is its byte offset in the volume; the root uses 2.

use std::io::{Read, Seek};

use chrono::NaiveDate;
use tracing::debug;

use super::{path_components, DirRef, FileKind, FileMeta, FileSystem, FsType, RawDirEntry};
use crate::common::binary::{le_u16, le_u32, read_bytes_at};

pub const ISO_ROOT_INODE: u64 = 2;

const DESCRIPTOR_START: u64 = 16 * 2048;
const ROOT_RECORD_OFFSET: u64 = 156;
const FLAG_DIRECTORY: u8 = 0x02;

pub struct IsoFilesystem<R> {
    reader: R,
    block_size: u64,
    /// Byte offset of the root directory record inside the PVD
    root_record: u64,
}

struct IsoRecord {
    inode: u64,
    name: Vec<u8>,
    extent: u64,
    size: u64,
    flags: u8,
    recorded: Option<i64>,
}

impl IsoRecord {
    fn is_dir(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    fn meta(&self) -> FileMeta {
        FileMeta {
            inode: self.inode,
            kind: if self.is_dir() { FileKind::Directory } else { FileKind::Regular },
            size: if self.is_dir() { 0 } else { self.size },
            created: self.recorded,
            accessed: None,
            modified: self.recorded,
            changed: None,
        }
    }
}

impl<R: Read + Seek> IsoFilesystem<R> {
    pub fn open(mut reader: R) -> Result<Self, String> {
        // Scan descriptors until the primary one or the set terminator
        for index in 0..32u64 {
            let offset = DESCRIPTOR_START + index * 2048;
            let desc = read_bytes_at(&mut reader, offset, 2048)?;
            if &desc[1..6] != b"CD001" {
                break;
            }
            match desc[0] {
                1 => {
                    let block_size = le_u16(&desc, 128) as u64;
                    if !matches!(block_size, 512 | 1024 | 2048) {
                        return Err(format!("Unsupported ISO9660 block size {}", block_size));
                    }
                    debug!(block_size, "Opened ISO9660 volume");
                    return Ok(Self {
                        reader,
                        block_size,
                        root_record: offset + ROOT_RECORD_OFFSET,
                    });
                }
                255 => break,
                _ => continue,
            }
        }
        Err("No ISO9660 primary volume descriptor".to_string())
    }

    fn record_at(&mut self, offset: u64) -> Result<IsoRecord, String> {
        let head = read_bytes_at(&mut self.reader, offset, 1)?;
        let len = head[0] as usize;
        if len < 34 {
            return Err(format!("No directory record at {}", offset));
        }
        let raw = read_bytes_at(&mut self.reader, offset, len)?;
        parse_record(offset, &raw).ok_or_else(|| format!("Malformed directory record at {}", offset))
    }

    fn directory(&mut self, inode: u64) -> Result<IsoRecord, String> {
        let offset = if inode == ISO_ROOT_INODE { self.root_record } else { inode };
        let mut record = self.record_at(offset)?;
        if !record.is_dir() {
            return Err(format!("Inode {} is not a directory", inode));
        }
        if inode == ISO_ROOT_INODE {
            record.inode = ISO_ROOT_INODE;
        }
        Ok(record)
    }

    fn list(&mut self, inode: u64) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        let dir = self.directory(inode)?;
        let start = dir.extent * self.block_size;
        let data = read_bytes_at(&mut self.reader, start, dir.size as usize)?;

        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let len = data[pos] as usize;
            if len == 0 {
                // Records never cross a block; padding runs to the next one
                pos = (pos / self.block_size as usize + 1) * self.block_size as usize;
                continue;
            }
            let Some(raw) = data.get(pos..pos + len) else {
                out.push(Err(format!("Directory record at {} runs past its extent", start + pos as u64)));
                break;
            };
            out.push(
                parse_record(start + pos as u64, raw)
                    .map(|r| RawDirEntry { meta: r.meta(), name: r.name })
                    .ok_or_else(|| format!("Malformed directory record at {}", start + pos as u64)),
            );
            pos += len;
        }
        Ok(out)
    }

    fn resolve(&mut self, path: &str) -> Result<u64, String> {
        let mut current = ISO_ROOT_INODE;
        for part in path_components(path) {
            current = self
                .list(current)?
                .into_iter()
                .flatten()
                .find(|e| String::from_utf8_lossy(&e.name).eq_ignore_ascii_case(part))
                .map(|e| e.meta.inode)
                .ok_or_else(|| format!("'{}' not found", part))?;
        }
        Ok(current)
    }
}

fn parse_record(offset: u64, raw: &[u8]) -> Option<IsoRecord> {
    let name_len = *raw.get(32)? as usize;
    let ident = raw.get(33..33 + name_len)?;
    let name = match ident {
        [0] => b".".to_vec(),
        [1] => b"..".to_vec(),
        _ => clean_identifier(ident),
    };
    Some(IsoRecord {
        inode: offset,
        name,
        extent: le_u32(raw, 2) as u64,
        size: le_u32(raw, 10) as u64,
        flags: *raw.get(25)?,
        recorded: record_time(raw.get(18..25)?),
    })
}

/// Drop the ";1" version suffix and a bare trailing dot
fn clean_identifier(ident: &[u8]) -> Vec<u8> {
    let mut name = match ident.iter().rposition(|&b| b == b';') {
        Some(i) => &ident[..i],
        None => ident,
    };
    if name.len() > 1 && name.ends_with(b".") {
        name = &name[..name.len() - 1];
    }
    name.to_vec()
}

/// 7-byte recording date; the last byte is the GMT offset in 15 minute steps
fn record_time(t: &[u8]) -> Option<i64> {
    if t.iter().all(|&b| b == 0) {
        return None;
    }
    let local = NaiveDate::from_ymd_opt(1900 + t[0] as i32, t[1] as u32, t[2] as u32)?
        .and_hms_opt(t[3] as u32, t[4] as u32, t[5] as u32)?
        .and_utc()
        .timestamp();
    Some(local - (t[6] as i8) as i64 * 15 * 60)
}

impl<R: Read + Seek + Send> FileSystem for IsoFilesystem<R> {
    fn fs_type(&self) -> FsType {
        FsType::Iso9660
    }

    fn root_inode(&self) -> u64 {
        ISO_ROOT_INODE
    }

    fn read_dir(&mut self, dir: DirRef<'_>) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        let inode = match dir {
            DirRef::Path(path) => self.resolve(path)?,
            DirRef::Inode(inode) => inode,
        };
        self.list(inode)
    }

    fn lookup(&mut self, path: &str) -> Result<FileMeta, String> {
        let inode = self.resolve(path)?;
        self.stat(inode)
    }

    fn stat(&mut self, inode: u64) -> Result<FileMeta, String> {
        if inode == ISO_ROOT_INODE {
            return Ok(self.directory(inode)?.meta());
        }
        Ok(self.record_at(inode)?.meta())
    }

    fn read_at(&mut self, inode: u64, offset: u64, len: usize) -> Result<Vec<u8>, String> {
        let record = self.record_at(inode)?;
        if record.is_dir() {
            return Err(format!("Inode {} is a directory", inode));
        }
        if offset >= record.size || len == 0 {
            return Ok(Vec::new());
        }
        let take = (record.size - offset).min(len as u64) as usize;
        read_bytes_at(&mut self.reader, record.extent * self.block_size + offset, take)
    }
}
