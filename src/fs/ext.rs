// ext2/ext3/ext4 reader: superblock, group descriptors, inode table,
// extent trees and classic direct/indirect block maps.

use std::io::{Read, Seek};

use tracing::{debug, trace};

use super::{path_components, DirRef, FileKind, FileMeta, FileSystem, FsType, RawDirEntry};
use crate::common::binary::{le_u16, le_u32, read_bytes_at};

pub const EXT_ROOT_INODE: u64 = 2;

const SUPERBLOCK_OFFSET: u64 = 0x400;
const INCOMPAT_64BIT: u32 = 0x80;
const EXTENTS_FL: u32 = 0x0008_0000;
const INLINE_DATA_FL: u32 = 0x1000_0000;
const EXTENT_MAGIC: u16 = 0xF30A;
/// Extents longer than this are uninitialized and read as zeros
const EXTENT_INIT_MAX_LEN: u64 = 32768;

/// Directories whose allocated blocks exceed this are treated as corrupt
const MAX_DIR_BYTES: u64 = 64 * 1024 * 1024;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;

pub struct ExtFilesystem<R> {
    reader: R,
    fs_type: FsType,
    block_size: u64,
    inodes_count: u64,
    inodes_per_group: u64,
    inode_size: u64,
    desc_size: u64,
    is_64bit: bool,
    /// Block map of the inode read last; chunked reads hit it repeatedly
    cached_runs: Option<(u64, Vec<BlockRun>)>,
}

/// The fields of an on-disk inode this reader needs
struct ExtInode {
    number: u64,
    mode: u16,
    size: u64,
    flags: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    crtime: Option<u32>,
    i_block: [u8; 60],
}

impl ExtInode {
    fn kind(&self) -> FileKind {
        match self.mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFREG => FileKind::Regular,
            _ => FileKind::Other,
        }
    }

    fn meta(&self) -> FileMeta {
        let ts = |t: u32| if t == 0 { None } else { Some(t as i64) };
        FileMeta {
            inode: self.number,
            kind: self.kind(),
            size: if self.kind() == FileKind::Directory { 0 } else { self.size },
            created: self.crtime.and_then(ts),
            accessed: ts(self.atime),
            modified: ts(self.mtime),
            changed: ts(self.ctime),
        }
    }
}

/// Contiguous mapping of logical file blocks to physical blocks
#[derive(Debug, Clone, Copy)]
struct BlockRun {
    logical: u64,
    physical: u64,
    len: u64,
    /// Allocated but never written; reads as zeros
    unwritten: bool,
}

impl<R: Read + Seek> ExtFilesystem<R> {
    pub fn open(mut reader: R, fs_type: FsType) -> Result<Self, String> {
        let sb = read_bytes_at(&mut reader, SUPERBLOCK_OFFSET, 1024)?;
        if le_u16(&sb, 56) != 0xEF53 {
            return Err("Missing ext superblock magic".to_string());
        }

        let log_block_size = le_u32(&sb, 24);
        if log_block_size > 6 {
            return Err(format!("Implausible ext block size shift {}", log_block_size));
        }
        let block_size = 1024u64 << log_block_size;
        let inodes_per_group = le_u32(&sb, 40) as u64;
        if inodes_per_group == 0 {
            return Err("ext superblock has zero inodes per group".to_string());
        }
        let inode_size = if le_u32(&sb, 76) == 0 { 128 } else { le_u16(&sb, 88) as u64 };
        let is_64bit = le_u32(&sb, 96) & INCOMPAT_64BIT != 0;
        let desc_size = match le_u16(&sb, 0xFE) as u64 {
            n if is_64bit && n >= 64 => n,
            _ => 32,
        };

        debug!(fs = fs_type.name(), block_size, inode_size, "Opened ext volume");
        Ok(Self {
            reader,
            fs_type,
            block_size,
            inodes_count: le_u32(&sb, 0) as u64,
            inodes_per_group,
            inode_size: inode_size.max(128),
            desc_size,
            is_64bit,
            cached_runs: None,
        })
    }

    /// Group descriptor table follows the superblock's block
    fn group_desc_offset(&self) -> u64 {
        if self.block_size == 1024 { 2048 } else { self.block_size }
    }

    /// Byte address of `within` bytes into `block`
    fn block_offset(&self, block: u64, within: u64) -> Result<u64, String> {
        block
            .checked_mul(self.block_size)
            .and_then(|b| b.checked_add(within))
            .ok_or_else(|| format!("Block {} out of range", block))
    }

    fn read_block(&mut self, block: u64) -> Result<Vec<u8>, String> {
        let offset = self.block_offset(block, 0)?;
        read_bytes_at(&mut self.reader, offset, self.block_size as usize)
    }

    fn read_inode(&mut self, number: u64) -> Result<ExtInode, String> {
        if number == 0 || number > self.inodes_count {
            return Err(format!("Inode {} out of range", number));
        }
        let group = (number - 1) / self.inodes_per_group;
        let index = (number - 1) % self.inodes_per_group;

        let desc_offset = self.group_desc_offset() + group * self.desc_size;
        let desc = read_bytes_at(&mut self.reader, desc_offset, self.desc_size as usize)?;
        let mut table = le_u32(&desc, 8) as u64;
        if self.is_64bit && self.desc_size >= 64 {
            table |= (le_u32(&desc, 0x28) as u64) << 32;
        }

        let inode_offset = self.block_offset(table, index * self.inode_size)?;
        let raw = read_bytes_at(&mut self.reader, inode_offset, self.inode_size as usize)?;

        let mut i_block = [0u8; 60];
        i_block.copy_from_slice(&raw[40..100]);
        let extra_isize = if self.inode_size > 128 { le_u16(&raw, 128) as u64 } else { 0 };
        let crtime = (extra_isize >= 24).then(|| le_u32(&raw, 144));

        Ok(ExtInode {
            number,
            mode: le_u16(&raw, 0),
            size: le_u32(&raw, 4) as u64 | (le_u32(&raw, 108) as u64) << 32,
            flags: le_u32(&raw, 32),
            atime: le_u32(&raw, 8),
            ctime: le_u32(&raw, 12),
            mtime: le_u32(&raw, 16),
            crtime,
            i_block,
        })
    }

    /// Block map of `inode`, sorted by logical block, up to the block holding its last byte
    fn block_runs(&mut self, inode: &ExtInode) -> Result<Vec<BlockRun>, String> {
        let limit = inode.size.div_ceil(self.block_size);
        let mut runs = Vec::new();
        if inode.flags & EXTENTS_FL != 0 {
            self.extent_node(&inode.i_block, 8, limit, &mut runs)?;
        } else {
            let mut logical = 0u64;
            for i in 0..12 {
                let block = le_u32(&inode.i_block, i * 4) as u64;
                if block != 0 && logical < limit {
                    runs.push(BlockRun { logical, physical: block, len: 1, unwritten: false });
                }
                logical += 1;
            }
            for level in 1..=3u32 {
                let block = le_u32(&inode.i_block, (11 + level as usize) * 4) as u64;
                self.indirect(block, level, limit, &mut logical, &mut runs)?;
            }
        }
        runs.sort_by_key(|r| r.logical);
        Ok(runs)
    }

    /// Cached block map for `inode`; hand it back with [`Self::keep_runs`]
    fn take_runs(&mut self, inode: &ExtInode) -> Result<Vec<BlockRun>, String> {
        match self.cached_runs.take() {
            Some((number, runs)) if number == inode.number => Ok(runs),
            _ => self.block_runs(inode),
        }
    }

    fn keep_runs(&mut self, inode: &ExtInode, runs: Vec<BlockRun>) {
        self.cached_runs = Some((inode.number, runs));
    }

    /// Walk one extent node; `depth_budget` bounds recursion on corrupt trees
    fn extent_node(&mut self, node: &[u8], depth_budget: u32, limit: u64, runs: &mut Vec<BlockRun>) -> Result<(), String> {
        if le_u16(node, 0) != EXTENT_MAGIC {
            return Err("Invalid extent header".to_string());
        }
        let entries = le_u16(node, 2) as usize;
        let depth = le_u16(node, 6);

        for i in 0..entries {
            let e = 12 + i * 12;
            if e + 12 > node.len() {
                break;
            }
            if le_u32(node, e) as u64 >= limit {
                continue;
            }
            if depth == 0 {
                let raw_len = le_u16(node, e + 4) as u64;
                let (len, unwritten) = if raw_len > EXTENT_INIT_MAX_LEN {
                    (raw_len - EXTENT_INIT_MAX_LEN, true)
                } else {
                    (raw_len, false)
                };
                runs.push(BlockRun {
                    logical: le_u32(node, e) as u64,
                    physical: (le_u16(node, e + 6) as u64) << 32 | le_u32(node, e + 8) as u64,
                    len,
                    unwritten,
                });
            } else {
                if depth_budget == 0 {
                    return Err("Extent tree too deep".to_string());
                }
                let leaf = (le_u16(node, e + 8) as u64) << 32 | le_u32(node, e + 4) as u64;
                let child = self.read_block(leaf)?;
                self.extent_node(&child, depth_budget - 1, limit, runs)?;
            }
        }
        Ok(())
    }

    /// Collect an indirect block map; holes advance `logical` by the subtree span
    fn indirect(
        &mut self,
        block: u64,
        level: u32,
        limit: u64,
        logical: &mut u64,
        runs: &mut Vec<BlockRun>,
    ) -> Result<(), String> {
        let per_block = self.block_size / 4;
        if block == 0 || *logical >= limit {
            *logical += per_block.pow(level);
            return Ok(());
        }
        let pointers = self.read_block(block)?;
        for i in 0..per_block as usize {
            let ptr = le_u32(&pointers, i * 4) as u64;
            if level == 1 {
                if ptr != 0 && *logical < limit {
                    runs.push(BlockRun { logical: *logical, physical: ptr, len: 1, unwritten: false });
                }
                *logical += 1;
            } else {
                self.indirect(ptr, level - 1, limit, logical, runs)?;
            }
        }
        Ok(())
    }

    fn read_content(&mut self, inode: &ExtInode, offset: u64, len: usize) -> Result<Vec<u8>, String> {
        if offset >= inode.size || len == 0 {
            return Ok(Vec::new());
        }
        let end = inode.size.min(offset.saturating_add(len as u64));

        // Inline data and fast symlinks keep their bytes in i_block
        let fast_symlink = inode.kind() == FileKind::Other && inode.size < 60 && inode.flags & EXTENTS_FL == 0;
        if inode.flags & INLINE_DATA_FL != 0 || fast_symlink {
            let stop = (end as usize).min(inode.i_block.len());
            return Ok(inode.i_block[(offset as usize).min(stop)..stop].to_vec());
        }

        let runs = self.take_runs(inode)?;
        let copied = self.copy_runs(&runs, offset, end);
        self.keep_runs(inode, runs);
        copied
    }

    fn copy_runs(&mut self, runs: &[BlockRun], offset: u64, end: u64) -> Result<Vec<u8>, String> {
        let mut out = Vec::new();
        let mut position = offset;
        let mut next = runs.partition_point(|r| r.logical.saturating_add(r.len) <= offset / self.block_size);
        while position < end {
            let logical = position / self.block_size;
            let within = position % self.block_size;
            let take = (self.block_size - within).min(end - position);

            while next < runs.len() && runs[next].logical.saturating_add(runs[next].len) <= logical {
                next += 1;
            }
            match runs.get(next).filter(|r| r.logical <= logical) {
                Some(run) if !run.unwritten => {
                    let physical = run.physical.saturating_add(logical - run.logical);
                    let at = self.block_offset(physical, within)?;
                    let data = read_bytes_at(&mut self.reader, at, take as usize)?;
                    out.extend_from_slice(&data);
                }
                _ => out.resize(out.len() + take as usize, 0),
            }
            position += take;
        }
        Ok(out)
    }

    /// Directory length clamped to the blocks its map actually covers
    fn directory_len(&mut self, inode: &ExtInode) -> Result<usize, String> {
        if inode.flags & INLINE_DATA_FL != 0 {
            return Ok(inode.size.min(inode.i_block.len() as u64) as usize);
        }
        let runs = self.take_runs(inode)?;
        let covered = runs
            .iter()
            .map(|r| r.logical.saturating_add(r.len))
            .max()
            .unwrap_or(0)
            .saturating_mul(self.block_size);
        self.keep_runs(inode, runs);

        let len = inode.size.min(covered);
        if len > MAX_DIR_BYTES {
            return Err(format!("Directory inode {} claims {} bytes", inode.number, len));
        }
        Ok(len as usize)
    }

    fn list(&mut self, number: u64) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        let inode = self.read_inode(number)?;
        if inode.kind() != FileKind::Directory {
            return Err(format!("Inode {} is not a directory", number));
        }
        let len = self.directory_len(&inode)?;
        let data = self.read_content(&inode, 0, len)?;

        let mut found = Vec::new();
        let mut offset = 0usize;
        while offset + 8 <= data.len() {
            let child = le_u32(&data, offset) as u64;
            let rec_len = le_u16(&data, offset + 4) as usize;
            let name_len = data[offset + 6] as usize;
            if rec_len < 8 || offset + rec_len > data.len() {
                break;
            }
            if child != 0 && 8 + name_len <= rec_len {
                found.push((data[offset + 8..offset + 8 + name_len].to_vec(), child));
            }
            offset += rec_len;
        }
        trace!(inode = number, entries = found.len(), "Read ext directory");

        Ok(found
            .into_iter()
            .map(|(name, child)| {
                let meta = self.read_inode(child)?.meta();
                Ok(RawDirEntry { name, meta })
            })
            .collect())
    }

    fn resolve(&mut self, path: &str) -> Result<u64, String> {
        let mut current = EXT_ROOT_INODE;
        for part in path_components(path) {
            current = self
                .list(current)?
                .into_iter()
                .flatten()
                .find(|e| e.name == part.as_bytes())
                .map(|e| e.meta.inode)
                .ok_or_else(|| format!("'{}' not found", part))?;
        }
        Ok(current)
    }
}

impl<R: Read + Seek + Send> FileSystem for ExtFilesystem<R> {
    fn fs_type(&self) -> FsType {
        self.fs_type
    }

    fn root_inode(&self) -> u64 {
        EXT_ROOT_INODE
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
        Ok(self.read_inode(inode)?.meta())
    }

    fn read_at(&mut self, inode: u64, offset: u64, len: usize) -> Result<Vec<u8>, String> {
        let inode = self.read_inode(inode)?;
        if inode.kind() == FileKind::Directory {
            return Err(format!("Inode {} is a directory", inode.number));
        }
        self.read_content(&inode, offset, len)
    }
}
