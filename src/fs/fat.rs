// FAT12/16/32 reader with long file name support.
//
// Inodes are synthetic: a file's inode is the byte offset of its 8.3
// directory entry divided by 32, so any entry can be re-read from its inode
// without keeping a table. The root directory has no entry and uses inode 2.

use std::io::{Read, Seek};

use chrono::NaiveDate;
use tracing::trace;

use super::{path_components, DirRef, FileKind, FileMeta, FileSystem, FsType, RawDirEntry};
use crate::common::binary::{le_u16, le_u32, read_bytes_at};

pub const FAT_ROOT_INODE: u64 = 2;

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const DELETED_MARKER: u8 = 0xE5;

pub struct FatFilesystem<R> {
    reader: R,
    fat_type: FsType,
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    reserved_sectors: u64,
    num_fats: u64,
    sectors_per_fat: u64,
    root_entry_count: u64,
    /// FAT32 only
    root_cluster: u32,
    total_clusters: u64,
    /// Chain of the file read last, keyed by its first cluster
    cached_chain: Option<(u32, Vec<u32>)>,
}

/// One decoded 8.3 entry plus its long name
struct FatDirent {
    name: String,
    inode: u64,
    attr: u8,
    first_cluster: u32,
    size: u32,
    created: Option<i64>,
    accessed: Option<i64>,
    modified: Option<i64>,
}

impl FatDirent {
    fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    fn meta(&self) -> FileMeta {
        FileMeta {
            inode: self.inode,
            kind: if self.is_dir() { FileKind::Directory } else { FileKind::Regular },
            size: if self.is_dir() { 0 } else { self.size as u64 },
            created: self.created,
            accessed: self.accessed,
            modified: self.modified,
            changed: None,
        }
    }
}

impl<R: Read + Seek> FatFilesystem<R> {
    pub fn open(mut reader: R) -> Result<Self, String> {
        let bpb = read_bytes_at(&mut reader, 0, 512)?;
        let fat_type = super::probe::fat_type(&bpb).ok_or("Invalid FAT boot sector")?;

        let bytes_per_sector = le_u16(&bpb, 11) as u64;
        let sectors_per_cluster = bpb[13] as u64;
        let reserved_sectors = le_u16(&bpb, 14) as u64;
        let num_fats = bpb[16] as u64;
        let root_entry_count = le_u16(&bpb, 17) as u64;
        let total_sectors = match le_u16(&bpb, 19) {
            0 => le_u32(&bpb, 32) as u64,
            n => n as u64,
        };
        let sectors_per_fat = match le_u16(&bpb, 22) {
            0 => le_u32(&bpb, 36) as u64,
            n => n as u64,
        };
        let root_cluster = if fat_type == FsType::Fat32 { le_u32(&bpb, 44) } else { 0 };

        let mut fs = Self {
            reader,
            fat_type,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            root_entry_count,
            root_cluster,
            total_clusters: 0,
            cached_chain: None,
        };
        fs.total_clusters = total_sectors.saturating_sub(fs.data_start_sector()) / sectors_per_cluster;
        trace!(fat = fat_type.name(), clusters = fs.total_clusters, "Opened FAT volume");
        Ok(fs)
    }

    fn cluster_size(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn root_dir_start_sector(&self) -> u64 {
        self.reserved_sectors + self.num_fats * self.sectors_per_fat
    }

    fn data_start_sector(&self) -> u64 {
        let root_dir_sectors = (self.root_entry_count * 32).div_ceil(self.bytes_per_sector);
        self.root_dir_start_sector() + root_dir_sectors
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        (self.data_start_sector() + (cluster as u64 - 2) * self.sectors_per_cluster) * self.bytes_per_sector
    }

    fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && (cluster as u64) < self.total_clusters + 2
    }

    /// Next cluster in the chain, None at end of chain or on a bad/reserved value
    fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>, String> {
        let fat_offset = self.reserved_sectors * self.bytes_per_sector;
        let next = match self.fat_type {
            FsType::Fat12 => {
                let raw = read_bytes_at(&mut self.reader, fat_offset + cluster as u64 * 3 / 2, 2)?;
                let val = le_u16(&raw, 0);
                let next = if cluster & 1 == 1 { val >> 4 } else { val & 0x0FFF };
                if next >= 0x0FF0 { 0 } else { next as u32 }
            }
            FsType::Fat16 => {
                let raw = read_bytes_at(&mut self.reader, fat_offset + cluster as u64 * 2, 2)?;
                let next = le_u16(&raw, 0);
                if next >= 0xFFF0 { 0 } else { next as u32 }
            }
            _ => {
                let raw = read_bytes_at(&mut self.reader, fat_offset + cluster as u64 * 4, 4)?;
                let next = le_u32(&raw, 0) & 0x0FFF_FFFF;
                if next >= 0x0FFF_FFF0 { 0 } else { next }
            }
        };
        Ok(if self.is_valid_cluster(next) { Some(next) } else { None })
    }

    /// Cluster chain starting at `first`, guarded against loops
    fn cluster_chain(&mut self, first: u32) -> Result<Vec<u32>, String> {
        let mut chain = Vec::new();
        let mut cluster = first;
        while self.is_valid_cluster(cluster) {
            if chain.len() as u64 > self.total_clusters {
                return Err(format!("Cluster chain from {} loops", first));
            }
            chain.push(cluster);
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(chain)
    }

    /// Raw directory bytes paired with the partition offset of each 32-byte slot
    fn directory_slots(&mut self, inode: u64) -> Result<Vec<(u64, [u8; 32])>, String> {
        let mut regions: Vec<(u64, usize)> = Vec::new();
        if inode == FAT_ROOT_INODE && self.fat_type != FsType::Fat32 {
            let offset = self.root_dir_start_sector() * self.bytes_per_sector;
            regions.push((offset, (self.root_entry_count * 32) as usize));
        } else {
            let first = if inode == FAT_ROOT_INODE {
                self.root_cluster
            } else {
                let dirent = self.dirent_at(inode)?;
                if !dirent.is_dir() {
                    return Err(format!("Inode {} is not a directory", inode));
                }
                dirent.first_cluster
            };
            let cluster_size = self.cluster_size() as usize;
            for cluster in self.cluster_chain(first)? {
                regions.push((self.cluster_offset(cluster), cluster_size));
            }
        }

        let mut slots = Vec::new();
        for (offset, len) in regions {
            let data = read_bytes_at(&mut self.reader, offset, len)?;
            for (i, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                let mut slot = [0u8; 32];
                slot.copy_from_slice(raw);
                slots.push((offset + (i * DIR_ENTRY_SIZE) as u64, slot));
            }
        }
        Ok(slots)
    }

    /// Decode directory slots, collecting LFN fragments ahead of each 8.3 entry
    fn parse_directory(&self, slots: &[(u64, [u8; 32])]) -> Vec<Result<FatDirent, String>> {
        let mut entries = Vec::new();
        let mut lfn_parts: Vec<(u8, String)> = Vec::new();

        for (offset, entry) in slots {
            if entry[0] == 0x00 {
                break;
            }
            if entry[0] == DELETED_MARKER {
                lfn_parts.clear();
                continue;
            }

            let attr = entry[11];
            if attr == ATTR_LONG_NAME {
                if entry[0] & 0x40 != 0 {
                    lfn_parts.clear();
                }
                lfn_parts.push((entry[0] & 0x3F, lfn_fragment(entry)));
                continue;
            }
            if attr & ATTR_VOLUME_ID != 0 {
                lfn_parts.clear();
                continue;
            }

            let long_name = if lfn_parts.is_empty() {
                None
            } else {
                lfn_parts.sort_by_key(|&(seq, _)| seq);
                Some(lfn_parts.drain(..).map(|(_, s)| s).collect::<String>())
            };
            let mut dirent = self.decode_short(offset / DIR_ENTRY_SIZE as u64, entry);
            if let Some(name) = long_name.filter(|n| !n.is_empty()) {
                dirent.name = name;
            }

            if dirent.first_cluster != 0 && !self.is_valid_cluster(dirent.first_cluster) {
                entries.push(Err(format!(
                    "Entry '{}' points at cluster {} outside the volume",
                    dirent.name, dirent.first_cluster
                )));
            } else {
                entries.push(Ok(dirent));
            }
        }
        entries
    }

    fn decode_short(&self, inode: u64, entry: &[u8; 32]) -> FatDirent {
        let cluster_hi = if self.fat_type == FsType::Fat32 { le_u16(entry, 20) as u32 } else { 0 };
        FatDirent {
            name: build_short_name(&entry[0..8], &entry[8..11]),
            inode,
            attr: entry[11],
            first_cluster: (cluster_hi << 16) | le_u16(entry, 26) as u32,
            size: le_u32(entry, 28),
            created: fat_datetime_to_unix(le_u16(entry, 16), le_u16(entry, 14)),
            accessed: fat_datetime_to_unix(le_u16(entry, 18), 0),
            modified: fat_datetime_to_unix(le_u16(entry, 24), le_u16(entry, 22)),
        }
    }

    /// Re-read the 8.3 entry an inode points at
    fn dirent_at(&mut self, inode: u64) -> Result<FatDirent, String> {
        let offset = inode
            .checked_mul(DIR_ENTRY_SIZE as u64)
            .ok_or_else(|| format!("Inode {} out of range", inode))?;
        let raw = read_bytes_at(&mut self.reader, offset, DIR_ENTRY_SIZE)?;
        let mut entry = [0u8; 32];
        entry.copy_from_slice(&raw);
        if entry[0] == 0 || entry[0] == DELETED_MARKER || entry[11] == ATTR_LONG_NAME {
            return Err(format!("No directory entry at inode {}", inode));
        }
        Ok(self.decode_short(inode, &entry))
    }

    fn list(&mut self, inode: u64) -> Result<Vec<Result<FatDirent, String>>, String> {
        let slots = self.directory_slots(inode)?;
        Ok(self.parse_directory(&slots))
    }

    fn resolve(&mut self, path: &str) -> Result<u64, String> {
        let mut current = FAT_ROOT_INODE;
        for part in path_components(path) {
            let found = self
                .list(current)?
                .into_iter()
                .flatten()
                .find(|d| d.name.eq_ignore_ascii_case(part))
                .ok_or_else(|| format!("'{}' not found", part))?;
            current = found.inode;
        }
        Ok(current)
    }

    fn root_meta(&self) -> FileMeta {
        FileMeta {
            inode: FAT_ROOT_INODE,
            kind: FileKind::Directory,
            size: 0,
            created: None,
            accessed: None,
            modified: None,
            changed: None,
        }
    }
}

impl<R: Read + Seek + Send> FileSystem for FatFilesystem<R> {
    fn fs_type(&self) -> FsType {
        self.fat_type
    }

    fn root_inode(&self) -> u64 {
        FAT_ROOT_INODE
    }

    fn read_dir(&mut self, dir: DirRef<'_>) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        let inode = match dir {
            DirRef::Path(path) => self.resolve(path)?,
            DirRef::Inode(inode) => inode,
        };
        Ok(self
            .list(inode)?
            .into_iter()
            .map(|d| {
                d.map(|d| RawDirEntry {
                    meta: d.meta(),
                    name: d.name.into_bytes(),
                })
            })
            .collect())
    }

    fn lookup(&mut self, path: &str) -> Result<FileMeta, String> {
        let inode = self.resolve(path)?;
        self.stat(inode)
    }

    fn stat(&mut self, inode: u64) -> Result<FileMeta, String> {
        if inode == FAT_ROOT_INODE {
            return Ok(self.root_meta());
        }
        Ok(self.dirent_at(inode)?.meta())
    }

    fn read_at(&mut self, inode: u64, offset: u64, len: usize) -> Result<Vec<u8>, String> {
        let dirent = self.dirent_at(inode)?;
        if dirent.is_dir() {
            return Err(format!("Inode {} is a directory", inode));
        }
        let size = dirent.size as u64;
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let end = size.min(offset.saturating_add(len as u64));

        let cluster_size = self.cluster_size();
        let chain = match self.cached_chain.take() {
            Some((first, chain)) if first == dirent.first_cluster => chain,
            _ => self.cluster_chain(dirent.first_cluster)?,
        };
        let mut out = Vec::new();
        let mut position = offset;
        while position < end {
            let index = (position / cluster_size) as usize;
            let Some(&cluster) = chain.get(index) else {
                break;
            };
            let within = position % cluster_size;
            let take = (cluster_size - within).min(end - position);
            let at = self.cluster_offset(cluster) + within;
            let data = read_bytes_at(&mut self.reader, at, take as usize)?;
            out.extend_from_slice(&data);
            position += take;
        }
        self.cached_chain = Some((dirent.first_cluster, chain));
        Ok(out)
    }
}

/// The 13 UTF-16 code units of one LFN slot, padding removed
fn lfn_fragment(entry: &[u8; 32]) -> String {
    const POSITIONS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
    let units: Vec<u16> = POSITIONS
        .iter()
        .map(|&p| le_u16(entry, p))
        .take_while(|&c| c != 0x0000 && c != 0xFFFF)
        .collect();
    String::from_utf16_lossy(&units)
}

/// "NAME.EXT" from space-padded 8.3 fields
fn build_short_name(name: &[u8], ext: &[u8]) -> String {
    let decode = |b: &[u8]| -> String {
        b.iter()
            .map(|&c| if c.is_ascii() { c as char } else { char::REPLACEMENT_CHARACTER })
            .collect::<String>()
            .trim_end()
            .to_string()
    };
    let mut base = decode(name);
    // 0x05 stands in for a leading 0xE5 byte
    if base.starts_with('\u{5}') {
        base.replace_range(..1, "\u{e5}");
    }
    let ext = decode(ext);
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

/// FAT date/time fields to unix seconds; date 0 means unset
fn fat_datetime_to_unix(date: u16, time: u16) -> Option<i64> {
    if date == 0 {
        return None;
    }
    let day = (date & 0x1F) as u32;
    let month = ((date >> 5) & 0x0F) as u32;
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let second = ((time & 0x1F) * 2) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{patterned_bytes, Fat12Builder, FatNode, FAT_FIXTURE_DATE, FAT_FIXTURE_TIME};
    use std::io::Cursor;

    fn sample() -> FatFilesystem<Cursor<Vec<u8>>> {
        let image = Fat12Builder::build(vec![
            FatNode::file("README.TXT", b"hello fat"),
            FatNode::file("Long File Name.docx", &patterned_bytes(1500)),
            FatNode::dir(
                "DOCS",
                vec![
                    FatNode::file("A.TXT", b"alpha"),
                    FatNode::dir("Nested Folder", vec![FatNode::file("deep.bin", &[7u8; 600])]),
                ],
            ),
        ]);
        FatFilesystem::open(Cursor::new(image)).unwrap()
    }

    fn names(fs: &mut FatFilesystem<Cursor<Vec<u8>>>, dir: DirRef<'_>) -> Vec<String> {
        fs.read_dir(dir)
            .unwrap()
            .into_iter()
            .map(|e| String::from_utf8(e.unwrap().name).unwrap())
            .collect()
    }

    #[test]
    fn test_root_listing_with_long_names() {
        let mut fs = sample();
        assert_eq!(fs.fs_type(), FsType::Fat12);
        assert_eq!(names(&mut fs, DirRef::Path("/")), vec!["README.TXT", "Long File Name.docx", "DOCS"]);
    }

    #[test]
    fn test_subdirectory_by_inode_has_dot_entries() {
        let mut fs = sample();
        let docs = fs.lookup("/DOCS").unwrap();
        assert!(docs.is_dir());
        assert_eq!(names(&mut fs, DirRef::Inode(docs.inode)), vec![".", "..", "A.TXT", "Nested Folder"]);
    }

    #[test]
    fn test_read_multi_cluster_file() {
        let mut fs = sample();
        let meta = fs.lookup("/long file name.DOCX").unwrap();
        assert_eq!(meta.size, 1500);
        let expected = patterned_bytes(1500);
        assert_eq!(fs.read_at(meta.inode, 0, 4096).unwrap(), expected);
        assert_eq!(fs.read_at(meta.inode, 500, 600).unwrap(), &expected[500..1100]);
        assert!(fs.read_at(meta.inode, 1500, 10).unwrap().is_empty());
    }

    #[test]
    fn test_nested_path_lookup() {
        let mut fs = sample();
        let meta = fs.lookup("/DOCS/Nested Folder/deep.bin").unwrap();
        assert_eq!(fs.read_at(meta.inode, 0, 1000).unwrap(), vec![7u8; 600]);
        assert!(fs.lookup("/DOCS/missing").is_err());
    }

    #[test]
    fn test_timestamps_decoded() {
        let mut fs = sample();
        let meta = fs.lookup("/README.TXT").unwrap();
        let expected = fat_datetime_to_unix(FAT_FIXTURE_DATE, FAT_FIXTURE_TIME);
        assert_eq!(expected, Some(946_782_246));
        assert_eq!(meta.modified, expected);
        assert_eq!(meta.created, expected);
        assert_eq!(meta.changed, None);
    }

    #[test]
    fn test_stat_root_and_bad_inode() {
        let mut fs = sample();
        assert!(fs.stat(FAT_ROOT_INODE).unwrap().is_dir());
        // An all-zero slot far into the root directory
        let empty_slot = (19 * 512 + 200 * 32) / 32;
        assert!(fs.stat(empty_slot).is_err());
    }

    fn set_fat12(image: &mut [u8], cluster: u32, value: u16) {
        let at = 512 + (cluster as usize * 3) / 2;
        let old = u16::from_le_bytes([image[at], image[at + 1]]);
        let new = if cluster & 1 == 1 { (old & 0x000F) | (value << 4) } else { (old & 0xF000) | value };
        image[at..at + 2].copy_from_slice(&new.to_le_bytes());
    }

    #[test]
    fn test_looping_cluster_chain_is_an_error() {
        let mut image = Fat12Builder::build(vec![FatNode::file("LOOP.BIN", &patterned_bytes(1500))]);
        let mut fs = FatFilesystem::open(Cursor::new(image.clone())).unwrap();
        let meta = fs.lookup("/LOOP.BIN").unwrap();
        let first = le_u16(&image, meta.inode as usize * 32 + 26) as u32;

        set_fat12(&mut image, first + 1, first as u16);
        let mut fs = FatFilesystem::open(Cursor::new(image)).unwrap();
        assert!(fs.read_at(meta.inode, 0, 4096).is_err());
    }

    #[test]
    fn test_chunked_read_reuses_chain() {
        let mut fs = sample();
        let big = fs.lookup("/Long File Name.docx").unwrap();
        let small = fs.lookup("/README.TXT").unwrap();
        let mut out = Vec::new();
        for offset in (0..1500u64).step_by(300) {
            out.extend(fs.read_at(big.inode, offset, 300).unwrap());
            assert_eq!(fs.read_at(small.inode, 0, 64).unwrap(), b"hello fat");
        }
        assert_eq!(out, patterned_bytes(1500));
    }

    #[test]
    fn test_corrupt_structures_never_panic() {
        let clean = Fat12Builder::build(vec![
            FatNode::file("A.TXT", &patterned_bytes(700)),
            FatNode::dir("SUB", vec![FatNode::file("B.TXT", b"b")]),
        ]);
        let root_slot = 19 * 512;
        let patches: Vec<(usize, Vec<u8>)> = vec![
            // sectors per FAT read from the FAT32 field, which holds boot code here
            (22, vec![0, 0]),
            // root entry count at its maximum
            (17, u16::MAX.to_le_bytes().to_vec()),
            // first cluster of the first root entry past the volume
            (root_slot + 26, u16::MAX.to_le_bytes().to_vec()),
            // file size of the first root entry at its maximum
            (root_slot + 28, u32::MAX.to_le_bytes().to_vec()),
            // clusters 2 and 3 chained into a loop
            (512 + 3, vec![0x03, 0x30, 0x00]),
        ];
        for (at, bytes) in patches {
            let mut image = clean.clone();
            image[at..at + bytes.len()].copy_from_slice(&bytes);
            let Ok(mut fs) = FatFilesystem::open(Cursor::new(image)) else {
                continue;
            };
            if let Ok(entries) = fs.read_dir(DirRef::Inode(FAT_ROOT_INODE)) {
                for entry in entries.into_iter().flatten() {
                    let _ = fs.read_at(entry.meta.inode, 0, 4096);
                    let _ = fs.read_dir(DirRef::Inode(entry.meta.inode));
                }
            }
            let _ = fs.stat(u64::MAX);
        }
    }

    #[test]
    fn test_short_name_helpers() {
        assert_eq!(build_short_name(b"README  ", b"TXT"), "README.TXT");
        assert_eq!(build_short_name(b"NOEXT   ", b"   "), "NOEXT");
        assert_eq!(fat_datetime_to_unix(0, 0), None);
    }
}
