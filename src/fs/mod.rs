//! Filesystem backends mounted at a byte offset inside an image
//!
//! Every backend implements [`FileSystem`]. Directory reads return one
//! `Result` per entry so a single unreadable record never hides its siblings;
//! callers decide what to do with the failures.
//!
//! Inode conventions:
//! - NTFS: MFT record number, root = 5
//! - ext2/3/4: native inode number, root = 2
//! - FAT / ISO9660: synthetic address derived from the directory record's
//!   byte position, root = 2

pub mod ext;
pub mod fat;
pub mod iso9660;
pub mod ntfs;
pub mod probe;

use serde::Serialize;
use tracing::debug;

use crate::container::{PartitionReader, SharedImage};

pub use probe::probe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FsType {
    Ntfs,
    Fat12,
    Fat16,
    Fat32,
    ExFat,
    Ext2,
    Ext3,
    Ext4,
    Iso9660,
    Hfs,
    Apfs,
    /// Something mounted but the type code is not one we name
    Unknown,
    /// Nothing mounted at this offset
    NotApplicable,
}

impl FsType {
    pub fn name(&self) -> &'static str {
        match self {
            FsType::Ntfs => "NTFS",
            FsType::Fat12 => "FAT12",
            FsType::Fat16 => "FAT16",
            FsType::Fat32 => "FAT32",
            FsType::ExFat => "ExFAT",
            FsType::Ext2 => "Ext2",
            FsType::Ext3 => "Ext3",
            FsType::Ext4 => "Ext4",
            FsType::Iso9660 => "ISO9660",
            FsType::Hfs => "HFS",
            FsType::Apfs => "APFS",
            FsType::Unknown => "Unknown",
            FsType::NotApplicable => "N/A",
        }
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    Directory,
    Regular,
    Other,
}

/// Metadata of one inode; timestamps are unix seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    pub inode: u64,
    pub kind: FileKind,
    pub size: u64,
    pub created: Option<i64>,
    pub accessed: Option<i64>,
    pub modified: Option<i64>,
    pub changed: Option<i64>,
}

impl FileMeta {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Directory entry as the backend stores it; the name is raw bytes
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    pub name: Vec<u8>,
    pub meta: FileMeta,
}

/// Root is opened by path, everything else by inode
#[derive(Debug, Clone, Copy)]
pub enum DirRef<'a> {
    Path(&'a str),
    Inode(u64),
}

pub trait FileSystem: Send {
    fn fs_type(&self) -> FsType;

    fn root_inode(&self) -> u64;

    /// List a directory. `.` and `..` are included when the format stores them.
    fn read_dir(&mut self, dir: DirRef<'_>) -> Result<Vec<Result<RawDirEntry, String>>, String>;

    fn lookup(&mut self, path: &str) -> Result<FileMeta, String>;

    fn stat(&mut self, inode: u64) -> Result<FileMeta, String>;

    /// Read up to `len` bytes of file content at `offset`; short at end of file
    fn read_at(&mut self, inode: u64, offset: u64, len: usize) -> Result<Vec<u8>, String>;
}

/// Opens a filesystem over an image at a byte offset
pub trait Mounter: Send {
    fn mount(&self, image: &SharedImage, byte_offset: u64) -> Result<Box<dyn FileSystem>, String>;
}

/// Probe the on-disk signature and open the matching in-crate backend
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeMounter;

impl Mounter for NativeMounter {
    fn mount(&self, image: &SharedImage, byte_offset: u64) -> Result<Box<dyn FileSystem>, String> {
        let mut reader = PartitionReader::new(image.clone(), byte_offset)
            .map_err(|e| format!("Failed to open partition window: {}", e))?;
        let fs_type = probe(&mut reader)?;
        debug!(byte_offset, fs_type = fs_type.name(), "Mounting filesystem");

        match fs_type {
            FsType::Ntfs => Ok(Box::new(ntfs::NtfsVolume::open(reader)?)),
            FsType::Fat12 | FsType::Fat16 | FsType::Fat32 => {
                Ok(Box::new(fat::FatFilesystem::open(reader)?))
            }
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
                Ok(Box::new(ext::ExtFilesystem::open(reader, fs_type)?))
            }
            FsType::Iso9660 => Ok(Box::new(iso9660::IsoFilesystem::open(reader)?)),
            FsType::ExFat | FsType::Hfs | FsType::Apfs | FsType::Unknown => {
                Ok(Box::new(TypeOnlyFilesystem { fs_type }))
            }
            FsType::NotApplicable => Err("No filesystem found".to_string()),
        }
    }
}

/// Recognized but not browsable; every operation fails softly
pub struct TypeOnlyFilesystem {
    fs_type: FsType,
}

impl TypeOnlyFilesystem {
    fn unsupported<T>(&self) -> Result<T, String> {
        Err(format!("{} browsing is not supported", self.fs_type.name()))
    }
}

impl FileSystem for TypeOnlyFilesystem {
    fn fs_type(&self) -> FsType {
        self.fs_type
    }

    fn root_inode(&self) -> u64 {
        0
    }

    fn read_dir(&mut self, _dir: DirRef<'_>) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        self.unsupported()
    }

    fn lookup(&mut self, _path: &str) -> Result<FileMeta, String> {
        self.unsupported()
    }

    fn stat(&mut self, _inode: u64) -> Result<FileMeta, String> {
        self.unsupported()
    }

    fn read_at(&mut self, _inode: u64, _offset: u64, _len: usize) -> Result<Vec<u8>, String> {
        self.unsupported()
    }
}

/// Split a slash path into non-empty components
pub(crate) fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|p| !p.is_empty() && *p != ".")
}

/// Windows FILETIME (100ns ticks since 1601) to unix seconds; 0 stays absent
pub(crate) fn filetime_to_unix(ticks: u64) -> Option<i64> {
    if ticks == 0 {
        return None;
    }
    Some((ticks / 10_000_000) as i64 - 11_644_473_600)
}
