// NTFS through the `ntfs` crate. Inodes are MFT record numbers.

use std::io::{Read, Seek, SeekFrom};

use ::ntfs::indexes::NtfsFileNameIndex;
use ::ntfs::structured_values::NtfsFileNamespace;
use ::ntfs::{Ntfs, NtfsReadSeek};
use tracing::{debug, trace};

use super::{filetime_to_unix, path_components, DirRef, FileKind, FileMeta, FileSystem, FsType, RawDirEntry};

/// MFT record of the root directory
pub const NTFS_ROOT_RECORD: u64 = 5;

pub struct NtfsVolume<R> {
    reader: R,
    ntfs: Ntfs,
}

impl<R: Read + Seek> NtfsVolume<R> {
    pub fn open(mut reader: R) -> Result<Self, String> {
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| format!("Failed to seek to NTFS boot sector: {}", e))?;
        let mut ntfs = Ntfs::new(&mut reader).map_err(|e| format!("Invalid NTFS volume: {}", e))?;
        ntfs.read_upcase_table(&mut reader)
            .map_err(|e| format!("Failed to read $UpCase: {}", e))?;
        debug!(cluster_size = ntfs.cluster_size(), "Opened NTFS volume");
        Ok(Self { reader, ntfs })
    }

    fn resolve(&mut self, path: &str) -> Result<u64, String> {
        let mut record = NTFS_ROOT_RECORD;
        for part in path_components(path) {
            let dir = self
                .ntfs
                .file(&mut self.reader, record)
                .map_err(|e| format!("MFT record {}: {}", record, e))?;
            let index = dir
                .directory_index(&mut self.reader)
                .map_err(|e| format!("Record {} has no directory index: {}", record, e))?;
            let mut finder = index.finder();
            let entry = NtfsFileNameIndex::find(&mut finder, &self.ntfs, &mut self.reader, part)
                .ok_or_else(|| format!("'{}' not found", part))?
                .map_err(|e| format!("Index lookup for '{}' failed: {}", part, e))?;
            record = entry.file_reference().file_record_number();
        }
        Ok(record)
    }

    fn list(&mut self, record: u64) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        let dir = self
            .ntfs
            .file(&mut self.reader, record)
            .map_err(|e| format!("MFT record {}: {}", record, e))?;
        let index = dir
            .directory_index(&mut self.reader)
            .map_err(|e| format!("Record {} is not a directory: {}", record, e))?;

        // Names first; metadata reads need the reader the iterator borrows
        let mut names: Vec<Result<(Vec<u8>, u64), String>> = Vec::new();
        let mut entries = index.entries();
        while let Some(entry) = entries.next(&mut self.reader) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    names.push(Err(format!("Corrupt index entry: {}", e)));
                    continue;
                }
            };
            match entry.key() {
                Some(Ok(file_name)) => {
                    // Every long name has a DOS twin in the same index
                    if file_name.namespace() == NtfsFileNamespace::Dos {
                        continue;
                    }
                    let name = file_name.name().to_string_lossy().into_bytes();
                    names.push(Ok((name, entry.file_reference().file_record_number())));
                }
                Some(Err(e)) => names.push(Err(format!("Unreadable file name: {}", e))),
                None => {}
            }
        }

        trace!(record, entries = names.len(), "Read NTFS directory index");
        Ok(names
            .into_iter()
            .map(|item| {
                let (name, child) = item?;
                let meta = file_meta(&self.ntfs, &mut self.reader, child)?;
                Ok(RawDirEntry { name, meta })
            })
            .collect())
    }
}

fn file_meta<R: Read + Seek>(ntfs: &Ntfs, reader: &mut R, record: u64) -> Result<FileMeta, String> {
    let file = ntfs
        .file(reader, record)
        .map_err(|e| format!("MFT record {}: {}", record, e))?;
    let info = file
        .info()
        .map_err(|e| format!("Record {} has no $STANDARD_INFORMATION: {}", record, e))?;

    let is_dir = file.is_directory();
    let size = if is_dir {
        0
    } else {
        match file.data(reader, "") {
            Some(item) => {
                let item = item.map_err(|e| format!("Record {} $DATA: {}", record, e))?;
                let attribute = item
                    .to_attribute()
                    .map_err(|e| format!("Record {} $DATA: {}", record, e))?;
                attribute.value_length()
            }
            None => 0,
        }
    };

    Ok(FileMeta {
        inode: record,
        kind: if is_dir { FileKind::Directory } else { FileKind::Regular },
        size,
        created: filetime_to_unix(info.creation_time().nt_timestamp()),
        accessed: filetime_to_unix(info.access_time().nt_timestamp()),
        modified: filetime_to_unix(info.modification_time().nt_timestamp()),
        changed: filetime_to_unix(info.mft_record_modification_time().nt_timestamp()),
    })
}

impl<R: Read + Seek + Send> FileSystem for NtfsVolume<R> {
    fn fs_type(&self) -> FsType {
        FsType::Ntfs
    }

    fn root_inode(&self) -> u64 {
        NTFS_ROOT_RECORD
    }

    fn read_dir(&mut self, dir: DirRef<'_>) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        let record = match dir {
            DirRef::Path(path) => self.resolve(path)?,
            DirRef::Inode(inode) => inode,
        };
        self.list(record)
    }

    fn lookup(&mut self, path: &str) -> Result<FileMeta, String> {
        let record = self.resolve(path)?;
        file_meta(&self.ntfs, &mut self.reader, record)
    }

    fn stat(&mut self, inode: u64) -> Result<FileMeta, String> {
        file_meta(&self.ntfs, &mut self.reader, inode)
    }

    fn read_at(&mut self, inode: u64, offset: u64, len: usize) -> Result<Vec<u8>, String> {
        let file = self
            .ntfs
            .file(&mut self.reader, inode)
            .map_err(|e| format!("MFT record {}: {}", inode, e))?;
        let item = file
            .data(&mut self.reader, "")
            .ok_or_else(|| format!("Record {} has no unnamed $DATA stream", inode))?
            .map_err(|e| format!("Record {} $DATA: {}", inode, e))?;
        let attribute = item
            .to_attribute()
            .map_err(|e| format!("Record {} $DATA: {}", inode, e))?;
        let mut value = attribute
            .value(&mut self.reader)
            .map_err(|e| format!("Record {} $DATA value: {}", inode, e))?;

        let total = value.len();
        if offset >= total || len == 0 {
            return Ok(Vec::new());
        }
        let wanted = (total - offset).min(len as u64) as usize;
        value
            .seek(&mut self.reader, SeekFrom::Start(offset))
            .map_err(|e| format!("Seek in record {} failed: {}", inode, e))?;

        let mut buf = vec![0u8; wanted];
        let mut filled = 0;
        while filled < wanted {
            let n = value
                .read(&mut self.reader, &mut buf[filled..])
                .map_err(|e| format!("Read of record {} failed: {}", inode, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}
