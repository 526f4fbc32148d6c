//! ZIP archives stored inside a filesystem
//!
//! The host file is re-read through the filesystem on every call; there is
//! no archive cache. Directory structure is synthesized from member paths:
//! a member ending in `/` is a directory and listing a directory filters the
//! flat member list by prefix.
//!
//! ## Module Structure
//! ```text
//! archive/
//! ├── mod.rs        - list / read members through an EvidenceSession
//! └── detection.rs  - magic signatures
//! ```

pub mod detection;

pub use detection::has_zip_signature;

use std::io::{Cursor, Read};

use chrono::NaiveDate;
use tracing::{debug, trace};
use zip::ZipArchive;

use crate::fs::FileKind;
use crate::session::EvidenceSession;
use crate::walker::{ArchiveLocation, DirectoryEntry, Timestamp};

/// Upper bound on the buffer reserved from a member's declared size
const MEMBER_CAPACITY_HINT: u64 = 16 * 1024 * 1024;

/// Member timestamps carry no zone; they are read as UTC
fn zip_time(dt: Option<zip::DateTime>) -> Timestamp {
    let unix = dt.and_then(|dt| {
        NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
            .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)
            .map(|t| t.and_utc().timestamp())
    });
    Timestamp::from_unix(unix)
}

fn member_name(internal_path: &str) -> String {
    internal_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

impl EvidenceSession {
    /// Extension match, else a header sniff of the file's first bytes
    pub fn is_archive(&mut self, fs_offset: u64, entry: &DirectoryEntry) -> bool {
        if entry.is_directory {
            return false;
        }
        if self.config().is_archive_name(&entry.name) {
            trace!(name = %entry.name, "Archive by extension");
            return true;
        }
        let Some(inode) = entry.inode else {
            return false;
        };
        if entry.size < detection::SIGNATURE_LEN as u64 {
            return false;
        }
        let Some(fs) = self.filesystem(fs_offset) else {
            return false;
        };
        match fs.read_at(inode, 0, detection::SIGNATURE_LEN) {
            Ok(header) => has_zip_signature(&header),
            Err(e) => {
                debug!(inode, error = %e, "Header read failed");
                false
            }
        }
    }

    fn open_archive(&mut self, host_inode: u64, host_offset: u64) -> Option<ZipArchive<Cursor<Vec<u8>>>> {
        let (content, _) = self.read_file(host_offset, host_inode)?;
        if !has_zip_signature(&content) {
            debug!(host_inode, "Host file has no ZIP signature");
            return None;
        }
        match ZipArchive::new(Cursor::new(content)) {
            Ok(archive) => Some(archive),
            Err(e) => {
                debug!(host_inode, error = %e, "Not a readable ZIP archive");
                None
            }
        }
    }

    /// Every member of the archive, in stored order; `None` if it is not a ZIP
    pub fn list_archive(&mut self, host_inode: u64, host_offset: u64) -> Option<Vec<DirectoryEntry>> {
        let mut archive = self.open_archive(host_inode, host_offset)?;

        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let member = match archive.by_index_raw(index) {
                Ok(member) => member,
                Err(e) => {
                    debug!(host_inode, index, error = %e, "Skipping unreadable member");
                    continue;
                }
            };
            let internal_path = member.name().to_string();
            let is_directory = internal_path.ends_with('/');
            let stamp = zip_time(member.last_modified());
            entries.push(DirectoryEntry {
                name: member_name(&internal_path),
                is_directory,
                kind: if is_directory { FileKind::Directory } else { FileKind::Regular },
                inode: None,
                size: member.size(),
                created: stamp,
                accessed: stamp,
                modified: stamp,
                changed: stamp,
                archive: Some(ArchiveLocation {
                    internal_path,
                    host_inode,
                    host_offset,
                }),
            });
        }
        debug!(host_inode, members = entries.len(), "Listed archive");
        Some(entries)
    }

    /// Members under `dir` at any depth, excluding `dir` itself
    pub fn list_archive_dir(&mut self, host_inode: u64, host_offset: u64, dir: &str) -> Option<Vec<DirectoryEntry>> {
        let prefix = if dir.ends_with('/') { dir.to_string() } else { format!("{}/", dir) };
        let entries = self.list_archive(host_inode, host_offset)?;
        Some(
            entries
                .into_iter()
                .filter(|e| {
                    e.archive
                        .as_ref()
                        .is_some_and(|loc| loc.internal_path.starts_with(&prefix) && loc.internal_path != prefix)
                })
                .collect(),
        )
    }

    /// Stored bytes of one member, decompressed in a single read
    pub fn read_archive_member(&mut self, host_inode: u64, host_offset: u64, member_path: &str) -> Option<Vec<u8>> {
        let mut archive = self.open_archive(host_inode, host_offset)?;
        let mut member = match archive.by_name(member_path) {
            Ok(member) => member,
            Err(e) => {
                debug!(host_inode, member_path, error = %e, "Member not found");
                return None;
            }
        };
        let mut data = Vec::with_capacity(member.size().min(MEMBER_CAPACITY_HINT) as usize);
        match member.read_to_end(&mut data) {
            Ok(_) => Some(data),
            Err(e) => {
                debug!(host_inode, member_path, error = %e, "Member extraction failed");
                None
            }
        }
    }
}
