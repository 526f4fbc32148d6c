//! Directory listing, recursive walks, file search and export
//!
//! Listings never fail as a whole because of one bad record: the backend
//! returns one `Result` per entry and failed entries are dropped here.
//! Walks are depth-first and pre-order; an unreadable directory hides only
//! its own subtree.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::DateTime;
use filetime::FileTime;
use serde::{Serialize, Serializer};
use tracing::{debug, info, trace, warn};

use crate::common::path_security::export_path;
use crate::fs::{path_components, DirRef, FileKind, RawDirEntry};
use crate::session::EvidenceSession;

pub const NOT_AVAILABLE: &str = "N/A";

/// A timestamp, or the "not available" marker for zero and absent values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    At(i64),
    NotAvailable,
}

impl Timestamp {
    pub fn from_unix(value: Option<i64>) -> Self {
        match value {
            Some(t) if t != 0 => Timestamp::At(t),
            _ => Timestamp::NotAvailable,
        }
    }

    pub fn unix(&self) -> Option<i64> {
        match self {
            Timestamp::At(t) => Some(*t),
            Timestamp::NotAvailable => None,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unix().and_then(|t| DateTime::from_timestamp(t, 0)) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S UTC")),
            None => f.write_str(NOT_AVAILABLE),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where an archive member lives, so it can be reopened without a lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveLocation {
    pub internal_path: String,
    pub host_inode: u64,
    pub host_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    #[serde(skip)]
    pub kind: FileKind,
    /// Absent for archive members
    pub inode: Option<u64>,
    pub size: u64,
    pub created: Timestamp,
    pub accessed: Timestamp,
    pub modified: Timestamp,
    pub changed: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveLocation>,
}

impl DirectoryEntry {
    fn from_raw(raw: RawDirEntry) -> Self {
        let meta = raw.meta;
        Self {
            name: String::from_utf8_lossy(&raw.name).into_owned(),
            is_directory: meta.is_dir(),
            kind: meta.kind,
            inode: Some(meta.inode),
            size: meta.size,
            created: Timestamp::from_unix(meta.created),
            accessed: Timestamp::from_unix(meta.accessed),
            modified: Timestamp::from_unix(meta.modified),
            changed: Timestamp::from_unix(meta.changed),
            archive: None,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }
}

/// Which walk results are emitted; filters other than `All` keep regular files only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkFilter {
    All,
    AllFiles,
    /// Lower-case extensions with their dot; "" selects files without one
    Extensions(Vec<String>),
    /// Lower-case substring, or an exact extension when it starts with '.'
    Query(String),
}

impl WalkFilter {
    pub fn extensions<S: AsRef<str>>(extensions: &[S]) -> Self {
        WalkFilter::Extensions(extensions.iter().map(|e| normalize_extension(e.as_ref())).collect())
    }

    pub fn query(query: &str) -> Self {
        WalkFilter::Query(query.to_lowercase())
    }

    pub fn accepts(&self, entry: &DirectoryEntry) -> bool {
        match self {
            WalkFilter::All => true,
            WalkFilter::AllFiles => entry.is_regular(),
            WalkFilter::Extensions(list) => entry.is_regular() && list.contains(&extension_of(&entry.name)),
            WalkFilter::Query(query) => {
                entry.is_regular()
                    && if query.starts_with('.') {
                        extension_of(&entry.name) == *query
                    } else {
                        entry.name.to_lowercase().contains(query.as_str())
                    }
            }
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.is_empty() || ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// Lower-case extension including the dot; leading dots do not start one
pub fn extension_of(name: &str) -> String {
    let stem = name.trim_start_matches('.');
    match stem.rfind('.') {
        Some(i) => stem[i..].to_lowercase(),
        None => String::new(),
    }
}

fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent, name)
}

/// Hit from a multi-partition search
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub created: Timestamp,
    pub accessed: Timestamp,
    pub modified: Timestamp,
    pub changed: Timestamp,
    pub inode: Option<u64>,
    /// Start sector of the partition holding the file
    pub fs_offset: u64,
}

impl FileRecord {
    pub fn new(entry: DirectoryEntry, path: String, fs_offset: u64) -> Self {
        Self {
            name: entry.name,
            path,
            size: entry.size,
            created: entry.created,
            accessed: entry.accessed,
            modified: entry.modified,
            changed: entry.changed,
            inode: entry.inode,
            fs_offset,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
    pub skipped: usize,
}

/// Lazy depth-first walk; re-create it to start over
pub struct Walk<'a> {
    session: &'a mut EvidenceSession,
    fs_offset: u64,
    filter: WalkFilter,
    stack: Vec<(String, std::vec::IntoIter<DirectoryEntry>)>,
    visited: HashSet<u64>,
}

impl Iterator for Walk<'_> {
    type Item = (DirectoryEntry, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (parent, entries) = self.stack.last_mut()?;
            let Some(entry) = entries.next() else {
                self.stack.pop();
                continue;
            };
            let path = join_path(parent, &entry.name);

            if let (true, Some(inode)) = (entry.is_directory, entry.inode) {
                if self.visited.insert(inode) {
                    match self.session.read_listing(self.fs_offset, Some(inode)) {
                        Some(children) => self.stack.push((path.clone(), children.into_iter())),
                        None => debug!(path = %path, "Skipping unreadable directory"),
                    }
                } else {
                    warn!(path = %path, inode, "Directory loop, not descending");
                }
            }

            if self.filter.accepts(&entry) {
                return Some((entry, path));
            }
        }
    }
}

impl EvidenceSession {
    /// One directory level, cached by `(fs_offset, inode)`; `None` is the root
    pub fn list(&mut self, fs_offset: u64, inode: Option<u64>) -> Vec<DirectoryEntry> {
        if let Some(cached) = self.dir_cache.get(&(fs_offset, inode)) {
            trace!(fs_offset, ?inode, "Listing cache hit");
            return cached.clone();
        }
        let Some(entries) = self.read_listing(fs_offset, inode) else {
            return Vec::new();
        };
        self.dir_cache.insert((fs_offset, inode), entries.clone());
        entries
    }

    /// Uncached listing; `None` when the filesystem or directory cannot be opened
    pub(crate) fn read_listing(&mut self, fs_offset: u64, inode: Option<u64>) -> Option<Vec<DirectoryEntry>> {
        let fs = self.filesystem(fs_offset)?;
        let dir = match inode {
            Some(inode) => DirRef::Inode(inode),
            None => DirRef::Path("/"),
        };
        let raw = match fs.read_dir(dir) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(fs_offset, ?inode, error = %e, "Directory open failed");
                return None;
            }
        };

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match item {
                Ok(raw) if raw.name == b"." || raw.name == b".." => {}
                Ok(raw) => entries.push(DirectoryEntry::from_raw(raw)),
                Err(e) => trace!(fs_offset, ?inode, error = %e, "Skipping unreadable entry"),
            }
        }
        Some(entries)
    }

    /// Walk below `start_path`, yielding `(entry, full path)` pairs
    pub fn walk(&mut self, fs_offset: u64, start_path: &str, filter: WalkFilter) -> Walk<'_> {
        let components: Vec<&str> = path_components(start_path).collect();
        let from_root = components.is_empty();
        let start = if from_root {
            self.filesystem(fs_offset).map(|fs| fs.root_inode())
        } else {
            self.filesystem(fs_offset)
                .and_then(|fs| fs.lookup(start_path).ok())
                .filter(|meta| meta.is_dir())
                .map(|meta| meta.inode)
        };
        let listing = match start {
            Some(_) if from_root => self.read_listing(fs_offset, None),
            Some(inode) => self.read_listing(fs_offset, Some(inode)),
            None => {
                debug!(fs_offset, start_path, "Walk start is not a directory");
                None
            }
        };

        let base = components.iter().fold(String::new(), |acc, c| join_path(&acc, c));
        Walk {
            session: self,
            fs_offset,
            filter,
            stack: listing.map(|l| vec![(base, l.into_iter())]).unwrap_or_default(),
            visited: start.into_iter().collect(),
        }
    }

    /// Regular files whose name contains `query`, or whose extension equals it
    pub fn search_files(&mut self, query: &str) -> Vec<FileRecord> {
        self.collect_files(WalkFilter::query(query))
    }

    /// Regular files by extension; `None` lists every regular file
    pub fn list_files<S: AsRef<str>>(&mut self, extensions: Option<&[S]>) -> Vec<FileRecord> {
        let filter = match extensions {
            Some(list) => WalkFilter::extensions(list),
            None => WalkFilter::AllFiles,
        };
        self.collect_files(filter)
    }

    fn collect_files(&mut self, filter: WalkFilter) -> Vec<FileRecord> {
        let offsets = self.catalog().search_offsets();
        let mut records = Vec::new();
        for fs_offset in offsets {
            let hits: Vec<(DirectoryEntry, String)> = self.walk(fs_offset, "/", filter.clone()).collect();
            debug!(fs_offset, hits = hits.len(), "Partition searched");
            records.extend(hits.into_iter().map(|(entry, path)| FileRecord::new(entry, path, fs_offset)));
        }
        records
    }

    /// Copy a directory tree out of the image; failing items are counted, not fatal
    pub fn export_directory(&mut self, fs_offset: u64, inode: Option<u64>, dest: &Path) -> Result<ExportSummary, String> {
        fs::create_dir_all(dest).map_err(|e| format!("Failed to create {}: {}", dest.display(), e))?;
        let mut summary = ExportSummary::default();
        let start = inode.or_else(|| self.filesystem(fs_offset).map(|fs| fs.root_inode()));
        let mut visited: HashSet<u64> = start.into_iter().collect();
        self.export_tree(fs_offset, inode, dest, &mut summary, &mut visited);
        info!(
            files = summary.files,
            directories = summary.directories,
            skipped = summary.skipped,
            dest = %dest.display(),
            "Export finished"
        );
        Ok(summary)
    }

    fn export_tree(
        &mut self,
        fs_offset: u64,
        inode: Option<u64>,
        dest: &Path,
        summary: &mut ExportSummary,
        visited: &mut HashSet<u64>,
    ) {
        let Some(entries) = self.read_listing(fs_offset, inode) else {
            warn!(?inode, dest = %dest.display(), "Directory unreadable, skipped");
            summary.skipped += 1;
            return;
        };

        for entry in entries {
            let target = export_path(dest, &entry.name);
            match (entry.is_directory, entry.inode) {
                (true, Some(child)) => {
                    if !visited.insert(child) {
                        continue;
                    }
                    if let Err(e) = fs::create_dir_all(&target) {
                        warn!(path = %target.display(), error = %e, "Cannot create export directory");
                        summary.skipped += 1;
                        continue;
                    }
                    summary.directories += 1;
                    self.export_tree(fs_offset, Some(child), &target, summary, visited);
                }
                (false, Some(file)) if entry.is_regular() => match self.export_file(fs_offset, file, &target) {
                    Ok(written) => {
                        summary.files += 1;
                        summary.bytes += written;
                    }
                    Err(e) => {
                        warn!(path = %target.display(), error = %e, "File export failed");
                        summary.skipped += 1;
                    }
                },
                _ => {}
            }
        }
    }

    /// Write one file's content to `dest`, keeping its modification time
    pub fn export_file(&mut self, fs_offset: u64, inode: u64, dest: &Path) -> Result<u64, String> {
        let meta = self
            .file_meta(fs_offset, inode)
            .ok_or_else(|| format!("Inode {} metadata unreadable", inode))?;
        let data = if meta.size == 0 {
            Vec::new()
        } else {
            self.read_file(fs_offset, inode)
                .map(|(data, _)| data)
                .ok_or_else(|| format!("Inode {} content unreadable", inode))?
        };
        fs::write(dest, &data).map_err(|e| format!("Failed to write {}: {}", dest.display(), e))?;

        if let Some(mtime) = Timestamp::from_unix(meta.modified).unix() {
            let mtime = FileTime::from_unix_time(mtime, 0);
            let atime = Timestamp::from_unix(meta.accessed)
                .unix()
                .map(|t| FileTime::from_unix_time(t, 0))
                .unwrap_or(mtime);
            if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
                debug!(path = %dest.display(), error = %e, "Could not set file times");
            }
        }
        Ok(data.len() as u64)
    }
}

/// Two-decimal size with the largest fitting binary unit
pub fn readable_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} PB", size)
}
