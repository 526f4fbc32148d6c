//! Operating-system identity from the SOFTWARE hive
//!
//! The hive is copied out of the filesystem into a temporary file that is
//! removed when the lookup finishes, whatever the outcome. Values that are
//! missing from the hive read as `N/A`.

pub mod regf;

use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::fs::FsType;
use crate::session::EvidenceSession;
use crate::walker::NOT_AVAILABLE;

pub use regf::RegfHive;

/// Key holding the version values in a SOFTWARE hive
pub const CURRENT_VERSION_KEY: &str = "Microsoft\\Windows NT\\CurrentVersion";

/// A decoded registry value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegValue {
    Text(String),
    MultiText(Vec<String>),
    Dword(u32),
    Qword(u64),
    Binary(Vec<u8>),
}

impl fmt::Display for RegValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegValue::Text(s) => f.write_str(s),
            RegValue::MultiText(parts) => f.write_str(&parts.join(", ")),
            RegValue::Dword(v) => write!(f, "{}", v),
            RegValue::Qword(v) => write!(f, "{}", v),
            RegValue::Binary(bytes) => f.write_str(&hex::encode(bytes)),
        }
    }
}

/// Key/value lookup over a hive file on disk
pub trait HiveParser: Sized {
    fn open(path: &Path) -> Result<Self, String>;

    /// `Err` when the key is missing, `Ok(None)` when the value is missing or unreadable
    fn value(&self, key_path: &str, name: &str) -> Result<Option<RegValue>, String>;
}

/// Identity string assembled from the CurrentVersion key
pub fn format_identity<P: HiveParser>(hive: &P) -> Result<String, String> {
    let get = |name: &str| -> Result<String, String> {
        Ok(match hive.value(CURRENT_VERSION_KEY, name)? {
            Some(value) => value.to_string(),
            None => {
                debug!(value = name, "Registry value missing");
                NOT_AVAILABLE.to_string()
            }
        })
    };
    Ok(format!(
        "{} Version {}\nBuild {} {}\nOwner: {}\nProduct ID: {}",
        get("ProductName")?,
        get("CurrentVersion")?,
        get("CurrentBuild")?,
        get("CSDVersion")?,
        get("RegisteredOwner")?,
        get("ProductId")?,
    ))
}

/// One partition's answer in [`EvidenceSession::os_information`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsReport {
    pub description: String,
    pub start_sector: u64,
    pub fs_type: FsType,
    pub identity: Option<String>,
}

impl EvidenceSession {
    /// OS identity of the Windows install on an NTFS filesystem
    pub fn os_identity(&mut self, fs_offset: u64) -> Option<String> {
        self.os_identity_with::<RegfHive>(fs_offset)
    }

    pub fn os_identity_with<P: HiveParser>(&mut self, fs_offset: u64) -> Option<String> {
        if self.fs_type(fs_offset) != FsType::Ntfs {
            return None;
        }
        let hive_path = self.config().software_hive_path.clone();
        let hive_data = self.read_hive(fs_offset, &hive_path)?;

        let mut temp = match NamedTempFile::new() {
            Ok(temp) => temp,
            Err(e) => {
                warn!(error = %e, "Could not create temporary hive file");
                return None;
            }
        };
        if let Err(e) = temp.write_all(&hive_data).and_then(|_| temp.flush()) {
            warn!(error = %e, "Could not write temporary hive file");
            return None;
        }

        let identity = P::open(temp.path()).and_then(|hive| format_identity(&hive));
        match identity {
            Ok(identity) => {
                info!(fs_offset, "Extracted OS identity");
                Some(identity)
            }
            Err(e) => {
                warn!(fs_offset, error = %e, "Failed to parse SOFTWARE hive");
                None
            }
        }
    }

    /// Description, filesystem type and OS identity of every allocated partition
    pub fn os_information(&mut self) -> Vec<OsReport> {
        let catalog = self.catalog();
        let targets: Vec<(String, u64)> = if catalog.allocated().next().is_some() {
            catalog
                .allocated()
                .map(|v| (v.description.clone(), v.start_sector))
                .collect()
        } else {
            catalog
                .search_offsets()
                .into_iter()
                .map(|offset| ("Whole image".to_string(), offset))
                .collect()
        };

        targets
            .into_iter()
            .map(|(description, start_sector)| {
                let fs_type = self.fs_type(start_sector);
                let identity = self.os_identity(start_sector);
                OsReport {
                    description,
                    start_sector,
                    fs_type,
                    identity,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{fake_session, regf_hive, FakeFs, HiveValue, FAKE_ROOT};

    fn windows_fs(hive: Vec<u8>) -> FakeFs {
        let mut fs = FakeFs::new();
        fs.fs_type = FsType::Ntfs;
        fs.add_dir(FAKE_ROOT, 20, "Windows");
        fs.add_dir(20, 21, "System32");
        fs.add_dir(21, 22, "config");
        fs.add_file(22, 23, "SOFTWARE", hive);
        fs
    }

    fn software_hive() -> Vec<u8> {
        regf_hive(
            &["Microsoft", "Windows NT", "CurrentVersion"],
            &[
                ("ProductName", HiveValue::Sz("Windows 10 Pro")),
                ("CurrentVersion", HiveValue::Sz("6.3")),
                ("CurrentBuild", HiveValue::Sz("19045")),
                ("RegisteredOwner", HiveValue::Sz("Examiner")),
                ("ProductId", HiveValue::Sz("00330-80000-00000-AA111")),
            ],
        )
    }

    #[test]
    fn test_identity_with_missing_value() {
        let (_dir, mut session) = fake_session(windows_fs(software_hive()));
        assert_eq!(
            session.os_identity(0).unwrap(),
            "Windows 10 Pro Version 6.3\nBuild 19045 N/A\nOwner: Examiner\nProduct ID: 00330-80000-00000-AA111"
        );
    }

    #[test]
    fn test_non_ntfs_short_circuits() {
        let mut fs = windows_fs(software_hive());
        fs.fs_type = FsType::Ext4;
        let (_dir, mut session) = fake_session(fs);
        assert!(session.os_identity(0).is_none());
    }

    #[test]
    fn test_absent_or_corrupt_hive() {
        let (_dir, mut session) = fake_session(windows_fs(b"regf but not really".to_vec()));
        assert!(session.os_identity(0).is_none());

        let mut fs = FakeFs::new();
        fs.fs_type = FsType::Ntfs;
        let (_dir, mut session) = fake_session(fs);
        assert!(session.os_identity(0).is_none());
    }

    #[test]
    fn test_missing_key_fails_whole_lookup() {
        let hive = regf_hive(&["Microsoft"], &[("ProductName", HiveValue::Sz("x"))]);
        let (_dir, mut session) = fake_session(windows_fs(hive));
        assert!(session.os_identity(0).is_none());
    }

    #[test]
    fn test_os_information_for_bare_filesystem() {
        let (_dir, mut session) = fake_session(windows_fs(software_hive()));
        let reports = session.os_information();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].start_sector, 0);
        assert_eq!(reports[0].fs_type, FsType::Ntfs);
        assert!(reports[0].identity.as_deref().unwrap().starts_with("Windows 10 Pro"));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(RegValue::Dword(7).to_string(), "7");
        assert_eq!(RegValue::Binary(vec![0xab, 0x01]).to_string(), "ab01");
        assert_eq!(RegValue::MultiText(vec!["a".into(), "b".into()]).to_string(), "a, b");
    }
}
