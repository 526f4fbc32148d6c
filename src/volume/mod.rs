//! Volume catalog: partition tables, bare filesystems and wiped media
//!
//! Discovery is a three-step fallback that never fails: a DOS or GPT table
//! gives a partitioned layout, otherwise a filesystem mounted at offset 0
//! gives a bare layout, otherwise the image is treated as wiped.

pub mod gpt;
pub mod mbr;

use std::io::{Read, Seek};

use serde::Serialize;
use tracing::{debug, info};

use crate::common::binary::read_bytes_at;
use crate::common::SECTOR_SIZE;
use crate::container::{PartitionReader, SharedImage};
use crate::fs::{FileSystem, FsType, Mounter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolumeFlags {
    Allocated,
    Unallocated,
    Meta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeEntry {
    pub address: usize,
    pub description: String,
    pub start_sector: u64,
    pub length_sectors: u64,
    pub flags: VolumeFlags,
    /// Extended partition whose logical volumes are listed separately
    #[serde(skip)]
    container: bool,
}

impl VolumeEntry {
    pub(crate) fn new(description: &str, start_sector: u64, length_sectors: u64, flags: VolumeFlags) -> Self {
        Self {
            address: 0,
            description: description.to_string(),
            start_sector,
            length_sectors,
            flags,
            container: false,
        }
    }

    pub(crate) fn extended_container(description: &str, start_sector: u64, length_sectors: u64) -> Self {
        Self {
            container: true,
            ..Self::new(description, start_sector, length_sectors, VolumeFlags::Meta)
        }
    }

    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.length_sectors).saturating_sub(1)
    }

    pub fn size_bytes(&self) -> u64 {
        self.length_sectors.saturating_mul(SECTOR_SIZE)
    }

    pub fn byte_offset(&self) -> u64 {
        self.start_sector.saturating_mul(SECTOR_SIZE)
    }

    pub fn is_allocated(&self) -> bool {
        self.flags == VolumeFlags::Allocated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Layout {
    Partitioned,
    BareFilesystem,
    Wiped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeCatalog {
    pub layout: Layout,
    pub volumes: Vec<VolumeEntry>,
    /// Type of the filesystem at offset 0 for a bare layout
    pub bare_fs_type: Option<FsType>,
}

impl VolumeCatalog {
    pub fn wiped(&self) -> bool {
        self.layout == Layout::Wiped
    }

    pub fn bare_filesystem(&self) -> bool {
        self.layout == Layout::BareFilesystem
    }

    pub fn allocated(&self) -> impl Iterator<Item = &VolumeEntry> {
        self.volumes.iter().filter(|v| v.is_allocated())
    }

    /// Sector offsets worth searching: allocated partitions, or 0 without a table
    pub fn search_offsets(&self) -> Vec<u64> {
        match self.layout {
            Layout::Partitioned => self.allocated().map(|v| v.start_sector).collect(),
            Layout::BareFilesystem | Layout::Wiped => vec![0],
        }
    }
}

/// Catalog plus the filesystem mounted while probing a bare layout
pub struct Discovery {
    pub catalog: VolumeCatalog,
    pub bare_fs: Option<Box<dyn FileSystem>>,
}

pub fn discover(image: &SharedImage, mounter: &dyn Mounter) -> Discovery {
    match PartitionReader::new(image.clone(), 0) {
        Ok(mut reader) => {
            let total_sectors = reader.len() / SECTOR_SIZE;
            match read_volume_table(&mut reader, total_sectors) {
                Ok(volumes) if !volumes.is_empty() => {
                    info!(entries = volumes.len(), "Volume table found");
                    return Discovery {
                        catalog: VolumeCatalog {
                            layout: Layout::Partitioned,
                            volumes,
                            bare_fs_type: None,
                        },
                        bare_fs: None,
                    };
                }
                Ok(_) => debug!("Volume table has no usable entries"),
                Err(e) => debug!(error = %e, "No volume table"),
            }
        }
        Err(e) => debug!(error = %e, "Image window unavailable for table parsing"),
    }

    match mounter.mount(image, 0) {
        Ok(fs) => {
            let fs_type = fs.fs_type();
            info!(fs_type = fs_type.name(), "Bare filesystem at offset 0");
            Discovery {
                catalog: VolumeCatalog {
                    layout: Layout::BareFilesystem,
                    volumes: Vec::new(),
                    bare_fs_type: Some(fs_type),
                },
                bare_fs: Some(fs),
            }
        }
        Err(e) => {
            info!(error = %e, "No volume table or filesystem, treating image as wiped");
            Discovery {
                catalog: VolumeCatalog {
                    layout: Layout::Wiped,
                    volumes: Vec::new(),
                    bare_fs_type: None,
                },
                bare_fs: None,
            }
        }
    }
}

/// Parse GPT (behind a protective MBR) or a DOS table, then add gaps
pub fn read_volume_table<R: Read + Seek>(reader: &mut R, total_sectors: u64) -> Result<Vec<VolumeEntry>, String> {
    let sector0 = read_bytes_at(reader, 0, SECTOR_SIZE as usize)?;
    let mut entries = if mbr::is_partition_table(&sector0) && mbr::is_protective(&sector0) {
        match gpt::parse(reader) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Protective MBR without a GPT, reading it as a DOS table");
                mbr::parse(reader)?
            }
        }
    } else {
        mbr::parse(reader)?
    };

    entries.retain(|e| !e.description.trim().is_empty());
    Ok(fill_gaps(entries, total_sectors))
}

/// Order by start sector and insert `Unallocated` runs for uncovered sectors
fn fill_gaps(mut entries: Vec<VolumeEntry>, total_sectors: u64) -> Vec<VolumeEntry> {
    entries.sort_by(|a, b| {
        a.start_sector
            .cmp(&b.start_sector)
            .then(b.length_sectors.cmp(&a.length_sectors))
    });

    let mut out = Vec::with_capacity(entries.len() * 2);
    let mut cursor = 0u64;
    for entry in entries {
        if entry.start_sector > cursor {
            out.push(VolumeEntry::new("Unallocated", cursor, entry.start_sector - cursor, VolumeFlags::Unallocated));
        }
        if !entry.container {
            cursor = cursor.max(entry.start_sector.saturating_add(entry.length_sectors));
        } else {
            cursor = cursor.max(entry.start_sector);
        }
        out.push(entry);
    }
    if total_sectors > cursor {
        out.push(VolumeEntry::new("Unallocated", cursor, total_sectors - cursor, VolumeFlags::Unallocated));
    }

    for (address, entry) in out.iter_mut().enumerate() {
        entry.address = address;
    }
    out
}

/// Table structures rather than data
pub fn is_meta_description(description: &str) -> bool {
    ["Primary Table", "Safety Table", "GPT Header", "Partition Table"]
        .iter()
        .any(|m| description.contains(m))
}

/// Space with no filesystem worth mounting
pub fn is_unallocated_description(description: &str) -> bool {
    ["Unallocated", "Microsoft reserved"]
        .iter()
        .any(|m| description.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ImageContainer;
    use crate::fixtures::{gpt_disk, mbr_disk, Fat12Builder, FatNode};
    use crate::fs::NativeMounter;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn shared(dir: &TempDir, name: &str, bytes: &[u8]) -> SharedImage {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        ImageContainer::open(&path).unwrap().into_shared()
    }

    #[test]
    fn test_gaps_and_addresses() {
        let fat = Fat12Builder::build(vec![FatNode::file("A.TXT", b"a")]);
        let disk = mbr_disk(4096, &[(0x01, 63, &fat)]);
        let volumes = read_volume_table(&mut Cursor::new(disk), 4096).unwrap();

        let described: Vec<(usize, &str, u64, u64)> = volumes
            .iter()
            .map(|v| (v.address, v.description.as_str(), v.start_sector, v.length_sectors))
            .collect();
        assert_eq!(
            described,
            vec![
                (0, "Primary Table (#0)", 0, 1),
                (1, "Unallocated", 1, 62),
                (2, "DOS FAT12 (0x01)", 63, 2880),
                (3, "Unallocated", 2943, 1153),
            ]
        );
        assert_eq!(volumes[2].end_sector(), 2942);
        assert_eq!(volumes[2].size_bytes(), 2880 * 512);
        assert_eq!(volumes[1].flags, VolumeFlags::Unallocated);
    }

    #[test]
    fn test_gpt_preferred_over_protective_entry() {
        let part = vec![0u8; 64 * 512];
        let disk = gpt_disk(256, &[("Data", 40, &part)]);
        let volumes = read_volume_table(&mut Cursor::new(disk), 256).unwrap();
        let names: Vec<&str> = volumes.iter().map(|v| v.description.as_str()).collect();
        assert_eq!(
            names,
            vec!["Safety Table", "GPT Header", "Partition Table", "Unallocated", "Data", "Unallocated"]
        );
        assert_eq!(volumes[3].start_sector, 34);
        assert_eq!(volumes[3].length_sectors, 6);
    }

    #[test]
    fn test_extended_container_does_not_hide_gaps() {
        let entries = vec![
            VolumeEntry::new("Primary Table (#0)", 0, 1, VolumeFlags::Meta),
            VolumeEntry::extended_container("DOS Extended (0x05)", 100, 100),
            VolumeEntry::new("Extended Table (#1)", 100, 1, VolumeFlags::Meta),
            VolumeEntry::new("Linux (0x83)", 110, 20, VolumeFlags::Allocated),
        ];
        let out = fill_gaps(entries, 200);
        let gaps: Vec<(u64, u64)> = out
            .iter()
            .filter(|v| v.flags == VolumeFlags::Unallocated)
            .map(|v| (v.start_sector, v.length_sectors))
            .collect();
        assert_eq!(gaps, vec![(1, 99), (101, 9), (130, 70)]);
    }

    #[test]
    fn test_three_tier_fallback() {
        let dir = TempDir::new().unwrap();
        let fat = Fat12Builder::build(vec![FatNode::file("A.TXT", b"a")]);

        let partitioned = shared(&dir, "disk.dd", &mbr_disk(4096, &[(0x01, 63, &fat)]));
        let found = discover(&partitioned, &NativeMounter);
        assert_eq!(found.catalog.layout, Layout::Partitioned);
        assert!(!found.catalog.wiped());
        assert!(!found.catalog.volumes.is_empty());
        assert_eq!(found.catalog.search_offsets(), vec![63]);

        let bare = shared(&dir, "floppy.img", &fat);
        let found = discover(&bare, &NativeMounter);
        assert!(found.catalog.bare_filesystem());
        assert!(!found.catalog.wiped());
        assert!(found.catalog.volumes.is_empty());
        assert_eq!(found.catalog.bare_fs_type, Some(FsType::Fat12));
        assert!(found.bare_fs.is_some());

        let blank = shared(&dir, "wiped.raw", &vec![0u8; 64 * 1024]);
        let found = discover(&blank, &NativeMounter);
        assert!(found.catalog.wiped());
        assert!(found.catalog.volumes.is_empty());
        assert_eq!(found.catalog.search_offsets(), vec![0]);
    }

    #[test]
    fn test_gaps_with_entry_reaching_u64_max() {
        let entries = vec![
            VolumeEntry::new("Primary Table (#0)", 0, 1, VolumeFlags::Meta),
            VolumeEntry::new("Linux (0x83)", 10, u64::MAX, VolumeFlags::Allocated),
        ];
        let out = fill_gaps(entries, 100);
        let described: Vec<(&str, u64)> = out.iter().map(|v| (v.description.as_str(), v.start_sector)).collect();
        assert_eq!(described, vec![("Primary Table (#0)", 0), ("Unallocated", 1), ("Linux (0x83)", 10)]);
        assert_eq!(out[2].end_sector(), u64::MAX - 1);
    }

    #[test]
    fn test_corrupt_gpt_header_falls_back() {
        let part = vec![0u8; 16 * 512];
        let mut disk = gpt_disk(400, &[("Data", 40, &part)]);
        disk[512 + 72..512 + 80].copy_from_slice(&u64::MAX.to_le_bytes());
        let volumes = read_volume_table(&mut Cursor::new(disk), 400).unwrap();
        assert!(volumes.iter().all(|v| v.description != "Data"));
    }

    #[test]
    fn test_description_classes() {
        assert!(is_meta_description("Primary Table (#0)"));
        assert!(is_meta_description("GPT Header"));
        assert!(!is_meta_description("Linux (0x83)"));
        assert!(is_unallocated_description("Unallocated"));
        assert!(is_unallocated_description("Microsoft reserved partition"));
        assert!(!is_unallocated_description("Basic data partition"));
    }
}
