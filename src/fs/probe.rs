// Filesystem signature probe.
// Only the first 36 KiB of the partition is read; nothing is mounted here.

use std::io::{Read, Seek, SeekFrom};

use tracing::trace;

use super::FsType;
use crate::common::binary::{le_u16, le_u32};

const PROBE_WINDOW: usize = 36 * 1024;

const EXT_SUPERBLOCK: usize = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const EXT_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT_INCOMPAT_EXTENTS: u32 = 0x0040;
const EXT_INCOMPAT_64BIT: u32 = 0x0080;
const EXT_INCOMPAT_FLEX_BG: u32 = 0x0200;

const ISO_PVD_OFFSET: usize = 0x8000;

/// Identify the filesystem at the reader's start
pub fn probe<R: Read + Seek>(reader: &mut R) -> Result<FsType, String> {
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| format!("Failed to seek to partition start: {}", e))?;

    let mut window = Vec::with_capacity(PROBE_WINDOW);
    reader
        .take(PROBE_WINDOW as u64)
        .read_to_end(&mut window)
        .map_err(|e| format!("Failed to read probe window: {}", e))?;

    if window.len() < 512 {
        return Err("Partition is smaller than one sector".to_string());
    }

    let fs_type = identify(&window).ok_or_else(|| "No known filesystem signature".to_string())?;
    trace!(fs_type = fs_type.name(), "Probe matched");
    Ok(fs_type)
}

/// Signature checks in probe order
pub fn identify(window: &[u8]) -> Option<FsType> {
    if window.get(3..11) == Some(&b"NTFS    "[..]) {
        return Some(FsType::Ntfs);
    }
    if window.get(3..11) == Some(&b"EXFAT   "[..]) {
        return Some(FsType::ExFat);
    }
    if let Some(fat) = fat_type(window) {
        return Some(fat);
    }
    if let Some(ext) = ext_type(window) {
        return Some(ext);
    }
    if window.get(ISO_PVD_OFFSET + 1..ISO_PVD_OFFSET + 6) == Some(&b"CD001"[..]) {
        return Some(FsType::Iso9660);
    }
    if matches!(window.get(1024..1026), Some(b"BD") | Some(b"H+") | Some(b"HX")) {
        return Some(FsType::Hfs);
    }
    if window.get(32..36) == Some(&b"NXSB"[..]) {
        return Some(FsType::Apfs);
    }
    None
}

/// True when `sector` is a FAT/NTFS/exFAT boot sector rather than a partition table
pub fn is_boot_sector(sector: &[u8]) -> bool {
    sector.get(3..11) == Some(&b"NTFS    "[..])
        || sector.get(3..11) == Some(&b"EXFAT   "[..])
        || fat_type(sector).is_some()
}

/// FAT variant from BPB geometry; None unless every field is plausible
pub fn fat_type(boot: &[u8]) -> Option<FsType> {
    if boot.len() < 512 || boot[510] != 0x55 || boot[511] != 0xAA {
        return None;
    }
    if boot[0] != 0xEB && boot[0] != 0xE9 {
        return None;
    }

    let bytes_per_sector = le_u16(boot, 11) as u64;
    let sectors_per_cluster = boot[13] as u64;
    let reserved = le_u16(boot, 14) as u64;
    let num_fats = boot[16] as u64;
    let root_entries = le_u16(boot, 17) as u64;

    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096)
        || sectors_per_cluster == 0
        || !sectors_per_cluster.is_power_of_two()
        || reserved == 0
        || num_fats == 0
    {
        return None;
    }

    let total_sectors = match le_u16(boot, 19) {
        0 => le_u32(boot, 32) as u64,
        n => n as u64,
    };
    let fat_size = match le_u16(boot, 22) {
        0 => le_u32(boot, 36) as u64,
        n => n as u64,
    };
    if total_sectors == 0 || fat_size == 0 {
        return None;
    }

    let root_dir_sectors = (root_entries * 32).div_ceil(bytes_per_sector);
    let data_start = reserved + num_fats * fat_size + root_dir_sectors;
    if data_start >= total_sectors {
        return None;
    }
    let clusters = (total_sectors - data_start) / sectors_per_cluster;

    Some(if clusters < 4085 {
        FsType::Fat12
    } else if clusters < 65525 {
        FsType::Fat16
    } else {
        FsType::Fat32
    })
}

fn ext_type(window: &[u8]) -> Option<FsType> {
    let sb = window.get(EXT_SUPERBLOCK..EXT_SUPERBLOCK + 1024)?;
    if le_u16(sb, 56) != EXT_MAGIC {
        return None;
    }
    let compat = le_u32(sb, 92);
    let incompat = le_u32(sb, 96);
    Some(
        if incompat & (EXT_INCOMPAT_EXTENTS | EXT_INCOMPAT_64BIT | EXT_INCOMPAT_FLEX_BG) != 0 {
            FsType::Ext4
        } else if compat & EXT_COMPAT_HAS_JOURNAL != 0 {
            FsType::Ext3
        } else {
            FsType::Ext2
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Fat12Builder, FatNode};
    use std::io::Cursor;

    fn ext_window(compat: u32, incompat: u32) -> Vec<u8> {
        let mut w = vec![0u8; 4096];
        w[1024 + 56..1024 + 58].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        w[1024 + 92..1024 + 96].copy_from_slice(&compat.to_le_bytes());
        w[1024 + 96..1024 + 100].copy_from_slice(&incompat.to_le_bytes());
        w
    }

    #[test]
    fn test_ext_generations() {
        assert_eq!(identify(&ext_window(0, 0)), Some(FsType::Ext2));
        assert_eq!(identify(&ext_window(EXT_COMPAT_HAS_JOURNAL, 0)), Some(FsType::Ext3));
        assert_eq!(identify(&ext_window(EXT_COMPAT_HAS_JOURNAL, EXT_INCOMPAT_EXTENTS)), Some(FsType::Ext4));
        assert_eq!(identify(&ext_window(0, EXT_INCOMPAT_FLEX_BG)), Some(FsType::Ext4));
    }

    #[test]
    fn test_oem_signatures() {
        let mut w = vec![0u8; 512];
        w[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(identify(&w), Some(FsType::Ntfs));
        assert!(is_boot_sector(&w));
        w[3..11].copy_from_slice(b"EXFAT   ");
        assert_eq!(identify(&w), Some(FsType::ExFat));
    }

    #[test]
    fn test_other_signatures() {
        let mut iso = vec![0u8; 0x8800];
        iso[0x8001..0x8006].copy_from_slice(b"CD001");
        assert_eq!(identify(&iso), Some(FsType::Iso9660));

        let mut hfs = vec![0u8; 2048];
        hfs[1024..1026].copy_from_slice(b"H+");
        assert_eq!(identify(&hfs), Some(FsType::Hfs));

        let mut apfs = vec![0u8; 512];
        apfs[32..36].copy_from_slice(b"NXSB");
        assert_eq!(identify(&apfs), Some(FsType::Apfs));
    }

    #[test]
    fn test_fat12_fixture() {
        let image = Fat12Builder::build(vec![FatNode::file("A.TXT", b"a")]);
        assert_eq!(fat_type(&image[..512]), Some(FsType::Fat12));
        assert_eq!(probe(&mut Cursor::new(image)).unwrap(), FsType::Fat12);
    }

    #[test]
    fn test_blank_and_tiny() {
        assert!(probe(&mut Cursor::new(vec![0u8; 8192])).is_err());
        assert!(probe(&mut Cursor::new(vec![0u8; 100])).is_err());
        assert!(!is_boot_sector(&[0u8; 512]));
    }
}
