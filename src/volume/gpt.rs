// GUID partition table behind a protective MBR

use std::io::{Read, Seek};

use tracing::debug;

use super::{VolumeEntry, VolumeFlags};
use crate::common::binary::{le_u16, le_u32, le_u64, read_bytes_at, utf16le_to_string};
use crate::common::SECTOR_SIZE;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const MAX_ENTRIES: u64 = 4096;

/// Well-known partition type GUIDs used when an entry carries no name
const KNOWN_TYPES: &[(&str, &str)] = &[
    ("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7", "Basic data partition"),
    ("C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "EFI system partition"),
    ("E3C9E316-0B5C-4DB8-817D-F92DF00215AE", "Microsoft reserved partition"),
    ("DE94BBA4-06D1-4D40-A16A-BFD50179D6AC", "Windows Recovery Environment"),
    ("0FC63DAF-8483-4772-8E79-3D69D8477DE4", "Linux filesystem"),
    ("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F", "Linux swap"),
    ("48465300-0000-11AA-AA11-00306543ECAC", "Apple HFS+"),
    ("7C3457EF-0000-11AA-AA11-00306543ECAC", "Apple APFS"),
];

pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Vec<VolumeEntry>, String> {
    let header = read_bytes_at(reader, SECTOR_SIZE, SECTOR_SIZE as usize)?;
    if &header[0..8] != GPT_SIGNATURE {
        return Err("No GPT header at LBA 1".to_string());
    }

    let entries_lba = le_u64(&header, 72);
    let entry_count = le_u32(&header, 80) as u64;
    let entry_size = le_u32(&header, 84) as u64;
    if !(128..=4096).contains(&entry_size) || entry_count == 0 || entry_count > MAX_ENTRIES {
        return Err(format!("Implausible GPT entry array ({} x {})", entry_count, entry_size));
    }

    let table_sectors = (entry_count * entry_size).div_ceil(SECTOR_SIZE);
    let table_offset = entries_lba
        .checked_mul(SECTOR_SIZE)
        .filter(|off| off.checked_add(table_sectors * SECTOR_SIZE).is_some())
        .ok_or_else(|| format!("GPT entry array LBA {} out of range", entries_lba))?;
    let table = read_bytes_at(reader, table_offset, (table_sectors * SECTOR_SIZE) as usize)?;

    let mut volumes = vec![
        VolumeEntry::new("Safety Table", 0, 1, VolumeFlags::Meta),
        VolumeEntry::new("GPT Header", 1, 1, VolumeFlags::Meta),
        VolumeEntry::new("Partition Table", entries_lba, table_sectors, VolumeFlags::Meta),
    ];

    for i in 0..entry_count as usize {
        let raw = &table[i * entry_size as usize..(i + 1) * entry_size as usize];
        if raw[0..16].iter().all(|&b| b == 0) {
            continue;
        }
        let first = le_u64(raw, 32);
        let last = le_u64(raw, 40);
        let Some(length) = entry_length(first, last) else {
            debug!(index = i, first, last, "Skipping GPT entry with unusable bounds");
            continue;
        };
        let name = utf16le_to_string(&raw[56..128]);
        let description = if name.trim().is_empty() {
            type_name(&raw[0..16])
        } else {
            name
        };
        volumes.push(VolumeEntry::new(&description, first, length, VolumeFlags::Allocated));
    }

    debug!(entries = volumes.len(), "Parsed GPT");
    Ok(volumes)
}

/// Sector count of an inclusive LBA range whose byte extent still fits a u64
fn entry_length(first: u64, last: u64) -> Option<u64> {
    let length = last.checked_sub(first)?.checked_add(1)?;
    first.checked_add(length)?.checked_mul(SECTOR_SIZE)?;
    Some(length)
}

/// Canonical text form of an on-disk (mixed-endian) GUID
pub fn guid_string(raw: &[u8]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{}-{}",
        le_u32(raw, 0),
        le_u16(raw, 4),
        le_u16(raw, 6),
        hex::encode_upper(&raw[8..10]),
        hex::encode_upper(&raw[10..16]),
    )
}

fn type_name(raw: &[u8]) -> String {
    let guid = guid_string(raw);
    KNOWN_TYPES
        .iter()
        .find(|(g, _)| *g == guid)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("Unknown ({})", guid))
}
