// DOS partition table with extended (EBR) chains

use std::collections::HashSet;
use std::io::{Read, Seek};

use tracing::{debug, trace};

use super::{VolumeEntry, VolumeFlags};
use crate::common::binary::{le_u32, read_bytes_at};
use crate::common::SECTOR_SIZE;
use crate::fs::probe::is_boot_sector;

const ENTRY_TABLE: usize = 446;
const ENTRY_SIZE: usize = 16;
const MAX_EBR_DEPTH: usize = 128;

pub const GPT_PROTECTIVE: u8 = 0xEE;

struct PrimaryEntry {
    ptype: u8,
    start: u64,
    length: u64,
}

fn entries(sector: &[u8]) -> Vec<PrimaryEntry> {
    (0..4)
        .map(|i| {
            let e = ENTRY_TABLE + i * ENTRY_SIZE;
            PrimaryEntry {
                ptype: sector[e + 4],
                start: le_u32(sector, e + 8) as u64,
                length: le_u32(sector, e + 12) as u64,
            }
        })
        .collect()
}

/// Signature present, boot flags sane, and not a filesystem boot sector
pub fn is_partition_table(sector: &[u8]) -> bool {
    if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
        return false;
    }
    if is_boot_sector(sector) {
        return false;
    }
    let flags_ok = (0..4).all(|i| matches!(sector[ENTRY_TABLE + i * ENTRY_SIZE], 0x00 | 0x80));
    flags_ok && entries(sector).iter().any(|e| e.ptype != 0)
}

/// True when the only use of the table is a GPT protective entry
pub fn is_protective(sector: &[u8]) -> bool {
    entries(sector).iter().any(|e| e.ptype == GPT_PROTECTIVE)
}

fn is_extended(ptype: u8) -> bool {
    matches!(ptype, 0x05 | 0x0F | 0x85)
}

/// Parse the table in sector 0 and every EBR it links to
pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Vec<VolumeEntry>, String> {
    let sector0 = read_bytes_at(reader, 0, SECTOR_SIZE as usize)?;
    if !is_partition_table(&sector0) {
        return Err("No DOS partition table".to_string());
    }

    let mut volumes = vec![VolumeEntry::new("Primary Table (#0)", 0, 1, VolumeFlags::Meta)];
    let mut table_number = 0;

    for entry in entries(&sector0) {
        if entry.ptype == 0 || entry.length == 0 {
            continue;
        }
        if is_extended(entry.ptype) {
            volumes.push(VolumeEntry::extended_container(&type_description(entry.ptype), entry.start, entry.length));
            walk_ebr_chain(reader, entry.start, &mut table_number, &mut volumes);
        } else {
            volumes.push(VolumeEntry::new(&type_description(entry.ptype), entry.start, entry.length, VolumeFlags::Allocated));
        }
    }

    debug!(entries = volumes.len(), "Parsed DOS partition table");
    Ok(volumes)
}

/// Follow the EBR list; a broken link ends the chain without failing the table
fn walk_ebr_chain<R: Read + Seek>(reader: &mut R, ext_base: u64, table_number: &mut usize, volumes: &mut Vec<VolumeEntry>) {
    let mut ebr_lba = ext_base;
    let mut seen = HashSet::new();
    for _ in 0..MAX_EBR_DEPTH {
        if !seen.insert(ebr_lba) {
            debug!(ebr_lba, "EBR chain loops back, chain ends");
            return;
        }
        let sector = match read_bytes_at(reader, ebr_lba * SECTOR_SIZE, SECTOR_SIZE as usize) {
            Ok(s) => s,
            Err(e) => {
                debug!(ebr_lba, error = %e, "EBR unreadable, chain ends");
                return;
            }
        };
        if sector[510] != 0x55 || sector[511] != 0xAA {
            trace!(ebr_lba, "EBR signature missing, chain ends");
            return;
        }

        *table_number += 1;
        volumes.push(VolumeEntry::new(
            &format!("Extended Table (#{})", table_number),
            ebr_lba,
            1,
            VolumeFlags::Meta,
        ));

        let slots = entries(&sector);
        let logical = &slots[0];
        if logical.ptype != 0 && logical.length != 0 && !is_extended(logical.ptype) {
            volumes.push(VolumeEntry::new(
                &type_description(logical.ptype),
                ebr_lba + logical.start,
                logical.length,
                VolumeFlags::Allocated,
            ));
        }

        let next = &slots[1];
        if next.ptype == 0 || !is_extended(next.ptype) || next.start == 0 {
            return;
        }
        ebr_lba = ext_base + next.start;
    }
}

/// Partition type name in "Name (0xNN)" form
pub fn type_description(ptype: u8) -> String {
    let name = match ptype {
        0x01 => "DOS FAT12",
        0x04 | 0x06 => "DOS FAT16",
        0x05 => "DOS Extended",
        0x07 => "NTFS / exFAT",
        0x0B | 0x0C => "Win95 FAT32",
        0x0E => "Win95 FAT16",
        0x0F => "Win95 Extended",
        0x11 => "Hidden FAT12",
        0x12 => "Hidden FAT16",
        0x17 => "Hidden NTFS / exFAT",
        0x1B | 0x1C => "Hidden Win95 FAT32",
        0x27 => "Windows Recovery",
        0x42 => "Windows Dynamic",
        0x82 => "Linux Swap / Solaris x86",
        0x83 => "Linux",
        0x85 => "Linux Extended",
        0x8E => "Linux Logical Volume Manager",
        0xA5 => "FreeBSD",
        0xA6 => "OpenBSD",
        0xA8 => "Mac OS X",
        0xAF => "Mac OS X HFS",
        0xEE => "GPT Safety Partition",
        0xEF => "EFI File System",
        0xFD => "Linux RAID",
        _ => "Unknown Type",
    };
    format!("{} (0x{:02x})", name, ptype)
}
