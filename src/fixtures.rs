//! Synthetic evidence builders shared by the unit tests
//!
//! Every builder produces bytes in memory; tests write them into a
//! `TempDir` when a real file path is needed.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::common::segments::ewf_segment_extension;
use tempfile::TempDir;

use crate::config::ToolkitConfig;
use crate::container::SharedImage;
use crate::fs::{DirRef, FileKind, FileMeta, FileSystem, FsType, Mounter, RawDirEntry};
use crate::session::EvidenceSession;

/// Deterministic non-repeating-looking bytes
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

// =============================================================================
// EWF
// =============================================================================

pub struct EwfFixture<'a> {
    data: &'a [u8],
    sectors_per_chunk: u32,
    chunks_per_segment: usize,
    compressed: bool,
    digest: bool,
}

const DESCRIPTOR_SIZE: usize = 76;

impl<'a> EwfFixture<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len() % 512, 0, "fixture media must be whole sectors");
        Self {
            data,
            sectors_per_chunk: 8,
            chunks_per_segment: usize::MAX,
            compressed: true,
            digest: false,
        }
    }

    pub fn chunks_per_segment(mut self, n: usize) -> Self {
        self.chunks_per_segment = n;
        self
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn with_digest(mut self) -> Self {
        self.digest = true;
        self
    }

    /// Write every segment next to `dir/first_name`; returns the first path
    pub fn write(&self, dir: &Path, first_name: &str) -> PathBuf {
        let (stem, ext) = first_name.rsplit_once('.').expect("segment name needs an extension");
        for (i, segment) in self.build().into_iter().enumerate() {
            let name = format!("{}.{}", stem, ewf_segment_extension(ext, i as u32 + 1).unwrap());
            std::fs::write(dir.join(name), segment).unwrap();
        }
        dir.join(first_name)
    }

    pub fn build(&self) -> Vec<Vec<u8>> {
        let chunk_size = self.sectors_per_chunk as usize * 512;
        let chunks: Vec<&[u8]> = self.data.chunks(chunk_size).collect();
        let groups: Vec<&[&[u8]]> = if chunks.is_empty() {
            vec![&chunks[..0]]
        } else {
            chunks.chunks(self.chunks_per_segment.max(1)).collect()
        };

        let mut segments = Vec::new();
        for (seg_idx, group) in groups.iter().enumerate() {
            let last = seg_idx + 1 == groups.len();
            let mut out = Vec::new();
            out.extend_from_slice(b"EVF\x09\x0d\x0a\xff\x00");
            out.push(1);
            out.extend_from_slice(&(seg_idx as u16 + 1).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());

            if seg_idx == 0 {
                let mut volume = vec![0u8; 1052];
                volume[0] = 1;
                volume[4..8].copy_from_slice(&(chunks.len() as u32).to_le_bytes());
                volume[8..12].copy_from_slice(&self.sectors_per_chunk.to_le_bytes());
                volume[12..16].copy_from_slice(&512u32.to_le_bytes());
                volume[16..24].copy_from_slice(&((self.data.len() / 512) as u64).to_le_bytes());
                push_section(&mut out, "volume", &volume);
            }

            let sectors_start = out.len() + DESCRIPTOR_SIZE;
            let mut sectors = Vec::new();
            let mut entries = Vec::new();
            for chunk in group.iter() {
                let offset = (sectors_start + sectors.len()) as u32;
                if self.compressed {
                    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
                    enc.write_all(chunk).unwrap();
                    sectors.extend_from_slice(&enc.finish().unwrap());
                    entries.push(offset | 0x8000_0000);
                } else {
                    sectors.extend_from_slice(chunk);
                    sectors.extend_from_slice(&[0u8; 4]); // adler32 slot
                    entries.push(offset);
                }
            }
            push_section(&mut out, "sectors", &sectors);

            let mut table = vec![0u8; 24];
            table[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
            for e in &entries {
                table.extend_from_slice(&e.to_le_bytes());
            }
            table.extend_from_slice(&[0u8; 4]);
            push_section(&mut out, "table", &table);

            if last {
                if self.digest {
                    let mut digest = Vec::new();
                    digest.extend_from_slice(&Md5::digest(self.data));
                    digest.extend_from_slice(&Sha1::digest(self.data));
                    digest.extend_from_slice(&[0u8; 44]);
                    push_section(&mut out, "digest", &digest);
                }
                push_terminal(&mut out, "done");
            } else {
                push_terminal(&mut out, "next");
            }
            segments.push(out);
        }
        segments
    }
}

fn descriptor(section_type: &str, next: u64, size: u64) -> Vec<u8> {
    let mut d = vec![0u8; DESCRIPTOR_SIZE];
    d[..section_type.len()].copy_from_slice(section_type.as_bytes());
    d[16..24].copy_from_slice(&next.to_le_bytes());
    d[24..32].copy_from_slice(&size.to_le_bytes());
    d
}

fn push_section(out: &mut Vec<u8>, section_type: &str, data: &[u8]) {
    let size = (DESCRIPTOR_SIZE + data.len()) as u64;
    let next = out.len() as u64 + size;
    out.extend_from_slice(&descriptor(section_type, next, size));
    out.extend_from_slice(data);
}

/// `next` / `done` point at themselves
fn push_terminal(out: &mut Vec<u8>, section_type: &str) {
    let here = out.len() as u64;
    out.extend_from_slice(&descriptor(section_type, here, DESCRIPTOR_SIZE as u64));
}

// =============================================================================
// FAT12
// =============================================================================

/// A file or directory placed into a [`Fat12Builder`] image
pub enum FatNode {
    File { name: String, data: Vec<u8> },
    Dir { name: String, children: Vec<FatNode> },
}

impl FatNode {
    pub fn file(name: &str, data: &[u8]) -> Self {
        FatNode::File { name: name.to_string(), data: data.to_vec() }
    }

    pub fn dir(name: &str, children: Vec<FatNode>) -> Self {
        FatNode::Dir { name: name.to_string(), children }
    }
}

/// Builds a 1.44 MB-style FAT12 volume (512-byte sectors, 1 sector per cluster)
///
/// Short 8.3 names are used for names that fit, long names get LFN entries.
pub struct Fat12Builder {
    image: Vec<u8>,
    fat: Vec<u16>,
    next_cluster: u16,
}

const FAT12_TOTAL_SECTORS: usize = 2880;
const FAT12_RESERVED: usize = 1;
const FAT12_FAT_SECTORS: usize = 9;
const FAT12_ROOT_ENTRIES: usize = 224;
const FAT12_ROOT_START: usize = FAT12_RESERVED + 2 * FAT12_FAT_SECTORS; // sector 19
const FAT12_DATA_START: usize = FAT12_ROOT_START + FAT12_ROOT_ENTRIES * 32 / 512; // sector 33

/// 2000-01-02 03:04:06 in FAT date/time encoding
pub const FAT_FIXTURE_DATE: u16 = (20 << 9) | (1 << 5) | 2;
pub const FAT_FIXTURE_TIME: u16 = (3 << 11) | (4 << 5) | 3;

impl Fat12Builder {
    pub fn build(root: Vec<FatNode>) -> Vec<u8> {
        let mut builder = Fat12Builder {
            image: vec![0u8; FAT12_TOTAL_SECTORS * 512],
            fat: vec![0u16; FAT12_TOTAL_SECTORS],
            next_cluster: 2,
        };
        builder.write_boot_sector();
        builder.fat[0] = 0xFF0;
        builder.fat[1] = 0xFFF;

        let root_entries = builder.encode_dir(&root, None);
        let root_offset = FAT12_ROOT_START * 512;
        builder.image[root_offset..root_offset + root_entries.len()].copy_from_slice(&root_entries);

        builder.write_fats();
        builder.image
    }

    fn write_boot_sector(&mut self) {
        let bs = &mut self.image[..512];
        bs[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        bs[3..11].copy_from_slice(b"MSDOS5.0");
        bs[11..13].copy_from_slice(&512u16.to_le_bytes());
        bs[13] = 1;
        bs[14..16].copy_from_slice(&(FAT12_RESERVED as u16).to_le_bytes());
        bs[16] = 2;
        bs[17..19].copy_from_slice(&(FAT12_ROOT_ENTRIES as u16).to_le_bytes());
        bs[19..21].copy_from_slice(&(FAT12_TOTAL_SECTORS as u16).to_le_bytes());
        bs[21] = 0xF0;
        bs[22..24].copy_from_slice(&(FAT12_FAT_SECTORS as u16).to_le_bytes());
        bs[24..26].copy_from_slice(&18u16.to_le_bytes());
        bs[26..28].copy_from_slice(&2u16.to_le_bytes());
        bs[38] = 0x29;
        bs[43..54].copy_from_slice(b"FIXTURE    ");
        bs[54..62].copy_from_slice(b"FAT12   ");
        bs[510] = 0x55;
        bs[511] = 0xAA;
    }

    fn write_fats(&mut self) {
        let mut packed = vec![0u8; FAT12_FAT_SECTORS * 512];
        for (cluster, &value) in self.fat.iter().enumerate() {
            let off = cluster * 3 / 2;
            if off + 1 >= packed.len() {
                break;
            }
            if cluster % 2 == 0 {
                packed[off] = (value & 0xFF) as u8;
                packed[off + 1] = (packed[off + 1] & 0xF0) | ((value >> 8) & 0x0F) as u8;
            } else {
                packed[off] = (packed[off] & 0x0F) | (((value & 0x0F) << 4) as u8);
                packed[off + 1] = (value >> 4) as u8;
            }
        }
        for copy in 0..2 {
            let start = (FAT12_RESERVED + copy * FAT12_FAT_SECTORS) * 512;
            self.image[start..start + packed.len()].copy_from_slice(&packed);
        }
    }

    /// Allocate a contiguous chain for `len` bytes; returns the first cluster
    fn allocate(&mut self, len: usize) -> u16 {
        if len == 0 {
            return 0;
        }
        let count = len.div_ceil(512);
        let first = self.next_cluster;
        for i in 0..count {
            let cluster = first as usize + i;
            self.fat[cluster] = if i + 1 == count { 0xFFF } else { (cluster + 1) as u16 };
        }
        self.next_cluster += count as u16;
        first
    }

    fn write_cluster_data(&mut self, first: u16, data: &[u8]) {
        if first == 0 {
            return;
        }
        let offset = (FAT12_DATA_START + first as usize - 2) * 512;
        self.image[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Encode directory entries; `parent` is Some((self_cluster, parent_cluster)) for subdirectories
    fn encode_dir(&mut self, nodes: &[FatNode], dot_entries: Option<(u16, u16)>) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some((own, parent)) = dot_entries {
            out.extend_from_slice(&short_entry(*b".          ", 0x10, own, 0));
            out.extend_from_slice(&short_entry(*b"..         ", 0x10, parent, 0));
        }
        for (index, node) in nodes.iter().enumerate() {
            let (name, attr, cluster, size) = match node {
                FatNode::File { name, data } => {
                    let cluster = self.allocate(data.len());
                    self.write_cluster_data(cluster, data);
                    (name, 0x20u8, cluster, data.len() as u32)
                }
                FatNode::Dir { name, children } => {
                    // Reserve the directory cluster(s) before encoding children
                    let estimate = (children.len() * 3 + 2) * 32;
                    let cluster = self.allocate(estimate.max(512));
                    let own_parent = dot_entries.map(|(own, _)| own).unwrap_or(0);
                    let entries = self.encode_dir(children, Some((cluster, own_parent)));
                    self.write_cluster_data(cluster, &entries);
                    (name, 0x10u8, cluster, 0)
                }
            };
            match short_name_for(name) {
                Some(short) => out.extend_from_slice(&short_entry(short, attr, cluster, size)),
                None => {
                    let short = numbered_short_name(name, index);
                    out.extend_from_slice(&lfn_entries(name, &short));
                    out.extend_from_slice(&short_entry(short, attr, cluster, size));
                }
            }
        }
        out
    }
}

fn short_entry(name: [u8; 11], attr: u8, cluster: u16, size: u32) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[..11].copy_from_slice(&name);
    e[11] = attr;
    e[14..16].copy_from_slice(&FAT_FIXTURE_TIME.to_le_bytes());
    e[16..18].copy_from_slice(&FAT_FIXTURE_DATE.to_le_bytes());
    e[18..20].copy_from_slice(&FAT_FIXTURE_DATE.to_le_bytes());
    e[22..24].copy_from_slice(&FAT_FIXTURE_TIME.to_le_bytes());
    e[24..26].copy_from_slice(&FAT_FIXTURE_DATE.to_le_bytes());
    e[26..28].copy_from_slice(&cluster.to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
    e
}

/// 8.3 form when `name` is already upper-case and short
fn short_name_for(name: &str) -> Option<[u8; 11]> {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    let valid = |s: &str| s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if base.is_empty() || base.len() > 8 || ext.len() > 3 || !valid(base) || !valid(ext) {
        return None;
    }
    let mut out = [b' '; 11];
    out[..base.len()].copy_from_slice(base.as_bytes());
    out[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    Some(out)
}

fn numbered_short_name(name: &str, index: usize) -> [u8; 11] {
    let mut out = [b' '; 11];
    let stem: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_ascii_uppercase();
    let short = format!("{}~{}", stem, index + 1);
    out[..short.len()].copy_from_slice(short.as_bytes());
    out
}

fn lfn_checksum(short: &[u8; 11]) -> u8 {
    short.iter().fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
}

fn lfn_entries(name: &str, short: &[u8; 11]) -> Vec<u8> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0);
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }
    let parts: Vec<&[u16]> = units.chunks(13).collect();
    let checksum = lfn_checksum(short);
    let mut out = Vec::new();
    for (i, part) in parts.iter().enumerate().rev() {
        let mut e = [0u8; 32];
        let mut seq = (i + 1) as u8;
        if i + 1 == parts.len() {
            seq |= 0x40;
        }
        e[0] = seq;
        e[11] = 0x0F;
        e[13] = checksum;
        let positions = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
        for (unit, &pos) in part.iter().zip(positions.iter()) {
            e[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&e);
    }
    out
}

// =============================================================================
// Partition tables
// =============================================================================

/// Wrap filesystem images into an MBR disk; each part is (type, start_lba, image)
pub fn mbr_disk(total_sectors: usize, parts: &[(u8, u32, &[u8])]) -> Vec<u8> {
    let mut disk = vec![0u8; total_sectors * 512];
    for (i, (ptype, start, image)) in parts.iter().enumerate() {
        let entry = 446 + i * 16;
        let sectors = image.len().div_ceil(512) as u32;
        disk[entry] = 0x00;
        disk[entry + 4] = *ptype;
        disk[entry + 8..entry + 12].copy_from_slice(&start.to_le_bytes());
        disk[entry + 12..entry + 16].copy_from_slice(&sectors.to_le_bytes());
        let offset = *start as usize * 512;
        disk[offset..offset + image.len()].copy_from_slice(image);
    }
    disk[510] = 0x55;
    disk[511] = 0xAA;
    disk
}

/// Basic data partition type GUID in on-disk byte order
pub const GPT_BASIC_DATA: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

/// GPT disk with one partition per (name, first_lba, image)
pub fn gpt_disk(total_sectors: usize, parts: &[(&str, u64, &[u8])]) -> Vec<u8> {
    let mut disk = vec![0u8; total_sectors * 512];
    // Protective MBR
    disk[446 + 4] = 0xEE;
    disk[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    disk[446 + 12..446 + 16].copy_from_slice(&((total_sectors - 1) as u32).to_le_bytes());
    disk[510] = 0x55;
    disk[511] = 0xAA;

    let header = 512;
    disk[header..header + 8].copy_from_slice(b"EFI PART");
    disk[header + 8..header + 12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    disk[header + 12..header + 16].copy_from_slice(&92u32.to_le_bytes());
    disk[header + 24..header + 32].copy_from_slice(&1u64.to_le_bytes());
    disk[header + 32..header + 40].copy_from_slice(&((total_sectors - 1) as u64).to_le_bytes());
    disk[header + 40..header + 48].copy_from_slice(&34u64.to_le_bytes());
    disk[header + 48..header + 56].copy_from_slice(&((total_sectors - 34) as u64).to_le_bytes());
    disk[header + 72..header + 80].copy_from_slice(&2u64.to_le_bytes());
    disk[header + 80..header + 84].copy_from_slice(&128u32.to_le_bytes());
    disk[header + 84..header + 88].copy_from_slice(&128u32.to_le_bytes());

    for (i, (name, first, image)) in parts.iter().enumerate() {
        let entry = 1024 + i * 128;
        disk[entry..entry + 16].copy_from_slice(&GPT_BASIC_DATA);
        disk[entry + 16] = i as u8 + 1; // unique GUID, only needs to be non-zero
        let last = first + image.len().div_ceil(512) as u64 - 1;
        disk[entry + 32..entry + 40].copy_from_slice(&first.to_le_bytes());
        disk[entry + 40..entry + 48].copy_from_slice(&last.to_le_bytes());
        for (j, unit) in name.encode_utf16().enumerate() {
            disk[entry + 56 + j * 2..entry + 58 + j * 2].copy_from_slice(&unit.to_le_bytes());
        }
        let offset = *first as usize * 512;
        disk[offset..offset + image.len()].copy_from_slice(image);
    }
    disk
}

// =============================================================================
// NTFS volume
// =============================================================================

/// 2 MiB mkntfs volume with 512-byte clusters. Root holds `empty-file`,
/// `file-with-12345` (resident), `1000-bytes-file` ("12345" x 200),
/// `sparse-file` (500005 bytes, "12345" then zeros then "11111") and
/// `many_subdirs/1..=512`.
pub fn ntfs_image() -> Vec<u8> {
    let packed: &[u8] = include_bytes!("../testdata/ntfs-small.img.gz");
    let mut image = Vec::new();
    GzDecoder::new(packed).read_to_end(&mut image).unwrap();
    image
}

// =============================================================================
// Registry hive
// =============================================================================

pub enum HiveValue<'a> {
    Sz(&'a str),
    Dword(u32),
    Binary(&'a [u8]),
}

/// Append one allocated cell, returning its hbin-relative offset
fn push_cell(bin: &mut Vec<u8>, data: &[u8]) -> u32 {
    let offset = bin.len() as u32;
    let size = (data.len() + 4).div_ceil(8) * 8;
    bin.extend_from_slice(&(-(size as i32)).to_le_bytes());
    bin.extend_from_slice(data);
    bin.resize(offset as usize + size, 0);
    offset
}

fn nk_cell(name: &str, subkeys: Option<u32>, values: &[u32], values_list: Option<u32>) -> Vec<u8> {
    let mut nk = vec![0u8; 76];
    nk[0..2].copy_from_slice(b"nk");
    nk[2..4].copy_from_slice(&0x0020u16.to_le_bytes());
    let (count, list) = match subkeys {
        Some(list) => (1u32, list),
        None => (0, u32::MAX),
    };
    nk[20..24].copy_from_slice(&count.to_le_bytes());
    nk[28..32].copy_from_slice(&list.to_le_bytes());
    nk[32..36].copy_from_slice(&u32::MAX.to_le_bytes());
    nk[36..40].copy_from_slice(&(values.len() as u32).to_le_bytes());
    nk[40..44].copy_from_slice(&values_list.unwrap_or(u32::MAX).to_le_bytes());
    nk[48..52].copy_from_slice(&u32::MAX.to_le_bytes());
    nk[72..74].copy_from_slice(&(name.len() as u16).to_le_bytes());
    nk.extend_from_slice(name.as_bytes());
    nk
}

/// Minimal regf hive: a root key `ROOT` with the chain `path` below it and
/// `values` on the deepest key
pub fn regf_hive(path: &[&str], values: &[(&str, HiveValue)]) -> Vec<u8> {
    let mut bin = vec![0u8; 32];
    bin[0..4].copy_from_slice(b"hbin");

    let mut value_cells = Vec::new();
    for (name, value) in values {
        let mut vk = vec![0u8; 20];
        vk[0..2].copy_from_slice(b"vk");
        vk[2..4].copy_from_slice(&(name.len() as u16).to_le_bytes());
        let (size, offset, kind) = match value {
            HiveValue::Sz(text) => {
                let mut data: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
                data.extend_from_slice(&[0, 0]);
                let size = data.len() as u32;
                (size, push_cell(&mut bin, &data), 1u32)
            }
            HiveValue::Dword(v) => (0x8000_0004, *v, 4),
            HiveValue::Binary(bytes) => (bytes.len() as u32, push_cell(&mut bin, bytes), 3),
        };
        vk[4..8].copy_from_slice(&size.to_le_bytes());
        vk[8..12].copy_from_slice(&offset.to_le_bytes());
        vk[12..16].copy_from_slice(&kind.to_le_bytes());
        vk[16..18].copy_from_slice(&1u16.to_le_bytes());
        vk.extend_from_slice(name.as_bytes());
        value_cells.push(push_cell(&mut bin, &vk));
    }
    let values_list = if value_cells.is_empty() {
        None
    } else {
        let list: Vec<u8> = value_cells.iter().flat_map(|o| o.to_le_bytes()).collect();
        Some(push_cell(&mut bin, &list))
    };

    // Deepest key first, each parent pointing at its child through an lf list
    let mut child: Option<(u32, &str)> = None;
    let names: Vec<&str> = std::iter::once("ROOT").chain(path.iter().copied()).collect();
    for (depth, name) in names.iter().enumerate().rev() {
        let subkeys = child.map(|(offset, child_name)| {
            let mut lf = vec![0u8; 4];
            lf[0..2].copy_from_slice(b"lf");
            lf[2..4].copy_from_slice(&1u16.to_le_bytes());
            lf.extend_from_slice(&offset.to_le_bytes());
            let mut hint = [0u8; 4];
            for (h, b) in hint.iter_mut().zip(child_name.bytes()) {
                *h = b;
            }
            lf.extend_from_slice(&hint);
            push_cell(&mut bin, &lf)
        });
        let is_leaf = depth == names.len() - 1;
        let nk = if is_leaf {
            nk_cell(name, subkeys, &value_cells, values_list)
        } else {
            nk_cell(name, subkeys, &[], None)
        };
        child = Some((push_cell(&mut bin, &nk), *name));
    }
    let root = child.map(|(offset, _)| offset).unwrap_or(0);

    let bin_size = bin.len().div_ceil(4096) * 4096;
    bin.resize(bin_size, 0);
    bin[8..12].copy_from_slice(&(bin_size as u32).to_le_bytes());

    let mut hive = vec![0u8; 4096];
    hive[0..4].copy_from_slice(b"regf");
    hive[0x24..0x28].copy_from_slice(&root.to_le_bytes());
    hive[0x28..0x2C].copy_from_slice(&(bin_size as u32).to_le_bytes());
    hive.extend_from_slice(&bin);
    hive
}

// =============================================================================
// Fake filesystem
// =============================================================================

/// In-memory filesystem whose entries can be made to fail individually
#[derive(Clone)]
pub struct FakeFs {
    pub fs_type: FsType,
    /// dir inode -> children (name, inode)
    pub dirs: HashMap<u64, Vec<(String, u64)>>,
    pub files: HashMap<u64, Vec<u8>>,
    /// Inodes whose metadata read fails
    pub broken: Vec<u64>,
    /// Directories whose open fails
    pub unreadable_dirs: Vec<u64>,
}

pub const FAKE_ROOT: u64 = 1;

impl FakeFs {
    pub fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(FAKE_ROOT, Vec::new());
        Self {
            fs_type: FsType::Ext4,
            dirs,
            files: HashMap::new(),
            broken: Vec::new(),
            unreadable_dirs: Vec::new(),
        }
    }

    pub fn add_file(&mut self, parent: u64, inode: u64, name: &str, data: Vec<u8>) -> &mut Self {
        self.dirs.entry(parent).or_default().push((name.to_string(), inode));
        self.files.insert(inode, data);
        self
    }

    pub fn add_dir(&mut self, parent: u64, inode: u64, name: &str) -> &mut Self {
        self.dirs.entry(parent).or_default().push((name.to_string(), inode));
        self.dirs.entry(inode).or_default();
        self
    }

    fn meta(&self, inode: u64) -> Result<FileMeta, String> {
        if self.broken.contains(&inode) {
            return Err(format!("inode {} metadata is corrupt", inode));
        }
        let (kind, size) = if self.dirs.contains_key(&inode) {
            (FileKind::Directory, 0)
        } else if let Some(data) = self.files.get(&inode) {
            (FileKind::Regular, data.len() as u64)
        } else {
            return Err(format!("inode {} not found", inode));
        };
        Ok(FileMeta {
            inode,
            kind,
            size,
            created: Some(1_600_000_000),
            accessed: None,
            modified: Some(0),
            changed: Some(1_600_000_000),
        })
    }

    fn path_to_inode(&self, path: &str) -> Result<u64, String> {
        let mut current = FAKE_ROOT;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let children = self.dirs.get(&current).ok_or("not a directory")?;
            current = children
                .iter()
                .find(|(name, _)| name == part)
                .map(|(_, inode)| *inode)
                .ok_or_else(|| format!("{} not found", part))?;
        }
        Ok(current)
    }
}

impl FileSystem for FakeFs {
    fn fs_type(&self) -> FsType {
        self.fs_type
    }

    fn root_inode(&self) -> u64 {
        FAKE_ROOT
    }

    fn read_dir(&mut self, dir: DirRef<'_>) -> Result<Vec<Result<RawDirEntry, String>>, String> {
        let inode = match dir {
            DirRef::Path(path) => self.path_to_inode(path)?,
            DirRef::Inode(inode) => inode,
        };
        if self.unreadable_dirs.contains(&inode) {
            return Err(format!("directory {} unreadable", inode));
        }
        let children = self.dirs.get(&inode).ok_or("not a directory")?.clone();
        let mut out = vec![
            Ok(RawDirEntry { name: b".".to_vec(), meta: self.meta(inode)? }),
            Ok(RawDirEntry { name: b"..".to_vec(), meta: self.meta(FAKE_ROOT)? }),
        ];
        for (name, child) in children {
            out.push(self.meta(child).map(|meta| RawDirEntry { name: name.into_bytes(), meta }));
        }
        Ok(out)
    }

    fn lookup(&mut self, path: &str) -> Result<FileMeta, String> {
        let inode = self.path_to_inode(path)?;
        self.meta(inode)
    }

    fn stat(&mut self, inode: u64) -> Result<FileMeta, String> {
        self.meta(inode)
    }

    fn read_at(&mut self, inode: u64, offset: u64, len: usize) -> Result<Vec<u8>, String> {
        let data = self.files.get(&inode).ok_or("not a file")?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

/// Hands out copies of one `FakeFs` at byte offset 0 only
pub struct FakeMounter {
    pub fs: FakeFs,
}

impl Mounter for FakeMounter {
    fn mount(&self, _image: &SharedImage, byte_offset: u64) -> Result<Box<dyn FileSystem>, String> {
        if byte_offset == 0 {
            Ok(Box::new(self.fs.clone()))
        } else {
            Err(format!("nothing mounted at {}", byte_offset))
        }
    }
}

/// Session over a blank raw image whose offset 0 mounts `fs`
pub fn fake_session(fs: FakeFs) -> (TempDir, EvidenceSession) {
    fake_session_with(fs, ToolkitConfig::default())
}

pub fn fake_session_with(fs: FakeFs, config: ToolkitConfig) -> (TempDir, EvidenceSession) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blank.dd");
    std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
    let session = EvidenceSession::open(&path, config)
        .unwrap()
        .with_mounter(Box::new(FakeMounter { fs }));
    (dir, session)
}
