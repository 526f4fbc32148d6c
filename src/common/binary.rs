// Shared binary reading utilities for container and filesystem parsers
//
// Stream readers work on anything Read + Seek (segment files, partition views);
// the slice helpers decode fields out of already-read sectors and never panic
// on short buffers.

use std::io::{Read, Seek, SeekFrom};

/// Read exactly `length` bytes at `offset`
pub fn read_bytes_at<R: Read + Seek>(reader: &mut R, offset: u64, length: usize) -> Result<Vec<u8>, String> {
    reader.seek(SeekFrom::Start(offset))
        .map_err(|e| format!("Failed to seek to {}: {}", offset, e))?;
    let mut buf = vec![0u8; length];
    reader.read_exact(&mut buf)
        .map_err(|e| format!("Failed to read {} bytes at {}: {}", length, offset, e))?;
    Ok(buf)
}

// =============================================================================
// Slice Decoding
// =============================================================================

/// u16 little-endian at `offset`, 0 when out of range
#[inline]
pub fn le_u16(buf: &[u8], offset: usize) -> u16 {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .unwrap_or(0)
}

/// u32 little-endian at `offset`, 0 when out of range
#[inline]
pub fn le_u32(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

/// u64 little-endian at `offset`, 0 when out of range
#[inline]
pub fn le_u64(buf: &[u8], offset: usize) -> u64 {
    buf.get(offset..offset + 8)
        .map(|b| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            u64::from_le_bytes(arr)
        })
        .unwrap_or(0)
}

/// Decode UTF-16LE bytes up to the first NUL code unit
pub fn utf16le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Convert bytes to null-terminated string
pub fn bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}
