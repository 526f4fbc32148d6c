//! ZIP-family detection
//!
//! Two tiers: the configured extension list first, then the first bytes of
//! the file. Only a few header bytes are ever read for the second tier.

// Format  | Magic Bytes   | Hex          | Meaning
// --------|---------------|--------------|-----------------------------
// ZIP     | PK\x03\x04    | 50 4B 03 04  | Local file header
// ZIP     | PK\x05\x06    | 50 4B 05 06  | End of central directory (empty)
// ZIP     | PK\x07\x08    | 50 4B 07 08  | Spanned archive marker
//
// Office documents, JARs and APKs share the local header signature.

pub const ZIP_LOCAL_HEADER_SIG: &[u8] = &[0x50, 0x4B, 0x03, 0x04];
pub const ZIP_EOCD_SIG: &[u8] = &[0x50, 0x4B, 0x05, 0x06];
pub const ZIP_SPANNED_SIG: &[u8] = &[0x50, 0x4B, 0x07, 0x08];

/// Bytes needed by [`has_zip_signature`]
pub const SIGNATURE_LEN: usize = 4;

pub fn has_zip_signature(header: &[u8]) -> bool {
    [ZIP_LOCAL_HEADER_SIG, ZIP_EOCD_SIG, ZIP_SPANNED_SIG]
        .iter()
        .any(|sig| header.starts_with(sig))
}
