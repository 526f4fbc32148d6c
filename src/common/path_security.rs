//! Host-side names for files exported out of evidence
//!
//! Names inside an image are attacker-controlled bytes. Before one becomes a
//! path component on the examiner's machine it is reduced to a single safe
//! component that cannot climb out of the export directory.

use std::path::{Path, PathBuf};
use tracing::warn;

/// True when `name` could escape or alias its parent directory
pub fn contains_traversal_pattern(name: &str) -> bool {
    if name.contains('\0') || name == "." || name == ".." {
        return true;
    }
    if name.contains('/') || name.contains('\\') {
        return true;
    }
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Reduce an evidence name to one host path component
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\0'..='\x1f' | '\x7f' => continue,
            '/' | '\\' => sanitized.push('_'),
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => sanitized.push('_'),
            _ => sanitized.push(c),
        }
    }
    let trimmed = sanitized.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Join an evidence name under `base`, sanitizing when needed
pub fn export_path(base: &Path, name: &str) -> PathBuf {
    if contains_traversal_pattern(name) {
        warn!(name, "Evidence name rewritten for export");
    }
    base.join(sanitize_filename(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_patterns() {
        assert!(contains_traversal_pattern(".."));
        assert!(contains_traversal_pattern("a/b"));
        assert!(contains_traversal_pattern("..\\x"));
        assert!(contains_traversal_pattern("C:evil"));
        assert!(contains_traversal_pattern("nul\0byte"));
        assert!(!contains_traversal_pattern("file..name.txt"));
        assert!(!contains_traversal_pattern("$MFT"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("normal.txt"), "normal.txt");
        assert_eq!(sanitize_filename("path/to/file.txt"), "path_to_file.txt");
        assert_eq!(sanitize_filename("a<b>.txt"), "a_b_.txt");
        assert_eq!(sanitize_filename(".."), "_");
        assert_eq!(sanitize_filename("tab\there"), "tabhere");
    }

    #[test]
    fn test_export_path_stays_under_base() {
        let base = Path::new("/out");
        assert_eq!(export_path(base, "../../etc"), PathBuf::from("/out/_.._etc"));
        assert_eq!(export_path(base, "ok.bin"), PathBuf::from("/out/ok.bin"));
    }
}
