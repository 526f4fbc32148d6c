// Segment discovery for multi-file evidence containers
//
// Handles the two segmentation schemes the container opener accepts:
// - Numbered raw segments: .001, .002, .003, etc.
// - EWF segments: .E01 ... .E99, then .EAA ... .ZZZ (same for .S01 / .L01),
//   and .Ex01 ... .Ex99 for version 2 containers

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

// =============================================================================
// Numbered Segment Discovery (.001, .002, etc.)
// =============================================================================

/// Discover numbered segments (.001, .002, etc.) starting from any segment
///
/// Returns (paths, sizes) sorted by segment number. A path without a
/// numeric extension is returned as a single segment.
pub fn discover_numbered_segments(path: &Path) -> Result<(Vec<PathBuf>, Vec<u64>), String> {
    debug!(path = %path.display(), "Discovering numbered segments");
    let parent = path.parent().unwrap_or(Path::new("."));
    let filename = path.file_name()
        .ok_or("Invalid filename")?
        .to_string_lossy()
        .to_string();

    if is_numbered_segment(&filename) {
        let base = &filename[..filename.len() - 4];
        trace!(base, "Detected numbered segment format");
        let (segments, sizes) = discover_numbered_segments_by_base(parent, base)?;
        if !segments.is_empty() {
            debug!(segment_count = segments.len(), "Numbered segments discovered");
            return Ok((segments, sizes));
        }
    }

    let size = fs::metadata(path)
        .map_err(|e| format!("Failed to get file size: {}", e))?
        .len();

    debug!(size, "Single file (non-segmented)");
    Ok((vec![path.to_path_buf()], vec![size]))
}

fn discover_numbered_segments_by_base(dir: &Path, base: &str) -> Result<(Vec<PathBuf>, Vec<u64>), String> {
    let mut segments = Vec::new();
    let mut sizes = Vec::new();

    for num in 1..=999 {
        let segment_name = format!("{}.{:03}", base, num);
        let Some(segment_path) = existing_case_variant(dir, &segment_name) else {
            break;
        };
        let size = fs::metadata(&segment_path)
            .map_err(|e| format!("Failed to get segment size: {}", e))?
            .len();
        trace!(num, ?segment_path, "Found numbered segment");
        segments.push(segment_path);
        sizes.push(size);
    }

    Ok((segments, sizes))
}

// =============================================================================
// EWF Segment Discovery (.E01 / .S01 / .L01 / .Ex01)
// =============================================================================

/// Discover every segment file belonging to the EWF image at `first_segment`
///
/// The series ends at the first missing segment. The first segment itself
/// must exist.
pub fn discover_ewf_segments(first_segment: &Path) -> Result<Vec<PathBuf>, String> {
    debug!(path = %first_segment.display(), "Discovering EWF segments");
    if !first_segment.is_file() {
        return Err(format!("Segment file not found: {}", first_segment.display()));
    }

    let parent = first_segment.parent().unwrap_or(Path::new("."));
    let stem = first_segment.file_stem().ok_or("No filename")?.to_string_lossy().to_string();
    let ext = first_segment.extension().ok_or("No extension")?.to_string_lossy().to_string();

    let mut paths = vec![first_segment.to_path_buf()];

    for number in 2..=MAX_EWF_SEGMENTS {
        let Some(next_ext) = ewf_segment_extension(&ext, number) else {
            break;
        };
        let segment_name = format!("{}.{}", stem, next_ext);
        match existing_case_variant(parent, &segment_name) {
            Some(segment_path) => {
                trace!(segment = number, ?segment_path, "Found EWF segment");
                paths.push(segment_path);
            }
            None => break,
        }
    }

    debug!(segment_count = paths.len(), "EWF segments discovered");
    Ok(paths)
}

/// Highest segment number reachable with the three-letter scheme (E01 .. ZZZ)
const MAX_EWF_SEGMENTS: u32 = 99 + 26 * 26 * 22;

/// Extension of segment `number` (1-based) given the first segment's extension
///
/// `E01` -> `E02` ... `E99` -> `EAA` ... `EZZ` -> `FAA` ... `ZZZ`.
/// `Ex01` -> `Ex02` ... `Ex99`.
pub fn ewf_segment_extension(first_ext: &str, number: u32) -> Option<String> {
    let chars: Vec<char> = first_ext.chars().collect();
    let lead = *chars.first()?;
    let upper = lead.is_ascii_uppercase();

    if chars.len() == 4 && chars[1].eq_ignore_ascii_case(&'x') {
        if number > 99 {
            return None;
        }
        return Some(format!("{}{}{:02}", lead, chars[1], number));
    }

    if number == 0 {
        return None;
    }
    if number <= 99 {
        return Some(format!("{}{:02}", lead, number));
    }

    // Base-26 continuation: the remainder walks the last two letters, the
    // carry advances the lead letter.
    let index = number - 100;
    let lead_offset = index / (26 * 26);
    let lead_code = lead.to_ascii_uppercase() as u32 + lead_offset;
    if lead_code > 'Z' as u32 {
        return None;
    }
    let second = (index / 26) % 26;
    let third = index % 26;
    let base = if upper { b'A' } else { b'a' } as u32;
    let lead_char = char::from_u32(if upper { lead_code } else { lead_code + 32 })?;
    let second_char = char::from_u32(base + second)?;
    let third_char = char::from_u32(base + third)?;
    Some(format!("{}{}{}", lead_char, second_char, third_char))
}

/// First existing path among the name as given, lowercased and uppercased
fn existing_case_variant(dir: &Path, name: &str) -> Option<PathBuf> {
    [name.to_string(), name.to_lowercase(), name.to_uppercase()]
        .into_iter()
        .map(|candidate| dir.join(candidate))
        .find(|candidate| candidate.is_file())
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Check if filename is a numbered segment (.001, .002, etc.)
pub fn is_numbered_segment(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    if let Some(ext_start) = lower.rfind('.') {
        let ext = &lower[ext_start + 1..];
        if ext.len() == 3 && ext.chars().all(|c| c.is_ascii_digit()) {
            return true;
        }
    }
    false
}
