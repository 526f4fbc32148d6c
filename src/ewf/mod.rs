//! EWF (Expert Witness Format) segmented container reader
//!
//! Covers the version 1 family (`.E01`, `.S01`, `.L01` series). A container is
//! a series of segment files, each holding a chain of sections:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ EVF/LVF signature (8) + segment number header (5)            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Section chain (76-byte descriptors: type, next, size)        │
//! │  volume/disk : chunk count, sectors per chunk, sector count  │
//! │  sectors     : chunk data (zlib or raw + adler32)            │
//! │  table       : chunk offsets, high bit = compressed          │
//! │  hash/digest : MD5 (+ SHA1) of the acquired media            │
//! │  next/done   : end of this segment / end of the series       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`EwfHandle`] indexes every chunk at open time and serves random-access
//! reads through an LRU cache of decompressed chunks.

mod cache;
mod handle;
pub mod types;

pub use handle::EwfHandle;
pub use types::{EwfInfo, StoredImageHash, VolumeSection};
