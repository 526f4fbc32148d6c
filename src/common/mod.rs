// Common utilities shared across the container readers and filesystem parsers

pub mod hash;
pub mod binary;
pub mod segments;
pub mod io_pool;
pub mod path_security;

// Re-exports for convenience
pub use hash::{MultiDigest, MultiHasher};
pub use binary::{le_u16, le_u32, le_u64};
pub use segments::{discover_ewf_segments, discover_numbered_segments, is_numbered_segment};
pub use io_pool::FileIoPool;

// Shared constants
pub const SECTOR_SIZE: u64 = 512;
