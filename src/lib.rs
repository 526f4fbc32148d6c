//! Forensic disk image access
//!
//! Opens raw and EWF evidence containers, discovers the volumes on them,
//! mounts the filesystems inside and walks, reads and exports their content.
//! ZIP archives and the Windows SOFTWARE hive found inside a filesystem are
//! reachable through the same [`EvidenceSession`].
//!
//! ```no_run
//! use evidence_toolkit::{EvidenceSession, ToolkitConfig};
//!
//! let mut session = EvidenceSession::open("disk.E01".as_ref(), ToolkitConfig::default())?;
//! for volume in session.catalog().volumes.clone() {
//!     println!("{} {}", volume.start_sector, volume.description);
//! }
//! # Ok::<(), evidence_toolkit::ContainerError>(())
//! ```

pub mod archive;
pub mod common;
pub mod config;
pub mod container;
pub mod error;
pub mod ewf;
pub mod extract;
pub mod fs;
pub mod hashing;
pub mod logging;
pub mod raw;
pub mod registry;
pub mod session;
pub mod volume;
pub mod walker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::ToolkitConfig;
pub use container::{ImageContainer, ImageFormat, ImageInfo};
pub use error::{ContainerError, ContainerResult};
pub use session::EvidenceSession;
pub use volume::{VolumeCatalog, VolumeEntry};
pub use walker::{DirectoryEntry, Timestamp, WalkFilter};
