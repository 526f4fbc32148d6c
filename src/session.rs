//! Per-image session: the container, its volume catalog and mounted filesystems
//!
//! One `EvidenceSession` exists per open image. It owns every cache the
//! browsing operations use, so nothing here is process-global:
//!
//! - the volume catalog, discovered on first request and then kept
//! - mounted filesystems keyed by partition start sector
//! - directory listings keyed by `(start sector, inode or root)`
//! - file metadata keyed by `(start sector, inode)`
//!
//! A failed mount is not remembered; the next request probes again.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, instrument};

use crate::common::SECTOR_SIZE;
use crate::config::ToolkitConfig;
use crate::container::{ImageContainer, ImageInfo, SharedImage};
use crate::error::ContainerResult;
use crate::fs::{DirRef, FileMeta, FileSystem, FsType, Mounter, NativeMounter};
use crate::volume::{self, VolumeCatalog};
use crate::walker::DirectoryEntry;

pub struct EvidenceSession {
    image: SharedImage,
    config: ToolkitConfig,
    mounter: Box<dyn Mounter>,
    catalog: Option<VolumeCatalog>,
    filesystems: HashMap<u64, Box<dyn FileSystem>>,
    pub(crate) dir_cache: HashMap<(u64, Option<u64>), Vec<DirectoryEntry>>,
    pub(crate) meta_cache: HashMap<(u64, u64), FileMeta>,
    mount_attempts: usize,
    discovery_runs: usize,
}

impl EvidenceSession {
    /// Open an image file; only classification and segment resolution can fail
    #[instrument(skip(config), fields(path = %path.display()))]
    pub fn open(path: &Path, config: ToolkitConfig) -> ContainerResult<Self> {
        let mut image = ImageContainer::open(path)?;
        image.set_read_buffer_size(config.read_buffer_size);
        info!(size = image.size(), format = image.format().name(), "Evidence session opened");
        Ok(Self::from_image(image, config))
    }

    pub fn from_image(image: ImageContainer, config: ToolkitConfig) -> Self {
        Self {
            image: image.into_shared(),
            config,
            mounter: Box::new(NativeMounter),
            catalog: None,
            filesystems: HashMap::new(),
            dir_cache: HashMap::new(),
            meta_cache: HashMap::new(),
            mount_attempts: 0,
            discovery_runs: 0,
        }
    }

    /// Replace the filesystem backend factory
    pub fn with_mounter(mut self, mounter: Box<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn image(&self) -> &SharedImage {
        &self.image
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn info(&self) -> Option<ImageInfo> {
        self.image.lock().ok().map(|image| image.info())
    }

    pub fn size(&self) -> u64 {
        self.image.lock().map(|image| image.size()).unwrap_or(0)
    }

    /// Volume catalog, discovered once on first use
    pub fn catalog(&mut self) -> &VolumeCatalog {
        let catalog = match self.catalog.take() {
            Some(catalog) => catalog,
            None => {
                self.discovery_runs += 1;
                let found = volume::discover(&self.image, self.mounter.as_ref());
                if let Some(fs) = found.bare_fs {
                    self.filesystems.insert(0, fs);
                }
                found.catalog
            }
        };
        self.catalog.insert(catalog)
    }

    /// Mounted filesystem at a partition start sector, mounting on first use
    pub fn filesystem(&mut self, start_sector: u64) -> Option<&mut Box<dyn FileSystem>> {
        if !self.filesystems.contains_key(&start_sector) {
            let Some(base) = start_sector.checked_mul(SECTOR_SIZE) else {
                debug!(start_sector, "Start sector beyond addressable bytes");
                return None;
            };
            self.mount_attempts += 1;
            match self.mounter.mount(&self.image, base) {
                Ok(fs) => {
                    debug!(start_sector, fs_type = fs.fs_type().name(), "Filesystem cached");
                    self.filesystems.insert(start_sector, fs);
                }
                Err(e) => {
                    debug!(start_sector, error = %e, "No filesystem at offset");
                    return None;
                }
            }
        }
        self.filesystems.get_mut(&start_sector)
    }

    /// Canonical type name source; `NotApplicable` when nothing mounts
    pub fn fs_type(&mut self, start_sector: u64) -> FsType {
        self.filesystem(start_sector)
            .map(|fs| fs.fs_type())
            .unwrap_or(FsType::NotApplicable)
    }

    /// True when the partition mounts and its root holds at least one entry
    pub fn check_partition_contents(&mut self, start_sector: u64) -> bool {
        let Some(fs) = self.filesystem(start_sector) else {
            return false;
        };
        match fs.read_dir(DirRef::Path("/")) {
            Ok(entries) => entries
                .iter()
                .flatten()
                .any(|e| e.name != b"." && e.name != b".."),
            Err(_) => false,
        }
    }

    /// Drop listing and metadata caches; mounted filesystems stay
    pub fn clear_cache(&mut self) {
        debug!(
            listings = self.dir_cache.len(),
            metadata = self.meta_cache.len(),
            "Clearing browse caches"
        );
        self.dir_cache.clear();
        self.meta_cache.clear();
    }

    pub fn mount_attempts(&self) -> usize {
        self.mount_attempts
    }

    pub fn discovery_runs(&self) -> usize {
        self.discovery_runs
    }

    pub fn mounted_count(&self) -> usize {
        self.filesystems.len()
    }
}
