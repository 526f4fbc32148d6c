//! Evidence container access - one byte stream over raw and EWF images
//!
//! `ImageContainer` is the only type that touches container files. Format is
//! chosen once, from the file extension, and stored as an enum of backends:
//!
//! | Format     | Extensions                                              |
//! |------------|---------------------------------------------------------|
//! | Segmented  | .e01 .s01 .l01 .ex01                                    |
//! | Linear     | .raw .img .dd .iso .ad1 .001 .dmg .sparse .sparseimage  |
//!
//! Anything else fails with [`ContainerError::UnsupportedFormat`]; contents
//! are never sniffed.
//!
//! Filesystem parsers read through [`PartitionReader`], a `Read + Seek`
//! window over a [`SharedImage`] starting at a partition's byte offset.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::DEFAULT_READ_BUFFER_SIZE;
use crate::error::{ContainerError, ContainerResult};
use crate::ewf::{EwfHandle, StoredImageHash, VolumeSection};
use crate::raw::RawHandle;

const SEGMENTED_EXTENSIONS: &[&str] = &["e01", "s01", "l01", "ex01"];
const LINEAR_EXTENSIONS: &[&str] = &[
    "raw", "img", "dd", "iso", "ad1", "001", "dmg", "sparse", "sparseimage",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageFormat {
    /// Flat sector stream (single file or numbered set)
    Linear,
    /// Segmented, chunk-compressed evidence container
    Segmented,
}

impl ImageFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Linear => "Linear (raw)",
            ImageFormat::Segmented => "Segmented (EWF)",
        }
    }
}

/// Select the container format from the file extension alone
pub fn classify(path: &Path) -> ContainerResult<ImageFormat> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if SEGMENTED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ImageFormat::Segmented)
    } else if LINEAR_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ImageFormat::Linear)
    } else {
        Err(ContainerError::UnsupportedFormat(format!(
            "'{}' has an unrecognized extension",
            path.display()
        )))
    }
}

enum Backend {
    Linear(RawHandle),
    Segmented(EwfHandle),
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub path: String,
    pub format: ImageFormat,
    pub size_bytes: u64,
    pub segment_files: Vec<String>,
    pub stored_hashes: Vec<StoredImageHash>,
    /// Media geometry recorded by segmented containers
    pub geometry: Option<VolumeSection>,
}

pub struct ImageContainer {
    path: PathBuf,
    format: ImageFormat,
    size_bytes: u64,
    read_buffer_size: usize,
    backend: Backend,
}

/// Container shared between the volume catalog and mounted filesystems
pub type SharedImage = Arc<Mutex<ImageContainer>>;

impl ImageContainer {
    /// Classify `path` and open the matching backend
    #[instrument(fields(path = %path.display()))]
    pub fn open(path: &Path) -> ContainerResult<Self> {
        let format = classify(path)?;
        let backend = match format {
            ImageFormat::Linear => {
                if !path.is_file() {
                    return Err(ContainerError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} not found", path.display()),
                    )));
                }
                Backend::Linear(RawHandle::open(path).map_err(ContainerError::Segments)?)
            }
            ImageFormat::Segmented => {
                let handle = EwfHandle::open(path).map_err(|e| {
                    if path.is_file() {
                        ContainerError::Corrupt(e)
                    } else {
                        ContainerError::Segments(e)
                    }
                })?;
                Backend::Segmented(handle)
            }
        };

        let size_bytes = match &backend {
            Backend::Linear(h) => h.total_size(),
            Backend::Segmented(h) => h.media_size(),
        };
        debug!(format = format.name(), size_bytes, "Opened image container");

        Ok(Self {
            path: path.to_path_buf(),
            format,
            size_bytes,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            backend,
        })
    }

    pub fn into_shared(self) -> SharedImage {
        Arc::new(Mutex::new(self))
    }

    /// Cap on a single backend read; larger requests are split
    pub fn set_read_buffer_size(&mut self, size: usize) {
        self.read_buffer_size = size.max(512);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    /// Read up to `size` bytes at `offset`
    ///
    /// The result is shorter than `size` only when the stream ends first.
    pub fn read(&mut self, offset: u64, size: u64) -> ContainerResult<Vec<u8>> {
        if offset >= self.size_bytes || size == 0 {
            return Ok(Vec::new());
        }
        let wanted = size.min(self.size_bytes - offset) as usize;
        let mut out = vec![0u8; wanted];
        let n = self.read_at(offset, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Fill `buf` from `offset`, returning the number of bytes read
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> ContainerResult<usize> {
        if offset >= self.size_bytes || buf.is_empty() {
            return Ok(0);
        }

        let filled = match &mut self.backend {
            Backend::Linear(handle) => handle.read_at(offset, buf).map_err(ContainerError::Corrupt)?,
            Backend::Segmented(handle) => {
                // Bounded sub-reads; a zero-length sub-read ends the request
                let step = self.read_buffer_size;
                let mut filled = 0usize;
                while filled < buf.len() {
                    let end = (filled + step).min(buf.len());
                    let n = handle
                        .read_at(offset + filled as u64, &mut buf[filled..end])
                        .map_err(ContainerError::Corrupt)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                filled
            }
        };

        Ok(filled)
    }

    /// Digests embedded by the acquisition tool (segmented containers only)
    pub fn stored_hashes(&self) -> Vec<StoredImageHash> {
        match &self.backend {
            Backend::Segmented(h) => h.stored_hashes().to_vec(),
            Backend::Linear(_) => Vec::new(),
        }
    }

    pub fn stored_hash(&self, algorithm: &str) -> Option<String> {
        match &self.backend {
            Backend::Segmented(h) => h.stored_hash(algorithm).map(str::to_string),
            Backend::Linear(_) => None,
        }
    }

    pub fn info(&self) -> ImageInfo {
        let (segment_files, geometry) = match &self.backend {
            Backend::Linear(h) => (h.info().segment_files, None),
            Backend::Segmented(h) => (h.info().segment_files, Some(h.volume().clone())),
        };
        ImageInfo {
            path: self.path.to_string_lossy().to_string(),
            format: self.format,
            size_bytes: self.size_bytes,
            segment_files,
            stored_hashes: self.stored_hashes(),
            geometry,
        }
    }
}

// =============================================================================
// Partition Reader - Read + Seek window for filesystem parsers
// =============================================================================

#[derive(Clone)]
pub struct PartitionReader {
    image: SharedImage,
    base: u64,
    len: u64,
    pos: u64,
}

impl PartitionReader {
    /// Window from `base` to the end of the image
    pub fn new(image: SharedImage, base: u64) -> io::Result<Self> {
        let size = lock_image(&image)?.size();
        Ok(Self {
            image,
            base,
            len: size.saturating_sub(base),
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub(crate) fn lock_image(image: &SharedImage) -> io::Result<std::sync::MutexGuard<'_, ImageContainer>> {
    image
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "image container lock poisoned"))
}

impl Read for PartitionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let wanted = buf.len().min((self.len - self.pos) as usize);
        let n = lock_image(&self.image)?.read_at(self.base + self.pos, &mut buf[..wanted])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for PartitionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of partition")),
        }
    }
}
