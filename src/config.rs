//! Tunable settings for reads, extraction and archive detection
//!
//! Stored as JSON under the user config directory
//! (`<config_dir>/evidence-toolkit/config.json`). Every field has a default,
//! so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_SOFTWARE_HIVE_PATH: &str = "/Windows/System32/config/SOFTWARE";

const CONFIG_DIR_NAME: &str = "evidence-toolkit";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Largest single read issued against a container
    pub read_buffer_size: usize,
    /// Files above this size are extracted in chunks
    pub large_file_threshold: u64,
    /// Chunk size used above the threshold
    pub chunk_size: u64,
    /// Extensions treated as ZIP-family archives without sniffing
    pub archive_extensions: Vec<String>,
    /// Location of the SOFTWARE hive inside a Windows volume
    pub software_hive_path: String,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            archive_extensions: ["zip", "jar", "war", "ear", "apk"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            software_hive_path: DEFAULT_SOFTWARE_HIVE_PATH.to_string(),
        }
    }
}

impl ToolkitConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        let config: ToolkitConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config.sanitized())
    }

    /// Load from the default location, falling back to defaults
    pub fn load_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                warn!("{}; using defaults", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, json)
            .map_err(|e| format!("Failed to write config {}: {}", path.display(), e))
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// True when `name` carries one of the configured archive extensions
    pub fn is_archive_name(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        match lower.rsplit_once('.') {
            Some((_, ext)) => self.archive_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    /// Zero sizes would stall the read loops
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.read_buffer_size == 0 {
            self.read_buffer_size = defaults.read_buffer_size;
        }
        if self.chunk_size == 0 {
            self.chunk_size = defaults.chunk_size;
        }
        self.archive_extensions = self
            .archive_extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        self
    }
}
