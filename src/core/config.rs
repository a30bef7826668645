//! Engine configuration.
//!
//! All sizes and policies of the loading engine live in one [`EngineConfig`]
//! value. Configuration can be built programmatically with the `with_*`
//! builders or loaded from `PDFX_*` environment variables.

use super::error::{PDFError, PDFResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default block size of the byte-range cache: 32KB
pub const DEFAULT_BLOCK_SIZE: u32 = 32 * 1024;

/// Default budget of the render cache: 100MB
pub const DEFAULT_RENDER_CACHE_BYTES: usize = 100 * 1024 * 1024;

/// Default budget of the thumbnail cache: 8MB
pub const DEFAULT_THUMBNAIL_CACHE_BYTES: usize = 8 * 1024 * 1024;

/// Default duration of one progressive loading unit
pub const DEFAULT_LOAD_UNIT_DURATION: Duration = Duration::from_millis(250);

/// Configuration for the loading engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Size of one byte-range cache block in bytes
    pub block_size: u32,
    /// Number of consecutive blocks fetched per missing block
    pub fetch_block_count: u32,
    /// Number of blocks kept in memory over a file-backed range cache
    pub hot_block_capacity: usize,
    /// Byte budget of the render cache
    pub render_cache_bytes: usize,
    /// Byte budget of the thumbnail cache
    pub thumbnail_cache_bytes: usize,
    /// Fixed scale thumbnails are rendered at
    pub thumbnail_scale: f32,
    /// Pages kept around the visible range when computing the prefetch window
    pub prefetch_pages: u32,
    /// Open documents with only the first page loaded
    pub use_progressive_loading: bool,
    /// Time box of one progressive loading unit
    pub load_unit_duration: Duration,
    /// Optional count box of one progressive loading unit
    pub max_pages_per_unit: Option<usize>,
    /// Try an empty password before asking the password provider
    pub try_empty_password_first: bool,
    /// Persist byte ranges of remote documents on disk
    pub persist_range_cache: bool,
    /// Directory of persisted range caches
    pub range_cache_dir: PathBuf,
    /// Root directory asset names are resolved against
    pub asset_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            fetch_block_count: 1,
            hot_block_capacity: 16,
            render_cache_bytes: DEFAULT_RENDER_CACHE_BYTES,
            thumbnail_cache_bytes: DEFAULT_THUMBNAIL_CACHE_BYTES,
            thumbnail_scale: 0.25,
            prefetch_pages: 1,
            use_progressive_loading: true,
            load_unit_duration: DEFAULT_LOAD_UNIT_DURATION,
            max_pages_per_unit: None,
            try_empty_password_first: true,
            persist_range_cache: true,
            range_cache_dir: Self::default_range_cache_dir(),
            asset_root: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    pub fn with_block_size(mut self, bytes: u32) -> Self {
        self.block_size = bytes.max(1);
        self
    }

    pub fn with_fetch_block_count(mut self, count: u32) -> Self {
        self.fetch_block_count = count.max(1);
        self
    }

    pub fn with_hot_block_capacity(mut self, blocks: usize) -> Self {
        self.hot_block_capacity = blocks;
        self
    }

    /// Sets the render cache budget in megabytes.
    pub fn with_render_cache_mb(mut self, mb: usize) -> Self {
        self.render_cache_bytes = mb * 1024 * 1024;
        self
    }

    pub fn with_render_cache_bytes(mut self, bytes: usize) -> Self {
        self.render_cache_bytes = bytes;
        self
    }

    /// Sets the thumbnail cache budget in megabytes.
    pub fn with_thumbnail_cache_mb(mut self, mb: usize) -> Self {
        self.thumbnail_cache_bytes = mb * 1024 * 1024;
        self
    }

    pub fn with_thumbnail_scale(mut self, scale: f32) -> Self {
        self.thumbnail_scale = scale;
        self
    }

    pub fn with_prefetch_pages(mut self, pages: u32) -> Self {
        self.prefetch_pages = pages;
        self
    }

    pub fn with_progressive_loading(mut self, enabled: bool) -> Self {
        self.use_progressive_loading = enabled;
        self
    }

    pub fn with_load_unit_duration(mut self, duration: Duration) -> Self {
        self.load_unit_duration = duration;
        self
    }

    pub fn with_max_pages_per_unit(mut self, pages: Option<usize>) -> Self {
        self.max_pages_per_unit = pages.map(|p| p.max(1));
        self
    }

    pub fn with_empty_password_first(mut self, enabled: bool) -> Self {
        self.try_empty_password_first = enabled;
        self
    }

    pub fn with_persisted_range_cache(mut self, enabled: bool) -> Self {
        self.persist_range_cache = enabled;
        self
    }

    pub fn with_range_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.range_cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_asset_root<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.asset_root = path.as_ref().to_path_buf();
        self
    }

    /// Returns the default range cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/pdf-x/ranges
    /// - Linux: ~/.cache/pdf-x/ranges
    /// - Windows: %LOCALAPPDATA%\pdf-x\ranges
    pub fn default_range_cache_dir() -> PathBuf {
        match dirs::cache_dir() {
            Some(dir) => dir.join("pdf-x").join("ranges"),
            None => PathBuf::from("cache/ranges"),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PDFX_BLOCK_SIZE`: range cache block size in bytes
    /// - `PDFX_RENDER_CACHE_MB`: render cache budget in MB
    /// - `PDFX_THUMBNAIL_CACHE_MB`: thumbnail cache budget in MB
    /// - `PDFX_PROGRESSIVE`: `true`/`false`, `1`/`0`
    /// - `PDFX_LOAD_UNIT_MS`: progressive loading unit in milliseconds
    /// - `PDFX_CACHE_DIR`: range cache directory
    /// - `PDFX_ASSET_ROOT`: asset root directory
    ///
    /// # Errors
    /// Returns [`PDFError::Config`] naming the variable with an invalid value.
    pub fn from_env() -> PDFResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> PDFResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("PDFX_BLOCK_SIZE") {
            let size = parse_number::<u32>("PDFX_BLOCK_SIZE", &val)?;
            if size == 0 {
                return Err(PDFError::Config("PDFX_BLOCK_SIZE".to_string()));
            }
            config.block_size = size;
        }

        if let Some(val) = lookup("PDFX_RENDER_CACHE_MB") {
            config.render_cache_bytes =
                parse_number::<usize>("PDFX_RENDER_CACHE_MB", &val)? * 1024 * 1024;
        }

        if let Some(val) = lookup("PDFX_THUMBNAIL_CACHE_MB") {
            config.thumbnail_cache_bytes =
                parse_number::<usize>("PDFX_THUMBNAIL_CACHE_MB", &val)? * 1024 * 1024;
        }

        if let Some(val) = lookup("PDFX_PROGRESSIVE") {
            config.use_progressive_loading = match val.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(PDFError::Config("PDFX_PROGRESSIVE".to_string())),
            };
        }

        if let Some(val) = lookup("PDFX_LOAD_UNIT_MS") {
            config.load_unit_duration =
                Duration::from_millis(parse_number::<u64>("PDFX_LOAD_UNIT_MS", &val)?);
        }

        if let Some(val) = lookup("PDFX_CACHE_DIR") {
            config.range_cache_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("PDFX_ASSET_ROOT") {
            config.asset_root = PathBuf::from(val);
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> PDFResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| PDFError::Config(key.to_string()))
}
