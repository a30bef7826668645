//! File-backed byte-range cache.
//!
//! Persisted layout (all integers little endian):
//!
//! ```text
//! 0   u32  magic "PDXC"
//! 4   u32  block size
//! 8   u64  file size of the remote document
//! 16  u32  validator blob length
//! 20  u32  flags (bit 0: file identity set)
//! 24  [u8; VALIDATOR_CAPACITY]  validator blob
//! ..  [u8; ceil(blocks / 8)]    block bitmap
//! ..  raw bytes, block `n` at data offset + n * block size
//! ```
//!
//! A header with a different magic number or block size is treated as an
//! uninitialized cache.

use super::block_cache::{BlockBitmap, ByteRangeCache, check_range, checked_total_blocks};
use super::error::{PDFError, PDFResult};
use super::validators::CacheValidators;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic number at the start of every cache file ("PDXC")
pub const CACHE_MAGIC: u32 = 0x4358_4450;

/// Size of the fixed header
pub const HEADER_SIZE: u64 = 24;

/// Bytes reserved for the validator blob
pub const VALIDATOR_CAPACITY: u64 = 1024;

/// File extension of cache files
pub const CACHE_EXTENSION: &str = "pxcache";

const FLAG_HAS_IDENTITY: u32 = 1;

/// Returns the cache file path for `uri` inside `dir`.
///
/// The name is the hex SHA-256 of the URI, so it is stable across runs.
pub fn cache_path_for(dir: &Path, uri: &str) -> PathBuf {
    let digest = Sha256::digest(uri.as_bytes());
    dir.join(format!("{}.{}", hex::encode(digest), CACHE_EXTENSION))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    block_size: u32,
    file_size: u64,
    blob_len: u32,
    flags: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&CACHE_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.file_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.blob_len.to_le_bytes());
        out[20..24].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Returns `None` on a bad magic number.
    fn decode(bytes: &[u8; HEADER_SIZE as usize]) -> Option<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        if u32_at(0) != CACHE_MAGIC {
            return None;
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[8..16]);
        Some(Self {
            block_size: u32_at(4),
            file_size: u64::from_le_bytes(size),
            blob_len: u32_at(16),
            flags: u32_at(20),
        })
    }
}

fn bitmap_offset() -> u64 {
    HEADER_SIZE + VALIDATOR_CAPACITY
}

fn data_offset(blocks: u32) -> u64 {
    bitmap_offset() + BlockBitmap::byte_len(blocks) as u64
}

/// Contents of a cache file, for inspection tools.
#[derive(Debug, Clone)]
pub struct CacheFileSummary {
    pub path: PathBuf,
    pub block_size: u32,
    pub file_size: u64,
    pub has_identity: bool,
    pub validators: CacheValidators,
    pub bitmap: BlockBitmap,
}

impl CacheFileSummary {
    pub fn cached_bytes(&self) -> u64 {
        (self.bitmap.count() as u64 * self.block_size as u64).min(self.file_size)
    }
}

/// Reads exactly `buf.len()` bytes at `offset` without moving a shared cursor.
#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

struct FileState {
    file: Arc<File>,
    file_size: u64,
    has_identity: bool,
    bitmap: BlockBitmap,
    validators: CacheValidators,
    /// Recently read blocks, keyed by block number
    hot: Option<LruCache<u32, Arc<Vec<u8>>>>,
    /// Bumped by every change to the data; a block read from disk only
    /// enters `hot` if no change happened while it was read
    epoch: u64,
}

impl FileState {
    fn header(&self, block_size: u32, blob_len: u32) -> Header {
        Header {
            block_size,
            file_size: self.file_size,
            blob_len,
            flags: if self.has_identity { FLAG_HAS_IDENTITY } else { 0 },
        }
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> PDFResult<()> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        self.epoch += 1;
        Ok(())
    }

    fn flush(&self) -> PDFResult<()> {
        (&*self.file).flush()?;
        Ok(())
    }

    /// Rewrites header and validator blob.
    fn write_metadata(&mut self, block_size: u32) -> PDFResult<()> {
        let mut blob = self.validators.to_blob().into_bytes();
        if blob.len() as u64 > VALIDATOR_CAPACITY {
            warn!(bytes = blob.len(), "validator blob too large, not persisted");
            blob.clear();
        }
        let header = self.header(block_size, blob.len() as u32);
        self.write_at(0, &header.encode())?;
        blob.resize(VALIDATOR_CAPACITY as usize, 0);
        self.write_at(HEADER_SIZE, &blob)?;
        Ok(())
    }

    fn write_bitmap(&mut self) -> PDFResult<()> {
        let bytes = self.bitmap.as_bytes().to_vec();
        self.write_at(bitmap_offset(), &bytes)
    }
}

/// [`ByteRangeCache`] persisted in a single file.
///
/// A small LRU of hot blocks sits in front of the file so repeated reads of
/// the same region (the cross-reference table, for instance) do not hit the
/// disk.
pub struct FileByteRangeCache {
    path: PathBuf,
    block_size: u32,
    state: Mutex<FileState>,
}

impl FileByteRangeCache {
    /// Opens or creates the cache file at `path`.
    ///
    /// Existing content is kept if its header is valid for `block_size`.
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32, hot_blocks: usize) -> PDFResult<Self> {
        let path = path.as_ref().to_path_buf();
        let block_size = block_size.max(1);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut state = FileState {
            file: Arc::new(file),
            file_size: 0,
            has_identity: false,
            bitmap: BlockBitmap::new(0),
            validators: CacheValidators::default(),
            hot: NonZeroUsize::new(hot_blocks).map(LruCache::new),
            epoch: 0,
        };

        match read_persisted(&state.file)? {
            Some((header, validators, bitmap)) if header.block_size == block_size => {
                state.file_size = header.file_size;
                state.has_identity = header.flags & FLAG_HAS_IDENTITY != 0;
                state.validators = validators;
                state.bitmap = bitmap;
                debug!(
                    path = %path.display(),
                    file_size = header.file_size,
                    cached_blocks = state.bitmap.count(),
                    "reopened range cache"
                );
            }
            Some(_) => {
                info!(path = %path.display(), "range cache block size changed, discarding");
                state.file.set_len(0)?;
                state.write_metadata(block_size)?;
            }
            None => {
                state.file.set_len(0)?;
                state.write_metadata(block_size)?;
            }
        }

        Ok(Self {
            path,
            block_size,
            state: Mutex::new(state),
        })
    }

    /// Opens the cache of `uri` inside `dir`.
    pub fn for_uri(dir: &Path, uri: &str, block_size: u32, hot_blocks: usize) -> PDFResult<Self> {
        Self::open(cache_path_for(dir, uri), block_size, hot_blocks)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted metadata of a cache file without opening it for
    /// writing.
    pub fn inspect<P: AsRef<Path>>(path: P) -> PDFResult<CacheFileSummary> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let (header, validators, bitmap) = read_persisted(&file)?
            .ok_or_else(|| PDFError::CacheIo(format!("{} is not a range cache", path.display())))?;
        Ok(CacheFileSummary {
            path,
            block_size: header.block_size,
            file_size: header.file_size,
            has_identity: header.flags & FLAG_HAS_IDENTITY != 0,
            validators,
            bitmap,
        })
    }

    fn block_bytes(&self, block: u32, file_size: u64) -> usize {
        let start = block as u64 * self.block_size as u64;
        (file_size.saturating_sub(start)).min(self.block_size as u64) as usize
    }
}

/// Reads header, validators and bitmap. Returns `None` if the file does not
/// start with a valid header.
fn read_persisted(file: &File) -> PDFResult<Option<(Header, CacheValidators, BlockBitmap)>> {
    let mut file = file;
    let len = file.metadata()?.len();
    if len < HEADER_SIZE + VALIDATOR_CAPACITY {
        return Ok(None);
    }
    let mut raw = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut raw)?;
    let Some(header) = Header::decode(&raw) else {
        return Ok(None);
    };
    if header.block_size == 0 || header.blob_len as u64 > VALIDATOR_CAPACITY {
        return Ok(None);
    }

    let mut blob = vec![0u8; header.blob_len as usize];
    file.read_exact(&mut blob)?;
    let validators = CacheValidators::from_blob(&String::from_utf8_lossy(&blob));

    let Ok(blocks) = checked_total_blocks(header.file_size, header.block_size) else {
        return Ok(None);
    };
    let mut bits = vec![0u8; BlockBitmap::byte_len(blocks)];
    if len < data_offset(blocks) {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(bitmap_offset()))?;
    file.read_exact(&mut bits)?;
    Ok(Some((header, validators, BlockBitmap::from_bytes(&bits, blocks))))
}

impl ByteRangeCache for FileByteRangeCache {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    fn is_initialized(&self) -> bool {
        let state = self.state.lock();
        state.has_identity && (state.bitmap.is_empty() || state.bitmap.is_set(0))
    }

    fn is_block_cached(&self, block: u32) -> bool {
        self.state.lock().bitmap.is_set(block)
    }

    fn cached_blocks(&self) -> u32 {
        self.state.lock().bitmap.count()
    }

    fn set_file_identity(&self, file_size: u64) -> PDFResult<()> {
        let blocks = checked_total_blocks(file_size, self.block_size)?;
        let mut state = self.state.lock();
        state.file_size = file_size;
        state.has_identity = true;
        state.bitmap = BlockBitmap::new(blocks);
        if let Some(hot) = state.hot.as_mut() {
            hot.clear();
        }
        state.file.set_len(0)?;
        state.write_metadata(self.block_size)?;
        state.write_bitmap()?;
        state.file.set_len(data_offset(blocks) + file_size)?;
        info!(path = %self.path.display(), file_size, blocks, "range cache identity set");
        Ok(())
    }

    fn set_cached(&self, start: u32, end: Option<u32>) -> PDFResult<()> {
        let end = end.unwrap_or(start);
        let mut state = self.state.lock();
        if start > end || end >= state.bitmap.len() {
            return Err(PDFError::DataNotLoaded { block: end });
        }
        state.bitmap.set_range(start, end);
        state.write_bitmap()?;
        state.flush()?;
        Ok(())
    }

    fn write(&self, position: u64, bytes: &[u8]) -> PDFResult<()> {
        let mut state = self.state.lock();
        check_range(state.file_size, position, bytes.len(), bytes.len(), 0)?;
        let base = data_offset(state.bitmap.len());
        state.write_at(base + position, bytes)?;

        if !bytes.is_empty() {
            let first = (position / self.block_size as u64) as u32;
            let last = ((position + bytes.len() as u64 - 1) / self.block_size as u64) as u32;
            if let Some(hot) = state.hot.as_mut() {
                for block in first..=last {
                    hot.pop(&block);
                }
            }
        }
        Ok(())
    }

    fn read(
        &self,
        buf: &mut [u8],
        buf_offset: usize,
        position: u64,
        size: usize,
    ) -> PDFResult<()> {
        let (file, file_size, base) = {
            let state = self.state.lock();
            check_range(state.file_size, position, size, buf.len(), buf_offset)?;
            (state.file.clone(), state.file_size, data_offset(state.bitmap.len()))
        };
        let block_size = self.block_size as u64;

        let mut pos = position;
        let mut out = buf_offset;
        let end = position + size as u64;
        while pos < end {
            let block = (pos / block_size) as u32;
            let within = (pos % block_size) as usize;
            let (cached, epoch) = {
                let mut state = self.state.lock();
                let cached = state.hot.as_mut().and_then(|hot| hot.get(&block).cloned());
                (cached, state.epoch)
            };
            let data = match cached {
                Some(data) => data,
                None => {
                    // The disk read runs unlocked; readers of other blocks
                    // proceed in parallel
                    let mut data = vec![0u8; self.block_bytes(block, file_size)];
                    read_exact_at(&file, &mut data, base + block as u64 * block_size)?;
                    let data = Arc::new(data);
                    let mut state = self.state.lock();
                    if state.epoch == epoch && state.bitmap.is_set(block) {
                        if let Some(hot) = state.hot.as_mut() {
                            hot.put(block, data.clone());
                        }
                    }
                    data
                }
            };
            let n = (data.len() - within).min((end - pos) as usize);
            buf[out..out + n].copy_from_slice(&data[within..within + n]);
            pos += n as u64;
            out += n;
        }
        Ok(())
    }

    fn validators(&self) -> CacheValidators {
        self.state.lock().validators.clone()
    }

    fn set_validators(&self, validators: CacheValidators) -> PDFResult<()> {
        let mut state = self.state.lock();
        state.validators = validators;
        state.write_metadata(self.block_size)?;
        state.flush()?;
        Ok(())
    }

    fn invalidate(&self) -> PDFResult<()> {
        let mut state = self.state.lock();
        state.file_size = 0;
        state.has_identity = false;
        state.bitmap = BlockBitmap::new(0);
        state.validators = CacheValidators::default();
        if let Some(hot) = state.hot.as_mut() {
            hot.clear();
        }
        state.file.set_len(0)?;
        state.write_metadata(self.block_size)?;
        info!(path = %self.path.display(), "range cache invalidated");
        Ok(())
    }
}
