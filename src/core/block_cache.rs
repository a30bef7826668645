use super::error::{PDFError, PDFResult};
use super::validators::CacheValidators;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// One bit per block: set when the block's bytes are cached.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBitmap {
    bits: Vec<u8>,
    len: u32,
}

impl BlockBitmap {
    /// Creates an empty bitmap for `len` blocks.
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0; Self::byte_len(len)],
            len,
        }
    }

    /// Restores a bitmap from its persisted bytes. Missing bytes read as
    /// not-cached, surplus bytes are ignored.
    pub fn from_bytes(bytes: &[u8], len: u32) -> Self {
        let mut bits = vec![0; Self::byte_len(len)];
        let n = bits.len().min(bytes.len());
        bits[..n].copy_from_slice(&bytes[..n]);
        // Clear padding bits past the last block
        if len % 8 != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1u8 << (len % 8)) - 1;
            }
        }
        Self { bits, len }
    }

    /// Number of bytes needed to store `len` bits.
    pub fn byte_len(len: u32) -> usize {
        (len as usize).div_ceil(8)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_set(&self, block: u32) -> bool {
        block < self.len && self.bits[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    pub fn set(&mut self, block: u32) {
        if block < self.len {
            self.bits[(block / 8) as usize] |= 1 << (block % 8);
        }
    }

    /// Sets every block in `start..=end` (clamped to the bitmap).
    pub fn set_range(&mut self, start: u32, end: u32) {
        for block in start..=end.min(self.len.saturating_sub(1)) {
            self.set(block);
        }
    }

    /// Number of set blocks.
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Returns the blocks that are not cached.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.len).filter(|b| !self.is_set(*b)).collect()
    }

    /// Returns the next uncached block starting from `begin`, with wraparound.
    pub fn next_missing(&self, begin: u32) -> Option<u32> {
        (0..self.len)
            .map(|i| (begin.wrapping_add(i)) % self.len)
            .find(|b| !self.is_set(*b))
    }
}

/// Persistent store of downloaded byte ranges of one remote document.
///
/// The cache is addressed by bytes but tracks availability per block of
/// `block_size` bytes. All methods take `&self`; implementations guard their
/// state internally so a cache can be shared between the fetch path and the
/// blocking reader the backend pulls from.
///
/// Reads do not check availability: callers mark blocks cached with
/// [`set_cached`](Self::set_cached) after a successful write and must only
/// read cached blocks.
pub trait ByteRangeCache: Send + Sync {
    fn block_size(&self) -> u32;

    /// Size of the remote document, 0 until the file identity is set.
    fn file_size(&self) -> u64;

    /// Returns true once the file identity is set and block 0 is cached.
    fn is_initialized(&self) -> bool;

    fn is_block_cached(&self, block: u32) -> bool;

    /// Number of cached blocks.
    fn cached_blocks(&self) -> u32;

    /// (Re)initializes the cache for a document of `file_size` bytes.
    ///
    /// Invalidates every previously cached block.
    fn set_file_identity(&self, file_size: u64) -> PDFResult<()>;

    /// Marks blocks `start..=end` cached; `end` defaults to `start`.
    fn set_cached(&self, start: u32, end: Option<u32>) -> PDFResult<()>;

    /// Writes `bytes` at byte `position`.
    fn write(&self, position: u64, bytes: &[u8]) -> PDFResult<()>;

    /// Copies `size` bytes at `position` into `buf[buf_offset..]`.
    fn read(&self, buf: &mut [u8], buf_offset: usize, position: u64, size: usize)
    -> PDFResult<()>;

    fn validators(&self) -> CacheValidators;

    fn set_validators(&self, validators: CacheValidators) -> PDFResult<()>;

    /// Drops every cached block and the file identity.
    fn invalidate(&self) -> PDFResult<()>;

    fn total_blocks(&self) -> u32 {
        total_blocks(self.file_size(), self.block_size())
    }

    /// `min(cached blocks * block size, file size)`
    fn cached_bytes(&self) -> u64 {
        (self.cached_blocks() as u64 * self.block_size() as u64).min(self.file_size())
    }

    /// Block containing byte `position`.
    fn block_of(&self, position: u64) -> u32 {
        (position / self.block_size() as u64) as u32
    }
}

/// Most blocks a cache tracks for one document.
pub const MAX_BLOCKS: u32 = 1 << 24;

/// Number of `block_size` blocks covering `file_size` bytes.
pub fn total_blocks(file_size: u64, block_size: u32) -> u32 {
    file_size.div_ceil(block_size.max(1) as u64) as u32
}

/// Like [`total_blocks`], but rejects documents needing more than
/// [`MAX_BLOCKS`] blocks.
pub fn checked_total_blocks(file_size: u64, block_size: u32) -> PDFResult<u32> {
    let blocks = file_size.div_ceil(block_size.max(1) as u64);
    if blocks > MAX_BLOCKS as u64 {
        return Err(PDFError::InvalidByteRange {
            begin: 0,
            end: file_size,
        });
    }
    Ok(blocks as u32)
}

/// Checks that `size` bytes at `position` fit a document of `file_size` bytes
/// and a buffer of `buf_len` bytes starting at `buf_offset`.
pub(crate) fn check_range(
    file_size: u64,
    position: u64,
    size: usize,
    buf_len: usize,
    buf_offset: usize,
) -> PDFResult<()> {
    let end = position.checked_add(size as u64);
    let buf_end = buf_offset.checked_add(size);
    match (end, buf_end) {
        (Some(end), Some(buf_end)) if end <= file_size && buf_end <= buf_len => Ok(()),
        _ => Err(PDFError::InvalidByteRange {
            begin: position,
            end: position.saturating_add(size as u64),
        }),
    }
}

struct MemoryState {
    file_size: u64,
    has_identity: bool,
    bitmap: BlockBitmap,
    /// Written blocks; a block is allocated by its first write
    blocks: FxHashMap<u32, Box<[u8]>>,
    validators: CacheValidators,
}

/// Memory-backed [`ByteRangeCache`]; lives as long as the document.
pub struct MemoryByteRangeCache {
    block_size: u32,
    state: Mutex<MemoryState>,
}

impl MemoryByteRangeCache {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: block_size.max(1),
            state: Mutex::new(MemoryState {
                file_size: 0,
                has_identity: false,
                bitmap: BlockBitmap::new(0),
                blocks: FxHashMap::default(),
                validators: CacheValidators::default(),
            }),
        }
    }

    /// Length of `block` in a document of `file_size` bytes.
    fn block_len(&self, block: u32, file_size: u64) -> usize {
        let start = block as u64 * self.block_size as u64;
        file_size.saturating_sub(start).min(self.block_size as u64) as usize
    }
}

impl ByteRangeCache for MemoryByteRangeCache {
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
        state.blocks.clear();
        Ok(())
    }

    fn set_cached(&self, start: u32, end: Option<u32>) -> PDFResult<()> {
        let end = end.unwrap_or(start);
        let mut state = self.state.lock();
        if start > end || end >= state.bitmap.len() {
            return Err(PDFError::DataNotLoaded { block: end });
        }
        state.bitmap.set_range(start, end);
        Ok(())
    }

    fn write(&self, position: u64, bytes: &[u8]) -> PDFResult<()> {
        let mut state = self.state.lock();
        check_range(state.file_size, position, bytes.len(), bytes.len(), 0)?;
        let file_size = state.file_size;
        let block_size = self.block_size as u64;

        let mut pos = position;
        let mut written = 0;
        while written < bytes.len() {
            let block = (pos / block_size) as u32;
            let within = (pos % block_size) as usize;
            let len = self.block_len(block, file_size);
            let data = state
                .blocks
                .entry(block)
                .or_insert_with(|| vec![0u8; len].into_boxed_slice());
            let n = (len - within).min(bytes.len() - written);
            data[within..within + n].copy_from_slice(&bytes[written..written + n]);
            pos += n as u64;
            written += n;
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
        let state = self.state.lock();
        check_range(state.file_size, position, size, buf.len(), buf_offset)?;
        let block_size = self.block_size as u64;

        let mut pos = position;
        let mut out = buf_offset;
        let end = buf_offset + size;
        while out < end {
            let block = (pos / block_size) as u32;
            let within = (pos % block_size) as usize;
            let n = (self.block_len(block, state.file_size) - within).min(end - out);
            match state.blocks.get(&block) {
                Some(data) => buf[out..out + n].copy_from_slice(&data[within..within + n]),
                // Never written
                None => buf[out..out + n].fill(0),
            }
            pos += n as u64;
            out += n;
        }
        Ok(())
    }

    fn validators(&self) -> CacheValidators {
        self.state.lock().validators.clone()
    }

    fn set_validators(&self, validators: CacheValidators) -> PDFResult<()> {
        self.state.lock().validators = validators;
        Ok(())
    }

    fn invalidate(&self) -> PDFResult<()> {
        let mut state = self.state.lock();
        state.file_size = 0;
        state.has_identity = false;
        state.bitmap = BlockBitmap::new(0);
        state.blocks = FxHashMap::default();
        state.validators = CacheValidators::default();
        Ok(())
    }
}
