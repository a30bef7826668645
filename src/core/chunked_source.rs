//! On-demand population of a [`ByteRangeCache`] from a remote source.
//!
//! [`ChunkedSource`] establishes the file identity from the block 0 response,
//! fetches missing blocks as reads touch them and keeps at most one fetch per
//! block in flight. [`BlockingSourceReader`] exposes it to the backend as a
//! synchronous [`RandomAccess`] reader.

use super::backend::RandomAccess;
use super::block_cache::{ByteRangeCache, check_range, checked_total_blocks};
use super::error::{PDFError, PDFResult};
use super::validators::{CacheValidators, format_http_date};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Progress callback for tracking download progress.
///
/// # Arguments
/// * `downloaded` - Number of bytes downloaded so far
/// * `total` - Total size of the document, once known
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// A request for bytes `start..=end` of the remote document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeRequest {
    pub start: u64,
    /// Inclusive end of the range
    pub end: u64,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// Response headers the cache cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseHeaders {
    pub content_range: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeResponse {
    /// HTTP status: 206 for a partial answer, 200 for the whole document,
    /// 304 for a successful revalidation
    pub status: u16,
    pub headers: ResponseHeaders,
    pub body: Vec<u8>,
}

/// Fetches byte ranges of one remote document.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn fetch(&self, request: RangeRequest) -> PDFResult<RangeResponse>;
}

/// Parses `bytes <start>-<end>/<total>`; `total` is `None` for `*`.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    if end < start {
        return None;
    }
    Some((start, end, total))
}

/// Options for [`ChunkedSource::open`].
#[derive(Clone, Default)]
pub struct ChunkedSourceOptions {
    /// Blocks fetched per missing block (minimum 1)
    pub fetch_block_count: u32,
    pub progress: Option<ProgressCallback>,
}

/// Remote document backed by a byte-range cache.
pub struct ChunkedSource {
    cache: Arc<dyn ByteRangeCache>,
    fetcher: Arc<dyn BlockFetcher>,
    fetch_block_count: u32,
    /// Fetch guards of the blocks being fetched; every block of a run maps to
    /// the guard of that run
    inflight: Mutex<FxHashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
    fetches: AtomicU64,
    downloaded: AtomicU64,
    progress: Option<ProgressCallback>,
}

/// Blocks claimed by one fetch. Dropping the claim releases the blocks and
/// then wakes the waiters.
struct RunClaim<'a> {
    source: &'a ChunkedSource,
    first: u32,
    last: u32,
    slot: Arc<tokio::sync::Mutex<()>>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        let mut inflight = self.source.inflight.lock();
        for block in self.first..=self.last {
            if inflight.get(&block).is_some_and(|slot| Arc::ptr_eq(slot, &self.slot)) {
                inflight.remove(&block);
            }
        }
    }
}

impl ChunkedSource {
    /// Opens a remote document.
    ///
    /// A cache that is already initialized is trusted while its validators are
    /// fresh. A stale cache is revalidated with a conditional block 0 request
    /// when validators exist: `304` keeps the cached bytes, any other answer
    /// rebuilds the cache from that answer. Otherwise block 0 is fetched and
    /// its response establishes the file identity.
    pub async fn open(
        cache: Arc<dyn ByteRangeCache>,
        fetcher: Arc<dyn BlockFetcher>,
        options: ChunkedSourceOptions,
    ) -> PDFResult<Self> {
        let source = Self {
            cache,
            fetcher,
            fetch_block_count: options.fetch_block_count.max(1),
            inflight: Mutex::new(FxHashMap::default()),
            fetches: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            progress: options.progress,
        };
        source.bootstrap().await?;
        Ok(source)
    }

    async fn bootstrap(&self) -> PDFResult<()> {
        let now = Utc::now();
        let block_end = self.cache.block_size() as u64 - 1;

        if self.cache.is_initialized() {
            let mut validators = self.cache.validators();
            if !validators.needs_revalidation(now) {
                debug!(file_size = self.cache.file_size(), "range cache is fresh");
                self.report_progress();
                return Ok(());
            }

            if validators.has_validators() {
                let request = RangeRequest {
                    start: 0,
                    end: block_end,
                    if_none_match: validators.etag.clone(),
                    if_modified_since: validators
                        .last_modified
                        .clone()
                        .or_else(|| validators.date.map(format_http_date)),
                };
                let response = self.fetch(request).await?;
                if response.status == 304 {
                    let h = &response.headers;
                    validators.refresh(
                        h.cache_control.as_deref(),
                        h.expires.as_deref(),
                        h.date.as_deref(),
                        now,
                    );
                    self.cache.set_validators(validators)?;
                    debug!("range cache revalidated");
                    self.report_progress();
                    return Ok(());
                }
                info!(status = response.status, "remote document changed, rebuilding range cache");
                self.cache.invalidate()?;
                return self.apply_first_response(response);
            }

            info!("range cache is stale and has no validators, rebuilding");
            self.cache.invalidate()?;
        } else if self.cache.file_size() > 0 {
            self.cache.invalidate()?;
        }

        let response = self
            .fetch(RangeRequest {
                start: 0,
                end: block_end,
                ..Default::default()
            })
            .await?;
        self.apply_first_response(response)
    }

    /// Establishes the file identity from the answer to the block 0 request.
    fn apply_first_response(&self, response: RangeResponse) -> PDFResult<()> {
        let now = Utc::now();
        let h = &response.headers;
        let validators = CacheValidators::from_headers(
            h.etag.as_deref(),
            h.last_modified.as_deref(),
            h.cache_control.as_deref(),
            h.expires.as_deref(),
            h.date.as_deref(),
            now,
        );

        match response.status {
            206 => {
                let (start, end, total) = h
                    .content_range
                    .as_deref()
                    .and_then(parse_content_range)
                    .ok_or_else(|| {
                        PDFError::NetworkFailure("missing or invalid Content-Range".to_string())
                    })?;
                let total = total.ok_or_else(|| {
                    PDFError::NetworkFailure("Content-Range without total size".to_string())
                })?;
                if start != 0 || end >= total || response.body.len() as u64 != end - start + 1 {
                    return Err(PDFError::NetworkFailure(format!(
                        "unexpected range {}-{}/{} with {} bytes",
                        start,
                        end,
                        total,
                        response.body.len()
                    )));
                }
                if checked_total_blocks(total, self.cache.block_size()).is_err() {
                    return Err(PDFError::NetworkFailure(format!(
                        "reported size {} is too large to cache",
                        total
                    )));
                }
                self.cache.set_file_identity(total)?;
                self.store(0, &response.body)?;
            }
            200 => {
                // No range support: the body is the whole document
                let total = response.body.len() as u64;
                self.cache.set_file_identity(total)?;
                self.store(0, &response.body)?;
                info!(file_size = total, "server ignored range request, cached whole document");
            }
            status => {
                return Err(PDFError::NetworkFailure(format!(
                    "unexpected status {} for block 0",
                    status
                )));
            }
        }
        self.cache.set_validators(validators)?;
        self.report_progress();
        Ok(())
    }

    /// Writes `bytes` at `position` and marks every block it fully covers.
    ///
    /// The last block counts as covered when the bytes reach the end of the
    /// document.
    fn store(&self, position: u64, bytes: &[u8]) -> PDFResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.cache.write(position, bytes)?;
        self.downloaded.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let block_size = self.cache.block_size() as u64;
        let end = position + bytes.len() as u64;
        let first = position.div_ceil(block_size);
        let last_exclusive = if end >= self.cache.file_size() {
            self.cache.total_blocks() as u64
        } else {
            end / block_size
        };
        if first < last_exclusive {
            self.cache
                .set_cached(first as u32, Some((last_exclusive - 1) as u32))?;
        }
        Ok(())
    }

    async fn fetch(&self, request: RangeRequest) -> PDFResult<RangeResponse> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(start = request.start, end = request.end, "fetching range");
        self.fetcher.fetch(request).await
    }

    fn report_progress(&self) {
        if let Some(progress) = &self.progress {
            let total = self.cache.file_size();
            let downloaded = self.downloaded.load(Ordering::Relaxed).max(self.cache.cached_bytes());
            progress(downloaded.min(total), Some(total));
        }
    }

    /// Ensures one block is cached, fetching it (and the configured run of
    /// following blocks) if needed.
    ///
    /// A fetch claims every block of its run, so a concurrent request for any
    /// of them waits for that fetch instead of sending its own.
    pub async fn ensure_block(&self, block: u32) -> PDFResult<()> {
        let total_blocks = self.cache.total_blocks();
        if block >= total_blocks {
            return Err(PDFError::DataNotLoaded { block });
        }

        loop {
            if self.cache.is_block_cached(block) {
                return Ok(());
            }
            let claim = match self.claim_run(block, total_blocks) {
                Ok(claim) => claim,
                Err(running) => {
                    // Wait for the fetch covering this block, then look again;
                    // a failed fetch leaves the block to this caller
                    drop(running.lock().await);
                    continue;
                }
            };

            let result = self.fetch_run(block, claim.last).await;
            drop(claim);
            if let Err(err) = &result {
                warn!(block, error = %err, "block fetch failed");
            }
            return result;
        }
    }

    /// Claims `block` and the uncached, unclaimed blocks following it, up to
    /// the configured run length. Returns the guard of the running fetch when
    /// `block` is already claimed.
    fn claim_run(
        &self,
        block: u32,
        total_blocks: u32,
    ) -> Result<RunClaim<'_>, Arc<tokio::sync::Mutex<()>>> {
        let mut inflight = self.inflight.lock();
        if let Some(running) = inflight.get(&block) {
            return Err(running.clone());
        }

        let slot = Arc::new(tokio::sync::Mutex::new(()));
        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            // A fresh mutex is never locked
            Err(_) => return Err(slot),
        };
        let mut last = block;
        while last + 1 < total_blocks
            && last + 1 < block.saturating_add(self.fetch_block_count)
            && !self.cache.is_block_cached(last + 1)
            && !inflight.contains_key(&(last + 1))
        {
            last += 1;
        }
        for claimed in block..=last {
            inflight.insert(claimed, slot.clone());
        }
        Ok(RunClaim {
            source: self,
            first: block,
            last,
            slot,
            _guard: guard,
        })
    }

    async fn fetch_run(&self, block: u32, last: u32) -> PDFResult<()> {
        let block_size = self.cache.block_size() as u64;
        let file_size = self.cache.file_size();

        let start = block as u64 * block_size;
        let end = ((last as u64 + 1) * block_size).min(file_size) - 1;

        let response = self
            .fetch(RangeRequest {
                start,
                end,
                ..Default::default()
            })
            .await?;

        match response.status {
            206 => {
                let expected = (end - start + 1) as usize;
                if response.body.len() != expected {
                    return Err(PDFError::NetworkFailure(format!(
                        "short read for block {}: {} of {} bytes",
                        block,
                        response.body.len(),
                        expected
                    )));
                }
                self.store(start, &response.body)?;
            }
            200 if response.body.len() as u64 == file_size => {
                self.store(0, &response.body)?;
            }
            status => {
                return Err(PDFError::NetworkFailure(format!(
                    "unexpected status {} for block {}",
                    status, block
                )));
            }
        }
        debug!(block, last, "blocks cached");
        self.report_progress();
        Ok(())
    }

    /// Ensures every block overlapping `position..position + size` is cached.
    pub async fn ensure_range(&self, position: u64, size: usize) -> PDFResult<()> {
        if size == 0 {
            return Ok(());
        }
        let first = self.cache.block_of(position);
        let last = self.cache.block_of(position + size as u64 - 1);
        for block in first..=last {
            self.ensure_block(block).await?;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `position`, fetching missing blocks first.
    pub async fn read(&self, position: u64, buf: &mut [u8]) -> PDFResult<()> {
        check_range(self.cache.file_size(), position, buf.len(), buf.len(), 0)?;
        self.ensure_range(position, buf.len()).await?;
        let size = buf.len();
        self.cache.read(buf, 0, position, size)
    }

    pub fn file_size(&self) -> u64 {
        self.cache.file_size()
    }

    pub fn cache(&self) -> &Arc<dyn ByteRangeCache> {
        &self.cache
    }

    /// Number of requests sent to the fetcher, including block 0.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Bytes downloaded by this source.
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Freshness of the cached document at the current time.
    pub fn is_stale(&self) -> bool {
        self.cache.validators().needs_revalidation(Utc::now())
    }
}

/// Synchronous reader over a [`ChunkedSource`].
///
/// Each read blocks the calling thread until the async fetch completes, like
/// a native read callback waiting on its data. Must only be used from
/// threads outside the async runtime (for example inside `spawn_blocking`).
pub struct BlockingSourceReader {
    source: Arc<ChunkedSource>,
    runtime: Handle,
}

impl BlockingSourceReader {
    pub fn new(source: Arc<ChunkedSource>, runtime: Handle) -> Self {
        Self { source, runtime }
    }

    pub fn source(&self) -> &Arc<ChunkedSource> {
        &self.source
    }
}

impl RandomAccess for BlockingSourceReader {
    fn size(&self) -> u64 {
        self.source.file_size()
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> PDFResult<()> {
        self.runtime.block_on(self.source.read(position, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-999/5000"), Some((0, 999, Some(5000))));
        assert_eq!(parse_content_range("bytes 10-19/*"), Some((10, 19, None)));
        assert_eq!(parse_content_range("bytes 20-10/50"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes 0-x/2"), None);
    }
}
