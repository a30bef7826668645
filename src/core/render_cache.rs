//! Byte-budgeted caches of rendered page bitmaps.
//!
//! Eviction does not follow plain recency. When a viewport is known, pages
//! inside the visible and prefetch window are never evicted, and of the
//! remaining entries the one whose page lies farthest from the active page
//! in layout space goes first. Without a viewport the cache degrades to LRU.

use super::backend::{PixelBuffer, RenderParams};
use super::cancel::{CancellationRegistry, CancellationToken};
use super::document::DocumentId;
use super::error::PDFResult;
use super::geometry::LayoutRect;
use super::page::{PageHandle, PageKey};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Identity of a cached bitmap: the page content and the render scale.
///
/// The scale is kept in thousandths so that keys hash and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderKey {
    pub page: PageKey,
    pub scale_millis: u32,
}

impl RenderKey {
    pub fn new(page: PageKey, scale: f32) -> Self {
        Self {
            page,
            scale_millis: (scale.max(0.0) * 1000.0).round() as u32,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale_millis as f32 / 1000.0
    }
}

/// What the viewer currently shows.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportState {
    /// 1-based number of the page the user is looking at
    pub active_page: u32,
    /// Page numbers that are visible or prefetched
    pub window: RangeInclusive<u32>,
    /// Layout rectangle of every page, indexed by page number - 1
    pub layout: Vec<LayoutRect>,
}

impl ViewportState {
    /// Viewport whose window is `visible` widened by `prefetch` pages on
    /// both sides.
    pub fn around(
        active_page: u32,
        visible: RangeInclusive<u32>,
        prefetch: u32,
        layout: Vec<LayoutRect>,
    ) -> Self {
        let start = visible.start().saturating_sub(prefetch).max(1);
        let end = visible.end().saturating_add(prefetch);
        Self {
            active_page,
            window: start..=end,
            layout,
        }
    }

    pub fn contains(&self, page_number: u32) -> bool {
        self.window.contains(&page_number)
    }

    /// Layout distance between the centers of `page_number` and the active
    /// page. Pages without a layout rectangle are infinitely far away.
    pub fn distance(&self, page_number: u32) -> f32 {
        let center = |number: u32| {
            number
                .checked_sub(1)
                .and_then(|i| self.layout.get(i as usize))
                .map(|rect| rect.center())
        };
        match (center(page_number), center(self.active_page)) {
            (Some(page), Some(active)) => page.distance(active),
            _ => f32::INFINITY,
        }
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub budget: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    bitmap: Arc<PixelBuffer>,
    page_number: u32,
    bytes: usize,
    /// Access tick, larger is more recent
    tick: u64,
}

struct CacheState {
    entries: FxHashMap<RenderKey, Entry>,
    bytes: usize,
    budget: usize,
    tick: u64,
    viewport: Option<ViewportState>,
    stats: CacheStats,
}

impl CacheState {
    fn new(budget: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            bytes: 0,
            budget,
            tick: 0,
            viewport: None,
            stats: CacheStats::default(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, key: RenderKey, page_number: u32, bitmap: Arc<PixelBuffer>) {
        let bytes = bitmap.byte_size();
        let tick = self.next_tick();
        if let Some(old) = self.entries.insert(
            key,
            Entry {
                bitmap,
                page_number,
                bytes,
                tick,
            },
        ) {
            self.bytes -= old.bytes;
        }
        self.bytes += bytes;
    }

    fn remove(&mut self, key: &RenderKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.bytes -= entry.bytes;
        Some(entry)
    }

    /// Picks the next entry to evict, never `keep`.
    fn victim(&self, keep: Option<&RenderKey>) -> Option<RenderKey> {
        let candidates = self
            .entries
            .iter()
            .filter(|(key, _)| Some(*key) != keep);
        match &self.viewport {
            Some(viewport) => candidates
                .filter(|(_, entry)| !viewport.contains(entry.page_number))
                .max_by(|(_, a), (_, b)| {
                    let da = viewport.distance(a.page_number);
                    let db = viewport.distance(b.page_number);
                    da.partial_cmp(&db)
                        .unwrap_or(Ordering::Equal)
                        .then(b.tick.cmp(&a.tick))
                })
                .map(|(key, _)| *key),
            None => candidates
                .min_by_key(|(_, entry)| entry.tick)
                .map(|(key, _)| *key),
        }
    }

    /// Evicts until the cache fits its budget or nothing is evictable.
    fn evict(&mut self, keep: Option<&RenderKey>) -> usize {
        let mut evicted = 0;
        while self.bytes > self.budget {
            let Some(key) = self.victim(keep) else {
                break;
            };
            if let Some(entry) = self.remove(&key) {
                debug!(
                    page = entry.page_number,
                    scale = key.scale(),
                    bytes = entry.bytes,
                    "render cache eviction"
                );
                evicted += 1;
            }
        }
        self.stats.evictions += evicted as u64;
        evicted
    }
}

/// Process-wide cache of rendered page bitmaps with one byte budget.
///
/// Entries of every document share the budget; call
/// [`remove_document`](Self::remove_document) when a document is disposed to
/// release its entries.
pub struct RenderCache {
    state: Mutex<CacheState>,
    inflight: CancellationRegistry<(RenderKey, u32)>,
    /// Keys being rendered; the sender closes when that render ends
    pending: Mutex<FxHashMap<RenderKey, watch::Sender<()>>>,
}

/// Marks one key as being rendered until dropped.
struct PendingRender<'a> {
    cache: &'a RenderCache,
    key: RenderKey,
}

impl Drop for PendingRender<'_> {
    fn drop(&mut self) {
        self.cache.pending.lock().remove(&self.key);
    }
}

impl RenderCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(budget_bytes)),
            inflight: CancellationRegistry::new(),
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the cached bitmap for `key`, marking it recently used.
    pub fn get(&self, key: &RenderKey) -> Option<Arc<PixelBuffer>> {
        self.lookup(key, None, true)
    }

    /// Marks `key` recently used and, with `page_number`, records the
    /// position the page was last requested at.
    fn lookup(
        &self,
        key: &RenderKey,
        page_number: Option<u32>,
        count: bool,
    ) -> Option<Arc<PixelBuffer>> {
        let mut state = self.state.lock();
        let tick = state.next_tick();
        let bitmap = state.entries.get_mut(key).map(|entry| {
            entry.tick = tick;
            if let Some(page_number) = page_number {
                entry.page_number = page_number;
            }
            entry.bitmap.clone()
        });
        if count {
            match bitmap {
                Some(_) => state.stats.hits += 1,
                None => state.stats.misses += 1,
            }
        }
        bitmap
    }

    /// Claims the render of `key`, or returns a receiver that closes when
    /// the running render of `key` ends.
    fn claim(&self, key: RenderKey) -> Result<PendingRender<'_>, watch::Receiver<()>> {
        let mut pending = self.pending.lock();
        if let Some(running) = pending.get(&key) {
            return Err(running.subscribe());
        }
        pending.insert(key, watch::channel(()).0);
        Ok(PendingRender { cache: self, key })
    }

    pub fn contains(&self, key: &RenderKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Returns the cached bitmap for `key` or renders it with `render`.
    ///
    /// `render` receives a token that is cancelled when the page leaves the
    /// viewport window before the render finished. A render that comes back
    /// empty (cancelled) or fails leaves the cache untouched. Concurrent
    /// misses on the same key render once; the other callers wait for that
    /// render and share its bitmap.
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        key: RenderKey,
        page_number: u32,
        render: F,
    ) -> PDFResult<Option<Arc<PixelBuffer>>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = PDFResult<Option<PixelBuffer>>>,
    {
        if let Some(bitmap) = self.lookup(&key, Some(page_number), true) {
            return Ok(Some(bitmap));
        }

        let registration = self.inflight.enter((key, page_number));
        let token = registration.token();
        let mut render = Some(render);
        loop {
            let pending = match self.claim(key) {
                Ok(pending) => pending,
                Err(mut running) => {
                    // Closed once the running render ends, however it ends
                    let _ = running.changed().await;
                    if token.is_cancelled() {
                        debug!(page = page_number, scale = key.scale(), "render cancelled");
                        return Ok(None);
                    }
                    if let Some(bitmap) = self.lookup(&key, Some(page_number), false) {
                        return Ok(Some(bitmap));
                    }
                    continue;
                }
            };
            // Another render may have finished since the first lookup
            if let Some(bitmap) = self.lookup(&key, Some(page_number), false) {
                return Ok(Some(bitmap));
            }
            let Some(render) = render.take() else {
                return Ok(None);
            };

            let bitmap = match render(token.clone()).await? {
                Some(bitmap) if !token.is_cancelled() => Arc::new(bitmap),
                _ => {
                    debug!(page = page_number, scale = key.scale(), "render cancelled");
                    return Ok(None);
                }
            };

            let mut state = self.state.lock();
            state.insert(key, page_number, bitmap.clone());
            state.evict(Some(&key));
            drop(state);
            drop(pending);
            return Ok(Some(bitmap));
        }
    }

    /// [`get_or_insert_with`](Self::get_or_insert_with) keyed by `page` at
    /// `scale`.
    pub async fn get_or_render<F, Fut>(
        &self,
        page: &PageHandle,
        scale: f32,
        render: F,
    ) -> PDFResult<Option<Arc<PixelBuffer>>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = PDFResult<Option<PixelBuffer>>>,
    {
        let key = RenderKey::new(page.key(), scale);
        self.get_or_insert_with(key, page.page_number(), render).await
    }

    /// Renders `page` through the backend at `scale` (1.0 = 72dpi) unless
    /// cached.
    pub async fn render_page(
        &self,
        page: &PageHandle,
        scale: f32,
    ) -> PDFResult<Option<Arc<PixelBuffer>>> {
        let params = scaled_params(page, scale);
        self.get_or_render(page, scale, |token| page.render(params, token))
            .await
    }

    /// Updates the viewport. Renders of pages outside the new window are
    /// cancelled and the cache is trimmed to its budget.
    pub fn set_viewport(&self, viewport: ViewportState) {
        let cancelled = self
            .inflight
            .cancel_where(|(_, page_number)| !viewport.contains(*page_number));
        if cancelled > 0 {
            debug!(cancelled, "renders outside the viewport cancelled");
        }
        let mut state = self.state.lock();
        state.viewport = Some(viewport);
        state.evict(None);
    }

    pub fn clear_viewport(&self) {
        self.state.lock().viewport = None;
    }

    /// Records the positions of `pages` for their cached entries.
    ///
    /// Call after a page list changed so that eviction measures viewport
    /// distance from where the pages now are. A page listed twice keeps its
    /// first position. Returns the number of entries that moved.
    pub fn renumber(&self, pages: &[PageHandle]) -> usize {
        let mut positions: FxHashMap<PageKey, u32> = FxHashMap::default();
        for (pos, page) in pages.iter().enumerate() {
            positions.entry(page.key()).or_insert(pos as u32 + 1);
        }
        let mut state = self.state.lock();
        let mut moved = 0;
        for (key, entry) in state.entries.iter_mut() {
            if let Some(&page_number) = positions.get(&key.page) {
                if entry.page_number != page_number {
                    entry.page_number = page_number;
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Changes the budget and evicts down to it.
    pub fn set_budget(&self, budget_bytes: usize) {
        let mut state = self.state.lock();
        state.budget = budget_bytes;
        state.evict(None);
    }

    /// Drops every entry of `document` and cancels its renders.
    pub fn remove_document(&self, document: DocumentId) -> usize {
        self.inflight
            .cancel_where(|(key, _)| key.page.document == document);
        let mut state = self.state.lock();
        let keys: Vec<RenderKey> = state
            .entries
            .keys()
            .filter(|key| key.page.document == document)
            .copied()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        if !keys.is_empty() {
            debug!(document = %document, entries = keys.len(), "render cache entries released");
        }
        keys.len()
    }

    pub fn clear(&self) {
        self.inflight.cancel_all();
        let mut state = self.state.lock();
        state.entries.clear();
        state.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of the cached bitmaps.
    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            budget: state.budget,
            ..state.stats
        }
    }
}

/// Render parameters for `page` at `scale`.
pub fn scaled_params(page: &PageHandle, scale: f32) -> RenderParams {
    let width = (page.width() * scale).round().max(1.0) as u32;
    let height = (page.height() * scale).round().max(1.0) as u32;
    RenderParams::new(width, height)
}

/// Low-resolution page images with their own, smaller budget.
///
/// Every page is rendered at one fixed scale, so entries are keyed by page
/// identity only.
pub struct ThumbnailCache {
    cache: RenderCache,
    scale: f32,
}

impl ThumbnailCache {
    pub fn new(budget_bytes: usize, scale: f32) -> Self {
        Self {
            cache: RenderCache::new(budget_bytes),
            scale,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn key(&self, page: &PageHandle) -> RenderKey {
        RenderKey::new(page.key(), self.scale)
    }

    pub fn get(&self, page: &PageHandle) -> Option<Arc<PixelBuffer>> {
        self.cache.get(&self.key(page))
    }

    /// Returns the thumbnail of `page`, rendering it with `render` on a miss.
    pub async fn get_or_render<F, Fut>(
        &self,
        page: &PageHandle,
        render: F,
    ) -> PDFResult<Option<Arc<PixelBuffer>>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = PDFResult<Option<PixelBuffer>>>,
    {
        self.cache.get_or_render(page, self.scale, render).await
    }

    /// Renders the thumbnail of `page` through the backend unless cached.
    pub async fn thumbnail(&self, page: &PageHandle) -> PDFResult<Option<Arc<PixelBuffer>>> {
        self.cache.render_page(page, self.scale).await
    }

    pub fn set_viewport(&self, viewport: ViewportState) {
        self.cache.set_viewport(viewport);
    }

    pub fn renumber(&self, pages: &[PageHandle]) -> usize {
        self.cache.renumber(pages)
    }

    pub fn remove_document(&self, document: DocumentId) -> usize {
        self.cache.remove_document(document)
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
