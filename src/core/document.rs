use super::backend::{BackendGate, BackendSource, DocumentHandle, PageGeometry, PageRotation};
use super::error::{PDFError, PDFResult};
use super::page::{PageHandle, PageLoadStatus};
use super::page_list::DocumentPageList;
use super::progressive::ProgressiveLoadController;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Geometry assumed for pages when no page could be loaded (US Letter).
const FALLBACK_GEOMETRY: PageGeometry = PageGeometry {
    width: 612.0,
    height: 792.0,
    rotation: PageRotation::Deg0,
};

/// Capacity of the page status event channel
const EVENT_CAPACITY: usize = 256;

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an opened document.
///
/// Unlike [`DocumentHandle`], an id is never reused after the document is
/// closed, so it is safe as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

impl DocumentId {
    fn next() -> Self {
        DocumentId(NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// How a page's state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTransition {
    /// Geometry of the page is now authoritative
    BecameLoaded,
    /// The page was assigned a new position in the page list
    PositionMoved,
    /// Loading the page failed; estimates are kept
    LoadFailed,
}

/// Page-status-change notification.
#[derive(Debug, Clone)]
pub struct PageStatusChange {
    /// 1-based position in the page list
    pub page_number: u32,
    /// Newest handle for that position
    pub page: PageHandle,
    pub kind: PageTransition,
}

/// Asks the user for a password. `None` gives up.
pub type PasswordProvider = Arc<dyn Fn() -> BoxFuture<'static, Option<String>> + Send + Sync>;

type DisposeHook = Box<dyn FnOnce(DocumentId) + Send>;
type PagesHook = Arc<dyn Fn(&[PageHandle]) + Send + Sync>;

/// Options for [`Document::open`].
#[derive(Clone)]
pub struct OpenOptions {
    pub password_provider: Option<PasswordProvider>,
    /// Try opening without a password before asking the provider
    pub try_empty_password_first: bool,
    /// Load only the first page on open
    pub use_progressive_loading: bool,
    pub load_unit_duration: Duration,
    pub max_pages_per_unit: Option<usize>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            password_provider: None,
            try_empty_password_first: true,
            use_progressive_loading: true,
            load_unit_duration: Duration::from_millis(250),
            max_pages_per_unit: None,
        }
    }
}

pub(crate) struct DocumentShared {
    id: DocumentId,
    source_name: String,
    handle: DocumentHandle,
    gate: BackendGate,
    disposed: AtomicBool,
    /// Current page list
    pages: RwLock<Vec<PageHandle>>,
    /// Latest state of every native page, keyed by native page index
    slots: Mutex<FxHashMap<u32, watch::Sender<PageHandle>>>,
    events: broadcast::Sender<PageStatusChange>,
    progressive: ProgressiveLoadController,
    assemble_lock: tokio::sync::Mutex<()>,
    dispose_hooks: Mutex<Vec<DisposeHook>>,
    pages_hooks: Mutex<Vec<PagesHook>>,
}

/// An opened document.
///
/// Cloning is cheap; all clones refer to the same native document. The
/// document stays usable until [`dispose`](Self::dispose) is called, after
/// which every operation fails with [`PDFError::DocumentStateError`].
#[derive(Clone)]
pub struct Document {
    shared: Arc<DocumentShared>,
}

/// Non-owning reference to a [`Document`], held by page handles.
#[derive(Clone)]
pub struct WeakDocument {
    id: DocumentId,
    shared: Weak<DocumentShared>,
}

impl WeakDocument {
    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Document> {
        self.shared.upgrade().map(|shared| Document { shared })
    }

    /// Upgrades and checks that the document is still open.
    pub fn open_document(&self) -> PDFResult<Document> {
        let doc = self.upgrade().ok_or_else(|| {
            PDFError::DocumentStateError(format!("{} has been dropped", self.id))
        })?;
        doc.ensure_open()?;
        Ok(doc)
    }
}

impl fmt::Debug for WeakDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakDocument({})", self.id)
    }
}

impl Document {
    /// Opens a document through the backend gate.
    ///
    /// Password-protected documents are retried with passwords from the
    /// provider until it returns `None`. With progressive loading only the
    /// first page is loaded; the other pages start `Unloaded` with the first
    /// page's geometry as estimate. Otherwise every page is loaded, and pages
    /// that fail are marked `Failed`.
    pub async fn open(
        gate: BackendGate,
        source: BackendSource,
        source_name: impl Into<String>,
        options: OpenOptions,
    ) -> PDFResult<Document> {
        let source_name = source_name.into();
        let handle = Self::open_with_password(&gate, &source, &options).await?;

        let page_count = match gate.run(move |b| b.page_count(handle)).await {
            Ok(count) => count,
            Err(err) => {
                gate.run(move |b| {
                    b.close_document(handle);
                    Ok(())
                })
                .await?;
                return Err(err);
            }
        };

        let id = DocumentId::next();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(DocumentShared {
            id,
            source_name: source_name.clone(),
            handle,
            gate: gate.clone(),
            disposed: AtomicBool::new(false),
            pages: RwLock::new(Vec::new()),
            slots: Mutex::new(FxHashMap::default()),
            events,
            progressive: ProgressiveLoadController::new(
                options.load_unit_duration,
                options.max_pages_per_unit,
            ),
            assemble_lock: tokio::sync::Mutex::new(()),
            dispose_hooks: Mutex::new(Vec::new()),
            pages_hooks: Mutex::new(Vec::new()),
        });
        let doc = Document { shared };

        let load_count = if options.use_progressive_loading {
            page_count.min(1)
        } else {
            page_count
        };
        let mut loaded = Vec::with_capacity(page_count as usize);
        for index in 0..load_count {
            let geometry = gate.run(move |b| b.load_page_geometry(handle, index)).await;
            if let Err(err) = &geometry {
                warn!(document = %id, page = index + 1, error = %err, "page failed to load");
            }
            loaded.push(geometry.ok());
        }

        let estimate = loaded
            .iter()
            .flatten()
            .next()
            .copied()
            .unwrap_or(FALLBACK_GEOMETRY);
        let owner = doc.downgrade();
        let pages: Vec<PageHandle> = (0..page_count)
            .map(|index| {
                let (geometry, status) = match loaded.get(index as usize) {
                    Some(Some(geometry)) => (*geometry, PageLoadStatus::Loaded),
                    Some(None) => (estimate, PageLoadStatus::Failed),
                    None => (estimate, PageLoadStatus::Unloaded),
                };
                PageHandle::owned(owner.clone(), index, index + 1, geometry, status)
            })
            .collect();

        {
            let mut slots = doc.shared.slots.lock();
            for page in &pages {
                if let Some(index) = page.owned_index() {
                    slots.insert(index, watch::channel(page.clone()).0);
                }
            }
        }
        *doc.shared.pages.write() = pages;

        info!(
            document = %id,
            source = %source_name,
            pages = page_count,
            progressive = options.use_progressive_loading,
            "document opened"
        );
        Ok(doc)
    }

    async fn open_with_password(
        gate: &BackendGate,
        source: &BackendSource,
        options: &OpenOptions,
    ) -> PDFResult<DocumentHandle> {
        let mut first = true;
        loop {
            let password = if first && options.try_empty_password_first {
                None
            } else {
                match &options.password_provider {
                    Some(provider) => match provider().await {
                        Some(password) => Some(password),
                        None => return Err(PDFError::PasswordRequired),
                    },
                    None if first => None,
                    None => return Err(PDFError::PasswordRequired),
                }
            };
            first = false;

            let source = source.clone();
            match gate
                .run(move |b| b.open_document(&source, password.as_deref()))
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(PDFError::PasswordRequired) => {
                    debug!("password required, asking provider");
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn id(&self) -> DocumentId {
        self.shared.id
    }

    pub fn source_name(&self) -> &str {
        &self.shared.source_name
    }

    /// Backend handle of the document.
    pub fn handle(&self) -> DocumentHandle {
        self.shared.handle
    }

    pub fn gate(&self) -> &BackendGate {
        &self.shared.gate
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// True if both refer to the same native document (backend handle
    /// equality).
    pub fn same_document(&self, other: &Document) -> bool {
        self.shared.handle == other.shared.handle && self.shared.gate.same_gate(&other.shared.gate)
    }

    pub fn downgrade(&self) -> WeakDocument {
        WeakDocument {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The document's page list.
    pub fn page_list(&self) -> DocumentPageList {
        DocumentPageList::new(self.clone())
    }

    /// Snapshot of the current pages.
    pub fn pages(&self) -> Vec<PageHandle> {
        self.shared.pages.read().clone()
    }

    pub fn page_count(&self) -> u32 {
        self.shared.pages.read().len() as u32
    }

    /// Subscribes to page status changes of this document.
    pub fn subscribe(&self) -> broadcast::Receiver<PageStatusChange> {
        self.shared.events.subscribe()
    }

    /// Watches the state of native page `index`. The receiver sees the
    /// current state immediately.
    pub fn watch_page(&self, index: u32) -> Option<watch::Receiver<PageHandle>> {
        self.shared.slots.lock().get(&index).map(|s| s.subscribe())
    }

    /// Loads the remaining pages in the background; see
    /// [`ProgressiveLoadController`].
    ///
    /// Returns `true` when every page settled, `false` if the callback
    /// cancelled the sweep or the document was disposed.
    pub async fn load_pages_progressively<F>(&self, on_progress: F) -> bool
    where
        F: FnMut(u32, u32) -> bool + Send + 'static,
    {
        self.shared
            .progressive
            .load(self.clone(), Box::new(on_progress))
            .await
    }

    /// Hints the progressive loader to load these page numbers first.
    pub fn set_priority_pages(&self, pages: RangeInclusive<u32>) {
        self.shared.progressive.set_priority(Some(pages));
    }

    pub fn progressive(&self) -> &ProgressiveLoadController {
        &self.shared.progressive
    }

    /// Forces a reload of native page `index`, even if it already settled.
    pub async fn reload_page(&self, index: u32) -> Option<PageHandle> {
        let mut rx = self.request_page_load(index, true)?;
        rx.wait_for(|page| page.status().is_terminal())
            .await
            .map(|page| page.clone())
            .ok()
    }

    /// Registers a callback run once when the document is disposed.
    pub fn on_dispose<F>(&self, hook: F)
    where
        F: FnOnce(DocumentId) + Send + 'static,
    {
        if self.is_disposed() {
            hook(self.shared.id);
            return;
        }
        self.shared.dispose_hooks.lock().push(Box::new(hook));
    }

    /// Registers a callback run with the new page list every time the list is
    /// replaced and positions may have moved.
    pub fn on_pages_replaced<F>(&self, hook: F)
    where
        F: Fn(&[PageHandle]) + Send + Sync + 'static,
    {
        self.shared.pages_hooks.lock().push(Arc::new(hook));
    }

    /// Closes the native document. Idempotent.
    ///
    /// Page handles of this document stop resolving; other documents holding
    /// pages of this one must have assembled them first.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.progressive.cancel();

        let hooks = std::mem::take(&mut *self.shared.dispose_hooks.lock());
        for hook in hooks {
            hook(self.shared.id);
        }
        self.shared.pages_hooks.lock().clear();
        self.shared.pages.write().clear();
        self.shared.slots.lock().clear();

        let handle = self.shared.handle;
        if let Err(err) = self
            .shared
            .gate
            .run(move |b| {
                b.close_document(handle);
                Ok(())
            })
            .await
        {
            warn!(document = %self.shared.id, error = %err, "failed to close document");
        }
        info!(document = %self.shared.id, source = %self.shared.source_name, "document disposed");
    }

    pub(crate) fn ensure_open(&self) -> PDFResult<()> {
        if self.is_disposed() {
            return Err(PDFError::DocumentStateError(format!(
                "{} ({}) has been disposed",
                self.shared.id, self.shared.source_name
            )));
        }
        Ok(())
    }

    pub(crate) fn assemble_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.shared.assemble_lock
    }

    /// Starts loading native page `index` unless it is already loading (or
    /// settled and `force` is false). Returns a receiver of the page state.
    pub(crate) fn request_page_load(
        &self,
        index: u32,
        force: bool,
    ) -> Option<watch::Receiver<PageHandle>> {
        if self.is_disposed() {
            return None;
        }
        let (rx, loading) = {
            let slots = self.shared.slots.lock();
            let sender = slots.get(&index)?;
            let current = sender.borrow().clone();
            let start = match current.status() {
                PageLoadStatus::Unloaded => true,
                PageLoadStatus::Loading => false,
                PageLoadStatus::Loaded | PageLoadStatus::Failed => force,
            };
            let loading = if start {
                let loading = current.with_state(current.geometry(), PageLoadStatus::Loading);
                sender.send_replace(loading.clone());
                Some(loading)
            } else {
                None
            };
            (sender.subscribe(), loading)
        };

        if let Some(loading) = loading {
            self.update_positions(index, &loading, None);
            let doc = self.clone();
            tokio::spawn(async move { doc.load_page_now(index).await });
        }
        Some(rx)
    }

    async fn load_page_now(&self, index: u32) {
        let handle = self.shared.handle;
        let result = self
            .shared
            .gate
            .run(move |b| b.load_page_geometry(handle, index))
            .await;
        if self.is_disposed() {
            return;
        }
        let Some(current) = self.slot_state(index) else {
            return;
        };

        let (updated, kind) = match result {
            Ok(geometry) => {
                debug!(document = %self.shared.id, page = index + 1, "page loaded");
                (
                    current.with_state(geometry, PageLoadStatus::Loaded),
                    PageTransition::BecameLoaded,
                )
            }
            Err(err) => {
                warn!(document = %self.shared.id, page = index + 1, error = %err, "page failed to load");
                (
                    current.with_state(current.geometry(), PageLoadStatus::Failed),
                    PageTransition::LoadFailed,
                )
            }
        };
        if let Some(sender) = self.shared.slots.lock().get(&index) {
            sender.send_replace(updated.clone());
        }
        self.update_positions(index, &updated, Some(kind));
    }

    fn slot_state(&self, index: u32) -> Option<PageHandle> {
        self.shared
            .slots
            .lock()
            .get(&index)
            .map(|s| s.borrow().clone())
    }

    /// Applies the state of native page `index` to every list position that
    /// shows it and notifies subscribers.
    fn update_positions(&self, index: u32, state: &PageHandle, kind: Option<PageTransition>) {
        let target = Some((self.shared.id, index));
        let mut changes: SmallVec<[PageStatusChange; 2]> = SmallVec::new();
        {
            let mut pages = self.shared.pages.write();
            for (pos, page) in pages.iter_mut().enumerate() {
                if page.native_target() != target {
                    continue;
                }
                let updated = page.with_state(state.geometry(), state.status());
                *page = updated.clone();
                if let Some(kind) = kind {
                    changes.push(PageStatusChange {
                        page_number: pos as u32 + 1,
                        page: updated,
                        kind,
                    });
                }
            }
        }
        for change in changes {
            let _ = self.shared.events.send(change);
        }
    }

    /// Replaces the handle at `pos` if it is still `old`, and notifies.
    pub(crate) fn refresh_position(&self, pos: usize, old: &PageHandle, new: PageHandle) {
        let kind = match new.status() {
            PageLoadStatus::Loaded => PageTransition::BecameLoaded,
            PageLoadStatus::Failed => PageTransition::LoadFailed,
            _ => return,
        };
        {
            let mut pages = self.shared.pages.write();
            match pages.get_mut(pos) {
                Some(current) if current.ptr_eq(old) => *current = new.clone(),
                _ => return,
            }
        }
        let _ = self.shared.events.send(PageStatusChange {
            page_number: pos as u32 + 1,
            page: new,
            kind,
        });
    }

    /// Swaps in a renumbered page list and notifies every position.
    pub(crate) fn replace_pages(&self, pages: Vec<PageHandle>) {
        let changes: Vec<PageStatusChange> = pages
            .iter()
            .enumerate()
            .map(|(pos, page)| PageStatusChange {
                page_number: pos as u32 + 1,
                page: page.clone(),
                kind: PageTransition::PositionMoved,
            })
            .collect();
        let hooks = self.shared.pages_hooks.lock().clone();
        for hook in &hooks {
            hook(&pages);
        }
        *self.shared.pages.write() = pages;
        for change in changes {
            let _ = self.shared.events.send(change);
        }
    }

    /// Runs `f` on the page list under the write lock.
    pub(crate) fn with_pages_mut<R>(&self, f: impl FnOnce(&mut Vec<PageHandle>) -> R) -> R {
        f(&mut self.shared.pages.write())
    }

    /// Registers the slot of a native page added by assembling.
    pub(crate) fn register_slot(&self, page: PageHandle) {
        if let Some(index) = page.owned_index() {
            self.shared
                .slots
                .lock()
                .insert(index, watch::channel(page).0);
        }
    }

    /// Counts pages whose load settled (`Loaded` or `Failed`).
    pub(crate) fn settled_count(&self) -> (u32, u32) {
        let pages = self.shared.pages.read();
        let settled = pages.iter().filter(|p| p.status().is_terminal()).count();
        (settled as u32, pages.len() as u32)
    }

    /// Next position whose page has not settled, preferring `priority` (page
    /// numbers).
    pub(crate) fn next_pending(
        &self,
        priority: Option<&RangeInclusive<u32>>,
    ) -> Option<(usize, PageHandle)> {
        let pages = self.shared.pages.read();
        let pending = |pos: &usize| !pages[*pos].status().is_terminal();
        let preferred = priority.and_then(|range| {
            let start = (*range.start()).max(1) as usize - 1;
            let end = (*range.end() as usize).min(pages.len());
            (start..end).find(pending)
        });
        preferred
            .or_else(|| (0..pages.len()).find(pending))
            .map(|pos| (pos, pages[pos].clone()))
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.shared.id)
            .field("source", &self.shared.source_name)
            .field("handle", &self.shared.handle)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
