use super::backend::{PageGeometry, PageLink, PageRotation, PageText, PixelBuffer, RenderParams};
use super::cancel::CancellationToken;
use super::document::{Document, DocumentId, WeakDocument};
use super::error::{PDFError, PDFResult};
use super::geometry::PageFrame;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Load state of one page.
///
/// `Unloaded -> Loading -> {Loaded | Failed}`; a forced reload moves a
/// settled page back to `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoadStatus {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

impl PageLoadStatus {
    /// True for `Loaded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, PageLoadStatus::Loaded | PageLoadStatus::Failed)
    }
}

/// What a page handle delegates to.
#[derive(Clone)]
pub enum PageSource {
    /// Native page `index` of the owning document
    Owned { index: u32 },
    /// Native page `index` of another document; depends on that document
    /// staying open until the owner's list is assembled
    External { document: WeakDocument, index: u32 },
    /// `inner` shown with a different absolute rotation
    Rotated {
        inner: PageHandle,
        rotation: PageRotation,
    },
}

impl fmt::Debug for PageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageSource::Owned { index } => write!(f, "Owned({})", index),
            PageSource::External { document, index } => {
                write!(f, "External({}, {})", document.id(), index)
            }
            PageSource::Rotated { inner, rotation } => {
                write!(f, "Rotated({:?}, {})", inner.source(), rotation.degrees())
            }
        }
    }
}

/// Stable identity of the content a handle shows: the native page and the
/// rotation it is displayed with. Unlike the page number it survives
/// reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub document: DocumentId,
    pub index: u32,
    pub rotation: PageRotation,
}

struct PageInner {
    owner: WeakDocument,
    source: PageSource,
    page_number: u32,
    geometry: PageGeometry,
    status: PageLoadStatus,
}

/// One page of a document's page list.
///
/// A handle is an immutable snapshot: when a page loads, a new handle replaces
/// the old one in the list and is published to subscribers. Callers holding
/// an old handle get the new one from [`ensure_loaded`](Self::ensure_loaded).
///
/// Width and height are in points at 72dpi, post-rotation. They are only
/// authoritative when [`is_loaded`](Self::is_loaded) returns true; otherwise
/// they are estimates.
#[derive(Clone)]
pub struct PageHandle(Arc<PageInner>);

impl PageHandle {
    pub(crate) fn owned(
        owner: WeakDocument,
        index: u32,
        page_number: u32,
        geometry: PageGeometry,
        status: PageLoadStatus,
    ) -> Self {
        PageHandle(Arc::new(PageInner {
            owner,
            source: PageSource::Owned { index },
            page_number,
            geometry,
            status,
        }))
    }

    /// 1-based position in the owning page list.
    pub fn page_number(&self) -> u32 {
        self.0.page_number
    }

    pub fn width(&self) -> f32 {
        self.0.geometry.width
    }

    pub fn height(&self) -> f32 {
        self.0.geometry.height
    }

    /// Absolute rotation of the page as displayed.
    pub fn rotation(&self) -> PageRotation {
        self.0.geometry.rotation
    }

    pub fn geometry(&self) -> PageGeometry {
        self.0.geometry
    }

    pub fn frame(&self) -> PageFrame {
        PageFrame::new(self.width(), self.height(), self.rotation())
    }

    pub fn status(&self) -> PageLoadStatus {
        self.0.status
    }

    pub fn is_loaded(&self) -> bool {
        self.0.status == PageLoadStatus::Loaded
    }

    pub fn source(&self) -> &PageSource {
        &self.0.source
    }

    /// Id of the document whose list this handle belongs to.
    pub fn owner_id(&self) -> DocumentId {
        self.0.owner.id()
    }

    /// The document whose list this handle belongs to, if still alive.
    pub fn document(&self) -> Option<Document> {
        self.0.owner.upgrade()
    }

    /// The underlying page of a rotation proxy or cross-document reference.
    pub fn source_page(&self) -> Option<&PageHandle> {
        match &self.0.source {
            PageSource::Rotated { inner, .. } => Some(inner),
            _ => None,
        }
    }

    /// True if both are the same handle instance.
    pub fn ptr_eq(&self, other: &PageHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True if this handle depends on another document's native page.
    pub fn is_external(&self) -> bool {
        match &self.0.source {
            PageSource::Owned { .. } => false,
            PageSource::External { .. } => true,
            PageSource::Rotated { inner, .. } => inner.is_external(),
        }
    }

    pub fn key(&self) -> PageKey {
        let (document, index) = self.native_target().unwrap_or((self.owner_id(), 0));
        PageKey {
            document,
            index,
            rotation: self.rotation(),
        }
    }

    pub(crate) fn owned_index(&self) -> Option<u32> {
        match &self.0.source {
            PageSource::Owned { index } => Some(*index),
            _ => None,
        }
    }

    /// Document id and native index this handle finally resolves to.
    pub(crate) fn native_target(&self) -> Option<(DocumentId, u32)> {
        match &self.0.source {
            PageSource::Owned { index } => Some((self.owner_id(), *index)),
            PageSource::External { document, index } => Some((document.id(), *index)),
            PageSource::Rotated { inner, .. } => inner.native_target(),
        }
    }

    fn native_document(&self) -> PDFResult<Document> {
        match &self.0.source {
            PageSource::Owned { .. } => self.0.owner.open_document(),
            PageSource::External { document, .. } => document.open_document(),
            PageSource::Rotated { inner, .. } => inner.native_document(),
        }
    }

    /// Rotation of the proxy relative to the page it wraps.
    fn rotation_delta(&self) -> PageRotation {
        match &self.0.source {
            PageSource::Rotated { inner, rotation } => rotation.relative_to(inner.rotation()),
            _ => PageRotation::Deg0,
        }
    }

    fn rebuild(&self, source: PageSource, page_number: u32, geometry: PageGeometry, status: PageLoadStatus) -> Self {
        self.rebuild_for(self.0.owner.clone(), source, page_number, geometry, status)
    }

    fn rebuild_for(
        &self,
        owner: WeakDocument,
        source: PageSource,
        page_number: u32,
        geometry: PageGeometry,
        status: PageLoadStatus,
    ) -> Self {
        PageHandle(Arc::new(PageInner {
            owner,
            source,
            page_number,
            geometry,
            status,
        }))
    }

    /// Returns a handle showing this page with absolute `rotation`.
    ///
    /// Returns this same handle if the rotation is unchanged, and the wrapped
    /// page if a proxy is rotated back to the wrapped page's rotation. Width
    /// and height swap when the rotation differs by an odd number of quarter
    /// turns.
    pub fn rotated(&self, rotation: PageRotation) -> PageHandle {
        if rotation == self.rotation() {
            return self.clone();
        }
        let base = match &self.0.source {
            PageSource::Rotated { inner, .. } => inner,
            _ => self,
        };
        if rotation == base.rotation() {
            return if base.page_number() == self.page_number() {
                base.clone()
            } else {
                base.renumbered(self.page_number())
            };
        }
        let geometry = base.geometry().rotated_by(rotation.relative_to(base.rotation()));
        self.rebuild(
            PageSource::Rotated {
                inner: base.clone(),
                rotation,
            },
            self.page_number(),
            geometry,
            base.status(),
        )
    }

    /// Same page at another position of the same list.
    pub fn renumbered(&self, page_number: u32) -> PageHandle {
        if page_number == self.page_number() {
            return self.clone();
        }
        let source = match &self.0.source {
            PageSource::Rotated { inner, rotation } => PageSource::Rotated {
                inner: inner.renumbered(page_number),
                rotation: *rotation,
            },
            other => other.clone(),
        };
        self.rebuild(source, page_number, self.geometry(), self.status())
    }

    /// Binds this handle to position `page_number` of `owner`'s list.
    ///
    /// A page of another document becomes an `External` reference; an
    /// `External` reference back into `owner` becomes `Owned` again.
    ///
    /// # Errors
    /// [`PDFError::DocumentStateError`] if the document the page comes from
    /// has been disposed.
    pub fn rebind(&self, owner: &Document, page_number: u32) -> PDFResult<PageHandle> {
        self.native_document()?;
        let same_owner = self.owner_id() == owner.id();
        let source = match &self.0.source {
            PageSource::Owned { index } if same_owner => PageSource::Owned { index: *index },
            PageSource::Owned { index } => PageSource::External {
                document: self.0.owner.clone(),
                index: *index,
            },
            PageSource::External { document, index } if document.id() == owner.id() => {
                PageSource::Owned { index: *index }
            }
            PageSource::External { document, index } => PageSource::External {
                document: document.clone(),
                index: *index,
            },
            PageSource::Rotated { inner, rotation } => PageSource::Rotated {
                inner: inner.rebind(owner, page_number)?,
                rotation: *rotation,
            },
        };
        if same_owner
            && page_number == self.page_number()
            && !matches!(self.0.source, PageSource::External { .. } | PageSource::Rotated { .. })
        {
            return Ok(self.clone());
        }
        Ok(self.rebuild_for(owner.downgrade(), source, page_number, self.geometry(), self.status()))
    }

    /// Replaces `External` native page references with `Owned` ones according
    /// to `imported`, which maps (source document, index) to the new index.
    pub(crate) fn materialize(&self, imported: &dyn Fn(DocumentId, u32) -> Option<u32>) -> Option<PageHandle> {
        let source = match &self.0.source {
            PageSource::Owned { .. } => return None,
            PageSource::External { document, index } => PageSource::Owned {
                index: imported(document.id(), *index)?,
            },
            PageSource::Rotated { inner, rotation } => PageSource::Rotated {
                inner: inner.materialize(imported)?,
                rotation: *rotation,
            },
        };
        Some(self.rebuild(source, self.page_number(), self.geometry(), self.status()))
    }

    /// Geometry of the native page behind any rotation proxies.
    pub(crate) fn native_geometry(&self) -> PageGeometry {
        match &self.0.source {
            PageSource::Rotated { inner, .. } => inner.native_geometry(),
            _ => self.geometry(),
        }
    }

    /// Same handle with the state of its native page: `geometry` is the
    /// native page's geometry, proxies apply their rotation on top.
    pub(crate) fn with_state(&self, geometry: PageGeometry, status: PageLoadStatus) -> PageHandle {
        match &self.0.source {
            PageSource::Rotated { inner, rotation } => {
                let inner = inner.with_state(geometry, status);
                let own = inner.geometry().rotated_by(rotation.relative_to(inner.rotation()));
                self.rebuild(
                    PageSource::Rotated {
                        inner,
                        rotation: *rotation,
                    },
                    self.page_number(),
                    own,
                    status,
                )
            }
            source => self.rebuild(source.clone(), self.page_number(), geometry, status),
        }
    }

    /// Waits until the page has settled and returns the up-to-date handle.
    ///
    /// Never fails: a page that fails to load comes back `Failed` with its
    /// estimated geometry, and a handle whose document is gone comes back
    /// unchanged. Callers must continue with the returned handle.
    pub async fn ensure_loaded(&self) -> PageHandle {
        if self.status().is_terminal() {
            return self.clone();
        }
        let Some((_, index)) = self.native_target() else {
            return self.clone();
        };
        let Ok(doc) = self.native_document() else {
            return self.clone();
        };
        let Some(mut rx) = doc.request_page_load(index, false) else {
            return self.clone();
        };
        let state = rx
            .wait_for(|page| page.status().is_terminal())
            .await
            .map(|page| page.clone());
        match state {
            Ok(state) => self.with_state(state.geometry(), state.status()),
            Err(_) => self.clone(),
        }
    }

    /// Like [`ensure_loaded`](Self::ensure_loaded) with a timeout. Returns
    /// `None` on timeout; the load itself keeps running.
    pub async fn wait_for_loaded(&self, timeout: Duration) -> Option<PageHandle> {
        tokio::time::timeout(timeout, self.ensure_loaded()).await.ok()
    }

    /// Extracts the page text. Returns `None` if the page is not loaded.
    ///
    /// Fragment bounds are in the page space of this handle, so a rotation
    /// proxy reports rotated rectangles.
    pub async fn text(&self) -> PDFResult<Option<PageText>> {
        if !self.is_loaded() {
            return Ok(None);
        }
        let doc = self.native_document()?;
        let Some((_, index)) = self.native_target() else {
            return Ok(None);
        };
        let handle = doc.handle();
        let text = doc.gate().run(move |b| b.extract_text(handle, index)).await?;
        Ok(text.map(|mut text| {
            let (delta, w, h) = self.proxy_transform();
            if delta != PageRotation::Deg0 {
                for fragment in &mut text.fragments {
                    fragment.bounds = fragment.bounds.rotate(delta, w, h);
                }
            }
            text
        }))
    }

    /// Extracts the page links. Returns an empty list if the page is not
    /// loaded.
    pub async fn links(&self) -> PDFResult<Vec<PageLink>> {
        if !self.is_loaded() {
            return Ok(Vec::new());
        }
        let doc = self.native_document()?;
        let Some((_, index)) = self.native_target() else {
            return Ok(Vec::new());
        };
        let handle = doc.handle();
        let mut links = doc.gate().run(move |b| b.extract_links(handle, index)).await?;
        let (delta, w, h) = self.proxy_transform();
        if delta != PageRotation::Deg0 {
            for link in &mut links {
                for rect in link.bounds.iter_mut() {
                    *rect = rect.rotate(delta, w, h);
                }
            }
        }
        Ok(links)
    }

    /// Rotation of a proxy relative to the native page and the native page
    /// size it rotates.
    fn proxy_transform(&self) -> (PageRotation, f32, f32) {
        match &self.0.source {
            PageSource::Rotated { inner, .. } => (self.rotation_delta(), inner.width(), inner.height()),
            _ => (PageRotation::Deg0, self.width(), self.height()),
        }
    }

    /// Renders the page through the backend gate.
    ///
    /// Returns `Ok(None)` if `cancel` was cancelled before or during the
    /// render.
    ///
    /// # Errors
    /// [`PDFError::RenderFailure`] for backend failures,
    /// [`PDFError::DocumentStateError`] if the document is disposed.
    pub async fn render(
        &self,
        params: RenderParams,
        cancel: CancellationToken,
    ) -> PDFResult<Option<PixelBuffer>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let doc = self.native_document()?;
        let (_, index) = self
            .native_target()
            .ok_or_else(|| PDFError::DocumentStateError("page has no native source".to_string()))?;
        let handle = doc.handle();
        let page = self.page_number();
        let params = RenderParams {
            rotation: params.rotation.add(self.rotation_delta()),
            ..params
        };
        let result = doc
            .gate()
            .run(move |b| {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                b.render(handle, index, &params, &cancel)
            })
            .await;
        match result {
            Ok(buffer) => Ok(buffer),
            Err(err @ PDFError::RenderFailure { .. }) => Err(err),
            Err(err @ PDFError::DocumentStateError(_)) => Err(err),
            Err(err) => Err(PDFError::RenderFailure {
                page,
                reason: err.to_string(),
            }),
        }
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_number", &self.0.page_number)
            .field("source", &self.0.source)
            .field("width", &self.0.geometry.width)
            .field("height", &self.0.geometry.height)
            .field("rotation", &self.0.geometry.rotation.degrees())
            .field("status", &self.0.status)
            .finish()
    }
}
