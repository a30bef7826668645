use super::backend::EncodePage;
use super::document::{Document, DocumentId};
use super::error::{PDFError, PDFResult};
use super::page::{PageHandle, PageLoadStatus, PageSource};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info};

/// The ordered, reorderable page sequence of a document.
///
/// Pages may repeat and may come from other documents. Every assignment
/// renumbers the pages to their 1-based positions.
#[derive(Clone, Debug)]
pub struct DocumentPageList {
    document: Document,
}

impl DocumentPageList {
    pub(crate) fn new(document: Document) -> Self {
        Self { document }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Snapshot of the pages in order.
    pub fn pages(&self) -> Vec<PageHandle> {
        self.document.pages()
    }

    pub fn len(&self) -> usize {
        self.document.page_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Page at 0-based `index`.
    ///
    /// # Errors
    /// [`PDFError::DocumentStateError`] if `index` is out of range.
    pub fn get(&self, index: usize) -> PDFResult<PageHandle> {
        self.document.ensure_open()?;
        let pages = self.document.pages();
        let len = pages.len();
        pages.into_iter().nth(index).ok_or_else(|| {
            PDFError::DocumentStateError(format!("page index {} out of range (0..{})", index, len))
        })
    }

    /// Watches the native state of the page at 0-based `index`.
    ///
    /// Only available for pages owned by this document.
    pub fn watch(&self, index: usize) -> PDFResult<watch::Receiver<PageHandle>> {
        let page = self.get(index)?;
        let (document, native) = page
            .native_target()
            .ok_or_else(|| PDFError::DocumentStateError("page has no native source".to_string()))?;
        if document != self.document.id() {
            return Err(PDFError::DocumentStateError(format!(
                "page {} belongs to {}",
                index + 1,
                document
            )));
        }
        self.document
            .watch_page(native)
            .ok_or_else(|| PDFError::DocumentStateError(format!("no state for page {}", index + 1)))
    }

    /// Replaces the pages (rearrange, extract, duplicate or combine).
    ///
    /// Each handle is rebound to its new position; the swap is atomic for
    /// readers.
    ///
    /// # Errors
    /// [`PDFError::DocumentStateError`] if this document or the source
    /// document of any handle has been disposed. The list is left unchanged.
    pub fn set_pages(&self, pages: Vec<PageHandle>) -> PDFResult<()> {
        self.document.ensure_open()?;
        let renumbered = pages
            .iter()
            .enumerate()
            .map(|(pos, page)| page.rebind(&self.document, pos as u32 + 1))
            .collect::<PDFResult<Vec<_>>>()?;
        debug!(document = %self.document.id(), pages = renumbered.len(), "page list replaced");
        self.document.replace_pages(renumbered);
        Ok(())
    }

    /// Makes the document self-contained.
    ///
    /// Every page that references another document is deep-copied into this
    /// document and its handle replaced by an owned one. Pages that are
    /// already owned are left untouched, so calling this again is a no-op.
    ///
    /// # Errors
    /// [`PDFError::DocumentStateError`] if a referenced document has been
    /// disposed.
    pub async fn assemble(&self) -> PDFResult<()> {
        let _assembling = self.document.assemble_lock().lock().await;
        self.document.ensure_open()?;

        let mut external: Vec<(DocumentId, u32, PageHandle)> = Vec::new();
        for page in self.document.pages() {
            if let Some(base) = external_base(&page) {
                if let Some((doc, index)) = base.native_target() {
                    if !external.iter().any(|(d, i, _)| *d == doc && *i == index) {
                        external.push((doc, index, base));
                    }
                }
            }
        }
        if external.is_empty() {
            return Ok(());
        }

        let dest = self.document.handle();
        let mut imported: FxHashMap<(DocumentId, u32), u32> = FxHashMap::default();
        for (doc_id, index, base) in external {
            let PageSource::External { document, .. } = base.source() else {
                continue;
            };
            let source = document.open_document()?;
            let source_handle = source.handle();
            let new_index = self
                .document
                .gate()
                .run(move |b| b.import_page(dest, source_handle, index))
                .await?;
            imported.insert((doc_id, index), new_index);

            // The imported page starts with the settled state of its origin
            let state = source
                .watch_page(index)
                .map(|rx| rx.borrow().clone())
                .unwrap_or_else(|| base.clone());
            let status = match state.status() {
                PageLoadStatus::Loading => PageLoadStatus::Unloaded,
                status => status,
            };
            let slot = PageHandle::owned(
                self.document.downgrade(),
                new_index,
                new_index + 1,
                state.geometry(),
                status,
            );
            self.document.register_slot(slot);
        }

        let lookup = |doc: DocumentId, index: u32| imported.get(&(doc, index)).copied();
        let replaced = self.document.with_pages_mut(|pages| {
            let mut replaced = 0;
            for page in pages.iter_mut() {
                if let Some(owned) = page.materialize(&lookup) {
                    *page = owned;
                    replaced += 1;
                }
            }
            replaced
        });
        info!(
            document = %self.document.id(),
            imported = imported.len(),
            replaced,
            "page list assembled"
        );
        Ok(())
    }

    /// Serializes the document with the current page arrangement.
    ///
    /// Always assembles first, so the output never references other
    /// documents.
    pub async fn encode(&self) -> PDFResult<Vec<u8>> {
        self.assemble().await?;
        let pages = self.document.pages();
        let own = self.document.id();
        let arrangement = pages
            .iter()
            .map(|page| match page.native_target() {
                Some((doc, index)) if doc == own => Ok(EncodePage {
                    index,
                    rotation: page.rotation(),
                }),
                _ => Err(PDFError::DocumentStateError(format!(
                    "page {} still references another document",
                    page.page_number()
                ))),
            })
            .collect::<PDFResult<Vec<_>>>()?;

        let handle = self.document.handle();
        self.document
            .gate()
            .run(move |b| b.encode(handle, &arrangement))
            .await
    }
}

/// The `External` handle a page ultimately delegates to, if any.
fn external_base(page: &PageHandle) -> Option<PageHandle> {
    match page.source() {
        PageSource::Owned { .. } => None,
        PageSource::External { .. } => Some(page.clone()),
        PageSource::Rotated { inner, .. } => external_base(inner),
    }
}
