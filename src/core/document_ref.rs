//! Shared, reference-counted access to one document.
//!
//! A [`DocumentRef`] is keyed by the source name of its document. It loads
//! the document at most once (concurrent loads share one in-flight future),
//! keeps either the document or the error of the last attempt, and closes the
//! document when its last listener releases it.

use super::chunked_source::ProgressCallback;
use super::document::Document;
use super::error::{PDFError, PDFResult};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Opens the document of a [`DocumentRef`]. Receives a progress reporter for
/// remote sources.
pub type DocumentLoader =
    Arc<dyn Fn(LoadProgress) -> BoxFuture<'static, PDFResult<Document>> + Send + Sync>;

type InflightLoad = Shared<BoxFuture<'static, PDFResult<Document>>>;

/// Notifications of a [`DocumentRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefEvent {
    /// The document or error changed; carries the new revision
    Revision(u64),
    /// Download progress of a remote source
    Progress { downloaded: u64, total: Option<u64> },
}

/// Observable state of a [`DocumentRef`].
#[derive(Debug, Clone)]
pub enum RefStatus {
    /// Nothing attempted yet (or reset by disposal)
    Empty,
    Loading,
    Ready(Document),
    Errored(PDFError),
}

struct RefState {
    document: Option<Document>,
    error: Option<PDFError>,
    revision: u64,
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
    listeners: usize,
    attempted: bool,
    inflight: Option<InflightLoad>,
    /// Bumped on every reset so that a load finishing after a reset is
    /// discarded
    generation: u64,
}

struct RefShared {
    source_name: String,
    loader: DocumentLoader,
    auto_dispose: bool,
    state: Mutex<RefState>,
    events: broadcast::Sender<RefEvent>,
}

/// Reference-counted handle to a lazily loaded document.
#[derive(Clone)]
pub struct DocumentRef(Arc<RefShared>);

/// Reports download progress into a [`DocumentRef`].
#[derive(Clone)]
pub struct LoadProgress {
    target: Weak<RefShared>,
}

impl LoadProgress {
    /// A reporter that goes nowhere.
    pub fn detached() -> Self {
        Self { target: Weak::new() }
    }

    pub fn report(&self, downloaded: u64, total: Option<u64>) {
        let Some(shared) = self.target.upgrade() else {
            return;
        };
        {
            let mut state = shared.state.lock();
            state.bytes_downloaded = downloaded;
            state.total_bytes = total;
        }
        let _ = shared.events.send(RefEvent::Progress { downloaded, total });
    }

    /// The reporter as a chunked-source progress callback.
    pub fn callback(&self) -> ProgressCallback {
        let progress = self.clone();
        Arc::new(move |downloaded, total| progress.report(downloaded, total))
    }
}

impl DocumentRef {
    /// Creates a reference whose document is opened by `loader`.
    ///
    /// With `auto_dispose` the reference closes documents it lets go of: the
    /// previous one on replacement and the current one when the last
    /// listener releases it.
    pub fn new(source_name: impl Into<String>, loader: DocumentLoader, auto_dispose: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        DocumentRef(Arc::new(RefShared {
            source_name: source_name.into(),
            loader,
            auto_dispose,
            state: Mutex::new(RefState {
                document: None,
                error: None,
                revision: 0,
                bytes_downloaded: 0,
                total_bytes: None,
                listeners: 0,
                attempted: false,
                inflight: None,
                generation: 0,
            }),
            events,
        }))
    }

    pub fn source_name(&self) -> &str {
        &self.0.source_name
    }

    pub fn auto_dispose(&self) -> bool {
        self.0.auto_dispose
    }

    pub fn document(&self) -> Option<Document> {
        self.0.state.lock().document.clone()
    }

    pub fn error(&self) -> Option<PDFError> {
        self.0.state.lock().error.clone()
    }

    /// Incremented on every document or error change.
    pub fn revision(&self) -> u64 {
        self.0.state.lock().revision
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.0.state.lock().bytes_downloaded
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.0.state.lock().total_bytes
    }

    pub fn listener_count(&self) -> usize {
        self.0.state.lock().listeners
    }

    pub fn status(&self) -> RefStatus {
        let state = self.0.state.lock();
        if state.inflight.is_some() {
            RefStatus::Loading
        } else if let Some(document) = &state.document {
            RefStatus::Ready(document.clone())
        } else if let Some(error) = &state.error {
            RefStatus::Errored(error.clone())
        } else {
            RefStatus::Empty
        }
    }

    /// True if both handles refer to the same reference.
    pub fn ptr_eq(&self, other: &DocumentRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Subscribes to events without becoming a listener.
    pub fn subscribe(&self) -> broadcast::Receiver<RefEvent> {
        self.0.events.subscribe()
    }

    /// Loads the document.
    ///
    /// After a completed attempt this returns its outcome without loading
    /// again unless `force_reload` is set. Calls made while a load is in
    /// flight wait for that load; the loader never runs twice concurrently.
    pub async fn load(&self, force_reload: bool) -> PDFResult<Document> {
        let load = {
            let mut state = self.0.state.lock();
            if let Some(inflight) = state.inflight.clone() {
                inflight
            } else if state.attempted && !force_reload {
                return Self::outcome(&state);
            } else {
                state.attempted = true;
                let load = self.start_load(state.generation);
                state.inflight = Some(load.clone());
                load
            }
        };
        load.await
    }

    fn outcome(state: &RefState) -> PDFResult<Document> {
        match (&state.document, &state.error) {
            (Some(document), _) => Ok(document.clone()),
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Err(PDFError::DocumentStateError(
                "document has not been loaded".to_string(),
            )),
        }
    }

    fn start_load(&self, generation: u64) -> InflightLoad {
        let this = self.clone();
        let progress = LoadProgress {
            target: Arc::downgrade(&self.0),
        };
        let loader = self.0.loader.clone();
        async move {
            debug!(source = %this.0.source_name, "loading document");
            let result = loader(progress).await;
            this.finish_load(generation, result).await
        }
        .boxed()
        .shared()
    }

    async fn finish_load(&self, generation: u64, result: PDFResult<Document>) -> PDFResult<Document> {
        let (outcome, discard, revision) = {
            let mut state = self.0.state.lock();
            state.inflight = None;
            if state.generation != generation {
                let discard = result.as_ref().ok().cloned();
                let outcome = result.and_then(|_| {
                    Err(PDFError::DocumentStateError(format!(
                        "{} was released while loading",
                        self.0.source_name
                    )))
                });
                (outcome, discard, None)
            } else {
                match result {
                    Ok(document) => {
                        let old = self.replace(&mut state, Some(document.clone()), None);
                        (Ok(document), old, Some(state.revision))
                    }
                    Err(error) => {
                        warn!(source = %self.0.source_name, error = %error, "document failed to load");
                        let old = self.replace(&mut state, None, Some(error.clone()));
                        (Err(error), old, Some(state.revision))
                    }
                }
            }
        };
        if let Some(revision) = revision {
            let _ = self.0.events.send(RefEvent::Revision(revision));
        }
        if let Some(document) = discard {
            document.dispose().await;
        }
        outcome
    }

    /// Swaps in a document or error and bumps the revision. Returns the
    /// document to dispose, if any.
    fn replace(
        &self,
        state: &mut RefState,
        document: Option<Document>,
        error: Option<PDFError>,
    ) -> Option<Document> {
        let old = std::mem::replace(&mut state.document, document);
        state.error = error;
        state.attempted = true;
        state.revision += 1;
        let current = state.document.as_ref();
        old.filter(|old| self.0.auto_dispose && !current.is_some_and(|new| new.same_document(old)))
    }

    /// Replaces the document.
    ///
    /// No-op if `document` is the current document (same backend handle).
    /// The previous document is disposed when auto-dispose is on.
    pub async fn set_document(&self, document: Document) {
        let (old, revision) = {
            let mut state = self.0.state.lock();
            if state
                .document
                .as_ref()
                .is_some_and(|current| current.same_document(&document))
            {
                return;
            }
            let old = self.replace(&mut state, Some(document), None);
            (old, state.revision)
        };
        let _ = self.0.events.send(RefEvent::Revision(revision));
        if let Some(old) = old {
            old.dispose().await;
        }
    }

    /// Records a failure in place of the document.
    pub async fn set_error(&self, error: PDFError) {
        let (old, revision) = {
            let mut state = self.0.state.lock();
            let old = self.replace(&mut state, None, Some(error));
            (old, state.revision)
        };
        let _ = self.0.events.send(RefEvent::Revision(revision));
        if let Some(old) = old {
            old.dispose().await;
        }
    }

    /// Adds a listener. The document is kept open while at least one
    /// listener holds it.
    pub fn acquire(&self) -> broadcast::Receiver<RefEvent> {
        self.0.state.lock().listeners += 1;
        self.0.events.subscribe()
    }

    /// Removes a listener; releasing the last one disposes the reference.
    pub async fn release(&self) {
        let remaining = {
            let mut state = self.0.state.lock();
            if state.listeners == 0 {
                drop(state);
                warn!(source = %self.0.source_name, "release without matching acquire");
                return;
            }
            state.listeners -= 1;
            state.listeners
        };
        if remaining == 0 {
            self.dispose().await;
        }
    }

    /// Drops the document (closing it when auto-dispose is on) and resets
    /// to the empty state. Clearing a document or an error is a change like
    /// any other: the revision is bumped and announced.
    pub async fn dispose(&self) {
        let (document, revision) = {
            let mut state = self.0.state.lock();
            state.generation += 1;
            state.inflight = None;
            state.attempted = false;
            state.bytes_downloaded = 0;
            state.total_bytes = None;
            let error = state.error.take();
            let document = state.document.take();
            let revision = (document.is_some() || error.is_some()).then(|| {
                state.revision += 1;
                state.revision
            });
            (document, revision)
        };
        if let Some(revision) = revision {
            let _ = self.0.events.send(RefEvent::Revision(revision));
        }
        info!(source = %self.0.source_name, "document reference disposed");
        if let Some(document) = document {
            if self.0.auto_dispose {
                document.dispose().await;
            }
        }
    }
}

impl fmt::Debug for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("DocumentRef")
            .field("source", &self.0.source_name)
            .field("revision", &state.revision)
            .field("listeners", &state.listeners)
            .field("loaded", &state.document.is_some())
            .finish()
    }
}

/// Document references by source name.
#[derive(Default)]
pub struct DocumentRefRegistry {
    refs: Mutex<FxHashMap<String, DocumentRef>>,
}

impl DocumentRefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reference for `source_name`, creating it with `create` on
    /// first access.
    pub fn get_or_create<F>(&self, source_name: &str, create: F) -> DocumentRef
    where
        F: FnOnce() -> DocumentRef,
    {
        self.refs
            .lock()
            .entry(source_name.to_string())
            .or_insert_with(create)
            .clone()
    }

    pub fn get(&self, source_name: &str) -> Option<DocumentRef> {
        self.refs.lock().get(source_name).cloned()
    }

    pub fn remove(&self, source_name: &str) -> Option<DocumentRef> {
        self.refs.lock().remove(source_name)
    }

    /// Forgets references that have no listeners and hold nothing.
    pub fn purge_idle(&self) -> usize {
        let mut refs = self.refs.lock();
        let before = refs.len();
        refs.retain(|_, r| r.listener_count() > 0 || !matches!(r.status(), RefStatus::Empty));
        before - refs.len()
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
