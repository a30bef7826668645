//! Document reference and engine tests


use futures::FutureExt;
use pdf_x_loader::core::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_utils::*;

/// Loader that opens the fake document `key` after `delay`, counting calls.
fn counting_loader(
    gate: &BackendGate,
    key: &'static str,
    calls: &Arc<AtomicUsize>,
    delay: Duration,
) -> DocumentLoader {
    let gate = gate.clone();
    let calls = calls.clone();
    Arc::new(move |_progress: LoadProgress| {
        calls.fetch_add(1, Ordering::SeqCst);
        let gate = gate.clone();
        async move {
            tokio::time::sleep(delay).await;
            open_fake(&gate, key, true).await
        }
        .boxed()
    })
}

struct Fixture {
    backend: Arc<FakeBackend>,
    gate: BackendGate,
    calls: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        let backend = Arc::new(FakeBackend::new());
        backend.add_document("a.pdf", FakeDocSpec::uniform("A", 3));
        backend.add_document("b.pdf", FakeDocSpec::uniform("B", 2));
        let gate = fake_gate(&backend);
        Self {
            backend,
            gate,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn doc_ref(&self, key: &'static str, delay: Duration, auto_dispose: bool) -> DocumentRef {
        DocumentRef::new(key, counting_loader(&self.gate, key, &self.calls, delay), auto_dispose)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Loading
// ============================================================================

#[tokio::test]
async fn test_concurrent_loads_share_one_attempt() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::from_millis(30), true);

    let (first, second) = tokio::join!(doc_ref.load(false), doc_ref.load(false));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(fx.calls(), 1);
    assert!(first.same_document(&second));
    assert_eq!(fx.backend.open_count(), 1);
    assert_eq!(doc_ref.revision(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_loads_share_one_attempt() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::from_millis(30), true);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let doc_ref = doc_ref.clone();
            tokio::spawn(async move { doc_ref.load(false).await.map(|d| d.handle()) })
        })
        .collect();
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(fx.calls(), 1);
    assert!(handles.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_outcome_is_kept_until_forced() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::ZERO, true);

    let first = doc_ref.load(false).await.unwrap();
    let again = doc_ref.load(false).await.unwrap();
    assert!(first.same_document(&again));
    assert_eq!(fx.calls(), 1);

    let reloaded = doc_ref.load(true).await.unwrap();
    assert_eq!(fx.calls(), 2);
    assert!(!reloaded.same_document(&first));
    assert_eq!(doc_ref.revision(), 2);
    // auto-dispose closes the replaced document
    assert!(first.is_disposed());
    assert!(fx.backend.is_closed(first.handle()));
}

#[tokio::test]
async fn test_failed_load_is_remembered() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("missing.pdf", Duration::ZERO, true);

    assert!(matches!(doc_ref.load(false).await, Err(PDFError::OpenFailure(_))));
    assert!(matches!(doc_ref.status(), RefStatus::Errored(PDFError::OpenFailure(_))));
    assert!(doc_ref.error().is_some());
    assert!(doc_ref.document().is_none());

    assert!(doc_ref.load(false).await.is_err());
    assert_eq!(fx.calls(), 1);
    assert_eq!(doc_ref.revision(), 1);
}

#[tokio::test]
async fn test_status_transitions() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::from_millis(20), true);
    assert!(matches!(doc_ref.status(), RefStatus::Empty));

    let loading = {
        let doc_ref = doc_ref.clone();
        tokio::spawn(async move { doc_ref.load(false).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(matches!(doc_ref.status(), RefStatus::Loading));

    loading.await.unwrap().unwrap();
    assert!(matches!(doc_ref.status(), RefStatus::Ready(_)));
}

// ============================================================================
// Replacing
// ============================================================================

#[tokio::test]
async fn test_revision_events() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::ZERO, true);
    let mut events = doc_ref.acquire();

    doc_ref.load(false).await.unwrap();
    assert_eq!(events.recv().await.unwrap(), RefEvent::Revision(1));

    doc_ref.set_error(PDFError::NetworkFailure("offline".into())).await;
    assert_eq!(events.recv().await.unwrap(), RefEvent::Revision(2));
    assert!(matches!(doc_ref.status(), RefStatus::Errored(PDFError::NetworkFailure(_))));
}

#[tokio::test]
async fn test_set_same_document_is_noop() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::ZERO, true);
    let doc = doc_ref.load(false).await.unwrap();
    let mut events = doc_ref.subscribe();

    doc_ref.set_document(doc.clone()).await;
    assert_eq!(doc_ref.revision(), 1);
    assert!(events.try_recv().is_err());
    assert!(!doc.is_disposed());
}

#[tokio::test]
async fn test_set_document_disposes_previous() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::ZERO, true);
    let old = doc_ref.load(false).await.unwrap();
    let other = open_fake(&fx.gate, "b.pdf", true).await.unwrap();

    doc_ref.set_document(other.clone()).await;
    assert_eq!(doc_ref.revision(), 2);
    assert!(old.is_disposed());
    assert!(doc_ref.document().unwrap().same_document(&other));
}

#[tokio::test]
async fn test_no_auto_dispose_keeps_documents_open() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::ZERO, false);
    let _events = doc_ref.acquire();
    let old = doc_ref.load(false).await.unwrap();

    let other = open_fake(&fx.gate, "b.pdf", true).await.unwrap();
    doc_ref.set_document(other.clone()).await;
    assert!(!old.is_disposed());

    doc_ref.release().await;
    assert!(!other.is_disposed());
    assert!(doc_ref.document().is_none());
}

// ============================================================================
// Listeners
// ============================================================================

#[tokio::test]
async fn test_last_release_disposes() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::ZERO, true);
    let mut first = doc_ref.acquire();
    let _second = doc_ref.acquire();
    let doc = doc_ref.load(false).await.unwrap();
    assert_eq!(doc_ref.listener_count(), 2);
    assert_eq!(first.try_recv().unwrap(), RefEvent::Revision(1));

    doc_ref.release().await;
    assert!(!doc.is_disposed());

    doc_ref.release().await;
    assert_eq!(doc_ref.listener_count(), 0);
    assert!(doc.is_disposed());
    assert!(fx.backend.is_closed(doc.handle()));
    assert!(matches!(doc_ref.status(), RefStatus::Empty));
    // dropping the document is announced like any other change
    assert_eq!(doc_ref.revision(), 2);
    assert_eq!(first.try_recv().unwrap(), RefEvent::Revision(2));

    // an unmatched release changes nothing
    doc_ref.release().await;
    assert_eq!(doc_ref.listener_count(), 0);
    assert_eq!(doc_ref.revision(), 2);

    // the reference loads again on demand
    let reopened = doc_ref.load(false).await.unwrap();
    assert!(!reopened.is_disposed());
    assert_eq!(fx.calls(), 2);
    assert_eq!(doc_ref.revision(), 3);
}

#[tokio::test]
async fn test_release_while_loading_discards_result() {
    let fx = Fixture::new();
    let doc_ref = fx.doc_ref("a.pdf", Duration::from_millis(30), true);
    let _events = doc_ref.acquire();

    let loading = {
        let doc_ref = doc_ref.clone();
        tokio::spawn(async move { doc_ref.load(false).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    doc_ref.release().await;

    let result = loading.await.unwrap();
    assert!(matches!(result, Err(PDFError::DocumentStateError(_))));
    assert!(doc_ref.document().is_none());
    assert_eq!(fx.backend.open_documents(), 0);
}

// ============================================================================
// Engine
// ============================================================================

#[tokio::test]
async fn test_engine_shares_references_by_source() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 2));
    let engine = fake_engine(&backend);

    let first = engine.document_ref(DocumentSource::File("a.pdf".into()));
    let second = engine.document_ref(DocumentSource::File("a.pdf".into()));
    assert!(first.ptr_eq(&second));
    assert_eq!(engine.refs().len(), 1);

    let doc = engine.open(DocumentSource::File("a.pdf".into())).await.unwrap();
    assert_eq!(doc.page_count(), 2);
    assert_eq!(backend.open_count(), 1);

    assert_eq!(engine.refs().purge_idle(), 0);
    first.dispose().await;
    assert_eq!(engine.refs().purge_idle(), 1);
    assert!(engine.refs().is_empty());
}

#[tokio::test]
async fn test_engine_opens_memory_source() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("in-memory document", FakeDocSpec::uniform("M", 4));
    let engine = fake_engine(&backend);

    let source = DocumentSource::Memory {
        name: "upload".into(),
        bytes: Arc::from(&b"in-memory document"[..]),
    };
    let doc = engine.open(source).await.unwrap();
    assert_eq!(doc.source_name(), "memory:upload");
    assert_eq!(doc.page_count(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_opens_remote_source() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("remote document bytes", FakeDocSpec::uniform("R", 2));
    let engine = fake_engine(&backend);

    let fetcher = Arc::new(FakeFetcher::new(b"remote document bytes".to_vec()));
    let source = DocumentSource::Uri {
        uri: "https://example.com/remote.pdf".into(),
        fetcher: fetcher.clone() as Arc<dyn BlockFetcher>,
    };
    let doc_ref = engine.document_ref(source);
    let mut events = doc_ref.acquire();

    let doc = doc_ref.load(false).await.unwrap();
    assert_eq!(doc.page_count(), 2);
    assert_eq!(doc.source_name(), "https://example.com/remote.pdf");
    assert_eq!(doc_ref.bytes_downloaded(), 21);
    assert_eq!(doc_ref.total_bytes(), Some(21));

    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RefEvent::Progress { downloaded, total } = event {
            progress.push((downloaded, total));
        }
    }
    assert_eq!(progress.last(), Some(&(21, Some(21))));
    assert_eq!(fetcher.request_count(), 1);
}

#[tokio::test]
async fn test_engine_password_provider() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("locked.pdf", FakeDocSpec::uniform("L", 1).with_password("pw"));
    let provider: PasswordProvider = Arc::new(|| async { Some("pw".to_string()) }.boxed());
    let engine = fake_engine(&backend).with_password_provider(provider);

    let doc = engine.open(DocumentSource::File("locked.pdf".into())).await.unwrap();
    assert_eq!(doc.page_count(), 1);
}

#[tokio::test]
async fn test_engine_releases_cached_bitmaps_with_document() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 2));
    let engine = fake_engine(&backend);

    let doc_ref = engine.document_ref(DocumentSource::File("a.pdf".into()));
    let _events = doc_ref.acquire();
    let doc = doc_ref.load(false).await.unwrap();
    let page = doc.page_list().get(0).unwrap();

    engine.render_cache().render_page(&page, 0.5).await.unwrap().unwrap();
    engine.thumbnails().thumbnail(&page).await.unwrap().unwrap();
    assert_eq!(engine.render_cache().len(), 1);
    assert_eq!(engine.thumbnails().stats().entries, 1);

    doc_ref.release().await;
    assert!(engine.render_cache().is_empty());
    assert_eq!(engine.thumbnails().stats().entries, 0);
}
