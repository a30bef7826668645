//! Progressive loading tests
//!
//! A progressive open loads only the first page; the sweep loads the rest in
//! units and reports after each unit.


use pdf_x_loader::core::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::*;

async fn open_with_units(
    gate: &BackendGate,
    key: &str,
    unit: Duration,
    max_pages_per_unit: Option<usize>,
) -> Document {
    let options = OpenOptions {
        load_unit_duration: unit,
        max_pages_per_unit,
        ..OpenOptions::default()
    };
    Document::open(gate.clone(), BackendSource::File(key.into()), key, options)
        .await
        .unwrap()
}

type ProgressLog = Arc<Mutex<Vec<(u32, u32)>>>;

fn recording(log: &ProgressLog, answer: bool) -> impl FnMut(u32, u32) -> bool + Send + 'static {
    let log = log.clone();
    move |settled, total| {
        log.lock().unwrap().push((settled, total));
        answer
    }
}

// ============================================================================
// Units and progress
// ============================================================================

#[tokio::test]
async fn test_progress_reported_per_unit() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 7));
    let gate = fake_gate(&backend);
    let doc = open_with_units(&gate, "a.pdf", Duration::from_secs(10), Some(2)).await;

    let log = ProgressLog::default();
    assert!(doc.load_pages_progressively(recording(&log, true)).await);

    assert_eq!(*log.lock().unwrap(), vec![(3, 7), (5, 7), (7, 7)]);
    assert!(doc.pages().iter().all(|p| p.is_loaded()));
    assert!(!doc.progressive().is_running());
    assert_eq!(backend.geometry_load_count(), 7);
}

#[tokio::test]
async fn test_time_boxed_unit_loads_at_least_one_page() {
    let backend = Arc::new(FakeBackend::with_delay(Duration::from_millis(2)));
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 4));
    let gate = fake_gate(&backend);
    let doc = open_with_units(&gate, "a.pdf", Duration::ZERO, None).await;

    let log = ProgressLog::default();
    assert!(doc.load_pages_progressively(recording(&log, true)).await);
    assert_eq!(*log.lock().unwrap(), vec![(2, 4), (3, 4), (4, 4)]);
}

#[tokio::test]
async fn test_already_loaded_document_completes_immediately() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 3));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", false).await.unwrap();

    let log = ProgressLog::default();
    assert!(doc.load_pages_progressively(recording(&log, true)).await);
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(backend.geometry_load_count(), 3);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_callback_false_stops_sweep() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 10));
    let gate = fake_gate(&backend);
    let doc = open_with_units(&gate, "a.pdf", Duration::from_secs(10), Some(1)).await;

    let log = ProgressLog::default();
    assert!(!doc.load_pages_progressively(recording(&log, false)).await);

    assert_eq!(*log.lock().unwrap(), vec![(2, 10)]);
    let pages = doc.pages();
    assert!(pages[1].is_loaded());
    assert_eq!(pages[2].status(), PageLoadStatus::Unloaded);
    assert!(!doc.progressive().is_running());

    // a new sweep resumes where the last one stopped
    assert!(doc.load_pages_progressively(|_, _| true).await);
    assert!(doc.pages().iter().all(|p| p.is_loaded()));
    assert_eq!(backend.geometry_load_count(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_stops_sweep() {
    let backend = Arc::new(FakeBackend::with_delay(Duration::from_millis(5)));
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 40));
    let gate = fake_gate(&backend);
    let doc = open_with_units(&gate, "a.pdf", Duration::from_millis(5), None).await;

    let sweep = {
        let doc = doc.clone();
        tokio::spawn(async move { doc.load_pages_progressively(|_, _| true).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    doc.dispose().await;

    assert!(!sweep.await.unwrap());
    assert!(backend.geometry_load_count() < 40);
}

// ============================================================================
// Priority and attachment
// ============================================================================

#[tokio::test]
async fn test_priority_pages_load_first() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 20));
    let gate = fake_gate(&backend);
    let doc = open_with_units(&gate, "a.pdf", Duration::from_secs(10), Some(1)).await;
    let mut events = doc.subscribe();

    doc.set_priority_pages(15..=16);
    assert!(doc.load_pages_progressively(|_, _| true).await);

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.kind == PageTransition::BecameLoaded {
            order.push(event.page_number);
        }
    }
    assert_eq!(order.len(), 19);
    assert_eq!(&order[..3], &[15, 16, 2]);
}

#[tokio::test]
async fn test_second_call_attaches_to_running_sweep() {
    let backend = Arc::new(FakeBackend::with_delay(Duration::from_millis(1)));
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 10));
    let gate = fake_gate(&backend);
    let doc = open_with_units(&gate, "a.pdf", Duration::from_millis(3), None).await;

    let first = ProgressLog::default();
    let second = ProgressLog::default();
    let (a, b) = tokio::join!(
        doc.load_pages_progressively(recording(&first, true)),
        doc.load_pages_progressively(recording(&second, true)),
    );

    assert!(a && b);
    assert_eq!(*second.lock().unwrap(), vec![(10, 10)]);
    assert_eq!(first.lock().unwrap().last(), Some(&(10, 10)));
    assert_eq!(backend.geometry_load_count(), 10);
}

// ============================================================================
// Events and failures
// ============================================================================

#[tokio::test]
async fn test_events_carry_newest_handles() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::with_pages("A", vec![LETTER, A4, A4, LETTER]));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", true).await.unwrap();
    let mut events = doc.subscribe();

    assert!(doc.load_pages_progressively(|_, _| true).await);

    let pages = doc.pages();
    let mut seen = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.kind, PageTransition::BecameLoaded);
        assert!(event.page.is_loaded());
        assert!(event.page.ptr_eq(&pages[event.page_number as usize - 1]));
        seen += 1;
    }
    assert_eq!(seen, 3);
    assert_eq!(pages[1].height(), A4.height);
}

#[tokio::test]
async fn test_failing_pages_do_not_abort_sweep() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document(
        "a.pdf",
        FakeDocSpec::uniform("A", 5).with_failing(1).with_failing(3),
    );
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", true).await.unwrap();
    let mut events = doc.subscribe();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    assert!(
        doc.load_pages_progressively(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .await
    );
    assert!(calls.load(Ordering::SeqCst) >= 1);

    let statuses: Vec<PageLoadStatus> = doc.pages().iter().map(|p| p.status()).collect();
    assert_eq!(
        statuses,
        vec![
            PageLoadStatus::Loaded,
            PageLoadStatus::Failed,
            PageLoadStatus::Loaded,
            PageLoadStatus::Failed,
            PageLoadStatus::Loaded,
        ]
    );

    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.kind == PageTransition::LoadFailed {
            failed.push(event.page_number);
        }
    }
    assert_eq!(failed, vec![2, 4]);
}

#[tokio::test]
async fn test_external_page_of_disposed_document_settles_as_failed() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("A", 1));
    backend.add_document("b.pdf", FakeDocSpec::uniform("B", 2));
    let gate = fake_gate(&backend);
    let a = open_fake(&gate, "a.pdf", true).await.unwrap();
    let b = open_fake(&gate, "b.pdf", true).await.unwrap();

    a.page_list()
        .set_pages(vec![a.pages()[0].clone(), b.pages()[1].clone()])
        .unwrap();
    b.dispose().await;

    assert!(a.load_pages_progressively(|_, _| true).await);
    assert_eq!(a.pages()[1].status(), PageLoadStatus::Failed);
}
