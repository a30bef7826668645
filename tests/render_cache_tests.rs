//! Render and thumbnail cache tests against real page handles


use pdf_x_loader::core::*;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;

const MB: usize = 1024 * 1024;

/// Pages stacked vertically, 800 units apart.
fn column_layout(pages: usize) -> Vec<LayoutRect> {
    (0..pages)
        .map(|i| LayoutRect::from_size(0.0, i as f32 * 800.0, LETTER.width, LETTER.height))
        .collect()
}

fn key(page: &PageHandle, scale: f32) -> RenderKey {
    RenderKey::new(page.key(), scale)
}

// ============================================================================
// Eviction by viewport distance
// ============================================================================

#[tokio::test]
async fn test_scrolled_away_page_is_evicted_first() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("long.pdf", FakeDocSpec::uniform("P", 60));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "long.pdf", false).await.unwrap();
    let pages = doc.pages();
    let layout = column_layout(60);

    // 1224 x 1584 at scale 2.0 (~7.4 MB); the small renders are ~118 KB each
    let cache = RenderCache::new(10 * MB);
    cache.set_viewport(ViewportState::around(5, 4..=6, 2, layout.clone()));
    let big = cache.render_page(&pages[4], 2.0).await.unwrap().unwrap();
    assert_eq!((big.width, big.height), (1224, 1584));

    cache.set_viewport(ViewportState::around(40, 39..=41, 2, layout));
    for page in &pages[10..60] {
        cache.render_page(page, 0.25).await.unwrap().unwrap();
    }

    assert!(!cache.contains(&key(&pages[4], 2.0)));
    assert!(cache.contains(&key(&pages[40], 0.25)));
    assert!(cache.contains(&key(&pages[10], 0.25)));
    assert_eq!(cache.len(), 50);

    let stats = cache.stats();
    assert_eq!(stats.evictions, 1);
    assert!(stats.bytes <= stats.budget);
}

#[tokio::test]
async fn test_far_pages_evicted_before_near_ones() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("P", 30));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", false).await.unwrap();
    let pages = doc.pages();

    let params = scaled_params(&pages[0], 0.5);
    let entry_bytes = params.width as usize * params.height as usize * 4;
    let cache = RenderCache::new(entry_bytes * 10);
    cache.set_viewport(ViewportState::around(15, 15..=15, 0, column_layout(30)));

    // render from both ends towards the active page
    for i in [0usize, 29, 1, 28, 2, 27, 3, 26, 4, 25, 13, 14, 15] {
        cache.render_page(&pages[i], 0.5).await.unwrap().unwrap();
    }

    assert_eq!(cache.len(), 10);
    // page 30 goes first; pages 1 and 29 tie on distance and the older goes
    for far in [29usize, 0, 28] {
        assert!(!cache.contains(&key(&pages[far], 0.5)), "page {} kept", far + 1);
    }
    for near in [1usize, 13, 14, 15, 4, 25] {
        assert!(cache.contains(&key(&pages[near], 0.5)), "page {} evicted", near + 1);
    }
}

#[tokio::test]
async fn test_rotated_and_rescaled_pages_are_separate_entries() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("P", 1));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", true).await.unwrap();
    let page = doc.pages()[0].clone();
    let turned = page.rotated(PageRotation::Deg90);
    let cache = RenderCache::new(64 * MB);

    cache.render_page(&page, 1.0).await.unwrap();
    cache.render_page(&page, 1.0).await.unwrap();
    cache.render_page(&page, 2.0).await.unwrap();
    let sideways = cache.render_page(&turned, 1.0).await.unwrap().unwrap();

    assert_eq!((sideways.width, sideways.height), (792, 612));
    assert_eq!(cache.len(), 3);
    assert_eq!(backend.render_count(), 3);
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 3);
}

#[tokio::test]
async fn test_reordered_pages_keep_visible_bitmap() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("P", 20));
    let engine = fake_engine(&backend);
    let doc = engine.open(DocumentSource::File("a.pdf".into())).await.unwrap();
    assert!(doc.load_pages_progressively(|_, _| true).await);
    let pages = doc.pages();
    let cache = engine.render_cache();

    cache.render_page(&pages[9], 0.25).await.unwrap().unwrap();
    cache.render_page(&pages[0], 0.25).await.unwrap().unwrap();

    // page 10 moves to the front, page 1 becomes page 2
    let mut reordered = pages.clone();
    let moved = reordered.remove(9);
    reordered.insert(0, moved.clone());
    doc.page_list().set_pages(reordered).unwrap();

    cache.set_viewport(ViewportState::around(1, 1..=1, 0, column_layout(20)));
    let params = scaled_params(&pages[0], 0.25);
    cache.set_budget(params.width as usize * params.height as usize * 4);

    assert!(cache.contains(&key(&moved, 0.25)));
    assert!(!cache.contains(&key(&pages[0], 0.25)));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leaving_window_cancels_render() {
    let backend = Arc::new(FakeBackend::with_delay(Duration::from_millis(40)));
    backend.add_document("a.pdf", FakeDocSpec::uniform("P", 50));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", true).await.unwrap();
    let page = doc.pages()[2].clone();
    let layout = column_layout(50);

    let cache = Arc::new(RenderCache::new(64 * MB));
    cache.set_viewport(ViewportState::around(3, 2..=4, 1, layout.clone()));

    let render = {
        let cache = cache.clone();
        let page = page.clone();
        tokio::spawn(async move { cache.render_page(&page, 1.0).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.set_viewport(ViewportState::around(40, 39..=41, 1, layout));

    assert!(render.await.unwrap().unwrap().is_none());
    assert!(cache.is_empty());
    assert!(!cache.contains(&key(&page, 1.0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_renders_of_one_page_hit_backend_once() {
    let backend = Arc::new(FakeBackend::with_delay(Duration::from_millis(40)));
    backend.add_document("a.pdf", FakeDocSpec::uniform("P", 50));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", false).await.unwrap();
    let page = doc.pages()[2].clone();
    let layout = column_layout(50);
    let renders_before = backend.render_count();

    let cache = Arc::new(RenderCache::new(64 * MB));
    cache.set_viewport(ViewportState::around(3, 2..=4, 1, layout.clone()));

    let spawn_render = || {
        let cache = cache.clone();
        let page = page.clone();
        tokio::spawn(async move { cache.render_page(&page, 1.0).await })
    };
    let first = spawn_render();
    let second = spawn_render();
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.set_viewport(ViewportState::around(40, 39..=41, 1, layout));

    assert!(first.await.unwrap().unwrap().is_none());
    assert!(second.await.unwrap().unwrap().is_none());
    assert_eq!(backend.render_count() - renders_before, 1);
    assert!(!cache.contains(&key(&page, 1.0)));
}

// ============================================================================
// Thumbnails
// ============================================================================

#[tokio::test]
async fn test_thumbnails_render_once_at_fixed_scale() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_document("a.pdf", FakeDocSpec::uniform("P", 3));
    let gate = fake_gate(&backend);
    let doc = open_fake(&gate, "a.pdf", false).await.unwrap();
    let thumbnails = ThumbnailCache::new(4 * MB, 0.2);

    for page in doc.pages() {
        let thumb = thumbnails.thumbnail(&page).await.unwrap().unwrap();
        assert_eq!((thumb.width, thumb.height), (122, 158));
    }
    for page in doc.pages() {
        assert!(thumbnails.get(&page).is_some());
    }

    assert_eq!(backend.render_count(), 3);
    assert_eq!(thumbnails.stats().entries, 3);
    assert_eq!(thumbnails.remove_document(doc.id()), 3);
    assert_eq!(thumbnails.stats().entries, 0);
}
