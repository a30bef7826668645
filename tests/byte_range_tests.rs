//! Byte-range cache tests: on-demand block population, fetch coalescing,
//! failure handling and revalidation of persisted caches.


use pdf_x_loader::core::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use test_utils::*;

async fn open_source(
    cache: Arc<dyn ByteRangeCache>,
    fetcher: &Arc<FakeFetcher>,
) -> PDFResult<ChunkedSource> {
    ChunkedSource::open(
        cache,
        fetcher.clone() as Arc<dyn BlockFetcher>,
        ChunkedSourceOptions::default(),
    )
    .await
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn test_block_zero_establishes_identity() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(5000)));
    let cache = Arc::new(MemoryByteRangeCache::new(1000));
    let source = open_source(cache.clone(), &fetcher).await.unwrap();

    assert_eq!(source.file_size(), 5000);
    assert!(cache.is_initialized());
    assert!(cache.is_block_cached(0));
    for block in 1..5 {
        assert!(!cache.is_block_cached(block), "block {} should not be cached", block);
    }
    assert_eq!(fetcher.request_count(), 1);

    // bytes [4000, 4500) live in block 4 only
    let mut buf = vec![0u8; 500];
    source.read(4000, &mut buf).await.unwrap();
    assert_eq!(fetcher.request_count(), 2);
    assert_eq!(buf, pattern(5000)[4000..4500]);
    assert!(cache.is_block_cached(4));
    assert!(!cache.is_block_cached(3));
}

#[tokio::test]
async fn test_server_without_range_support() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(3500)).without_ranges());
    let cache = Arc::new(MemoryByteRangeCache::new(1000));
    let source = open_source(cache.clone(), &fetcher).await.unwrap();

    assert_eq!(source.file_size(), 3500);
    assert_eq!(cache.cached_blocks(), 4);
    assert_eq!(cache.cached_bytes(), 3500);

    let mut buf = vec![0u8; 3500];
    source.read(0, &mut buf).await.unwrap();
    assert_eq!(buf, pattern(3500));
    assert_eq!(fetcher.request_count(), 1);
}

#[tokio::test]
async fn test_bootstrap_failure_propagates() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(100)));
    fetcher.set_failing(true);
    let cache = Arc::new(MemoryByteRangeCache::new(64));
    let result = open_source(cache.clone(), &fetcher).await;

    assert!(matches!(result, Err(PDFError::NetworkFailure(_))));
    assert!(!cache.is_initialized());
}

#[tokio::test]
async fn test_absurd_reported_size_is_a_network_failure() {
    let fetcher =
        Arc::new(FakeFetcher::new(pattern(10)).with_reported_size(4_611_686_018_427_387_904));
    let cache = Arc::new(MemoryByteRangeCache::new(1000));
    let result = open_source(cache.clone(), &fetcher).await;

    assert!(matches!(result, Err(PDFError::NetworkFailure(_))));
    assert!(!cache.is_initialized());
    assert_eq!(cache.file_size(), 0);
}

// ============================================================================
// On-demand population
// ============================================================================

#[tokio::test]
async fn test_sequential_read_caches_everything() {
    for (size, block_size) in [(5000usize, 1000u32), (4097, 1024), (10, 64), (1, 1)] {
        let data = pattern(size);
        let fetcher = Arc::new(FakeFetcher::new(data.clone()));
        let cache = Arc::new(MemoryByteRangeCache::new(block_size));
        let source = open_source(cache.clone(), &fetcher).await.unwrap();

        let mut read_back = Vec::with_capacity(size);
        let step = 300.min(size);
        let mut position = 0;
        while position < size {
            let len = step.min(size - position);
            let mut buf = vec![0u8; len];
            source.read(position as u64, &mut buf).await.unwrap();
            read_back.extend_from_slice(&buf);
            position += len;
        }

        assert_eq!(cache.cached_bytes(), size as u64, "size {} block {}", size, block_size);
        assert_eq!(read_back, data);
    }
}

#[tokio::test]
async fn test_fetch_runs_cover_several_blocks() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(8000)));
    let cache = Arc::new(MemoryByteRangeCache::new(1000));
    let options = ChunkedSourceOptions {
        fetch_block_count: 3,
        progress: None,
    };
    let source = ChunkedSource::open(cache.clone(), fetcher.clone(), options)
        .await
        .unwrap();

    source.ensure_block(2).await.unwrap();
    assert!(cache.is_block_cached(2));
    assert!(cache.is_block_cached(3));
    assert!(cache.is_block_cached(4));
    assert!(!cache.is_block_cached(5));

    let last = fetcher.requests().pop().unwrap();
    assert_eq!((last.start, last.end), (2000, 4999));
}

#[tokio::test]
async fn test_blocks_inside_a_running_fetch_are_not_refetched() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(10_000)).with_delay(Duration::from_millis(20)));
    let cache = Arc::new(MemoryByteRangeCache::new(1000));
    let options = ChunkedSourceOptions {
        fetch_block_count: 4,
        progress: None,
    };
    let source = ChunkedSource::open(cache.clone(), fetcher.clone(), options)
        .await
        .unwrap();

    let (a, b) = tokio::join!(source.ensure_block(1), source.ensure_block(3));
    a.unwrap();
    b.unwrap();

    let ranges: Vec<(u64, u64)> = fetcher.requests().iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(ranges, vec![(0, 999), (1000, 4999)]);
    assert!((1..=4).all(|block| cache.is_block_cached(block)));
    assert!(!cache.is_block_cached(5));

    // a later run stops at blocks another fetch already holds
    let (c, d) = tokio::join!(source.ensure_block(8), source.ensure_block(6));
    c.unwrap();
    d.unwrap();
    let ranges: Vec<(u64, u64)> = fetcher.requests().iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(&ranges[2..], &[(8000, 9999), (6000, 7999)]);
}

#[tokio::test]
async fn test_out_of_range_read_is_rejected() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(100)));
    let source = open_source(Arc::new(MemoryByteRangeCache::new(64)), &fetcher)
        .await
        .unwrap();
    let mut buf = vec![0u8; 10];
    assert!(matches!(
        source.read(95, &mut buf).await,
        Err(PDFError::InvalidByteRange { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_coalesce_fetches() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(4000)).with_delay(Duration::from_millis(20)));
    let cache = Arc::new(MemoryByteRangeCache::new(1000));
    let source = Arc::new(open_source(cache, &fetcher).await.unwrap());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let source = source.clone();
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 100];
            source.read(2100, &mut buf).await.map(|_| buf)
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), pattern(4000)[2100..2200]);
    }

    // block 0 plus one fetch of block 2
    assert_eq!(fetcher.request_count(), 2);
}

#[tokio::test]
async fn test_failed_fetch_does_not_mark_block() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(3000)));
    let cache = Arc::new(MemoryByteRangeCache::new(1000));
    let source = open_source(cache.clone(), &fetcher).await.unwrap();

    fetcher.set_failing(true);
    let mut buf = vec![0u8; 10];
    let result = source.read(1500, &mut buf).await;
    assert!(matches!(result, Err(PDFError::NetworkFailure(_))));
    assert!(!cache.is_block_cached(1));

    // the next read retries
    fetcher.set_failing(false);
    source.read(1500, &mut buf).await.unwrap();
    assert!(cache.is_block_cached(1));
    assert_eq!(buf, pattern(3000)[1500..1510]);
}

#[tokio::test]
async fn test_progress_reports_download() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(3000)));
    let reported = Arc::new(AtomicU64::new(0));
    let options = ChunkedSourceOptions {
        fetch_block_count: 1,
        progress: Some({
            let reported = reported.clone();
            Arc::new(move |downloaded: u64, total: Option<u64>| {
                assert_eq!(total, Some(3000));
                reported.store(downloaded, Ordering::SeqCst);
            })
        }),
    };
    let source = ChunkedSource::open(
        Arc::new(MemoryByteRangeCache::new(1000)),
        fetcher.clone(),
        options,
    )
    .await
    .unwrap();
    assert_eq!(reported.load(Ordering::SeqCst), 1000);

    source.ensure_range(0, 3000).await.unwrap();
    assert_eq!(reported.load(Ordering::SeqCst), 3000);
}

// ============================================================================
// Persisted caches
// ============================================================================

#[tokio::test]
async fn test_persisted_cache_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let uri = "https://example.com/reused.pdf";
    let fetcher = Arc::new(FakeFetcher::new(pattern(2500)));

    {
        let cache = Arc::new(FileByteRangeCache::for_uri(dir.path(), uri, 1000, 4).unwrap());
        let source = open_source(cache, &fetcher).await.unwrap();
        source.ensure_range(0, 2500).await.unwrap();
    }
    assert_eq!(fetcher.request_count(), 3);

    let cache = Arc::new(FileByteRangeCache::for_uri(dir.path(), uri, 1000, 4).unwrap());
    let source = open_source(cache, &fetcher).await.unwrap();
    let mut buf = vec![0u8; 2500];
    source.read(0, &mut buf).await.unwrap();
    assert_eq!(buf, pattern(2500));
    // fresh cache without expiry: nothing fetched again
    assert_eq!(fetcher.request_count(), 3);
}

#[tokio::test]
async fn test_stale_cache_revalidated_with_304() {
    let dir = tempfile::tempdir().unwrap();
    let uri = "https://example.com/revalidate.pdf";
    let fetcher = Arc::new(
        FakeFetcher::new(pattern(2000))
            .with_etag("\"v1\"")
            .with_cache_control("no-cache"),
    );

    {
        let cache = Arc::new(FileByteRangeCache::for_uri(dir.path(), uri, 1000, 4).unwrap());
        let source = open_source(cache, &fetcher).await.unwrap();
        source.ensure_range(0, 2000).await.unwrap();
    }

    let cache = Arc::new(FileByteRangeCache::for_uri(dir.path(), uri, 1000, 4).unwrap());
    let source = open_source(cache.clone(), &fetcher).await.unwrap();
    let revalidation = fetcher.requests().pop().unwrap();
    assert_eq!(revalidation.if_none_match.as_deref(), Some("\"v1\""));
    assert!(cache.is_block_cached(1), "304 keeps the cached blocks");

    let before = fetcher.request_count();
    let mut buf = vec![0u8; 2000];
    source.read(0, &mut buf).await.unwrap();
    assert_eq!(fetcher.request_count(), before);
}

#[tokio::test]
async fn test_changed_resource_rebuilds_cache() {
    let dir = tempfile::tempdir().unwrap();
    let uri = "https://example.com/changed.pdf";
    let fetcher = Arc::new(
        FakeFetcher::new(pattern(2000))
            .with_etag("\"v1\"")
            .with_cache_control("no-cache"),
    );

    {
        let cache = Arc::new(FileByteRangeCache::for_uri(dir.path(), uri, 1000, 4).unwrap());
        let source = open_source(cache, &fetcher).await.unwrap();
        source.ensure_range(0, 2000).await.unwrap();
    }

    let updated: Vec<u8> = pattern(3000).into_iter().map(|b| b ^ 0xFF).collect();
    fetcher.replace(updated.clone(), "\"v2\"");

    let cache = Arc::new(FileByteRangeCache::for_uri(dir.path(), uri, 1000, 4).unwrap());
    let source = open_source(cache.clone(), &fetcher).await.unwrap();
    assert_eq!(source.file_size(), 3000);
    assert!(cache.is_block_cached(0));
    assert!(!cache.is_block_cached(1), "old blocks must be dropped");
    assert_eq!(cache.validators().etag.as_deref(), Some("\"v2\""));

    let mut buf = vec![0u8; 3000];
    source.read(0, &mut buf).await.unwrap();
    assert_eq!(buf, updated);
}

#[tokio::test]
async fn test_inspect_reports_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let uri = "https://example.com/inspect.pdf";
    let fetcher = Arc::new(FakeFetcher::new(pattern(3000)).with_etag("\"abc\""));
    let path = {
        let cache = Arc::new(FileByteRangeCache::for_uri(dir.path(), uri, 1000, 0).unwrap());
        let path = cache.path().to_path_buf();
        let source = open_source(cache, &fetcher).await.unwrap();
        source.ensure_block(2).await.unwrap();
        path
    };

    let summary = FileByteRangeCache::inspect(&path).unwrap();
    assert_eq!(summary.block_size, 1000);
    assert_eq!(summary.file_size, 3000);
    assert!(summary.has_identity);
    assert_eq!(summary.bitmap.missing(), vec![1]);
    assert_eq!(summary.cached_bytes(), 2000);
    assert_eq!(summary.validators.etag.as_deref(), Some("\"abc\""));
}

// ============================================================================
// Blocking reader
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_reader_fetches_on_demand() {
    let fetcher = Arc::new(FakeFetcher::new(pattern(4000)));
    let source = Arc::new(
        open_source(Arc::new(MemoryByteRangeCache::new(1000)), &fetcher)
            .await
            .unwrap(),
    );
    let reader = BlockingSourceReader::new(source, tokio::runtime::Handle::current());

    let buf = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; 200];
        reader.read_at(2900, &mut buf).map(|_| buf)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(buf, pattern(4000)[2900..3100]);
    // block 0, then blocks 2 and 3
    assert_eq!(fetcher.request_count(), 3);
}
