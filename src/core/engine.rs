//! The engine: one backend gate, one configuration and the process-wide
//! caches, shared by every document it opens.

use super::backend::{BackendGate, BackendSource, RandomAccess, RenderBackend};
use super::block_cache::{ByteRangeCache, MemoryByteRangeCache};
use super::chunked_source::{BlockFetcher, BlockingSourceReader, ChunkedSource, ChunkedSourceOptions};
use super::config::EngineConfig;
use super::document::{Document, OpenOptions, PasswordProvider};
use super::document_ref::{DocumentLoader, DocumentRef, DocumentRefRegistry, LoadProgress};
use super::error::PDFResult;
use super::file_block_cache::FileByteRangeCache;
use super::page::PageHandle;
use super::render_cache::{RenderCache, ThumbnailCache};
use futures::FutureExt;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Where a document comes from.
#[derive(Clone)]
pub enum DocumentSource {
    File(PathBuf),
    /// Name resolved against the configured asset root
    Asset(String),
    Memory { name: String, bytes: Arc<[u8]> },
    /// Remote document fetched in blocks through the range cache
    Uri {
        uri: String,
        fetcher: Arc<dyn BlockFetcher>,
    },
    /// Caller-provided random access reader
    Custom {
        name: String,
        reader: Arc<dyn RandomAccess>,
    },
}

impl DocumentSource {
    /// Identity of the source; document references are keyed by it.
    pub fn name(&self) -> String {
        match self {
            DocumentSource::File(path) => path.display().to_string(),
            DocumentSource::Asset(name) => format!("asset:{}", name),
            DocumentSource::Memory { name, .. } => format!("memory:{}", name),
            DocumentSource::Uri { uri, .. } => uri.clone(),
            DocumentSource::Custom { name, .. } => format!("custom:{}", name),
        }
    }
}

impl fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentSource({})", self.name())
    }
}

/// Entry point of the loading engine.
///
/// The backend is injected explicitly; every document opened through one
/// engine shares its backend gate, render cache and thumbnail cache.
pub struct PdfEngine {
    gate: BackendGate,
    config: EngineConfig,
    render_cache: Arc<RenderCache>,
    thumbnails: Arc<ThumbnailCache>,
    refs: DocumentRefRegistry,
    password_provider: Option<PasswordProvider>,
}

impl PdfEngine {
    pub fn new(backend: Arc<dyn RenderBackend>, config: EngineConfig) -> Self {
        Self {
            gate: BackendGate::new(backend),
            render_cache: Arc::new(RenderCache::new(config.render_cache_bytes)),
            thumbnails: Arc::new(ThumbnailCache::new(
                config.thumbnail_cache_bytes,
                config.thumbnail_scale,
            )),
            refs: DocumentRefRegistry::new(),
            password_provider: None,
            config,
        }
    }

    /// Sets the provider asked for passwords of protected documents.
    pub fn with_password_provider(mut self, provider: PasswordProvider) -> Self {
        self.password_provider = Some(provider);
        self
    }

    pub fn gate(&self) -> &BackendGate {
        &self.gate
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn render_cache(&self) -> &Arc<RenderCache> {
        &self.render_cache
    }

    pub fn thumbnails(&self) -> &Arc<ThumbnailCache> {
        &self.thumbnails
    }

    pub fn refs(&self) -> &DocumentRefRegistry {
        &self.refs
    }

    /// The shared reference of `source`, created on first access.
    pub fn document_ref(&self, source: DocumentSource) -> DocumentRef {
        let name = source.name();
        self.refs.get_or_create(&name, || {
            DocumentRef::new(name.clone(), self.loader_for(source), true)
        })
    }

    /// Loads `source` through its shared reference.
    pub async fn open(&self, source: DocumentSource) -> PDFResult<Document> {
        self.document_ref(source).load(false).await
    }

    fn open_options(&self) -> OpenOptions {
        OpenOptions {
            password_provider: self.password_provider.clone(),
            try_empty_password_first: self.config.try_empty_password_first,
            use_progressive_loading: self.config.use_progressive_loading,
            load_unit_duration: self.config.load_unit_duration,
            max_pages_per_unit: self.config.max_pages_per_unit,
        }
    }

    fn loader_for(&self, source: DocumentSource) -> DocumentLoader {
        let gate = self.gate.clone();
        let config = self.config.clone();
        let options = self.open_options();
        let render_cache = self.render_cache.clone();
        let thumbnails = self.thumbnails.clone();
        Arc::new(move |progress: LoadProgress| {
            let gate = gate.clone();
            let config = config.clone();
            let options = options.clone();
            let source = source.clone();
            let render_cache = render_cache.clone();
            let thumbnails = thumbnails.clone();
            async move {
                let name = source.name();
                let backend_source = resolve_source(source, &config, progress).await?;
                let document = Document::open(gate, backend_source, name, options).await?;
                let (renders, thumbs) = (render_cache.clone(), thumbnails.clone());
                document.on_pages_replaced(move |pages: &[PageHandle]| {
                    renders.renumber(pages);
                    thumbs.renumber(pages);
                });
                document.on_dispose(move |id| {
                    render_cache.remove_document(id);
                    thumbnails.remove_document(id);
                });
                Ok(document)
            }
            .boxed()
        })
    }
}

/// Turns a document source into something the backend can read.
async fn resolve_source(
    source: DocumentSource,
    config: &EngineConfig,
    progress: LoadProgress,
) -> PDFResult<BackendSource> {
    Ok(match source {
        DocumentSource::File(path) => BackendSource::File(path),
        DocumentSource::Asset(name) => BackendSource::File(config.asset_root.join(name)),
        DocumentSource::Memory { bytes, .. } => BackendSource::Memory(bytes),
        DocumentSource::Custom { reader, .. } => BackendSource::Reader(reader),
        DocumentSource::Uri { uri, fetcher } => {
            let cache: Arc<dyn ByteRangeCache> = if config.persist_range_cache {
                Arc::new(FileByteRangeCache::for_uri(
                    &config.range_cache_dir,
                    &uri,
                    config.block_size,
                    config.hot_block_capacity,
                )?)
            } else {
                Arc::new(MemoryByteRangeCache::new(config.block_size))
            };
            let options = ChunkedSourceOptions {
                fetch_block_count: config.fetch_block_count,
                progress: Some(progress.callback()),
            };
            let source = Arc::new(ChunkedSource::open(cache, fetcher, options).await?);
            debug!(uri = %uri, size = source.file_size(), "remote source ready");
            BackendSource::Reader(Arc::new(BlockingSourceReader::new(source, Handle::current())))
        }
    })
}
