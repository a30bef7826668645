pub mod backend;
pub mod block_cache;
pub mod cancel;
pub mod chunked_source;
pub mod config;
pub mod document;
pub mod document_ref;
pub mod engine;
pub mod error;
pub mod file_block_cache;
pub mod geometry;
pub mod page;
pub mod page_list;
pub mod progressive;
pub mod render_cache;
pub mod validators;

#[cfg(feature = "http")]
pub mod http_fetcher;

pub use backend::{
    BackendGate, BackendSource, DocumentHandle, EncodePage, LinkTarget, PageGeometry, PageLink,
    PageRotation, PageText, PixelBuffer, RandomAccess, RenderBackend, RenderFlags, RenderParams,
    TextFragment,
};
pub use block_cache::{BlockBitmap, ByteRangeCache, MAX_BLOCKS, MemoryByteRangeCache};
pub use cancel::{CancellationRegistry, CancellationToken};
pub use chunked_source::{
    BlockFetcher, BlockingSourceReader, ChunkedSource, ChunkedSourceOptions, ProgressCallback,
    RangeRequest, RangeResponse, ResponseHeaders,
};
pub use config::EngineConfig;
pub use document::{
    Document, DocumentId, OpenOptions, PageStatusChange, PageTransition, PasswordProvider,
    WeakDocument,
};
pub use document_ref::{
    DocumentLoader, DocumentRef, DocumentRefRegistry, LoadProgress, RefEvent, RefStatus,
};
pub use engine::{DocumentSource, PdfEngine};
pub use error::{PDFError, PDFResult};
pub use file_block_cache::{CacheFileSummary, FileByteRangeCache};
pub use geometry::{LayoutRect, Offset, PageFrame, PdfPoint, PdfRect};
pub use page::{PageHandle, PageKey, PageLoadStatus, PageSource};
pub use page_list::DocumentPageList;
pub use progressive::ProgressiveLoadController;
pub use render_cache::{
    CacheStats, RenderCache, RenderKey, ThumbnailCache, ViewportState, scaled_params,
};
pub use validators::{CacheControl, CacheValidators};

#[cfg(feature = "http")]
pub use http_fetcher::HttpBlockFetcher;
