//! # PDF-X Loader: progressive page loading and caching for PDF viewers
//!
//! PDF-X Loader manages documents whose pages are loaded lazily and
//! asynchronously from a native rendering backend, while a viewer renders,
//! scrolls and caches bitmaps of those pages at the same time.
//!
//! ## Features
//!
//! - **Progressive Loading**: open with the first page loaded, load the rest in
//!   time-boxed background units with a priority hint for "jump to page N"
//! - **Page Lists**: reorder, duplicate, rotate and combine pages across
//!   documents, then assemble and encode a self-contained result
//! - **Range Cache**: remote documents are fetched in blocks and persisted on
//!   disk with HTTP validators for revalidation
//! - **Render Cache**: byte-budgeted bitmap cache that evicts the pages
//!   farthest from the viewport first, plus a thumbnail cache
//! - **Document References**: shared, listener-counted documents that load
//!   once and close when the last listener leaves
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pdf_x_loader::core::{DocumentSource, EngineConfig, PdfEngine};
//!
//! let engine = PdfEngine::new(backend, EngineConfig::from_env()?);
//! let doc_ref = engine.document_ref(DocumentSource::File("document.pdf".into()));
//! let _events = doc_ref.acquire();
//!
//! let doc = doc_ref.load(false).await?;
//! let first = doc.page_list().get(0)?;
//! assert!(first.is_loaded());
//!
//! // Load the remaining pages in the background
//! doc.load_pages_progressively(|loaded, total| {
//!     println!("{}/{} pages", loaded, total);
//!     true
//! })
//! .await;
//!
//! let bitmap = engine.render_cache().render_page(&first, 2.0).await?;
//! doc_ref.release().await;
//! # Ok::<(), pdf_x_loader::PDFError>(())
//! ```
//!
//! ## Native Backend
//!
//! The crate does not rasterize PDFs itself. A [`core::RenderBackend`]
//! implementation is injected into the engine, and every call into it is
//! serialized through a single [`core::BackendGate`], as native PDF
//! libraries are generally not thread-safe.
//!
//! ## CLI Tool
//!
//! ```bash
//! # Show what a persisted range cache file holds
//! cargo run --bin pdf-cache-inspect -- inspect ~/.cache/pdf-x/ranges/<hash>.pxcache
//! ```

pub mod core;

// Re-export main types for convenience
pub use core::{
    ByteRangeCache, CancellationToken, Document, DocumentPageList, DocumentRef, DocumentSource,
    EngineConfig, PDFError, PDFResult, PageHandle, PageLoadStatus, PageRotation, PdfEngine,
    ProgressiveLoadController, RenderBackend, RenderCache, ThumbnailCache,
};
