//! Native rendering backend contract and the gate that serializes it.
//!
//! The backend is an opaque, NOT thread-safe renderer. Every call into it goes
//! through a single [`BackendGate`] shared by all documents of an engine, so at
//! most one native call is outstanding at any time. Calls run on tokio's
//! blocking pool; callers await their turn on the gate instead of polling.

use super::cancel::CancellationToken;
use super::error::{PDFError, PDFResult};
use super::geometry::PdfRect;
use smallvec::SmallVec;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Opaque handle of a document opened by the backend.
///
/// Two handles are the same document if and only if they compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(pub u64);

/// Page rotation in quarter turns, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageRotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl PageRotation {
    /// Builds a rotation from quarter turns; any integer is accepted.
    pub fn from_quarter_turns(turns: i32) -> Self {
        match turns.rem_euclid(4) {
            0 => PageRotation::Deg0,
            1 => PageRotation::Deg90,
            2 => PageRotation::Deg180,
            _ => PageRotation::Deg270,
        }
    }

    /// Builds a rotation from degrees. Returns `None` unless `degrees` is a
    /// multiple of 90.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        Some(Self::from_quarter_turns(degrees / 90))
    }

    pub fn quarter_turns(self) -> i32 {
        match self {
            PageRotation::Deg0 => 0,
            PageRotation::Deg90 => 1,
            PageRotation::Deg180 => 2,
            PageRotation::Deg270 => 3,
        }
    }

    pub fn degrees(self) -> u16 {
        self.quarter_turns() as u16 * 90
    }

    /// Returns true for 90 and 270 degrees, which swap width and height.
    pub fn is_odd(self) -> bool {
        self.quarter_turns() % 2 == 1
    }

    pub fn add(self, other: PageRotation) -> Self {
        Self::from_quarter_turns(self.quarter_turns() + other.quarter_turns())
    }

    /// Rotation that turns `base` into `self`.
    pub fn relative_to(self, base: PageRotation) -> Self {
        Self::from_quarter_turns(self.quarter_turns() - base.quarter_turns())
    }
}

/// Geometry of one page as reported by the backend (points at 72dpi,
/// post-rotation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width: f32,
    pub height: f32,
    pub rotation: PageRotation,
}

impl PageGeometry {
    pub fn new(width: f32, height: f32, rotation: PageRotation) -> Self {
        Self {
            width,
            height,
            rotation,
        }
    }

    /// Applies an additional rotation, swapping the sides for odd turns.
    pub fn rotated_by(&self, delta: PageRotation) -> Self {
        let (width, height) = if delta.is_odd() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        };
        Self {
            width,
            height,
            rotation: self.rotation.add(delta),
        }
    }
}

/// Synchronous random access reader the backend pulls document bytes from.
///
/// This mirrors a native "read block" callback: the backend blocks in
/// `read_at` until the bytes are available.
pub trait RandomAccess: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Fills `buf` with the bytes starting at `position`.
    fn read_at(&self, position: u64, buf: &mut [u8]) -> PDFResult<()>;
}

/// Where the backend reads a document from.
#[derive(Clone)]
pub enum BackendSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
    Reader(Arc<dyn RandomAccess>),
}

impl fmt::Debug for BackendSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSource::File(path) => f.debug_tuple("File").field(path).finish(),
            BackendSource::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            BackendSource::Reader(reader) => write!(f, "Reader({} bytes)", reader.size()),
        }
    }
}

/// Rendering options passed through to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFlags {
    /// Render annotations and form fields
    pub annotations: bool,
    pub grayscale: bool,
    /// Sub-pixel text rendering
    pub lcd_text: bool,
}

impl Default for RenderFlags {
    fn default() -> Self {
        Self {
            annotations: true,
            grayscale: false,
            lcd_text: false,
        }
    }
}

/// One render request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParams {
    /// Target raster width in pixels
    pub width: u32,
    /// Target raster height in pixels
    pub height: u32,
    /// Background fill, ARGB
    pub background: u32,
    pub flags: RenderFlags,
    /// Rotation applied on top of the page's own rotation
    pub rotation: PageRotation,
}

impl RenderParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: 0xFFFF_FFFF,
            flags: RenderFlags::default(),
            rotation: PageRotation::Deg0,
        }
    }
}

/// Decoded RGBA bitmap produced by the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PixelBuffer {
    /// Allocates a bitmap filled with one ARGB color.
    pub fn filled(width: u32, height: u32, argb: u32) -> Self {
        let [a, r, g, b] = argb.to_be_bytes();
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 4);
        for _ in 0..count {
            pixels.extend_from_slice(&[r, g, b, a]);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Size accounted against cache budgets: width * height * 4.
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PixelBuffer({}x{})", self.width, self.height)
    }
}

/// A run of characters of the page text and its bounds in page space.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    /// Offset of the first character in [`PageText::text`]
    pub start: usize,
    pub len: usize,
    pub bounds: PdfRect,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageText {
    pub text: String,
    pub fragments: Vec<TextFragment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkTarget {
    Uri(String),
    /// 1-based page number inside the same document
    Page(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageLink {
    /// Most links cover a single rectangle
    pub bounds: SmallVec<[PdfRect; 1]>,
    pub target: LinkTarget,
}

/// One output page of an encode: a native page index and its rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePage {
    pub index: u32,
    pub rotation: PageRotation,
}

/// Contract of the native rendering backend.
///
/// Implementations are called from blocking threads, one call at a time.
pub trait RenderBackend: Send + Sync + 'static {
    /// Opens a document.
    ///
    /// # Errors
    /// [`PDFError::PasswordRequired`] if the password is missing or wrong,
    /// [`PDFError::OpenFailure`] for any other fatal error.
    fn open_document(
        &self,
        source: &BackendSource,
        password: Option<&str>,
    ) -> PDFResult<DocumentHandle>;

    fn page_count(&self, doc: DocumentHandle) -> PDFResult<u32>;

    /// Loads the geometry of the page at 0-based `index`.
    fn load_page_geometry(&self, doc: DocumentHandle, index: u32) -> PDFResult<PageGeometry>;

    /// Renders a page. Returns `Ok(None)` when `cancel` was observed.
    fn render(
        &self,
        doc: DocumentHandle,
        index: u32,
        params: &RenderParams,
        cancel: &CancellationToken,
    ) -> PDFResult<Option<PixelBuffer>>;

    /// Returns `None` if the page is not loaded on the native side.
    fn extract_text(&self, doc: DocumentHandle, index: u32) -> PDFResult<Option<PageText>>;

    /// Returns an empty list if the page is not loaded on the native side.
    fn extract_links(&self, doc: DocumentHandle, index: u32) -> PDFResult<Vec<PageLink>>;

    /// Deep-copies page `index` of `source` into `dest` and returns its index
    /// in `dest`.
    fn import_page(
        &self,
        dest: DocumentHandle,
        source: DocumentHandle,
        index: u32,
    ) -> PDFResult<u32>;

    /// Serializes `doc` with the given page arrangement.
    fn encode(&self, doc: DocumentHandle, pages: &[EncodePage]) -> PDFResult<Vec<u8>>;

    fn close_document(&self, doc: DocumentHandle);
}

/// Single-slot mutual exclusion gate in front of a [`RenderBackend`].
///
/// Cloning a gate shares the slot.
#[derive(Clone)]
pub struct BackendGate {
    backend: Arc<dyn RenderBackend>,
    slot: Arc<Mutex<()>>,
}

impl BackendGate {
    pub fn new(backend: Arc<dyn RenderBackend>) -> Self {
        Self {
            backend,
            slot: Arc::new(Mutex::new(())),
        }
    }

    /// Runs `op` against the backend once the slot is free.
    ///
    /// The slot is held by the blocking task itself, so it is released as
    /// soon as the native call returns even if the awaiting caller was
    /// dropped in the meantime.
    pub async fn run<T, F>(&self, op: F) -> PDFResult<T>
    where
        F: FnOnce(&dyn RenderBackend) -> PDFResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.slot.clone().lock_owned().await;
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            op(backend.as_ref())
        })
        .await
        .map_err(|e| PDFError::Backend(format!("backend task failed: {}", e)))?
    }

    pub fn backend(&self) -> &Arc<dyn RenderBackend> {
        &self.backend
    }

    /// Returns true if both gates share the same slot.
    pub fn same_gate(&self, other: &BackendGate) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_arithmetic() {
        assert_eq!(PageRotation::from_degrees(-90), Some(PageRotation::Deg270));
        assert_eq!(PageRotation::from_degrees(450), Some(PageRotation::Deg90));
        assert_eq!(PageRotation::from_degrees(45), None);
        assert_eq!(
            PageRotation::Deg270.add(PageRotation::Deg180),
            PageRotation::Deg90
        );
        assert_eq!(
            PageRotation::Deg90.relative_to(PageRotation::Deg270),
            PageRotation::Deg180
        );
        assert!(PageRotation::Deg270.is_odd());
        assert_eq!(PageRotation::Deg180.degrees(), 180);
    }

    #[test]
    fn test_geometry_rotated_by() {
        let geometry = PageGeometry::new(612.0, 792.0, PageRotation::Deg0);
        let rotated = geometry.rotated_by(PageRotation::Deg90);
        assert_eq!(rotated.width, 792.0);
        assert_eq!(rotated.height, 612.0);
        assert_eq!(rotated.rotation, PageRotation::Deg90);

        let flipped = geometry.rotated_by(PageRotation::Deg180);
        assert_eq!((flipped.width, flipped.height), (612.0, 792.0));
    }

    #[test]
    fn test_pixel_buffer_fill() {
        let buffer = PixelBuffer::filled(2, 3, 0xFF10_2030);
        assert_eq!(buffer.byte_size(), 24);
        assert_eq!(&buffer.pixels[0..4], &[0x10, 0x20, 0x30, 0xFF]);
    }
}
