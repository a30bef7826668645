use thiserror::Error;

/// Universal error type for document, page and cache operations.
///
/// Failures scoped to one unit of work (a page, a render, a byte range) are
/// returned to the caller of that unit only. Failures of the whole document
/// (open) are stored on the owning [`DocumentRef`](crate::core::DocumentRef)
/// and reach every listener.
#[derive(Debug, Clone, Error)]
pub enum PDFError {
    /// Bad file, unsupported format, or any other fatal open error
    #[error("Failed to open document: {0}")]
    OpenFailure(String),

    /// The document is encrypted and the supplied password was missing or wrong
    #[error("Password required")]
    PasswordRequired,

    /// Geometry of a single page could not be loaded
    #[error("Failed to load page {page}: {reason}")]
    PageLoadFailure { page: u32, reason: String },

    /// The backend failed to render a page
    #[error("Failed to render page {page}: {reason}")]
    RenderFailure { page: u32, reason: String },

    /// A block fetch from the remote source failed
    #[error("Network error: {0}")]
    NetworkFailure(String),

    /// Invalid page-list mutation or use of a disposed document
    #[error("Invalid document state: {0}")]
    DocumentStateError(String),

    /// Invalid byte range requested
    #[error("Invalid byte range: {begin}..{end}")]
    InvalidByteRange { begin: u64, end: u64 },

    /// Data not yet cached (caller must fetch the block first)
    #[error("Data not loaded for block {block}")]
    DataNotLoaded { block: u32 },

    /// Backing file of a range cache could not be read or written
    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    /// The native backend reported an error outside the categories above
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {0}")]
    Config(String),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

impl From<std::io::Error> for PDFError {
    fn from(err: std::io::Error) -> Self {
        PDFError::CacheIo(err.to_string())
    }
}

impl PDFError {
    /// Returns true for errors that a retry with a password may resolve.
    pub fn is_password_required(&self) -> bool {
        matches!(self, PDFError::PasswordRequired)
    }
}

/// Result type alias for PDF operations
pub type PDFResult<T> = Result<T, PDFError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PDFError = io.into();
        assert!(matches!(err, PDFError::CacheIo(ref msg) if msg.contains("gone")));
    }

    #[test]
    fn test_display() {
        let err = PDFError::InvalidByteRange { begin: 10, end: 4 };
        assert_eq!(err.to_string(), "Invalid byte range: 10..4");
        assert!(PDFError::PasswordRequired.is_password_required());
        assert!(!PDFError::Generic("x".into()).is_password_required());
    }
}
