//! Error types of every pipeline stage.
//!
//! Each stage has its own enum; [`ProcessError`] wraps them and is what a failed upload reports.

use thiserror::Error;

/// Failure to read a FITS byte stream.
#[derive(Debug, Error)]
pub enum FitsError {
    /// The stream does not start with a `SIMPLE = T` primary header.
    #[error("not a FITS file: {0}")]
    NotFits(String),
    /// The stream ends inside a header or data unit.
    #[error("truncated FITS file: HDU {hdu} needs {needed} bytes, {available} available")]
    Truncated {
        /// Index of the incomplete HDU.
        hdu: usize,
        /// Bytes required from the start of the HDU.
        needed: usize,
        /// Bytes remaining in the stream.
        available: usize,
    },
    /// A mandatory structural keyword is missing or malformed.
    #[error("HDU {hdu}: missing or invalid keyword {keyword}")]
    Keyword {
        /// Index of the HDU.
        hdu: usize,
        /// Keyword name.
        keyword: String,
    },
    /// `BITPIX` is not one of the values defined by the standard.
    #[error("unsupported BITPIX {0}")]
    UnsupportedBitpix(i64),
    /// The HDU does not contain a two-dimensional image.
    #[error("HDU {0} is not a two-dimensional image")]
    NotAnImage(usize),
    /// The declared data size does not fit in memory.
    #[error("HDU {hdu}: declared data size overflows")]
    Oversized {
        /// Index of the HDU.
        hdu: usize,
    },
    /// cfitsio could not read a header card.
    #[error("HDU {hdu}: cfitsio status {status} reading header card {card}")]
    Card {
        /// Index of the HDU.
        hdu: usize,
        /// One-based card number.
        card: i32,
        /// cfitsio status code.
        status: i32,
    },
    /// Error reported by cfitsio.
    #[error("cfitsio: {0}")]
    Cfitsio(String),
    /// The stream could not be spilled to a temporary file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<fitsio::errors::Error> for FitsError {
    fn from(e: fitsio::errors::Error) -> Self {
        FitsError::Cfitsio(e.to_string())
    }
}

/// Failure of a handler registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two handlers were registered under the same name.
    #[error("a handler named {0} is already registered")]
    DuplicateHandler(String),
    /// No registered handler claims the input.
    #[error("no handler found; known handlers: {}", known.join(", "))]
    NoHandlerFound {
        /// Names of all registered handlers.
        known: Vec<String>,
    },
}

/// Failure to standardize header metadata.
#[derive(Debug, Error)]
pub enum StandardizeError {
    /// A required field could not be derived from the header.
    #[error("missing required field {0}")]
    MissingRequiredField(String),
    /// The exposure time cannot be applied to the exposure bounds.
    #[error("exposure time of {0} s is out of range")]
    ExposureOutOfRange(f64),
    /// The header declares a time reference frame other than UTC.
    #[error("unsupported time system {0}")]
    UnsupportedTimeSystem(String),
    /// No registered standardizer recognizes the header.
    #[error(transparent)]
    NoStandardizer(#[from] RegistryError),
}

/// Failure to interpret the astrometric solution embedded in a header.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WcsParseError {
    /// A keyword needed for the solution is absent or not numeric.
    #[error("missing WCS keyword {0}")]
    MissingKeyword(String),
    /// The projection code is not supported.
    #[error("unsupported projection {0}")]
    UnsupportedProjection(String),
    /// The linear transformation cannot be inverted.
    #[error("singular pixel-to-world matrix")]
    Singular,
    /// The solution maps the requested pixel to a non-finite coordinate.
    #[error("non-finite world coordinate")]
    NonFinite,
}

/// Failure to produce a standardized WCS, after the solver fallback.
#[derive(Debug, Error)]
pub enum WcsError {
    /// The plate solver did not finish in the allotted window.
    #[error("plate solver timed out after {0:?}")]
    SolveTimeout(std::time::Duration),
    /// The solver found no solution or is not configured.
    #[error("WCS could not be determined: {0}")]
    Unsolvable(String),
    /// Pixel data needed for solving could not be decoded.
    #[error(transparent)]
    Decode(#[from] FitsError),
}

/// Outcome of a plate-solver call other than a solution.
#[derive(Debug, Error)]
pub enum SolveError {
    /// The deadline passed before the solver finished.
    #[error("deadline exceeded")]
    Timeout,
    /// The solver completed and found no solution.
    #[error("no solution found")]
    NoSolution,
    /// No credential is configured for the solver.
    #[error("there is no astrometry.net key")]
    NoCredentials,
    /// The service could not be reached or answered unexpectedly.
    #[error("plate solver service error: {0}")]
    Service(String),
}

/// Failure to render a preview image.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    /// An extension could not be decoded.
    #[error(transparent)]
    Decode(#[from] FitsError),
    /// Encoding or resampling failed.
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    /// The image has a zero-sized axis.
    #[error("cannot render an empty {0}x{1} image")]
    Empty(usize, usize),
    /// No detector of the upload could be placed on the focal plane.
    #[error("no detector of the upload matches the {0} focal plane")]
    NoDetectors(&'static str),
}

/// Failure of the record store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store rejected the transaction.
    #[error("transaction failed: {0}")]
    Transaction(String),
    /// A foreign key does not reference a row of this transaction or of the store.
    #[error("unknown {table} id {id}")]
    UnknownReference {
        /// Referenced table.
        table: &'static str,
        /// Referenced id.
        id: u64,
    },
}

/// Failure of the blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The path is absolute or escapes the store root.
    #[error("invalid blob path {0}")]
    InvalidPath(String),
    /// No blob exists at the path.
    #[error("no blob at {0}")]
    NotFound(String),
    /// Underlying filesystem error.
    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to load the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config {path}: {source}")]
    Read {
        /// File that was read.
        path: std::path::PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The configuration file is not valid YAML for [`Config`](crate::Config).
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    /// The handler registries could not be built.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A blob-store root is absolute, empty or leaves the store.
    #[error("{key} must be a relative path below the blob store, got {path:?}")]
    InvalidRoot {
        /// Configuration key.
        key: &'static str,
        /// Configured value.
        path: String,
    },
}

/// Reason an upload failed.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The byte stream could not be decoded.
    #[error("corrupt file: {0}")]
    CorruptFile(#[source] FitsError),
    /// No processor claims the upload.
    #[error(transparent)]
    NoHandlerFound(RegistryError),
    /// The chosen processor found no image to process.
    #[error("{0} found no image extension to process")]
    NoImages(&'static str),
    /// Header metadata could not be standardized.
    #[error(transparent)]
    Metadata(#[from] StandardizeError),
    /// WCS could not be standardized.
    #[error(transparent)]
    Wcs(#[from] WcsError),
    /// Preview images could not be rendered.
    #[error(transparent)]
    Thumbnail(#[from] ThumbnailError),
    /// The records could not be committed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// A stage panicked while handling the upload.
    #[error("internal error: {0}")]
    Internal(String),
}
