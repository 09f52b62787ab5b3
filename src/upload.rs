//! Upload handles as produced by the intake boundary.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FitsError;
use crate::fits::FitsFile;

/// File extensions accepted by the processors.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = [".fit", ".fits", ".fits.fz"];

/// Suffixes that wrap another extension and are kept together with it.
const COMPOUND_SUFFIXES: [&str; 4] = [".gz", ".bz2", ".xz", ".fz"];

/// Bookkeeping record of one upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Unique id, also used to keep the stored files of different uploads apart.
    pub id: Uuid,
    /// Time the upload was received.
    pub received: DateTime<Utc>,
    /// Address of the uploading client.
    pub ip: String,
}

impl Default for UploadInfo {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            received: Utc::now(),
            ip: "127.0.0.1".to_string(),
        }
    }
}

/// One uploaded file.
#[derive(Clone, Debug)]
pub struct Upload {
    /// File name as given by the client, without directories.
    pub filename: String,
    /// Extension including compound suffixes, e.g. `.fits.fz`. Empty if there is none.
    pub extension: String,
    /// File name without the extension.
    pub basename: String,
    /// Upload bookkeeping.
    pub info: UploadInfo,
    bytes: Arc<[u8]>,
}

impl Upload {
    /// Create an upload received now from the local host.
    pub fn new(filename: impl AsRef<str>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let filename = Path::new(filename.as_ref())
            .file_name()
            .map_or_else(|| filename.as_ref().to_string(), |n| n.to_string_lossy().into_owned());
        let extension = extension(&filename);
        let basename = filename[..filename.len() - extension.len()].to_string();
        Self {
            filename,
            extension,
            basename,
            info: UploadInfo::default(),
            bytes: bytes.into(),
        }
    }

    /// Set the client address.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.info.ip = ip.into();
        self
    }

    /// Replace the bookkeeping record.
    pub fn with_info(mut self, info: UploadInfo) -> Self {
        self.info = info;
        self
    }

    /// Raw content of the file.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the extension is in [`SUPPORTED_EXTENSIONS`], ignoring case.
    pub fn has_supported_extension(&self) -> bool {
        let extension = self.extension.to_lowercase();
        SUPPORTED_EXTENSIONS.contains(&extension.as_str())
    }

    /// Open the content as FITS.
    pub fn parse(&self) -> Result<FitsFile, FitsError> {
        FitsFile::parse(self.bytes())
    }
}

/// Extension of a file name, keeping compound suffixes such as `.fits.fz` together.
///
/// # Example:
/// ```
/// # use trailblazer::upload::extension;
/// assert_eq!(extension("frame.fits.fz"), ".fits.fz");
/// assert_eq!(extension("frame.v2.fits"), ".fits");
/// assert_eq!(extension("README"), "");
/// ```
pub fn extension(filename: &str) -> String {
    let suffix = |name: &str| name.rfind('.').filter(|i| *i > 0).map(|i| name[i..].to_string());

    let Some(last) = suffix(filename) else {
        return String::new();
    };
    if COMPOUND_SUFFIXES.contains(&last.to_lowercase().as_str()) {
        let stem = &filename[..filename.len() - last.len()];
        if let Some(inner) = suffix(stem) {
            return inner + &last;
        }
    }
    last
}

/// A parsed upload, the input of processor dispatch.
#[derive(Clone, Debug)]
pub struct ParsedUpload {
    /// The upload.
    pub upload: Upload,
    /// Its FITS structure.
    pub fits: FitsFile,
}
