//! Upload processors, one per supported file layout.
//!
//! A processor decides which header/data units of a parsed upload are science images,
//! which header describes the observation and how the previews are rendered.
//! The [`Pipeline`](crate::Pipeline) drives the stages, see [`default_registry()`] for the
//! shipped processors.

mod decam;
mod lbt;
mod multi;
mod rubin;
mod single;

pub use decam::DecamProcessor;
pub use lbt::LbtProcessor;
pub use multi::MultiExtensionProcessor;
pub use rubin::RubinCalexpProcessor;
pub use single::SingleExtensionProcessor;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::ThumbnailConfig;
use crate::error::{RegistryError, ThumbnailError};
use crate::fits::{FitsFile, Hdu, Header};
use crate::focal_plane::{FocalPlaneLayout, compose_focal_plane};
use crate::registry::{Handler, Registry};
use crate::thumbnail::{EncodedThumbnails, Normalization, encode_jpeg, render_single};
use crate::upload::ParsedUpload;

/// Largest accepted image side, in pixels. Larger units are usually tables stored as images.
pub const MAX_IMAGE_AXIS: usize = 6000;

/// Suffix of the previews of a focal-plane mosaic.
pub const MOSAIC_SUFFIX: &str = "_plane";

/// Handles one layout of uploaded files.
pub trait UploadProcessor: Handler<ParsedUpload> {
    /// Units whose WCS is standardized, in the order of the resulting records.
    fn science_extensions<'f>(&self, fits: &'f FitsFile) -> Vec<&'f Hdu>;

    /// Header handed to the metadata standardizers.
    ///
    /// The primary header, completed with the keywords of the first science extension.
    fn metadata_header(&self, fits: &FitsFile) -> Header {
        let primary = &fits.primary().header;
        match self.science_extensions(fits).first() {
            Some(hdu) if hdu.index != 0 => primary.with_fallback(&hdu.header),
            _ => primary.clone(),
        }
    }

    /// Render the previews of the science extensions.
    fn compose_thumbnails(
        &self,
        fits: &FitsFile,
        extensions: &[&Hdu],
        config: &ThumbnailConfig,
    ) -> Result<Vec<EncodedThumbnails>, ThumbnailError>;
}

/// Registry of upload processors.
pub type ProcessorRegistry = Registry<ParsedUpload, dyn UploadProcessor>;

/// Registry holding every processor shipped with the crate.
pub fn default_registry() -> Result<ProcessorRegistry, RegistryError> {
    ProcessorRegistry::new()
        .with(Box::new(SingleExtensionProcessor))?
        .with(Box::new(MultiExtensionProcessor))?
        .with(Box::new(DecamProcessor))?
        .with(Box::new(RubinCalexpProcessor))?
        .with(Box::new(LbtProcessor))
}

/// Whether a unit holds a 2-D image with data and no side above [`MAX_IMAGE_AXIS`].
pub fn is_image_like(hdu: &Hdu) -> bool {
    hdu.is_image()
        && hdu
            .shape()
            .is_some_and(|(rows, cols)| rows <= MAX_IMAGE_AXIS && cols <= MAX_IMAGE_AXIS)
}

/// Upload-level checks shared by every processor.
fn is_fits_upload(input: &ParsedUpload) -> bool {
    input.upload.has_supported_extension() && !input.fits.is_empty()
}

/// Header of `hdu`, falling back to the primary header for missing keywords.
pub fn extension_header(fits: &FitsFile, hdu: &Hdu) -> Header {
    if hdu.index == 0 {
        hdu.header.clone()
    } else {
        hdu.header.with_fallback(&fits.primary().header)
    }
}

/// One preview pair per extension, suffixed by `suffix(position)`.
fn render_each(
    fits: &FitsFile,
    extensions: &[&Hdu],
    config: &ThumbnailConfig,
    suffix: impl Fn(usize) -> String + Sync,
) -> Result<Vec<EncodedThumbnails>, ThumbnailError> {
    let render = |(position, hdu): (usize, &&Hdu)| -> Result<EncodedThumbnails, ThumbnailError> {
        let image = fits.image(hdu)?;
        render_single(&image, config, Normalization::Equalize, position, suffix(position))
    };

    #[cfg(feature = "parallel")]
    return extensions.par_iter().enumerate().map(render).collect();
    #[cfg(not(feature = "parallel"))]
    return extensions.iter().enumerate().map(render).collect();
}

/// One preview pair for the whole focal plane, linked to the first WCS.
fn render_mosaic(
    layout: &dyn FocalPlaneLayout,
    fits: &FitsFile,
    extensions: &[&Hdu],
    config: &ThumbnailConfig,
) -> Result<Vec<EncodedThumbnails>, ThumbnailError> {
    let scalings = config.mosaic_scaling.unwrap_or_else(|| layout.scalings());
    let images = compose_focal_plane(layout, fits, extensions, scalings)?;
    Ok(vec![EncodedThumbnails {
        suffix: MOSAIC_SUFFIX.to_string(),
        wcs_index: 0,
        small: encode_jpeg(&images.small, config.jpeg_quality)?,
        large: encode_jpeg(&images.large, config.jpeg_quality)?,
    }])
}
