use crate::config::ThumbnailConfig;
use crate::error::ThumbnailError;
use crate::fits::{FitsFile, Hdu};
use crate::registry::Handler;
use crate::thumbnail::EncodedThumbnails;
use crate::upload::ParsedUpload;

use super::{UploadProcessor, is_fits_upload, is_image_like, render_each};

/// Generic FITS file with several units. Every image-like unit is processed.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultiExtensionProcessor;

impl Handler<ParsedUpload> for MultiExtensionProcessor {
    fn name(&self) -> &'static str {
        "MultiExtensionFits"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, input: &ParsedUpload) -> bool {
        is_fits_upload(input)
            && input.fits.len() > 1
            && input.fits.hdus().iter().any(is_image_like)
    }
}

impl UploadProcessor for MultiExtensionProcessor {
    fn science_extensions<'f>(&self, fits: &'f FitsFile) -> Vec<&'f Hdu> {
        fits.hdus().iter().filter(|hdu| is_image_like(hdu)).collect()
    }

    fn compose_thumbnails(
        &self,
        fits: &FitsFile,
        extensions: &[&Hdu],
        config: &ThumbnailConfig,
    ) -> Result<Vec<EncodedThumbnails>, ThumbnailError> {
        render_each(fits, extensions, config, |i| format!("_ext{i}"))
    }
}
