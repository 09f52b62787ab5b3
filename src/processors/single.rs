use crate::config::ThumbnailConfig;
use crate::error::ThumbnailError;
use crate::fits::{FitsFile, Hdu};
use crate::registry::Handler;
use crate::thumbnail::EncodedThumbnails;
use crate::upload::ParsedUpload;

use super::{UploadProcessor, is_fits_upload, render_each};

/// FITS file holding one image in its primary unit.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleExtensionProcessor;

impl Handler<ParsedUpload> for SingleExtensionProcessor {
    fn name(&self) -> &'static str {
        "SingleExtensionFits"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, input: &ParsedUpload) -> bool {
        is_fits_upload(input) && input.fits.len() == 1 && input.fits.primary().is_image()
    }
}

impl UploadProcessor for SingleExtensionProcessor {
    fn science_extensions<'f>(&self, fits: &'f FitsFile) -> Vec<&'f Hdu> {
        vec![fits.primary()]
    }

    fn compose_thumbnails(
        &self,
        fits: &FitsFile,
        extensions: &[&Hdu],
        config: &ThumbnailConfig,
    ) -> Result<Vec<EncodedThumbnails>, ThumbnailError> {
        render_each(fits, extensions, config, |_| String::new())
    }
}
