use crate::config::ThumbnailConfig;
use crate::error::ThumbnailError;
use crate::fits::{FitsFile, Hdu};
use crate::registry::Handler;
use crate::thumbnail::EncodedThumbnails;
use crate::upload::ParsedUpload;

use super::{UploadProcessor, is_fits_upload, is_image_like, render_each};

/// Primary keywords left behind by the Rubin science pipelines.
const SIGNATURE: [&str; 4] = ["ZTENSION", "ZPCOUNT", "ZGCOUNT", "CCDNUM"];

/// Calibrated exposure of the Vera C. Rubin science pipelines.
///
/// Only unit 1 holds the image, the others are mask and variance planes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RubinCalexpProcessor;

impl Handler<ParsedUpload> for RubinCalexpProcessor {
    fn name(&self) -> &'static str {
        "RubinCalexpFits"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn can_handle(&self, input: &ParsedUpload) -> bool {
        let primary = &input.fits.primary().header;
        is_fits_upload(input)
            && input.fits.hdu(1).is_some_and(is_image_like)
            && SIGNATURE.iter().all(|key| primary.contains(key))
    }
}

impl UploadProcessor for RubinCalexpProcessor {
    fn science_extensions<'f>(&self, fits: &'f FitsFile) -> Vec<&'f Hdu> {
        fits.hdu(1).into_iter().collect()
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
