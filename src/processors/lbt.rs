use crate::config::ThumbnailConfig;
use crate::error::ThumbnailError;
use crate::fits::{FitsFile, Hdu, HduKind};
use crate::focal_plane::LbtLayout;
use crate::registry::Handler;
use crate::standardizers::LBT_ORIGIN;
use crate::thumbnail::EncodedThumbnails;
use crate::upload::ParsedUpload;

use super::{UploadProcessor, is_fits_upload, is_image_like, render_mosaic};

/// Multi-chip exposure of the LBT Large Binocular Camera.
///
/// The `IMAGE` extensions are the four chips, previewed as one mosaic.
#[derive(Clone, Copy, Debug, Default)]
pub struct LbtProcessor;

impl Handler<ParsedUpload> for LbtProcessor {
    fn name(&self) -> &'static str {
        "LbtFits"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn can_handle(&self, input: &ParsedUpload) -> bool {
        is_fits_upload(input)
            && input.fits.len() > 1
            && input
                .fits
                .primary()
                .header
                .get_str("ORIGIN")
                .is_some_and(|origin| origin.trim() == LBT_ORIGIN)
    }
}

impl UploadProcessor for LbtProcessor {
    fn science_extensions<'f>(&self, fits: &'f FitsFile) -> Vec<&'f Hdu> {
        fits.hdus()
            .iter()
            .filter(|hdu| hdu.kind == HduKind::Image && is_image_like(hdu))
            .collect()
    }

    fn compose_thumbnails(
        &self,
        fits: &FitsFile,
        extensions: &[&Hdu],
        config: &ThumbnailConfig,
    ) -> Result<Vec<EncodedThumbnails>, ThumbnailError> {
        render_mosaic(&LbtLayout, fits, extensions, config)
    }
}
