use crate::config::ThumbnailConfig;
use crate::error::ThumbnailError;
use crate::fits::{FitsFile, Hdu};
use crate::focal_plane::{DecamLayout, FocalPlaneLayout};
use crate::registry::Handler;
use crate::thumbnail::EncodedThumbnails;
use crate::upload::ParsedUpload;

use super::{UploadProcessor, is_fits_upload, is_image_like, render_mosaic};

/// Focal-plane products of the DECam Community Pipelines.
///
/// Recognized by 61 or 62 science CCDs, guide and focus chips aside.
/// The previews are one mosaic of the whole focal plane.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecamProcessor;

impl DecamProcessor {
    fn science_count(fits: &FitsFile) -> usize {
        fits.hdus()
            .iter()
            .filter(|hdu| DecamLayout.detector_label(hdu).is_some())
            .count()
    }
}

impl Handler<ParsedUpload> for DecamProcessor {
    fn name(&self) -> &'static str {
        "DECamCommunityFits"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn can_handle(&self, input: &ParsedUpload) -> bool {
        is_fits_upload(input)
            && input.fits.len() > 1
            && (61..=62).contains(&Self::science_count(&input.fits))
    }
}

impl UploadProcessor for DecamProcessor {
    fn science_extensions<'f>(&self, fits: &'f FitsFile) -> Vec<&'f Hdu> {
        fits.hdus()
            .iter()
            .filter(|hdu| is_image_like(hdu) && DecamLayout.detector_label(hdu).is_some())
            .collect()
    }

    fn compose_thumbnails(
        &self,
        fits: &FitsFile,
        extensions: &[&Hdu],
        config: &ThumbnailConfig,
    ) -> Result<Vec<EncodedThumbnails>, ThumbnailError> {
        render_mosaic(&DecamLayout, fits, extensions, config)
    }
}
