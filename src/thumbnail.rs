//! Normalization of pixel data into 8-bit previews, resampling and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::{Array2, ArrayBase, Data, Ix2};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ThumbnailConfig;
use crate::error::ThumbnailError;

/// Half-width of the sigma-clipping window, in standard deviations.
const CLIP_SIGMA: f64 = 0.5;

/// Mapping of raw pixel values onto the 8-bit range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Normalization {
    /// Histogram equalization of the raw values.
    #[default]
    Equalize,
    /// Clip to the mean ± half a standard deviation, rescale, then equalize the 8-bit result.
    SigmaClip,
}

impl Normalization {
    /// Normalize `image`. Non-finite pixels render black.
    pub fn apply<S: Data<Elem = f32>>(self, image: &ArrayBase<S, Ix2>) -> Array2<u8> {
        match self {
            Normalization::Equalize => equalize_histogram(image),
            Normalization::SigmaClip => sigma_clip(image),
        }
    }
}

/// Histogram equalization: each finite pixel maps to its rank among all finite pixels.
///
/// Equal values map to the same level and the mapping is monotonic.
pub fn equalize_histogram<S: Data<Elem = f32>>(image: &ArrayBase<S, Ix2>) -> Array2<u8> {
    let mut sorted: Vec<f32> = image.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_unstable_by(f32::total_cmp);
    let last = sorted.len().saturating_sub(1).max(1) as f64;

    image.mapv(|v| {
        if !v.is_finite() {
            return 0;
        }
        let rank = sorted.partition_point(|x| *x < v);
        (rank as f64 / last * 255.).round().clamp(0., 255.) as u8
    })
}

/// Clip to mean ± 0.5σ of the finite pixels, rescale linearly onto 0..=255 and equalize.
pub fn sigma_clip<S: Data<Elem = f32>>(image: &ArrayBase<S, Ix2>) -> Array2<u8> {
    let (count, sum, sum_sq) = image
        .iter()
        .filter(|v| v.is_finite())
        .fold((0usize, 0f64, 0f64), |(n, s, sq), v| {
            let v = f64::from(*v);
            (n + 1, s + v, sq + v * v)
        });
    if count == 0 {
        return Array2::zeros(image.dim());
    }
    let mean = sum / count as f64;
    let std = (sum_sq / count as f64 - mean * mean).max(0.).sqrt();
    let (lo, hi) = (mean - CLIP_SIGMA * std, mean + CLIP_SIGMA * std);

    let scaled = image.mapv(|v| {
        if !v.is_finite() || hi <= lo {
            return 0;
        }
        ((f64::from(v) - lo) / (hi - lo) * 255.).round().clamp(0., 255.) as u8
    });
    equalize_levels(&scaled)
}

/// Equalize an 8-bit image with the lookup table of the classic imaging libraries.
fn equalize_levels(image: &Array2<u8>) -> Array2<u8> {
    let mut histogram = [0usize; 256];
    image.iter().for_each(|v| histogram[usize::from(*v)] += 1);

    let used: Vec<usize> = histogram.iter().copied().filter(|n| *n > 0).collect();
    let step = match used.as_slice() {
        [.., last] if used.len() > 1 => (used.iter().sum::<usize>() - last) / 255,
        _ => 0,
    };
    if step == 0 {
        return image.clone();
    }

    let mut lut = [0u8; 256];
    let mut n = step / 2;
    for (level, count) in histogram.iter().enumerate() {
        lut[level] = (n / step).min(255) as u8;
        n += count;
    }
    image.mapv(|v| lut[usize::from(v)])
}

/// Convert to an [`image`] buffer. `None` if a side does not fit into `u32`.
pub fn to_gray_image(image: &Array2<u8>) -> Option<GrayImage> {
    let (rows, cols) = image.dim();
    GrayImage::from_raw(
        u32::try_from(cols).ok()?,
        u32::try_from(rows).ok()?,
        image.iter().copied().collect(),
    )
}

fn from_gray_image(image: &GrayImage) -> Array2<u8> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(row, col)| {
        image.get_pixel(col as u32, row as u32).0[0]
    })
}

fn gray_image(image: &Array2<u8>) -> Result<GrayImage, ThumbnailError> {
    let (rows, cols) = image.dim();
    match to_gray_image(image) {
        Some(buffer) if rows > 0 && cols > 0 => Ok(buffer),
        _ => Err(ThumbnailError::Empty(rows, cols)),
    }
}

/// Resample to `rows × cols` with a triangle filter.
pub fn resize(image: &Array2<u8>, rows: usize, cols: usize) -> Result<Array2<u8>, ThumbnailError> {
    if image.dim() == (rows, cols) {
        return Ok(image.clone());
    }
    let (width, height) = match (u32::try_from(cols), u32::try_from(rows)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(ThumbnailError::Empty(rows, cols)),
    };
    let buffer = gray_image(image)?;
    Ok(from_gray_image(&imageops::resize(
        &buffer,
        width,
        height,
        FilterType::Triangle,
    )))
}

/// Encode as grayscale JPEG.
pub fn encode_jpeg(image: &Array2<u8>, quality: u8) -> Result<Vec<u8>, ThumbnailError> {
    let buffer = gray_image(image)?;
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100)).encode_image(&buffer)?;
    Ok(bytes)
}

/// Height of the small preview of a `rows × cols` image that is `width` pixels wide.
pub fn small_height(rows: usize, cols: usize, width: usize) -> usize {
    if cols == 0 {
        return 1;
    }
    (rows * width / cols).max(1)
}

/// Blob-store locations of the two previews of one image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailPair {
    /// Path of the small preview.
    pub small_image_path: String,
    /// Path of the full-resolution preview.
    pub large_image_path: String,
}

impl ThumbnailPair {
    /// Paths of the previews of an upload, `suffix` telling apart several pairs of one upload.
    pub fn new(config: &ThumbnailConfig, upload: Uuid, basename: &str, suffix: &str) -> Self {
        Self {
            small_image_path: format!("{}/{upload}/{basename}{suffix}_small.jpg", config.small_root),
            large_image_path: format!("{}/{upload}/{basename}{suffix}_large.jpg", config.large_root),
        }
    }
}

/// Encoded previews, not yet stored.
#[derive(Clone, Debug)]
pub struct EncodedThumbnails {
    /// Suffix appended to the upload basename in the stored file names.
    pub suffix: String,
    /// Index of the [`StandardizedWcs`](crate::StandardizedWcs) of the upload they belong to.
    pub wcs_index: usize,
    /// Small JPEG.
    pub small: Vec<u8>,
    /// Large JPEG.
    pub large: Vec<u8>,
}

/// Render the previews of one image: the normalized image at full resolution and a copy
/// scaled to the configured width.
pub fn render_single<S: Data<Elem = f32>>(
    image: &ArrayBase<S, Ix2>,
    config: &ThumbnailConfig,
    normalization: Normalization,
    wcs_index: usize,
    suffix: impl Into<String>,
) -> Result<EncodedThumbnails, ThumbnailError> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Err(ThumbnailError::Empty(rows, cols));
    }
    let large = normalization.apply(image);
    let width = config.small_width.max(1) as usize;
    let small = resize(&large, small_height(rows, cols, width), width)?;

    Ok(EncodedThumbnails {
        suffix: suffix.into(),
        wcs_index,
        small: encode_jpeg(&small, config.jpeg_quality)?,
        large: encode_jpeg(&large, config.jpeg_quality)?,
    })
}
