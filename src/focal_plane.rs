//! Focal-plane mosaics of multi-detector cameras.
//!
//! A [`FocalPlaneLayout`] places every science detector of a camera on a shared canvas.
//! [`compose_focal_plane()`] decodes, normalizes and resamples the detectors of an upload and
//! blits them into two canvases, one per downscaling factor.

use log::debug;
use ndarray::{Array2, s};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::ThumbnailError;
use crate::fits::{FitsFile, Hdu, HduKind};
use crate::thumbnail::{Normalization, resize};

/// Region of a canvas covered by one detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    /// First row.
    pub top: usize,
    /// First column.
    pub left: usize,
    /// Number of rows.
    pub height: usize,
    /// Number of columns.
    pub width: usize,
    /// Whether the detector image is transposed before it is placed.
    pub transpose: bool,
}

impl Placement {
    /// One past the last row.
    pub fn bottom(&self) -> usize {
        self.top + self.height
    }

    /// One past the last column.
    pub fn right(&self) -> usize {
        self.left + self.width
    }

    /// Whether the two regions share a pixel.
    pub fn overlaps(&self, other: &Placement) -> bool {
        self.top < other.bottom()
            && other.top < self.bottom()
            && self.left < other.right()
            && other.left < self.right()
    }
}

/// Arrangement of the science detectors of a camera.
pub trait FocalPlaneLayout: Send + Sync {
    /// Camera name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Label of the detector stored in `hdu`, `None` for units that are not science detectors.
    fn detector_label(&self, hdu: &Hdu) -> Option<String>;

    /// Canvas shape `(rows, columns)` at the given downscaling factor.
    fn canvas_shape(&self, scaling: usize) -> (usize, usize);

    /// Region of the detector `label` at the given downscaling factor, `None` for unknown labels.
    fn placement(&self, label: &str, scaling: usize) -> Option<Placement>;

    /// Labels of every detector of the layout.
    fn labels(&self) -> Vec<String>;

    /// Downscaling factors of the large and small mosaics.
    fn scalings(&self) -> [usize; 2];

    /// Normalization applied to each detector.
    fn normalization(&self) -> Normalization {
        Normalization::Equalize
    }
}

/// The two renditions of a focal plane.
#[derive(Clone, Debug)]
pub struct FocalPlaneImages {
    /// Mosaic at the first downscaling factor.
    pub large: Array2<u8>,
    /// Mosaic at the second downscaling factor.
    pub small: Array2<u8>,
    /// Number of detectors placed.
    pub detectors: usize,
}

/// Side of a DECam CCD along its long axis, in pixels.
const DECAM_LONG: usize = 4096;
/// Side of a DECam CCD along its short axis, in pixels.
const DECAM_SHORT: usize = 2048;
/// Gap between two DECam CCDs, in pixels.
const DECAM_GAP: usize = 208;
/// Number of detector slots in a DECam row.
const DECAM_SLOTS: usize = 7;

/// One row of the DECam science array: label prefix, first number, detector count,
/// first slot and whether the row is shifted by half a detector.
struct DecamRow(&'static str, usize, usize, usize, bool);

const DECAM_ROWS: [DecamRow; 12] = [
    DecamRow("S", 29, 3, 2, false),
    DecamRow("S", 25, 4, 1, true),
    DecamRow("S", 20, 5, 1, false),
    DecamRow("S", 14, 6, 0, true),
    DecamRow("S", 8, 6, 0, true),
    DecamRow("S", 1, 7, 0, false),
    DecamRow("N", 1, 7, 0, false),
    DecamRow("N", 8, 6, 0, true),
    DecamRow("N", 14, 6, 0, true),
    DecamRow("N", 20, 5, 1, false),
    DecamRow("N", 25, 4, 1, true),
    DecamRow("N", 29, 3, 2, false),
];

/// The 62 science CCDs of the Dark Energy Camera, identified by `DETPOS`.
///
/// Detectors are stored with their long axis along the rows and are laid out transposed,
/// in twelve rows with alternate rows shifted by half a detector.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecamLayout;

impl DecamLayout {
    fn slot(label: &str) -> Option<(usize, &'static DecamRow)> {
        let prefix = label.get(..1)?;
        let number: usize = label.get(1..)?.parse().ok()?;
        DECAM_ROWS.iter().enumerate().find(|(_, row)| {
            row.0 == prefix && (row.1..row.1 + row.2).contains(&number)
        })
    }
}

impl FocalPlaneLayout for DecamLayout {
    fn name(&self) -> &'static str {
        "DECam"
    }

    fn detector_label(&self, hdu: &Hdu) -> Option<String> {
        let label = hdu.header.get_str("DETPOS")?.trim();
        (!label.is_empty() && !label.contains('G') && !label.contains('F'))
            .then(|| label.to_string())
    }

    fn canvas_shape(&self, scaling: usize) -> (usize, usize) {
        let scaling = scaling.max(1);
        let (long, short, gap) = (DECAM_LONG / scaling, DECAM_SHORT / scaling, DECAM_GAP / scaling);
        (DECAM_ROWS.len() * (short + gap), DECAM_SLOTS * (long + gap))
    }

    fn placement(&self, label: &str, scaling: usize) -> Option<Placement> {
        let (row_index, row) = Self::slot(label)?;
        let scaling = scaling.max(1);
        let (long, short, gap) = (DECAM_LONG / scaling, DECAM_SHORT / scaling, DECAM_GAP / scaling);

        let number: usize = label[1..].parse().ok()?;
        let slot = row.3 + number - row.1;
        let offset = if row.4 { long / 2 } else { 0 };
        Some(Placement {
            top: row_index * (short + gap),
            left: offset + slot * (long + gap),
            height: short,
            width: long,
            transpose: true,
        })
    }

    fn labels(&self) -> Vec<String> {
        DECAM_ROWS
            .iter()
            .flat_map(|row| (row.1..row.1 + row.2).map(move |n| format!("{}{n}", row.0)))
            .collect()
    }

    fn scalings(&self) -> [usize; 2] {
        [4, 10]
    }

    fn normalization(&self) -> Normalization {
        Normalization::SigmaClip
    }
}

/// Canvas of the LBT Large Binocular Camera at full resolution, `(rows, columns)`.
const LBT_CANVAS: (usize, usize) = (6922, 6932);

/// Full-resolution regions of the four LBC chips.
const LBT_CHIPS: [(&str, Placement); 4] = [
    ("chip1", Placement { top: 2314, left: 4628, height: 4608, width: 2304, transpose: false }),
    ("chip2", Placement { top: 2314, left: 2314, height: 4608, width: 2304, transpose: false }),
    ("chip3", Placement { top: 2314, left: 0, height: 4608, width: 2304, transpose: false }),
    ("chip4", Placement { top: 0, left: 1162, height: 2304, width: 4608, transpose: true }),
];

/// The four CCDs of the LBT Large Binocular Camera, identified by the digit in `EXTNAME`.
///
/// Three chips sit side by side with a 10 pixel gap, the fourth lies rotated above them.
#[derive(Clone, Copy, Debug, Default)]
pub struct LbtLayout;

impl FocalPlaneLayout for LbtLayout {
    fn name(&self) -> &'static str {
        "LBC"
    }

    fn detector_label(&self, hdu: &Hdu) -> Option<String> {
        if hdu.kind != HduKind::Image {
            return None;
        }
        let name = hdu.extension_name()?;
        let chip = ['1', '2', '3']
            .into_iter()
            .find(|digit| name.contains(*digit))
            .unwrap_or('4');
        Some(format!("chip{chip}"))
    }

    fn canvas_shape(&self, scaling: usize) -> (usize, usize) {
        let scaling = scaling.max(1);
        (LBT_CANVAS.0 / scaling, LBT_CANVAS.1 / scaling)
    }

    fn placement(&self, label: &str, scaling: usize) -> Option<Placement> {
        let scaling = scaling.max(1);
        let (_, chip) = LBT_CHIPS.iter().find(|(name, _)| *name == label)?;
        let (top, left) = (chip.top / scaling, chip.left / scaling);
        Some(Placement {
            top,
            left,
            height: chip.bottom() / scaling - top,
            width: chip.right() / scaling - left,
            transpose: chip.transpose,
        })
    }

    fn labels(&self) -> Vec<String> {
        LBT_CHIPS.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn scalings(&self) -> [usize; 2] {
        [2, 4]
    }
}

/// A detector of the upload with its regions on both canvases.
struct Detector<'a> {
    hdu: &'a Hdu,
    label: String,
    regions: [Placement; 2],
}

/// Render the focal plane of `fits` at the two downscaling factors `scalings`.
///
/// Units that are not science detectors or whose label is unknown to the layout are skipped.
/// Detectors are decoded and resampled independently, in parallel with the `parallel` feature.
/// A decode error of any detector aborts the composition.
pub fn compose_focal_plane(
    layout: &dyn FocalPlaneLayout,
    fits: &FitsFile,
    hdus: &[&Hdu],
    scalings: [usize; 2],
) -> Result<FocalPlaneImages, ThumbnailError> {
    let detectors: Vec<Detector<'_>> = hdus
        .iter()
        .filter_map(|hdu| {
            let label = layout.detector_label(hdu)?;
            let regions = [
                layout.placement(&label, scalings[0])?,
                layout.placement(&label, scalings[1])?,
            ];
            Some(Detector { hdu, label, regions })
        })
        .collect();
    if detectors.is_empty() {
        return Err(ThumbnailError::NoDetectors(layout.name()));
    }
    debug!(
        "Composing the {} focal plane from {} detectors at scalings {scalings:?}.",
        layout.name(),
        detectors.len()
    );

    let render = |detector: &Detector<'_>| -> Result<[Array2<u8>; 2], ThumbnailError> {
        let normalized = layout.normalization().apply(&fits.image(detector.hdu)?);
        let oriented = if detector.regions[0].transpose {
            normalized.t().to_owned()
        } else {
            normalized
        };
        let [large, small] = detector.regions;
        Ok([
            resize(&oriented, large.height, large.width)?,
            resize(&oriented, small.height, small.width)?,
        ])
    };

    #[cfg(feature = "parallel")]
    let tiles: Vec<[Array2<u8>; 2]> = detectors.par_iter().map(render).collect::<Result<_, _>>()?;
    #[cfg(not(feature = "parallel"))]
    let tiles: Vec<[Array2<u8>; 2]> = detectors.iter().map(render).collect::<Result<_, _>>()?;

    let mut canvases = scalings.map(|scaling| Array2::<u8>::zeros(layout.canvas_shape(scaling)));
    for (detector, tiles) in detectors.iter().zip(tiles) {
        for ((canvas, region), tile) in canvases.iter_mut().zip(detector.regions).zip(tiles) {
            debug!("Placing {} at {region:?}.", detector.label);
            canvas
                .slice_mut(s![region.top..region.bottom(), region.left..region.right()])
                .assign(&tile);
        }
    }

    let [large, small] = canvases;
    Ok(FocalPlaneImages {
        large,
        small,
        detectors: detectors.len(),
    })
}
