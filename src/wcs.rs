//! Simple implementation of the World Coordinate System standard and the standardized WCS record.
//!
//! Pixel coordinates are 0-based, `CRPIX` is 1-based as in FITS headers. World coordinates are
//! in degrees.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nalgebra::{Matrix2, Vector2, Vector3, convert};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::Float;
use crate::coordinates::{chord_distance, to_unit_sphere};
use crate::error::{FitsError, SolveError, WcsError, WcsParseError};
use crate::fits::Header;
use crate::metadata::is_close;
use crate::solver::{PlateSolver, SolveRequest};

/// Default time granted to the plate solver.
pub const DEFAULT_SOLVE_TIMEOUT: Duration = Duration::from_secs(200);

/// Projection codes handled as gnomonic. Distortion terms of `SIP` and `TPV` are ignored.
const GNOMONIC_CODES: [&str; 2] = ["TAN", "TPV"];

/// Spherical projection of the intermediate world coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    /// World coordinates are a linear function of the pixel coordinates.
    #[default]
    Linear,
    /// Gnomonic (`TAN`) projection.
    Gnomonic,
}

/// Relevant data for WCS transformations from FITS headers.
#[derive(Clone, Debug, PartialEq)]
pub struct Wcs<F: Float> {
    /// Reference pixel.
    pub crpix: Vector2<F>,
    /// Coordinate value at `crpix`.
    pub crval: Vector2<F>,
    /// Linear transformation matrix.
    pub cd: Matrix2<F>,
    /// Projection of the celestial sphere onto the image plane.
    pub projection: Projection,
}

fn radians_per_degree<F: Float>() -> F {
    F::pi() / convert::<f64, F>(180.)
}

impl<F: Float> Wcs<F> {
    /// Create a new linear instance.
    pub fn new(crpix: Vector2<F>, crval: Vector2<F>, cd: Matrix2<F>) -> Self {
        Self {
            crpix,
            crval,
            cd,
            projection: Projection::Linear,
        }
    }

    /// Set the projection.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Transforms from pixel to sky coordinate space.
    ///
    /// For the gnomonic projection the right ascension is normalized to `[0, 360)`.
    pub fn pixel_to_world(&self, pixel: Vector2<F>) -> Vector2<F> {
        let offset = self.cd * (pixel + Vector2::repeat(F::one()) - self.crpix);
        match self.projection {
            Projection::Linear => self.crval + offset,
            Projection::Gnomonic => {
                let rad = radians_per_degree::<F>();
                let (xi, eta) = (offset.x * rad, offset.y * rad);
                let (ra0, dec0) = (self.crval.x * rad, self.crval.y * rad);

                let denominator = dec0.cos() - eta * dec0.sin();
                let ra = ra0 + xi.atan2(denominator);
                let dec = (eta * dec0.cos() + dec0.sin())
                    .atan2((xi * xi + denominator * denominator).sqrt());

                let full_circle = convert::<f64, F>(360.);
                let mut ra = ra / rad;
                ra -= (ra / full_circle).floor() * full_circle;
                if ra >= full_circle {
                    ra -= full_circle;
                }
                Vector2::new(ra, dec / rad)
            }
        }
    }

    /// Transforms from sky coordinate to pixel space.
    ///
    /// Returns `None` if the linear term is singular or, for the gnomonic projection, if the
    /// coordinate lies on the far hemisphere.
    pub fn world_to_pixel(&self, world_coordinate: Vector2<F>) -> Option<Vector2<F>> {
        let cd_inv = self.cd.try_inverse()?;
        let offset = match self.projection {
            Projection::Linear => world_coordinate - self.crval,
            Projection::Gnomonic => {
                let rad = radians_per_degree::<F>();
                let (ra, dec) = (world_coordinate.x * rad, world_coordinate.y * rad);
                let (ra0, dec0) = (self.crval.x * rad, self.crval.y * rad);
                let dra = ra - ra0;

                let cos_c = dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * dra.cos();
                if cos_c <= F::zero() {
                    return None;
                }
                let xi = dec.cos() * dra.sin() / cos_c;
                let eta = (dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * dra.cos()) / cos_c;
                Vector2::new(xi / rad, eta / rad)
            }
        };
        Some(self.crpix + cd_inv * offset - Vector2::repeat(F::one()))
    }
}

impl Wcs<f64> {
    /// Read the solution from header keywords.
    ///
    /// The linear term is taken from `CDi_j`, else `PCi_j` scaled by `CDELTi`, else `CDELTi`
    /// rotated by `CROTA2`.
    pub fn from_header(header: &Header) -> Result<Self, WcsParseError> {
        let projection = projection(header)?;
        let value = |key: &str| {
            header
                .get_f64(key)
                .ok_or_else(|| WcsParseError::MissingKeyword(key.to_string()))
        };
        let crpix = Vector2::new(value("CRPIX1")?, value("CRPIX2")?);
        let crval = Vector2::new(value("CRVAL1")?, value("CRVAL2")?);
        let cd = linear_term(header)?;

        if !crpix.iter().chain(crval.iter()).chain(cd.iter()).all(|v| v.is_finite()) {
            return Err(WcsParseError::NonFinite);
        }
        if cd.try_inverse().is_none() {
            return Err(WcsParseError::Singular);
        }
        Ok(Self {
            crpix,
            crval,
            cd,
            projection,
        })
    }
}

fn projection(header: &Header) -> Result<Projection, WcsParseError> {
    let code = |key: &str| {
        header.get_str(key).and_then(|ctype| {
            ctype
                .split('-')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .nth(1)
                .map(str::to_uppercase)
        })
    };
    match (code("CTYPE1"), code("CTYPE2")) {
        (None, None) => Ok(Projection::Linear),
        (Some(a), Some(b)) if a == b && GNOMONIC_CODES.contains(&a.as_str()) => {
            Ok(Projection::Gnomonic)
        }
        _ => Err(WcsParseError::UnsupportedProjection(format!(
            "{}/{}",
            header.get_str("CTYPE1").unwrap_or_default().trim(),
            header.get_str("CTYPE2").unwrap_or_default().trim()
        ))),
    }
}

fn linear_term(header: &Header) -> Result<Matrix2<f64>, WcsParseError> {
    const ELEMENTS: [(usize, usize); 4] = [(1, 1), (1, 2), (2, 1), (2, 2)];
    let has = |prefix: &str| {
        ELEMENTS
            .iter()
            .any(|(i, j)| header.contains(&format!("{prefix}{i}_{j}")))
    };
    let matrix = |prefix: &str, default: Matrix2<f64>| {
        let mut m = default;
        for (i, j) in ELEMENTS {
            if let Some(v) = header.get_f64(&format!("{prefix}{i}_{j}")) {
                m[(i - 1, j - 1)] = v;
            }
        }
        m
    };

    if has("CD") {
        return Ok(matrix("CD", Matrix2::zeros()));
    }
    let (Some(cdelt1), Some(cdelt2)) = (header.get_f64("CDELT1"), header.get_f64("CDELT2")) else {
        let missing = if has("PC") { "CDELT1" } else { "CD1_1" };
        return Err(WcsParseError::MissingKeyword(missing.to_string()));
    };
    let scale = Matrix2::new(cdelt1, 0., 0., cdelt2);

    if has("PC") {
        return Ok(scale * matrix("PC", Matrix2::identity()));
    }
    let rho = header.get_f64("CROTA2").unwrap_or(0.).to_radians();
    Ok(Matrix2::new(
        cdelt1 * rho.cos(),
        -cdelt2 * rho.sin(),
        cdelt1 * rho.sin(),
        cdelt2 * rho.cos(),
    ))
}

/// Canonical WCS record of one image extension.
///
/// Center and corner of the image as unit vectors, and the chord between them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardizedWcs {
    /// Distance between center and corner.
    pub radius: f64,
    /// x of the image center.
    pub center_x: f64,
    /// y of the image center.
    pub center_y: f64,
    /// z of the image center.
    pub center_z: f64,
    /// x of pixel `(0, 0)`.
    pub corner_x: f64,
    /// y of pixel `(0, 0)`.
    pub corner_y: f64,
    /// z of pixel `(0, 0)`.
    pub corner_z: f64,
}

impl StandardizedWcs {
    /// Record from center and corner unit vectors.
    pub fn from_vectors(center: Vector3<f64>, corner: Vector3<f64>) -> Self {
        Self {
            radius: chord_distance(&center, &corner),
            center_x: center.x,
            center_y: center.y,
            center_z: center.z,
            corner_x: corner.x,
            corner_y: corner.y,
            corner_z: corner.z,
        }
    }

    /// Evaluate `wcs` at the center pixel `(width / 2, height / 2)` and at pixel `(0, 0)`.
    pub fn from_wcs(wcs: &Wcs<f64>, width: usize, height: usize) -> Result<Self, WcsParseError> {
        let center = wcs.pixel_to_world(Vector2::new((width / 2) as f64, (height / 2) as f64));
        let corner = wcs.pixel_to_world(Vector2::zeros());
        if !center.iter().chain(corner.iter()).all(|v| v.is_finite()) {
            return Err(WcsParseError::NonFinite);
        }
        let unit = |radec: Vector2<f64>| to_unit_sphere(radec.x.to_radians(), radec.y.to_radians());
        Ok(Self::from_vectors(unit(center), unit(corner)))
    }

    /// Unit vector of the image center.
    pub fn center(&self) -> Vector3<f64> {
        Vector3::new(self.center_x, self.center_y, self.center_z)
    }

    /// Unit vector of the image corner.
    pub fn corner(&self) -> Vector3<f64> {
        Vector3::new(self.corner_x, self.corner_y, self.corner_z)
    }

    /// Compare with `other` up to rounding.
    pub fn is_close(&self, other: &Self) -> bool {
        [
            (self.radius, other.radius),
            (self.center_x, other.center_x),
            (self.center_y, other.center_y),
            (self.center_z, other.center_z),
            (self.corner_x, other.corner_x),
            (self.corner_y, other.corner_y),
            (self.corner_z, other.corner_z),
        ]
        .iter()
        .all(|(a, b)| is_close(*a, *b))
    }
}

/// Standardize the WCS embedded in a header of an image of the given size.
pub fn try_embedded_wcs(
    header: &Header,
    width: usize,
    height: usize,
) -> Result<StandardizedWcs, WcsParseError> {
    StandardizedWcs::from_wcs(&Wcs::from_header(header)?, width, height)
}

/// How far the WCS in a header is trusted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WcsStrategy {
    /// Use the header, fall back to the plate solver if it has no usable solution.
    #[default]
    EmbeddedThenSolver,
    /// Ignore the header and always plate-solve.
    SolverOnly,
}

/// Produces [`StandardizedWcs`] records, from headers or with a plate solver.
#[derive(Clone)]
pub struct WcsStandardizer {
    solver: Arc<dyn PlateSolver>,
    timeout: Duration,
}

impl WcsStandardizer {
    /// Create an instance falling back to `solver`.
    pub fn new(solver: Arc<dyn PlateSolver>) -> Self {
        Self {
            solver,
            timeout: DEFAULT_SOLVE_TIMEOUT,
        }
    }

    /// Set the time granted to each plate-solver call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Time granted to each plate-solver call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The plate solver used as fallback.
    pub fn solver(&self) -> &dyn PlateSolver {
        self.solver.as_ref()
    }

    /// Standardize the WCS of one image.
    ///
    /// `pixels` is only invoked when the plate solver is actually consulted.
    pub fn standardize(
        &self,
        header: &Header,
        width: usize,
        height: usize,
        strategy: WcsStrategy,
        pixels: impl FnOnce() -> Result<Array2<f32>, FitsError>,
    ) -> Result<StandardizedWcs, WcsError> {
        let reason = match strategy {
            WcsStrategy::EmbeddedThenSolver => match try_embedded_wcs(header, width, height) {
                Ok(wcs) => return Ok(wcs),
                Err(e) => e.to_string(),
            },
            WcsStrategy::SolverOnly => "header WCS is not trusted".to_string(),
        };
        debug!("Plate solving with {}: {reason}.", self.solver.name());

        if !self.solver.is_configured() {
            return Err(WcsError::Unsolvable(format!("{reason}; {}", SolveError::NoCredentials)));
        }

        let image = pixels()?;
        let deadline = Instant::now() + self.timeout;
        let solved = match self.solver.solve(&SolveRequest::new(image.view()), deadline) {
            Ok(header) => header,
            Err(SolveError::Timeout) => return Err(WcsError::SolveTimeout(self.timeout)),
            Err(e) => return Err(WcsError::Unsolvable(e.to_string())),
        };

        let (rows, cols) = image.dim();
        try_embedded_wcs(&solved, cols, rows).map_err(|e| {
            warn!("Plate solver {} returned an unusable solution: {e}.", self.solver.name());
            WcsError::Unsolvable(format!("unusable solution: {e}"))
        })
    }
}
