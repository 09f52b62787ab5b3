//! Plate solvers, consulted when an image carries no usable WCS.

use std::sync::Arc;
use std::time::Instant;

use ndarray::ArrayView2;

use crate::config::AstrometryConfig;
use crate::error::SolveError;
use crate::fits::Header;

/// Image handed to a plate solver.
#[derive(Clone, Debug)]
pub struct SolveRequest<'a> {
    /// Pixel data, rows first.
    pub image: ArrayView2<'a, f32>,
}

impl<'a> SolveRequest<'a> {
    /// Create a request for `image`.
    pub fn new(image: ArrayView2<'a, f32>) -> Self {
        Self { image }
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.image.nrows()
    }
}

/// An external astrometric solver.
pub trait PlateSolver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Solve the image, giving up once `deadline` passes.
    ///
    /// The returned header holds a WCS for the image of the request.
    fn solve(&self, request: &SolveRequest<'_>, deadline: Instant) -> Result<Header, SolveError>;

    /// Whether the solver can be called at all.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Stand-in used when no solver credential is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredSolver;

impl PlateSolver for UnconfiguredSolver {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    fn solve(&self, _request: &SolveRequest<'_>, _deadline: Instant) -> Result<Header, SolveError> {
        Err(SolveError::NoCredentials)
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Solver described by the configuration.
pub fn solver_from_config(config: &AstrometryConfig) -> Arc<dyn PlateSolver> {
    match &config.api_key {
        #[cfg(feature = "astrometry-net")]
        Some(key) => Arc::new(astrometry_net::AstrometryNetSolver::new(key, &config.api_url)),
        #[cfg(not(feature = "astrometry-net"))]
        Some(_) => {
            log::warn!("An astrometry.net key is configured, but the astrometry-net feature is disabled.");
            Arc::new(UnconfiguredSolver)
        }
        None => Arc::new(UnconfiguredSolver),
    }
}

/// Gnomonic WCS header from a field center, position angle and pixel scale.
///
/// `ra` and `dec` in degrees, `orientation` in degrees east of north, `pixscale` in arcseconds
/// per pixel. The reference pixel is the image center.
pub fn tan_header(
    ra: f64,
    dec: f64,
    orientation: f64,
    pixscale: f64,
    width: usize,
    height: usize,
) -> Header {
    let theta = orientation.to_radians();
    let scale = pixscale / 3600.;
    Header::new()
        .with("CTYPE1", "RA---TAN")
        .with("CTYPE2", "DEC--TAN")
        .with("CRVAL1", ra)
        .with("CRVAL2", dec)
        .with("CRPIX1", width as f64 / 2.)
        .with("CRPIX2", height as f64 / 2.)
        .with("CD1_1", -scale * theta.cos())
        .with("CD1_2", scale * theta.sin())
        .with("CD2_1", scale * theta.sin())
        .with("CD2_2", scale * theta.cos())
}

/// Client of the nova.astrometry.net web API.
#[cfg(feature = "astrometry-net")]
pub mod astrometry_net {
    use std::io::Cursor;
    use std::thread;
    use std::time::{Duration, Instant};

    use image::{GrayImage, ImageFormat};
    use log::{debug, info};
    use reqwest::blocking::{Client, multipart};
    use serde_json::{Value, json};

    use super::{PlateSolver, SolveRequest, tan_header};
    use crate::error::SolveError;
    use crate::fits::Header;
    use crate::thumbnail::{equalize_histogram, to_gray_image};

    const POLL_INTERVAL: Duration = Duration::from_secs(2);

    /// Plate solver uploading a PNG rendition of the image to astrometry.net.
    pub struct AstrometryNetSolver {
        api_key: String,
        api_url: String,
        client: Client,
    }

    impl AstrometryNetSolver {
        /// Create a client for the service at `api_url`.
        pub fn new(api_key: &str, api_url: &str) -> Self {
            Self {
                api_key: api_key.to_string(),
                api_url: api_url.trim_end_matches('/').to_string(),
                client: Client::new(),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("{}/api/{path}", self.api_url)
        }

        fn get(&self, path: &str, deadline: Instant) -> Result<Value, SolveError> {
            self.client
                .get(self.url(path))
                .timeout(remaining(deadline)?)
                .send()
                .and_then(|r| r.json())
                .map_err(request_error)
        }

        fn login(&self, deadline: Instant) -> Result<String, SolveError> {
            let request = json!({ "apikey": self.api_key }).to_string();
            let response: Value = self
                .client
                .post(self.url("login"))
                .timeout(remaining(deadline)?)
                .form(&[("request-json", request)])
                .send()
                .and_then(|r| r.json())
                .map_err(request_error)?;
            expect_success(&response, "login")?;
            response["session"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| SolveError::Service("no session in login response".to_string()))
        }

        fn upload(&self, session: &str, png: Vec<u8>, deadline: Instant) -> Result<u64, SolveError> {
            let request = json!({
                "session": session,
                "allow_commercial_use": "n",
                "allow_modifications": "n",
                "publicly_visible": "n",
            });
            let part = multipart::Part::bytes(png)
                .file_name("image.png")
                .mime_str("image/png")
                .map_err(service)?;
            let form = multipart::Form::new()
                .text("request-json", request.to_string())
                .part("file", part);
            let response: Value = self
                .client
                .post(self.url("upload"))
                .timeout(remaining(deadline)?)
                .multipart(form)
                .send()
                .and_then(|r| r.json())
                .map_err(request_error)?;
            expect_success(&response, "upload")?;
            response["subid"]
                .as_u64()
                .ok_or_else(|| SolveError::Service("no subid in upload response".to_string()))
        }

        fn job(&self, submission: u64, deadline: Instant) -> Result<u64, SolveError> {
            loop {
                let status = self.get(&format!("submissions/{submission}"), deadline)?;
                let job = status["jobs"]
                    .as_array()
                    .and_then(|jobs| jobs.iter().filter_map(Value::as_u64).find(|id| *id > 0));
                if let Some(job) = job {
                    return Ok(job);
                }
                wait(deadline)?;
            }
        }

        fn await_job(&self, job: u64, deadline: Instant) -> Result<(), SolveError> {
            loop {
                let status = self.get(&format!("jobs/{job}"), deadline)?;
                match status["status"].as_str() {
                    Some("success") => return Ok(()),
                    Some("failure") => return Err(SolveError::NoSolution),
                    _ => wait(deadline)?,
                }
            }
        }
    }

    impl PlateSolver for AstrometryNetSolver {
        fn name(&self) -> &'static str {
            "astrometry.net"
        }

        fn solve(&self, request: &SolveRequest<'_>, deadline: Instant) -> Result<Header, SolveError> {
            let png = encode_png(request)?;
            let session = self.login(deadline)?;
            let submission = self.upload(&session, png, deadline)?;
            info!("Submitted image to astrometry.net as submission {submission}.");

            let job = self.job(submission, deadline)?;
            self.await_job(job, deadline)?;
            let calibration = self.get(&format!("jobs/{job}/calibration"), deadline)?;
            debug!("astrometry.net job {job} solved: {calibration}");

            let field = |key: &str| {
                calibration[key]
                    .as_f64()
                    .ok_or_else(|| SolveError::Service(format!("calibration lacks {key}")))
            };
            Ok(tan_header(
                field("ra")?,
                field("dec")?,
                field("orientation")?,
                field("pixscale")?,
                request.width(),
                request.height(),
            ))
        }
    }

    fn encode_png(request: &SolveRequest<'_>) -> Result<Vec<u8>, SolveError> {
        let image: GrayImage = to_gray_image(&equalize_histogram(&request.image))
            .ok_or_else(|| SolveError::Service("image too large to encode".to_string()))?;
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .map_err(service)?;
        Ok(png.into_inner())
    }

    fn expect_success(response: &Value, step: &str) -> Result<(), SolveError> {
        match response["status"].as_str() {
            Some("success") => Ok(()),
            _ => Err(SolveError::Service(format!(
                "{step} failed: {}",
                response["errormessage"].as_str().unwrap_or("unknown error")
            ))),
        }
    }

    fn remaining(deadline: Instant) -> Result<Duration, SolveError> {
        deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(SolveError::Timeout)
    }

    fn wait(deadline: Instant) -> Result<(), SolveError> {
        thread::sleep(POLL_INTERVAL.min(remaining(deadline)?));
        remaining(deadline).map(|_| ())
    }

    fn request_error(error: reqwest::Error) -> SolveError {
        if error.is_timeout() {
            SolveError::Timeout
        } else {
            service(error)
        }
    }

    fn service(error: impl std::fmt::Display) -> SolveError {
        SolveError::Service(error.to_string())
    }
}
