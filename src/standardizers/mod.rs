//! Metadata standardizers, one per supported instrument or observatory.
//!
//! All of them are listed in [`default_registry()`]. The header they see is the one of the
//! upload's metadata HDU, see [`UploadProcessor::metadata_header()`](crate::processors::UploadProcessor::metadata_header()).

mod common;
mod gemini;
mod las_cumbres;
mod lbt;
mod lowell;
mod moa;
mod vatt;
mod whipple;

pub use common::CommonKeywordsStandardizer;
pub use gemini::{GeminiNorthStandardizer, GmosnStandardizer};
pub use las_cumbres::LasCumbresStandardizer;
pub use lbt::LbtStandardizer;
pub(crate) use lbt::LBT_ORIGIN;
pub use lowell::LowellStandardizer;
pub use moa::MoaStandardizer;
pub use vatt::VattStandardizer;
pub use whipple::WhippleStandardizer;

use log::debug;

use crate::error::{RegistryError, StandardizeError};
use crate::fits::{Header, HeaderValue};
use crate::metadata::{MetadataStandardizer, StandardizedMetadata};
use crate::registry::Registry;

/// Registry of metadata standardizers, keyed by header.
pub type StandardizerRegistry = Registry<Header, dyn MetadataStandardizer>;

/// Registry holding every standardizer shipped with the crate.
pub fn default_registry() -> Result<StandardizerRegistry, RegistryError> {
    StandardizerRegistry::new()
        .with(Box::new(LasCumbresStandardizer))?
        .with(Box::new(GeminiNorthStandardizer))?
        .with(Box::new(GmosnStandardizer))?
        .with(Box::new(LowellStandardizer))?
        .with(Box::new(LbtStandardizer))?
        .with(Box::new(MoaStandardizer))?
        .with(Box::new(VattStandardizer))?
        .with(Box::new(WhippleStandardizer))?
        .with(Box::new(CommonKeywordsStandardizer))
}

/// Resolve the standardizer for `header` and run it.
pub fn standardize<'r>(
    registry: &'r StandardizerRegistry,
    header: &Header,
) -> Result<(&'r dyn MetadataStandardizer, StandardizedMetadata), StandardizeError> {
    let standardizer = registry.resolve(header)?;
    debug!("Standardizing metadata with {}.", standardizer.name());
    let metadata = standardizer.standardize_metadata(header)?;
    Ok((standardizer, metadata))
}

/// Keyword value as plain text, numbers included.
fn text(header: &Header, key: &str) -> Option<String> {
    match header.get(key)? {
        HeaderValue::String(s) => Some(s.clone()),
        HeaderValue::Integer(i) => Some(i.to_string()),
        HeaderValue::Float(f) => Some(f.to_string()),
        HeaderValue::Boolean(_) => None,
    }
}

/// Whether a numeric keyword equals `expected` up to rounding.
fn has_value(header: &Header, key: &str, expected: f64) -> bool {
    header
        .get_f64(key)
        .is_some_and(|v| (v - expected).abs() < 1e-6)
}

/// Whether a text keyword contains `needle`, ignoring case.
fn contains_ignore_case(header: &Header, key: &str, needle: &str) -> bool {
    header
        .get_str(key)
        .is_some_and(|v| v.to_uppercase().contains(&needle.to_uppercase()))
}

#[cfg(test)]
pub(crate) mod samples {
    //! Representative headers of every supported instrument.

    use crate::fits::Header;

    pub fn las_cumbres() -> Header {
        Header::new()
            .with("ORIGIN", "LCOGT")
            .with("LONGITUD", -70.8049)
            .with("LATITUDE", -30.1673)
            .with("HEIGHT", 2198.0)
            .with("TELESCOP", "1m0-04")
            .with("INSTRUME", "fa03")
            .with("PROPID", "LCO2020A-001")
            .with("DATE", "2020-02-01")
            .with("UTSTART", "03:14:15.926")
            .with("UTSTOP", "03:16:15.926")
            .with("TIMESYS", "UTC")
            .with("EXPTIME", 120.0)
            .with("FILTER", "rp")
    }

    pub fn gemini() -> Header {
        Header::new()
            .with("GEOLAT", 19.82)
            .with("GEOLON", -155.47)
            .with("DATE-OBS", "2015-06-01T10:00:00.5")
            .with("EXPTIME", 60.0)
            .with("FILTER", "r_G0303 ")
    }

    pub fn lowell() -> Header {
        Header::new()
            .with("GEOLAT", 34.7444)
            .with("GEOLON", -111.4223)
            .with("DATE-OBS", "2019-05-05T05:05:05.0")
            .with("EXPTIME", 10.0)
            .with("FILTER", "V")
    }

    pub fn lbt() -> Header {
        Header::new()
            .with("ORIGIN", "LBT Observatory")
            .with("LBTLONG", "-109:53:21.8")
            .with("LBTLAT", "32:42:04.7")
            .with("DATE_OBS", "2016-03-08T04:30:00.000")
            .with("EXPTIME", 90.0)
            .with("TELESCOP", "LBT-SX")
            .with("INSTRUME", "LBC_BLUE")
            .with("FILTER", "g-SLOAN ")
    }

    pub fn moa() -> Header {
        Header::new()
            .with("OBSTEL", "MOA-II 1.8m")
            .with("CAMERA", "MOA-cam3")
            .with("RUN", "A1234 ")
            .with("FIELD", "gb5")
            .with("COLOUR", "R")
            .with("CHIP", 10)
            .with("TIMESYS", "UTC")
            .with("JDSTART", 2_458_000.5)
            .with("EXPTIME", 60.0)
            .with("LOGITUD", 170.465)
            .with("LATITUD", -43.987)
            .with("HEIGHT", 1029.0)
    }

    pub fn vatt() -> Header {
        Header::new()
            .with("DEWAR", "vatt4k_dewar")
            .with("DATE-OBS", "2018-11-11")
            .with("TIME-OBS", "11:11:11.1")
            .with("EXPTIME", 5.0)
            .with("ELEVAT", 3191.0)
            .with("TELESCOP", "= \"VATT\"")
            .with("INSTRUME", "= \"VATT4K\"")
    }

    pub fn whipple() -> Header {
        Header::new()
            .with("OBSERVAT", "Whipple")
            .with("DATE-OBS", "2020-10-10T03:00:00.000-07:00")
            .with("DATE-END", "2020-10-10T03:05:00.000-07:00")
            .with("TELESCOP", "Ben 48in")
            .with("INSTRUME", "KeplerCam")
            .with("ORIGIN", "SAO")
            .with("OBSID", 42)
            .with("LONGITUD", -110.878)
            .with("LATITUDE", 31.681)
            .with("EXPTIME", 300.0)
            .with("FILTER", "r")
    }

    pub fn common() -> Header {
        Header::new()
            .with("SITELAT", "-30:14:26.7")
            .with("SITELONG", "-70:44:12.0")
            .with("SITEELEV", 2207.0)
            .with("DATE-OBS", "2021-07-01T01:02:03")
            .with("EXPTIME", 15.0)
            .with("TELESCOP", "CTIO 4.0-m telescope")
            .with("INSTRUME", "DECam")
            .with("FILTER", "r DECam SDSS c0002 6415.0 1480.0")
    }

    /// Every sample with the name of the standardizer expected to claim it.
    pub fn all() -> Vec<(&'static str, Header)> {
        vec![
            ("las_cumbres_standardizer", las_cumbres()),
            ("gmosn_standardizer", gemini()),
            ("lowell_discovery_telescope_standardizer", lowell()),
            ("large_binocular_telescope_standardizer", lbt()),
            ("moa_standardizer", moa()),
            ("vatt_standardizer", vatt()),
            ("whipple_standardizer", whipple()),
            ("common_keywords_standardizer", common()),
        ]
    }
}
