use chrono::{DateTime, TimeZone, Utc};

use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, required_datetime, required_f64,
};
use crate::registry::Handler;
use crate::wcs::WcsStrategy;

use super::has_value;

const LATITUDE: f64 = 19.82;
const HEIGHT: f64 = 4213.0;
const TELESCOPE: &str = "Gemini North";

/// Gemini North, with the CCD inferred from the observation epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeminiNorthStandardizer;

/// GMOS-N on Gemini North. Header WCS is not trusted.
#[derive(Clone, Copy, Debug, Default)]
pub struct GmosnStandardizer;

/// The GMOS-N detector in use at `time`.
fn detector(time: DateTime<Utc>) -> &'static str {
    let e2v = Utc.with_ymd_and_hms(2011, 10, 1, 0, 0, 0).single();
    let hamamatsu = Utc.with_ymd_and_hms(2014, 6, 1, 0, 0, 0).single();
    if e2v.is_some_and(|t| time < t) {
        "EEV"
    } else if hamamatsu.is_some_and(|t| time < t) {
        "e2v DD"
    } else {
        "Hamamatsu"
    }
}

fn standardize(
    name: &str,
    header: &Header,
    instrument: impl FnOnce(DateTime<Utc>) -> &'static str,
) -> Result<StandardizedMetadata, StandardizeError> {
    let begin = required_datetime(header, "DATE-OBS")?;
    MetadataBuilder::new(name)
        .location(
            Some(required_f64(header, "GEOLON")?),
            Some(required_f64(header, "GEOLAT")?),
            Some(HEIGHT),
        )
        .telescope(Some(TELESCOPE))
        .instrument(Some(instrument(begin)))
        .begin(Some(begin))
        .duration(Some(required_f64(header, "EXPTIME")?))
        .filter_name(header.get_str("FILTER"))
        .build()
}

impl Handler<Header> for GeminiNorthStandardizer {
    fn name(&self) -> &'static str {
        "gemini_north_standardizer"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, header: &Header) -> bool {
        has_value(header, "GEOLAT", LATITUDE)
    }
}

impl MetadataStandardizer for GeminiNorthStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        standardize(self.name(), header, detector)
    }
}

impl Handler<Header> for GmosnStandardizer {
    fn name(&self) -> &'static str {
        "gmosn_standardizer"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn can_handle(&self, header: &Header) -> bool {
        has_value(header, "GEOLAT", LATITUDE)
    }
}

impl MetadataStandardizer for GmosnStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        standardize(self.name(), header, |_| "GMOS")
    }

    fn wcs_strategy(&self) -> WcsStrategy {
        WcsStrategy::SolverOnly
    }
}
