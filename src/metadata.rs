//! The uniform metadata record and the tools standardizers build it with.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StandardizeError;
use crate::fits::{Header, HeaderValue};
use crate::registry::Handler;
use crate::wcs::{StandardizedWcs, WcsStrategy};

/// Julian date of the Unix epoch.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Instrument-independent description of an observation.
///
/// Only constructed through [`MetadataBuilder`], so location and both exposure bounds are
/// always present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardizedMetadata {
    /// Name of the upload processor that handled the file.
    pub processor_name: String,
    /// Name of the metadata standardizer that produced the record.
    pub standardizer_name: String,
    /// Instrument or camera.
    pub instrument: Option<String>,
    /// Telescope.
    pub telescope: Option<String>,
    /// Science program or proposal.
    pub science_program: Option<String>,
    /// Observatory longitude in degrees.
    pub observatory_longitude: f64,
    /// Observatory latitude in degrees.
    pub observatory_latitude: f64,
    /// Observatory height above sea level in meters.
    pub observatory_height: f64,
    /// Start of the exposure.
    pub exposure_begin: DateTime<Utc>,
    /// End of the exposure.
    pub exposure_end: DateTime<Utc>,
    /// Exposure time in seconds.
    pub exposure_duration: Option<f64>,
    /// Physical filter.
    pub filter_name: Option<String>,
}

impl StandardizedMetadata {
    /// Compare with `other`, allowing rounding differences in the numeric fields.
    pub fn is_close(&self, other: &Self) -> bool {
        let durations = match (self.exposure_duration, other.exposure_duration) {
            (Some(a), Some(b)) => is_close(a, b),
            (a, b) => a == b,
        };
        self.processor_name == other.processor_name
            && self.standardizer_name == other.standardizer_name
            && self.instrument == other.instrument
            && self.telescope == other.telescope
            && self.science_program == other.science_program
            && is_close(self.observatory_longitude, other.observatory_longitude)
            && is_close(self.observatory_latitude, other.observatory_latitude)
            && is_close(self.observatory_height, other.observatory_height)
            && self.exposure_begin == other.exposure_begin
            && self.exposure_end == other.exposure_end
            && durations
            && self.filter_name == other.filter_name
    }
}

/// Floats equal up to a relative tolerance of `1e-5` and an absolute one of `1e-8`.
pub(crate) fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// One standardized metadata record and the WCS of every processed extension.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StandardizedHeader {
    /// Observation metadata.
    pub metadata: StandardizedMetadata,
    /// WCS records, in extension order.
    pub wcs: Vec<StandardizedWcs>,
}

/// Validating builder of [`StandardizedMetadata`].
///
/// Setters take `Option`s so header lookups can be passed straight through. Text values are
/// cleaned with [`clean_text()`].
#[derive(Clone, Debug, Default)]
pub struct MetadataBuilder {
    standardizer_name: String,
    instrument: Option<String>,
    telescope: Option<String>,
    science_program: Option<String>,
    longitude: Option<f64>,
    latitude: Option<f64>,
    height: Option<f64>,
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    duration: Option<f64>,
    filter_name: Option<String>,
}

impl MetadataBuilder {
    /// Start a record on behalf of the named standardizer.
    pub fn new(standardizer_name: impl Into<String>) -> Self {
        Self {
            standardizer_name: standardizer_name.into(),
            ..Default::default()
        }
    }

    /// Set the instrument.
    pub fn instrument(mut self, value: Option<impl AsRef<str>>) -> Self {
        self.instrument = value.and_then(|v| clean_text(v.as_ref()));
        self
    }

    /// Set the telescope.
    pub fn telescope(mut self, value: Option<impl AsRef<str>>) -> Self {
        self.telescope = value.and_then(|v| clean_text(v.as_ref()));
        self
    }

    /// Set the science program.
    pub fn science_program(mut self, value: Option<impl AsRef<str>>) -> Self {
        self.science_program = value.and_then(|v| clean_text(v.as_ref()));
        self
    }

    /// Set the physical filter.
    pub fn filter_name(mut self, value: Option<impl AsRef<str>>) -> Self {
        self.filter_name = value.and_then(|v| clean_text(v.as_ref()));
        self
    }

    /// Set the observatory location, in degrees and meters.
    pub fn location(mut self, longitude: Option<f64>, latitude: Option<f64>, height: Option<f64>) -> Self {
        self.longitude = longitude.filter(|v| v.is_finite());
        self.latitude = latitude.filter(|v| v.is_finite());
        self.height = height.filter(|v| v.is_finite());
        self
    }

    /// Set the exposure start.
    pub fn begin(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.begin = value;
        self
    }

    /// Set the exposure end.
    pub fn end(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.end = value;
        self
    }

    /// Set the exposure time in seconds.
    pub fn duration(mut self, value: Option<f64>) -> Self {
        self.duration = value.filter(|v| v.is_finite() && *v >= 0.0);
        self
    }

    /// Validate and assemble the record.
    ///
    /// A missing exposure bound is derived from the other one and the duration.
    pub fn build(self) -> Result<StandardizedMetadata, StandardizeError> {
        let missing = |field: &str| StandardizeError::MissingRequiredField(field.to_string());
        let out_of_range = || StandardizeError::ExposureOutOfRange(self.duration.unwrap_or_default());
        let span = self
            .duration
            .map(|duration| seconds(duration).ok_or_else(out_of_range))
            .transpose()?;

        let (begin, end) = match (self.begin, self.end, span) {
            (Some(begin), Some(end), _) => (begin, end),
            (Some(begin), None, Some(span)) => {
                (begin, begin.checked_add_signed(span).ok_or_else(out_of_range)?)
            }
            (None, Some(end), Some(span)) => {
                (end.checked_sub_signed(span).ok_or_else(out_of_range)?, end)
            }
            (None, _, _) => return Err(missing("exposure_begin")),
            (Some(_), None, None) => return Err(missing("exposure_end")),
        };

        Ok(StandardizedMetadata {
            processor_name: String::new(),
            standardizer_name: self.standardizer_name,
            instrument: self.instrument,
            telescope: self.telescope,
            science_program: self.science_program,
            observatory_longitude: self.longitude.ok_or_else(|| missing("observatory_longitude"))?,
            observatory_latitude: self.latitude.ok_or_else(|| missing("observatory_latitude"))?,
            observatory_height: self.height.ok_or_else(|| missing("observatory_height"))?,
            exposure_begin: begin,
            exposure_end: end,
            exposure_duration: self.duration,
            filter_name: self.filter_name,
        })
    }
}

/// Longest exposure accepted, in seconds.
pub const MAX_EXPOSURE_SECONDS: f64 = 1e7;

fn seconds(value: f64) -> Option<TimeDelta> {
    if !(0.0..=MAX_EXPOSURE_SECONDS).contains(&value) {
        return None;
    }
    Some(TimeDelta::microseconds((value * 1e6).round() as i64))
}

/// A metadata standardizer for one instrument or observatory.
///
/// [`Handler::can_handle()`] is the fingerprint test on the header.
pub trait MetadataStandardizer: Handler<Header> {
    /// Translate the header into the uniform record.
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError>;

    /// Whether WCS embedded in the header can be trusted.
    fn wcs_strategy(&self) -> WcsStrategy {
        WcsStrategy::EmbeddedThenSolver
    }
}

/// Trim free text and strip `="value"` style decoration. Empty text becomes `None`.
///
/// # Example:
/// ```
/// # use trailblazer::metadata::clean_text;
/// assert_eq!(clean_text(" = \"vatt4k\" ").as_deref(), Some("vatt4k"));
/// assert_eq!(clean_text("  r' "), Some("r'".to_string()));
/// assert_eq!(clean_text("   "), None);
/// ```
pub fn clean_text(value: &str) -> Option<String> {
    let mut text = value.trim();
    if let Some(rest) = text.strip_prefix('=') {
        text = rest.trim();
    }
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            text = text[1..text.len() - 1].trim();
        }
    }
    (!text.is_empty()).then(|| text.to_string())
}

/// Parse an ISO-8601 style timestamp. Values without an offset are taken as UTC.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|t| t.and_utc())
}

/// Convert a Julian date in the UTC scale to a timestamp.
pub fn julian_to_utc(jd: f64) -> Option<DateTime<Utc>> {
    if !jd.is_finite() {
        return None;
    }
    let micros = ((jd - UNIX_EPOCH_JD) * 86_400e6).round();
    DateTime::from_timestamp_micros(micros as i64)
}

/// Angle in degrees from a numeric card or a sexagesimal string such as `-30:10:12.5`.
pub fn parse_angle(value: &HeaderValue) -> Option<f64> {
    if let Some(v) = value.as_f64() {
        return Some(v);
    }
    let text = value.as_str()?.trim();
    let negative = text.starts_with('-');
    let parts: Vec<f64> = text
        .trim_start_matches(['-', '+'])
        .split([':', ' '])
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let magnitude = parts
        .iter()
        .zip([1.0, 60.0, 3600.0])
        .map(|(p, d)| p / d)
        .sum::<f64>();
    Some(if negative { -magnitude } else { magnitude })
}

/// Accept a missing `TIMESYS` or one naming UTC.
pub fn ensure_utc(header: &Header) -> Result<(), StandardizeError> {
    match header.get_str("TIMESYS") {
        Some(system) if !system.to_uppercase().contains("UTC") => {
            Err(StandardizeError::UnsupportedTimeSystem(system.trim().to_string()))
        }
        _ => Ok(()),
    }
}

/// Numeric keyword that must be present.
pub fn required_f64(header: &Header, key: &str) -> Result<f64, StandardizeError> {
    header
        .get_f64(key)
        .ok_or_else(|| StandardizeError::MissingRequiredField(key.to_string()))
}

/// Text keyword that must be present.
pub fn required_str<'h>(header: &'h Header, key: &str) -> Result<&'h str, StandardizeError> {
    header
        .get_str(key)
        .ok_or_else(|| StandardizeError::MissingRequiredField(key.to_string()))
}

/// Timestamp keyword that must be present and parse.
pub fn required_datetime(header: &Header, key: &str) -> Result<DateTime<Utc>, StandardizeError> {
    parse_datetime(required_str(header, key)?)
        .ok_or_else(|| StandardizeError::MissingRequiredField(key.to_string()))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    use super::*;

    fn located() -> MetadataBuilder {
        MetadataBuilder::new("test").location(Some(-70.7), Some(-30.2), Some(2200.0))
    }

    #[test]
    fn end_from_duration() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let meta = located().begin(Some(begin)).duration(Some(30.5)).build().unwrap();
        assert_eq!(meta.exposure_end, begin + TimeDelta::milliseconds(30_500));
        assert_eq!(meta.standardizer_name, "test");
        assert_eq!(meta.processor_name, "");

        let end = Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap();
        let meta = located().end(Some(end)).duration(Some(60.0)).build().unwrap();
        assert_eq!(meta.exposure_begin, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn absurd_exposure_times() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            located().begin(Some(begin)).duration(Some(1e13)).build(),
            Err(StandardizeError::ExposureOutOfRange(d)) if d == 1e13
        ));
        assert!(matches!(
            located().end(Some(begin)).duration(Some(MAX_EXPOSURE_SECONDS * 2.)).build(),
            Err(StandardizeError::ExposureOutOfRange(_))
        ));

        let meta = located().begin(Some(begin)).duration(Some(MAX_EXPOSURE_SECONDS)).build().unwrap();
        assert_eq!(meta.exposure_end - meta.exposure_begin, TimeDelta::seconds(10_000_000));

        assert!(matches!(
            located().begin(Some(begin)).duration(Some(f64::INFINITY)).build(),
            Err(StandardizeError::MissingRequiredField(field)) if field == "exposure_end"
        ));
    }

    #[test]
    fn missing_fields() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let err = located().begin(Some(begin)).build().unwrap_err();
        assert!(matches!(err, StandardizeError::MissingRequiredField(f) if f == "exposure_end"));

        let err = MetadataBuilder::new("test")
            .location(Some(1.0), None, Some(1.0))
            .begin(Some(begin))
            .end(Some(begin))
            .build()
            .unwrap_err();
        assert!(matches!(err, StandardizeError::MissingRequiredField(f) if f == "observatory_latitude"));

        let err = located().duration(Some(1.0)).build().unwrap_err();
        assert!(matches!(err, StandardizeError::MissingRequiredField(f) if f == "exposure_begin"));
    }

    #[test]
    fn text_cleaning() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let meta = located()
            .begin(Some(begin))
            .end(Some(begin))
            .telescope(Some("='VATT'"))
            .instrument(Some("  "))
            .filter_name(Some(" R "))
            .build()
            .unwrap();
        assert_eq!(meta.telescope.as_deref(), Some("VATT"));
        assert_eq!(meta.instrument, None);
        assert_eq!(meta.filter_name.as_deref(), Some("R"));
    }

    #[test]
    fn datetimes() {
        let expected = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(parse_datetime("2021-03-04T05:06:07"), Some(expected));
        assert_eq!(parse_datetime("2021-03-04 05:06:07"), Some(expected));
        assert_eq!(parse_datetime("2021-03-04T05:06:07Z"), Some(expected));
        assert_eq!(parse_datetime("2021-03-04T00:06:07-05:00"), Some(expected));
        assert_eq!(parse_datetime("2021-03-04T00:06:07.000-0500"), Some(expected));
        assert_eq!(
            parse_datetime("2021-03-04T05:06:07.250"),
            Some(expected + TimeDelta::milliseconds(250))
        );
        assert_eq!(
            parse_datetime("2021-03-04"),
            Some(Utc.with_ymd_and_hms(2021, 3, 4, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_datetime("yesterday"), None);
    }

    #[test]
    fn julian_dates() {
        assert_eq!(
            julian_to_utc(2_451_545.0),
            Some(Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(julian_to_utc(f64::NAN), None);
    }

    #[test]
    fn angles() {
        assert_abs_diff_eq!(parse_angle(&HeaderValue::Float(12.5)).unwrap(), 12.5);
        assert_abs_diff_eq!(
            parse_angle(&HeaderValue::from("-30:10:12")).unwrap(),
            -(30.0 + 10.0 / 60.0 + 12.0 / 3600.0),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            parse_angle(&HeaderValue::from("19 49 30")).unwrap(),
            19.825,
            epsilon = 1e-12
        );
        assert_eq!(parse_angle(&HeaderValue::from("north")), None);
    }

    #[test]
    fn time_systems() {
        assert!(ensure_utc(&Header::new()).is_ok());
        assert!(ensure_utc(&Header::new().with("TIMESYS", "UTC")).is_ok());
        assert!(matches!(
            ensure_utc(&Header::new().with("TIMESYS", "TAI")),
            Err(StandardizeError::UnsupportedTimeSystem(s)) if s == "TAI"
        ));
    }

    #[test]
    fn closeness() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let a = located().begin(Some(begin)).duration(Some(10.0)).build().unwrap();
        let mut b = a.clone();
        b.observatory_latitude += 1e-9;
        assert!(a.is_close(&b));
        b.observatory_latitude += 1.0;
        assert!(!a.is_close(&b));
    }
}
