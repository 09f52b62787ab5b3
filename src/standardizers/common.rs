//! Fallback for headers that follow common keyword conventions.

use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, ensure_utc, parse_angle,
    parse_datetime,
};
use crate::registry::Handler;

/// Keyword triples of longitude, latitude and height, in order of preference.
const LOCATION_KEYWORDS: [[&str; 3]; 4] = [
    ["OBSGEO-L", "OBSGEO-B", "OBSGEO-H"],
    ["SITELONG", "SITELAT", "SITEELEV"],
    ["OBS-LONG", "OBS-LAT", "OBS-ELEV"],
    ["LONGITUD", "LATITUDE", "HEIGHT"],
];

/// Generic standardizer using widely shared keywords.
///
/// Claims any header with a complete observatory location and a parsable `DATE-OBS`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommonKeywordsStandardizer;

fn location(header: &Header) -> Option<(f64, f64, f64)> {
    LOCATION_KEYWORDS.iter().find_map(|[lon, lat, height]| {
        Some((
            parse_angle(header.get(lon)?)?,
            parse_angle(header.get(lat)?)?,
            header.get_f64(height)?,
        ))
    })
}

fn begin(header: &Header) -> Option<chrono::DateTime<chrono::Utc>> {
    let date = header.get_str("DATE-OBS")?.trim();
    match header.get_str("TIME-OBS") {
        Some(time) if !date.contains('T') => parse_datetime(&format!("{date}T{}", time.trim())),
        _ => parse_datetime(date),
    }
}

impl Handler<Header> for CommonKeywordsStandardizer {
    fn name(&self) -> &'static str {
        "common_keywords_standardizer"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn can_handle(&self, header: &Header) -> bool {
        location(header).is_some() && begin(header).is_some()
    }
}

impl MetadataStandardizer for CommonKeywordsStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        ensure_utc(header)?;
        let (lon, lat, height) = location(header).ok_or_else(|| {
            StandardizeError::MissingRequiredField("observatory_location".to_string())
        })?;
        let duration = header.get_f64("EXPTIME").or_else(|| header.get_f64("EXPOSURE"));
        let program = header.get_str("PROPID").or_else(|| header.get_str("PROGRAM"));

        MetadataBuilder::new(self.name())
            .location(Some(lon), Some(lat), Some(height))
            .telescope(header.get_str("TELESCOP"))
            .instrument(header.get_str("INSTRUME"))
            .science_program(program)
            .begin(begin(header))
            .end(header.get_str("DATE-END").and_then(parse_datetime))
            .duration(duration)
            .filter_name(header.get_str("FILTER"))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::{TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::standardizers::samples;

    #[test]
    fn standardize() {
        let meta = CommonKeywordsStandardizer
            .standardize_metadata(&samples::common())
            .unwrap();
        assert_abs_diff_eq!(meta.observatory_latitude, -30.240750, epsilon = 1e-6);
        assert_abs_diff_eq!(meta.observatory_longitude, -70.736667, epsilon = 1e-6);
        let begin = Utc.with_ymd_and_hms(2021, 7, 1, 1, 2, 3).unwrap();
        assert_eq!(meta.exposure_end, begin + TimeDelta::seconds(15));
        assert_eq!(meta.instrument.as_deref(), Some("DECam"));
    }

    #[test]
    fn separate_time_keyword() {
        let header = Header::new()
            .with("OBS-LONG", 10.0)
            .with("OBS-LAT", 20.0)
            .with("OBS-ELEV", 30.0)
            .with("DATE-OBS", "2001-02-03")
            .with("TIME-OBS", "04:05:06")
            .with("DATE-END", "2001-02-03T04:06:06");
        assert!(CommonKeywordsStandardizer.can_handle(&header));
        let meta = CommonKeywordsStandardizer.standardize_metadata(&header).unwrap();
        assert_eq!(meta.exposure_begin, Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap());
        assert_eq!(meta.exposure_duration, None);
    }

    #[test]
    fn incomplete_location() {
        let header = Header::new()
            .with("SITELAT", 10.0)
            .with("SITELONG", 20.0)
            .with("DATE-OBS", "2001-02-03");
        assert!(!CommonKeywordsStandardizer.can_handle(&header));
    }

    #[test]
    fn other_time_systems() {
        let header = samples::common().with("TIMESYS", "TAI");
        assert!(CommonKeywordsStandardizer.can_handle(&header));
        assert!(matches!(
            CommonKeywordsStandardizer.standardize_metadata(&header),
            Err(StandardizeError::UnsupportedTimeSystem(_))
        ));
    }
}
