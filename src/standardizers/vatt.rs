use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, clean_text, parse_datetime,
    required_f64, required_str,
};
use crate::registry::Handler;

const LONGITUDE: f64 = -109.892107;
const LATITUDE: f64 = 32.701328;

/// Vatican Advanced Technology Telescope with the 4k CCD.
#[derive(Clone, Copy, Debug, Default)]
pub struct VattStandardizer;

impl Handler<Header> for VattStandardizer {
    fn name(&self) -> &'static str {
        "vatt_standardizer"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, header: &Header) -> bool {
        header
            .get_str("DEWAR")
            .and_then(clean_text)
            .is_some_and(|d| d == "vatt4k_dewar")
    }
}

impl MetadataStandardizer for VattStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        let date = required_str(header, "DATE-OBS")?.trim();
        let time = required_str(header, "TIME-OBS")?.trim();
        let begin = parse_datetime(&format!("{date}T{time}"))
            .ok_or_else(|| StandardizeError::MissingRequiredField("DATE-OBS".to_string()))?;

        MetadataBuilder::new(self.name())
            .location(
                Some(LONGITUDE),
                Some(LATITUDE),
                Some(required_f64(header, "ELEVAT")?),
            )
            .telescope(header.get_str("TELESCOP"))
            .instrument(header.get_str("INSTRUME"))
            .begin(Some(begin))
            .duration(Some(required_f64(header, "EXPTIME")?))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::standardizers::samples;

    #[test]
    fn standardize() {
        let meta = VattStandardizer.standardize_metadata(&samples::vatt()).unwrap();
        let begin = Utc.with_ymd_and_hms(2018, 11, 11, 11, 11, 11).unwrap() + TimeDelta::milliseconds(100);
        assert_eq!(meta.exposure_begin, begin);
        assert_eq!(meta.exposure_end, begin + TimeDelta::seconds(5));
        assert_eq!(meta.telescope.as_deref(), Some("VATT"));
        assert_eq!(meta.instrument.as_deref(), Some("VATT4K"));
        assert_eq!(meta.observatory_longitude, LONGITUDE);
        assert_eq!(meta.observatory_height, 3191.0);
        assert_eq!(meta.filter_name, None);
    }

    #[test]
    fn fingerprint() {
        assert!(VattStandardizer.can_handle(&Header::new().with("DEWAR", "= 'vatt4k_dewar'")));
        assert!(!VattStandardizer.can_handle(&Header::new().with("DEWAR", "other")));
    }
}
