use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, required_datetime, required_f64,
    required_str,
};
use crate::registry::Handler;

use super::{contains_ignore_case, text};

/// Height of the Whipple telescopes that do not record it.
const KNOWN_TELESCOPE_HEIGHT: f64 = 1268.0;

/// Fred Lawrence Whipple Observatory.
#[derive(Clone, Copy, Debug, Default)]
pub struct WhippleStandardizer;

impl Handler<Header> for WhippleStandardizer {
    fn name(&self) -> &'static str {
        "whipple_standardizer"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, header: &Header) -> bool {
        contains_ignore_case(header, "OBSERVAT", "WHIPPLE")
    }
}

impl MetadataStandardizer for WhippleStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        let height = match header.get_f64("HEIGHT") {
            Some(height) => height,
            None => {
                let telescope = required_str(header, "TELESCOP")?.to_lowercase();
                if telescope.contains("cecilia") || telescope.contains("ben") {
                    KNOWN_TELESCOPE_HEIGHT
                } else {
                    return Err(StandardizeError::MissingRequiredField("HEIGHT".to_string()));
                }
            }
        };
        let program = match (text(header, "ORIGIN"), text(header, "OBSID")) {
            (Some(origin), Some(id)) => Some(format!("{} {}", origin.trim(), id.trim())),
            _ => None,
        };

        MetadataBuilder::new(self.name())
            .location(
                Some(required_f64(header, "LONGITUD")?),
                Some(required_f64(header, "LATITUDE")?),
                Some(height),
            )
            .telescope(header.get_str("TELESCOP"))
            .instrument(header.get_str("INSTRUME"))
            .science_program(program)
            .begin(Some(required_datetime(header, "DATE-OBS")?))
            .end(Some(required_datetime(header, "DATE-END")?))
            .duration(header.get_f64("EXPTIME"))
            .filter_name(header.get_str("FILTER"))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::standardizers::samples;

    #[test]
    fn standardize() {
        let meta = WhippleStandardizer.standardize_metadata(&samples::whipple()).unwrap();
        assert_eq!(meta.exposure_begin, Utc.with_ymd_and_hms(2020, 10, 10, 10, 0, 0).unwrap());
        assert_eq!(meta.exposure_end, Utc.with_ymd_and_hms(2020, 10, 10, 10, 5, 0).unwrap());
        assert_eq!(meta.observatory_height, KNOWN_TELESCOPE_HEIGHT);
        assert_eq!(meta.science_program.as_deref(), Some("SAO 42"));
    }

    #[test]
    fn recorded_height_wins() {
        let header = samples::whipple().with("HEIGHT", 2345.0);
        let meta = WhippleStandardizer.standardize_metadata(&header).unwrap();
        assert_eq!(meta.observatory_height, 2345.0);
    }

    #[test]
    fn unknown_telescope_needs_height() {
        let header = samples::whipple().with("TELESCOP", "Tillinghast");
        assert!(matches!(
            WhippleStandardizer.standardize_metadata(&header),
            Err(StandardizeError::MissingRequiredField(key)) if key == "HEIGHT"
        ));
    }
}
