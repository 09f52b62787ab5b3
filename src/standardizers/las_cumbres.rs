use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, ensure_utc, parse_datetime,
    required_f64, required_str,
};
use crate::registry::Handler;

use super::contains_ignore_case;

/// Las Cumbres Observatory global telescope network.
#[derive(Clone, Copy, Debug, Default)]
pub struct LasCumbresStandardizer;

impl Handler<Header> for LasCumbresStandardizer {
    fn name(&self) -> &'static str {
        "las_cumbres_standardizer"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, header: &Header) -> bool {
        contains_ignore_case(header, "ORIGIN", "LCOGT")
    }
}

impl MetadataStandardizer for LasCumbresStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        ensure_utc(header)?;
        let date = required_str(header, "DATE")?.trim();
        let at = |key: &str| -> Result<_, StandardizeError> {
            let time = required_str(header, key)?.trim();
            parse_datetime(&format!("{date}T{time}"))
                .ok_or_else(|| StandardizeError::MissingRequiredField(key.to_string()))
                .map(Some)
        };

        MetadataBuilder::new(self.name())
            .location(
                Some(required_f64(header, "LONGITUD")?),
                Some(required_f64(header, "LATITUDE")?),
                Some(required_f64(header, "HEIGHT")?),
            )
            .telescope(header.get_str("TELESCOP"))
            .instrument(header.get_str("INSTRUME"))
            .science_program(header.get_str("PROPID"))
            .begin(at("UTSTART")?)
            .end(at("UTSTOP")?)
            .duration(header.get_f64("EXPTIME"))
            .filter_name(header.get_str("FILTER"))
            .build()
    }
}
