use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, parse_angle, required_datetime,
    required_f64,
};
use crate::registry::Handler;

/// Value of `ORIGIN` in Large Binocular Telescope headers.
pub(crate) const LBT_ORIGIN: &str = "LBT Observatory";

/// Large Binocular Telescope.
#[derive(Clone, Copy, Debug, Default)]
pub struct LbtStandardizer;

impl Handler<Header> for LbtStandardizer {
    fn name(&self) -> &'static str {
        "large_binocular_telescope_standardizer"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, header: &Header) -> bool {
        header.get_str("ORIGIN").is_some_and(|o| o.trim() == LBT_ORIGIN)
    }
}

impl MetadataStandardizer for LbtStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        let angle = |key: &str| {
            header
                .get(key)
                .and_then(parse_angle)
                .ok_or_else(|| StandardizeError::MissingRequiredField(key.to_string()))
        };
        MetadataBuilder::new(self.name())
            .location(Some(angle("LBTLONG")?), Some(angle("LBTLAT")?), Some(3221.0))
            .telescope(header.get_str("TELESCOP"))
            .instrument(header.get_str("INSTRUME"))
            .begin(Some(required_datetime(header, "DATE_OBS")?))
            .duration(Some(required_f64(header, "EXPTIME")?))
            .filter_name(header.get_str("FILTER"))
            .build()
    }
}
