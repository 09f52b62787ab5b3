use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, required_datetime, required_f64,
};
use crate::registry::Handler;

use super::has_value;

/// Lowell Discovery Telescope with the Large Monolithic Imager.
#[derive(Clone, Copy, Debug, Default)]
pub struct LowellStandardizer;

impl Handler<Header> for LowellStandardizer {
    fn name(&self) -> &'static str {
        "lowell_discovery_telescope_standardizer"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, header: &Header) -> bool {
        has_value(header, "GEOLAT", 34.7444)
    }
}

impl MetadataStandardizer for LowellStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        MetadataBuilder::new(self.name())
            .location(
                Some(required_f64(header, "GEOLON")?),
                Some(required_f64(header, "GEOLAT")?),
                Some(2360.0),
            )
            .telescope(Some("Lowell Discovery Telescope"))
            .instrument(Some("Large Monolithic Imager"))
            .begin(Some(required_datetime(header, "DATE-OBS")?))
            .duration(Some(required_f64(header, "EXPTIME")?))
            .filter_name(header.get_str("FILTER"))
            .build()
    }
}
