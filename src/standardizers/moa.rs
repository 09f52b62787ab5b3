use crate::error::StandardizeError;
use crate::fits::Header;
use crate::metadata::{
    MetadataBuilder, MetadataStandardizer, StandardizedMetadata, ensure_utc, julian_to_utc,
    required_f64,
};
use crate::registry::Handler;
use crate::wcs::WcsStrategy;

use super::{contains_ignore_case, text};

/// MOA-II at Mt John Observatory. Header WCS is not trusted.
#[derive(Clone, Copy, Debug, Default)]
pub struct MoaStandardizer;

impl Handler<Header> for MoaStandardizer {
    fn name(&self) -> &'static str {
        "moa_standardizer"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, header: &Header) -> bool {
        contains_ignore_case(header, "OBSTEL", "MOA")
    }
}

impl MetadataStandardizer for MoaStandardizer {
    fn standardize_metadata(&self, header: &Header) -> Result<StandardizedMetadata, StandardizeError> {
        if !header.contains("TIMESYS") {
            return Err(StandardizeError::MissingRequiredField("TIMESYS".to_string()));
        }
        ensure_utc(header)?;

        let part = |key: &str| {
            text(header, key)
                .map(|t| t.trim().to_string())
                .ok_or_else(|| StandardizeError::MissingRequiredField(key.to_string()))
        };
        let program = [part("RUN")?, part("FIELD")?, part("COLOUR")?, part("CHIP")?].join("-");
        let begin = julian_to_utc(required_f64(header, "JDSTART")?)
            .ok_or_else(|| StandardizeError::MissingRequiredField("JDSTART".to_string()))?;

        MetadataBuilder::new(self.name())
            .location(
                Some(required_f64(header, "LOGITUD")?),
                Some(required_f64(header, "LATITUD")?),
                Some(required_f64(header, "HEIGHT")?),
            )
            .telescope(header.get_str("OBSTEL"))
            .instrument(header.get_str("CAMERA"))
            .science_program(Some(program))
            .begin(Some(begin))
            .duration(Some(required_f64(header, "EXPTIME")?))
            .filter_name(header.get_str("COLOUR"))
            .build()
    }

    fn wcs_strategy(&self) -> WcsStrategy {
        WcsStrategy::SolverOnly
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::standardizers::samples;

    #[test]
    fn standardize() {
        let meta = MoaStandardizer.standardize_metadata(&samples::moa()).unwrap();
        let begin = Utc.with_ymd_and_hms(2017, 9, 4, 0, 0, 0).unwrap();
        assert_eq!(meta.exposure_begin, begin);
        assert_eq!(meta.exposure_end, begin + TimeDelta::seconds(60));
        assert_eq!(meta.science_program.as_deref(), Some("A1234-gb5-R-10"));
        assert_eq!(meta.instrument.as_deref(), Some("MOA-cam3"));
        assert_eq!(meta.telescope.as_deref(), Some("MOA-II 1.8m"));
        assert_eq!(MoaStandardizer.wcs_strategy(), WcsStrategy::SolverOnly);
    }

    #[test]
    fn time_system_is_checked() {
        let header = samples::moa().with("TIMESYS", "TDB");
        assert!(matches!(
            MoaStandardizer.standardize_metadata(&header),
            Err(StandardizeError::UnsupportedTimeSystem(s)) if s == "TDB"
        ));
    }
}
