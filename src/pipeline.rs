//! Processing of single uploads, from raw bytes to committed records and stored previews.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::{Config, ThumbnailConfig};
use crate::error::{ConfigError, PersistenceError, ProcessError, RegistryError, WcsError};
use crate::fits::{FitsFile, Hdu};
use crate::metadata::StandardizedMetadata;
use crate::persistence::{Persistence, Transaction};
use crate::processors::{self, ProcessorRegistry, UploadProcessor, extension_header};
use crate::solver::{PlateSolver, UnconfiguredSolver, solver_from_config};
use crate::standardizers::{self, StandardizerRegistry, standardize};
use crate::thumbnail::{EncodedThumbnails, ThumbnailPair};
use crate::upload::{ParsedUpload, Upload};
use crate::wcs::{StandardizedWcs, WcsStandardizer, WcsStrategy};

/// Progress of an upload through the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum UploadState {
    /// Accepted, nothing done yet.
    Received,
    /// The file structure was read and a processor chosen.
    Parsed,
    /// Header metadata was standardized.
    MetadataStandardized,
    /// Every science extension has a standardized WCS.
    WcsStandardized,
    /// The previews were rendered.
    ThumbnailsComposed,
    /// The records were committed.
    Persisted,
    /// Processing stopped, nothing was committed.
    Failed {
        /// Description of the error.
        reason: String,
    },
}

/// Outcome of processing one upload.
#[derive(Debug, Serialize)]
pub struct ProcessReport {
    /// Id of the upload.
    pub upload_id: Uuid,
    /// Name of the uploaded file.
    pub filename: String,
    /// State reached.
    pub state: UploadState,
    /// Name of the processor that claimed the upload.
    pub processor: Option<String>,
    /// Name of the metadata standardizer used.
    pub standardizer: Option<String>,
    /// The standardized metadata.
    pub metadata: Option<StandardizedMetadata>,
    /// One record per science extension.
    pub wcs: Vec<StandardizedWcs>,
    /// Blob-store locations of the previews.
    pub thumbnails: Vec<ThumbnailPair>,
    /// Blob writes that failed after the records were committed.
    pub blob_errors: Vec<String>,
    /// The error that stopped processing.
    #[serde(skip)]
    pub error: Option<ProcessError>,
}

impl ProcessReport {
    fn new(upload: &Upload) -> Self {
        Self {
            upload_id: upload.info.id,
            filename: upload.filename.clone(),
            state: UploadState::Received,
            processor: None,
            standardizer: None,
            metadata: None,
            wcs: Vec::new(),
            thumbnails: Vec::new(),
            blob_errors: Vec::new(),
            error: None,
        }
    }

    /// Whether the records of the upload were committed.
    pub fn is_persisted(&self) -> bool {
        self.state == UploadState::Persisted
    }
}

/// Records of one upload, ready to be committed.
struct Records {
    metadata: StandardizedMetadata,
    wcs: Vec<StandardizedWcs>,
    thumbnails: Vec<(ThumbnailPair, EncodedThumbnails)>,
}

/// The upload processing pipeline.
///
/// Stages run in order: parse, processor dispatch, metadata standardization, WCS
/// standardization, thumbnail rendering, a single persistence transaction and finally the
/// blob writes. An upload failing any stage before the commit leaves no rows and no blobs.
pub struct Pipeline {
    processors: ProcessorRegistry,
    standardizers: StandardizerRegistry,
    wcs: WcsStandardizer,
    thumbnails: ThumbnailConfig,
    data_root: String,
    persistence: Arc<dyn Persistence>,
    blobs: Arc<dyn BlobStore>,
}

impl Pipeline {
    /// Create a pipeline with every shipped processor and standardizer and no plate solver.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, RegistryError> {
        let config = Config::default();
        Ok(Self {
            processors: processors::default_registry()?,
            standardizers: standardizers::default_registry()?,
            wcs: WcsStandardizer::new(Arc::new(UnconfiguredSolver)),
            thumbnails: config.thumbnails,
            data_root: config.data_root,
            persistence,
            blobs,
        })
    }

    /// Create a pipeline from the [validated](Config::validate()) configuration, including its
    /// plate solver.
    pub fn from_config(
        config: &Config,
        persistence: Arc<dyn Persistence>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(persistence, blobs)?
            .with_solver(solver_from_config(&config.astrometry))
            .with_solve_timeout(Duration::from_secs(config.astrometry.solve_timeout_secs))
            .with_thumbnail_config(config.thumbnails.clone())
            .with_data_root(config.data_root.clone()))
    }

    /// Replace the processor registry.
    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    /// Replace the metadata standardizer registry.
    pub fn with_standardizers(mut self, standardizers: StandardizerRegistry) -> Self {
        self.standardizers = standardizers;
        self
    }

    /// Set the plate solver consulted for images without a usable WCS.
    pub fn with_solver(mut self, solver: Arc<dyn PlateSolver>) -> Self {
        self.wcs = WcsStandardizer::new(solver).with_timeout(self.wcs.timeout());
        self
    }

    /// Set the time granted to each plate-solver call.
    pub fn with_solve_timeout(mut self, timeout: Duration) -> Self {
        self.wcs = self.wcs.with_timeout(timeout);
        self
    }

    /// Set the preview settings.
    pub fn with_thumbnail_config(mut self, thumbnails: ThumbnailConfig) -> Self {
        self.thumbnails = thumbnails;
        self
    }

    /// Set the blob-store directory of the original uploads.
    pub fn with_data_root(mut self, data_root: impl Into<String>) -> Self {
        self.data_root = data_root.into();
        self
    }

    /// Blob-store path of the original file of `upload`.
    pub fn upload_path(&self, upload: &Upload) -> String {
        format!("{}/{}/{}", self.data_root, upload.info.id, upload.filename)
    }

    /// Process one upload.
    ///
    /// Never fails as a whole: errors end up in the [`ProcessReport`] as
    /// [`UploadState::Failed`]. A panic in any stage is reported as [`ProcessError::Internal`].
    pub fn process(&self, upload: Upload) -> ProcessReport {
        let mut report = ProcessReport::new(&upload);
        info!("[{}] Processing {}.", report.upload_id, upload.filename);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(&upload, &mut report)))
            .unwrap_or_else(|payload| Err(ProcessError::Internal(panic_message(payload.as_ref()))));
        match outcome {
            Ok(thumbnails) => {
                self.store_blobs(&upload, &thumbnails, &mut report);
                info!(
                    "[{}] Stored {} WCS and {} thumbnail records.",
                    report.upload_id,
                    report.wcs.len(),
                    report.thumbnails.len()
                );
            }
            Err(e) => {
                error!("[{}] {} failed: {e}", report.upload_id, upload.filename);
                report.state = UploadState::Failed { reason: e.to_string() };
                report.wcs.clear();
                report.thumbnails.clear();
                report.error = Some(e);
            }
        }
        report
    }

    /// Process uploads one after another.
    pub fn process_batch(&self, uploads: impl IntoIterator<Item = Upload>) -> Vec<ProcessReport> {
        let reports: Vec<_> = uploads.into_iter().map(|u| self.process(u)).collect();
        let persisted = reports.iter().filter(|r| r.is_persisted()).count();
        info!("Persisted {persisted} of {} uploads.", reports.len());
        reports
    }

    /// Every stage up to the commit. Returns the encoded previews still to be stored.
    fn run(
        &self,
        upload: &Upload,
        report: &mut ProcessReport,
    ) -> Result<Vec<(ThumbnailPair, EncodedThumbnails)>, ProcessError> {
        let fits = upload.parse().map_err(ProcessError::CorruptFile)?;
        let input = ParsedUpload {
            upload: upload.clone(),
            fits,
        };
        let processor = self
            .processors
            .resolve(&input)
            .map_err(ProcessError::NoHandlerFound)?;
        debug!("[{}] Claimed by {}.", report.upload_id, processor.name());
        report.processor = Some(processor.name().to_string());
        report.state = UploadState::Parsed;

        let fits = &input.fits;
        let extensions = processor.science_extensions(fits);
        if extensions.is_empty() {
            return Err(ProcessError::NoImages(processor.name()));
        }

        info!("[{}] Standardizing header.", report.upload_id);
        let (standardizer, mut metadata) =
            standardize(&self.standardizers, &processor.metadata_header(fits))?;
        metadata.processor_name = processor.name().to_string();
        report.standardizer = Some(standardizer.name().to_string());
        report.metadata = Some(metadata.clone());
        report.state = UploadState::MetadataStandardized;

        info!("[{}] Standardizing WCS of {} extensions.", report.upload_id, extensions.len());
        let wcs = self.standardize_wcs(fits, &extensions, standardizer.wcs_strategy())?;
        report.wcs = wcs.clone();
        report.state = UploadState::WcsStandardized;

        info!("[{}] Composing thumbnails.", report.upload_id);
        let thumbnails = self.compose_thumbnails(processor, fits, &extensions, upload)?;
        report.thumbnails = thumbnails.iter().map(|(pair, _)| pair.clone()).collect();
        report.state = UploadState::ThumbnailsComposed;

        let records = Records {
            metadata,
            wcs,
            thumbnails,
        };
        self.persist(upload, &records)?;
        report.state = UploadState::Persisted;
        Ok(records.thumbnails)
    }

    /// One WCS record per science extension, in extension order.
    fn standardize_wcs(
        &self,
        fits: &FitsFile,
        extensions: &[&Hdu],
        strategy: WcsStrategy,
    ) -> Result<Vec<StandardizedWcs>, WcsError> {
        let standardize = |hdu: &&Hdu| -> Result<StandardizedWcs, WcsError> {
            let (rows, cols) = match hdu.shape() {
                Some(shape) => shape,
                None => fits.image(hdu)?.dim(),
            };
            let header = extension_header(fits, hdu);
            self.wcs
                .standardize(&header, cols, rows, strategy, || fits.image(hdu))
        };

        #[cfg(feature = "parallel")]
        return extensions.par_iter().map(standardize).collect();
        #[cfg(not(feature = "parallel"))]
        return extensions.iter().map(standardize).collect();
    }

    fn compose_thumbnails(
        &self,
        processor: &dyn UploadProcessor,
        fits: &FitsFile,
        extensions: &[&Hdu],
        upload: &Upload,
    ) -> Result<Vec<(ThumbnailPair, EncodedThumbnails)>, ProcessError> {
        let encoded = processor.compose_thumbnails(fits, extensions, &self.thumbnails)?;
        Ok(encoded
            .into_iter()
            .map(|e| {
                let pair =
                    ThumbnailPair::new(&self.thumbnails, upload.info.id, &upload.basename, &e.suffix);
                (pair, e)
            })
            .collect())
    }

    /// Insert every record of the upload in one transaction.
    fn persist(&self, upload: &Upload, records: &Records) -> Result<(), PersistenceError> {
        let mut transaction = self.persistence.begin()?;
        match Self::insert(transaction.as_mut(), upload, records) {
            Ok(()) => transaction.commit(),
            Err(e) => {
                warn!("[{}] Rolling back: {e}", upload.info.id);
                transaction.rollback();
                Err(e)
            }
        }
    }

    fn insert(
        transaction: &mut dyn Transaction,
        upload: &Upload,
        records: &Records,
    ) -> Result<(), PersistenceError> {
        let info = transaction.insert_upload_info(&upload.info)?;
        let metadata = transaction.insert_metadata(info, &records.metadata)?;
        let wcs_ids = records
            .wcs
            .iter()
            .map(|wcs| transaction.insert_wcs(metadata, wcs))
            .collect::<Result<Vec<_>, _>>()?;

        for (pair, encoded) in &records.thumbnails {
            let wcs = wcs_ids.get(encoded.wcs_index).ok_or_else(|| {
                PersistenceError::Transaction(format!(
                    "thumbnail {} refers to WCS {} of {}",
                    pair.small_image_path,
                    encoded.wcs_index,
                    wcs_ids.len()
                ))
            })?;
            transaction.insert_thumbnail(*wcs, pair)?;
        }
        Ok(())
    }

    /// Write previews and the original file. Failures are reported but keep the records.
    fn store_blobs(
        &self,
        upload: &Upload,
        thumbnails: &[(ThumbnailPair, EncodedThumbnails)],
        report: &mut ProcessReport,
    ) {
        let original = self.upload_path(upload);
        let writes = thumbnails
            .iter()
            .flat_map(|(pair, encoded)| {
                [
                    (pair.small_image_path.as_str(), encoded.small.as_slice()),
                    (pair.large_image_path.as_str(), encoded.large.as_slice()),
                ]
            })
            .chain([(original.as_str(), upload.bytes())]);

        for (path, bytes) in writes {
            if let Err(e) = self.blobs.write(path, bytes) {
                error!("[{}] Could not store {path}: {e}", upload.info.id);
                report.blob_errors.push(format!("{path}: {e}"));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::coordinates::to_unit_sphere;
    use crate::error::{BlobError, FitsError, SolveError, StandardizeError, WcsError};
    use crate::fits::Header;
    use crate::focal_plane::{DecamLayout, FocalPlaneLayout};
    use crate::persistence::{MemoryStore, Row, TableCounts};
    use crate::processors::MOSAIC_SUFFIX;
    use crate::standardizers::samples;
    use crate::testing::{FitsBuilder, card};
    use crate::upload::UploadInfo;
    use crate::wcs::tests::{FixedSolver, tan_wcs_header};

    struct Fixture {
        store: Arc<MemoryStore>,
        blobs: Arc<MemoryBlobStore>,
        pipeline: Pipeline,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let pipeline = Pipeline::new(store.clone(), blobs.clone())
            .unwrap()
            .with_thumbnail_config(ThumbnailConfig {
                small_width: 32,
                mosaic_scaling: Some([64, 128]),
                ..ThumbnailConfig::default()
            });
        Fixture {
            store,
            blobs,
            pipeline,
        }
    }

    fn linear_wcs(header: Header, ra: f64, dec: f64, rows: usize, cols: usize) -> Header {
        header
            .with("CRPIX1", (cols / 2 + 1) as f64)
            .with("CRPIX2", (rows / 2 + 1) as f64)
            .with("CRVAL1", ra)
            .with("CRVAL2", dec)
            .with("CDELT1", -2.7e-4)
            .with("CDELT2", 2.7e-4)
    }

    fn ramp(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f32)
    }

    fn single_frame() -> Vec<u8> {
        let header = linear_wcs(samples::common(), 200., 87., 1024, 1024)
            .with("RA", 200.)
            .with("DEC", 87.);
        FitsBuilder::new().image(header, &ramp(1024, 1024)).build()
    }

    fn decam_frame() -> Vec<u8> {
        let mut builder = FitsBuilder::new().empty_primary(samples::common());
        for (i, label) in DecamLayout.labels().iter().enumerate() {
            let header = Header::new().with("DETPOS", label.as_str());
            let header = linear_wcs(header, 30. + i as f64 * 0.1, -20., 8, 4);
            builder = builder.image(header, &ramp(8, 4));
        }
        builder.build()
    }

    fn unsolved_frame() -> Vec<u8> {
        FitsBuilder::new().image(samples::common(), &ramp(20, 30)).build()
    }

    #[test]
    fn single_extension_with_linear_wcs() {
        let f = fixture();
        let upload = Upload::new("frame.fits", single_frame());
        let id = upload.info.id;
        let report = f.pipeline.process(upload);

        assert_eq!(report.state, UploadState::Persisted);
        assert_eq!(report.processor.as_deref(), Some("SingleExtensionFits"));
        assert_eq!(report.standardizer.as_deref(), Some("common_keywords_standardizer"));
        assert_eq!(
            f.store.counts(),
            TableCounts { upload_info: 1, metadata: 1, wcs: 1, thumbnails: 1 }
        );

        let metadata = f.store.query_metadata(&|_| true).unwrap();
        assert_eq!(metadata[0].record.processor_name, "SingleExtensionFits");

        let expected = to_unit_sphere(200_f64.to_radians(), 87_f64.to_radians());
        let wcs = f.store.wcs()[0].record;
        assert_abs_diff_eq!(wcs.center(), expected, epsilon = 1e-9);
        assert!(wcs.radius > 0.);

        let pair = &f.store.thumbnails()[0].record;
        assert_eq!(pair.small_image_path, format!("thumbnails/small/{id}/frame_small.jpg"));
        for path in [&pair.small_image_path, &pair.large_image_path] {
            assert!(f.blobs.exists(path).unwrap(), "{path} missing");
        }
        assert!(f.blobs.exists(&format!("upload/fits/{id}/frame.fits")).unwrap());
        assert!(report.blob_errors.is_empty());
    }

    #[test]
    fn decam_upload_gets_one_mosaic() {
        let f = fixture();
        let report = f.pipeline.process(Upload::new("c4d.fits.fz", decam_frame()));

        assert_eq!(report.state, UploadState::Persisted);
        assert_eq!(report.processor.as_deref(), Some("DECamCommunityFits"));
        let counts = f.store.counts();
        assert_eq!(counts.wcs, 62);
        assert_eq!(counts.thumbnails, 1);

        let pair = &f.store.thumbnails()[0];
        assert!(pair.record.large_image_path.ends_with(&format!("c4d{MOSAIC_SUFFIX}_large.jpg")));
        assert_eq!(pair.parent, Some(f.store.wcs()[0].id));
        assert_eq!(f.blobs.len(), 3);
    }

    #[test]
    fn missing_wcs_without_solver_leaves_nothing() {
        let f = fixture();
        let report = f.pipeline.process(Upload::new("frame.fits", unsolved_frame()));

        assert!(matches!(report.state, UploadState::Failed { .. }));
        assert!(matches!(report.error, Some(ProcessError::Wcs(WcsError::Unsolvable(_)))));
        assert_eq!(report.processor.as_deref(), Some("SingleExtensionFits"));
        assert_eq!(f.store.counts(), TableCounts::default());
        assert!(f.blobs.is_empty());
    }

    #[test]
    fn missing_wcs_is_plate_solved() {
        let solver = Arc::new(FixedSolver::new(|| Ok(tan_wcs_header(10., 20.))));
        let f = fixture();
        let pipeline = f.pipeline.with_solver(solver.clone());
        let report = pipeline.process(Upload::new("frame.fits", unsolved_frame()));

        assert_eq!(report.state, UploadState::Persisted);
        assert_eq!(solver.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(f.store.counts().wcs, 1);
    }

    #[test]
    fn solver_timeout_fails_the_upload() {
        let f = fixture();
        let pipeline = f
            .pipeline
            .with_solver(Arc::new(FixedSolver::new(|| Err(SolveError::Timeout))))
            .with_solve_timeout(Duration::from_secs(3));
        let report = pipeline.process(Upload::new("frame.fits", unsolved_frame()));

        assert!(matches!(
            report.error,
            Some(ProcessError::Wcs(WcsError::SolveTimeout(t))) if t == Duration::from_secs(3)
        ));
        assert_eq!(f.store.counts(), TableCounts::default());
    }

    #[test]
    fn solver_keeps_the_configured_timeout() {
        let f = fixture();
        let pipeline = f
            .pipeline
            .with_solve_timeout(Duration::from_secs(3))
            .with_solver(Arc::new(FixedSolver::new(|| Err(SolveError::Timeout))));
        let report = pipeline.process(Upload::new("frame.fits", unsolved_frame()));

        assert!(matches!(
            report.error,
            Some(ProcessError::Wcs(WcsError::SolveTimeout(t))) if t == Duration::from_secs(3)
        ));
    }

    fn crashing_solver() -> Result<Header, SolveError> {
        panic!("solver crashed")
    }

    #[test]
    fn a_panicking_upload_does_not_stop_the_batch() {
        let f = fixture();
        let pipeline = f.pipeline.with_solver(Arc::new(FixedSolver::new(crashing_solver)));
        let reports = pipeline.process_batch([
            Upload::new("first.fits", single_frame()),
            Upload::new("unsolved.fits", unsolved_frame()),
            Upload::new("last.fits", single_frame()),
        ]);

        assert!(reports[0].is_persisted());
        assert!(matches!(
            &reports[1].error,
            Some(ProcessError::Internal(message)) if message == "solver crashed"
        ));
        assert!(matches!(reports[1].state, UploadState::Failed { .. }));
        assert!(reports[2].is_persisted());
        assert_eq!(f.store.counts().upload_info, 2);
    }

    #[test]
    fn hostile_headers_fail_without_crashing() {
        let f = fixture();
        let huge_axes = FitsBuilder::new()
            .raw(
                vec![
                    card("SIMPLE", true),
                    card("BITPIX", -64),
                    card("NAXIS", 2),
                    card("NAXIS1", 2147483648i64),
                    card("NAXIS2", 2147483648i64),
                ],
                &[],
            )
            .build();
        let report = f.pipeline.process(Upload::new("huge.fits", huge_axes));
        assert!(matches!(report.error, Some(ProcessError::CorruptFile(_))));

        let mut truncated = single_frame();
        truncated.truncate(truncated.len() / 2);
        let report = f.pipeline.process(Upload::new("truncated.fits", truncated));
        assert!(matches!(
            report.error,
            Some(ProcessError::CorruptFile(FitsError::Truncated { hdu: 0, .. }))
        ));

        let header = samples::common().with("EXPTIME", 1e13);
        let bytes = FitsBuilder::new().image(header, &ramp(20, 30)).build();
        let report = f.pipeline.process(Upload::new("exposure.fits", bytes));
        assert!(matches!(
            report.error,
            Some(ProcessError::Metadata(StandardizeError::ExposureOutOfRange(_)))
        ));

        assert_eq!(f.store.counts(), TableCounts::default());
    }

    #[test]
    fn repeated_uploads_are_independent() {
        let f = fixture();
        let bytes = single_frame();
        let first = f.pipeline.process(Upload::new("frame.fits", bytes.clone()));
        let second = f.pipeline.process(Upload::new("frame.fits", bytes));

        assert!(first.is_persisted() && second.is_persisted());
        assert_ne!(first.upload_id, second.upload_id);
        assert_eq!(
            f.store.counts(),
            TableCounts { upload_info: 2, metadata: 2, wcs: 2, thumbnails: 2 }
        );
        let infos: Vec<u64> = f.store.upload_infos().iter().map(|r| r.id).collect();
        let parents: Vec<_> = f
            .store
            .query_metadata(&|_| true)
            .unwrap()
            .into_iter()
            .map(|r| r.parent)
            .collect();
        assert_eq!(parents, infos.into_iter().map(Some).collect::<Vec<_>>());
        assert_eq!(f.blobs.len(), 6);
    }

    #[test]
    fn corrupt_and_unclaimed_files() {
        let f = fixture();
        let reports = f.pipeline.process_batch([
            Upload::new("frame.fits", b"not a fits file".to_vec()),
            Upload::new("frame.txt", unsolved_frame()),
            Upload::new("frame.fits", single_frame()),
        ]);

        assert!(matches!(reports[0].error, Some(ProcessError::CorruptFile(_))));
        assert_eq!(reports[0].processor, None);
        assert!(matches!(reports[1].error, Some(ProcessError::NoHandlerFound(_))));
        assert!(reports[2].is_persisted());
        assert_eq!(f.store.counts().upload_info, 1);
    }

    #[test]
    fn unknown_instrument() {
        let f = fixture();
        let bytes = FitsBuilder::new().image(Header::new(), &ramp(10, 10)).build();
        let report = f.pipeline.process(Upload::new("frame.fits", bytes));

        assert!(matches!(report.error, Some(ProcessError::Metadata(_))));
        let reason = report.error.as_ref().unwrap().to_string();
        assert_eq!(report.state, UploadState::Failed { reason });
        assert_eq!(f.store.counts(), TableCounts::default());
    }

    /// Store whose transactions fail on the first thumbnail.
    struct FlakyStore(MemoryStore);

    struct FlakyTransaction<'s>(Box<dyn Transaction + 's>);

    impl Transaction for FlakyTransaction<'_> {
        fn insert_upload_info(&mut self, info: &UploadInfo) -> Result<u64, PersistenceError> {
            self.0.insert_upload_info(info)
        }

        fn insert_metadata(
            &mut self,
            upload_info: u64,
            metadata: &StandardizedMetadata,
        ) -> Result<u64, PersistenceError> {
            self.0.insert_metadata(upload_info, metadata)
        }

        fn insert_wcs(&mut self, metadata: u64, wcs: &StandardizedWcs) -> Result<u64, PersistenceError> {
            self.0.insert_wcs(metadata, wcs)
        }

        fn insert_thumbnail(&mut self, _: u64, _: &ThumbnailPair) -> Result<u64, PersistenceError> {
            Err(PersistenceError::Transaction("disk full".to_string()))
        }

        fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
            self.0.commit()
        }

        fn rollback(self: Box<Self>) {
            self.0.rollback()
        }
    }

    impl Persistence for FlakyStore {
        fn begin(&self) -> Result<Box<dyn Transaction + '_>, PersistenceError> {
            Ok(Box::new(FlakyTransaction(self.0.begin()?)))
        }

        fn query_metadata(
            &self,
            predicate: &dyn Fn(&StandardizedMetadata) -> bool,
        ) -> Result<Vec<Row<StandardizedMetadata>>, PersistenceError> {
            self.0.query_metadata(predicate)
        }
    }

    #[test]
    fn failed_insert_rolls_back_everything() {
        let store = Arc::new(FlakyStore(MemoryStore::new()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let pipeline = Pipeline::new(store.clone(), blobs.clone()).unwrap();
        let report = pipeline.process(Upload::new("frame.fits", single_frame()));

        assert!(matches!(report.error, Some(ProcessError::Persistence(_))));
        assert!(report.thumbnails.is_empty() && report.wcs.is_empty());
        assert_eq!(store.0.counts(), TableCounts::default());
        assert!(blobs.is_empty());
    }

    /// Blob store rejecting every write.
    struct ReadOnlyBlobs;

    impl BlobStore for ReadOnlyBlobs {
        fn write(&self, path: &str, _bytes: &[u8]) -> Result<(), BlobError> {
            Err(BlobError::InvalidPath(path.to_string()))
        }

        fn read(&self, path: &str) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::NotFound(path.to_string()))
        }

        fn delete(&self, _path: &str) -> Result<(), BlobError> {
            Ok(())
        }

        fn exists(&self, _path: &str) -> Result<bool, BlobError> {
            Ok(false)
        }
    }

    #[test]
    fn blob_failures_keep_the_records() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(store.clone(), Arc::new(ReadOnlyBlobs)).unwrap();
        let report = pipeline.process(Upload::new("frame.fits", single_frame()));

        assert!(report.is_persisted());
        assert_eq!(report.blob_errors.len(), 3);
        assert_eq!(store.counts().thumbnails, 1);
    }

    #[test]
    fn configured_paths() {
        let yaml = "data_root: raw\nthumbnails:\n  small_root: s\n  large_root: l\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let pipeline = Pipeline::from_config(&config, store, blobs.clone()).unwrap();
        let upload = Upload::new("frame.fits", single_frame());
        let id = upload.info.id;
        let report = pipeline.process(upload);

        assert!(report.is_persisted());
        assert_eq!(
            blobs.paths(),
            [
                format!("l/{id}/frame_large.jpg"),
                format!("raw/{id}/frame.fits"),
                format!("s/{id}/frame_small.jpg"),
            ]
        );
    }

    #[test]
    fn configured_roots_are_checked() {
        let mut config = Config::default();
        config.thumbnails.small_root = "/var/www/small".to_string();
        let result = Pipeline::from_config(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBlobStore::new()),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidRoot { key: "thumbnails.small_root", .. })
        ));
    }

    #[test]
    fn report_serializes() {
        let f = fixture();
        let report = f.pipeline.process(Upload::new("frame.fits", unsolved_frame()));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["filename"], "frame.fits");
        assert!(json["state"]["Failed"]["reason"].as_str().unwrap().contains("astrometry.net"));
        assert!(json.get("error").is_none());
    }
}
