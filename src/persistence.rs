//! Record store of processed uploads.
//!
//! Rows form a tree: upload info → metadata → WCS → thumbnails. Everything an upload produces
//! is inserted through one [`Transaction`] and becomes visible only on commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::metadata::StandardizedMetadata;
use crate::thumbnail::ThumbnailPair;
use crate::upload::UploadInfo;
use crate::wcs::StandardizedWcs;

/// A stored record with its id and the id of the row it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row<T> {
    /// Id of the row, unique across tables.
    pub id: u64,
    /// Id of the parent row, `None` for upload infos.
    pub parent: Option<u64>,
    /// The record.
    pub record: T,
}

/// Table names used in [`PersistenceError::UnknownReference`].
const UPLOAD_INFO: &str = "upload_info";
const METADATA: &str = "metadata";
const WCS: &str = "wcs";

/// A unit of work. Dropping it without [`commit`](Transaction::commit()) rolls it back.
pub trait Transaction {
    /// Stage the bookkeeping record of an upload.
    fn insert_upload_info(&mut self, info: &UploadInfo) -> Result<u64, PersistenceError>;

    /// Stage a metadata row of the upload info `upload_info`.
    fn insert_metadata(
        &mut self,
        upload_info: u64,
        metadata: &StandardizedMetadata,
    ) -> Result<u64, PersistenceError>;

    /// Stage a WCS row of the metadata row `metadata`.
    fn insert_wcs(&mut self, metadata: u64, wcs: &StandardizedWcs) -> Result<u64, PersistenceError>;

    /// Stage a thumbnail row of the WCS row `wcs`.
    fn insert_thumbnail(&mut self, wcs: u64, thumbnail: &ThumbnailPair) -> Result<u64, PersistenceError>;

    /// Make the staged rows visible.
    fn commit(self: Box<Self>) -> Result<(), PersistenceError>;

    /// Discard the staged rows.
    fn rollback(self: Box<Self>);
}

/// The record store.
pub trait Persistence: Send + Sync {
    /// Start a transaction.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, PersistenceError>;

    /// Committed metadata rows matching `predicate`, in insertion order.
    fn query_metadata(
        &self,
        predicate: &dyn Fn(&StandardizedMetadata) -> bool,
    ) -> Result<Vec<Row<StandardizedMetadata>>, PersistenceError>;
}

#[derive(Debug, Default)]
struct Tables {
    upload_info: BTreeMap<u64, Row<UploadInfo>>,
    metadata: BTreeMap<u64, Row<StandardizedMetadata>>,
    wcs: BTreeMap<u64, Row<StandardizedWcs>>,
    thumbnails: BTreeMap<u64, Row<ThumbnailPair>>,
}

impl Tables {
    fn is_empty(&self) -> bool {
        self.upload_info.is_empty()
            && self.metadata.is_empty()
            && self.wcs.is_empty()
            && self.thumbnails.is_empty()
    }

    fn merge(&mut self, other: Tables) {
        self.upload_info.extend(other.upload_info);
        self.metadata.extend(other.metadata);
        self.wcs.extend(other.wcs);
        self.thumbnails.extend(other.thumbnails);
    }
}

/// Row counts of a [`MemoryStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableCounts {
    /// Upload infos.
    pub upload_info: usize,
    /// Metadata rows.
    pub metadata: usize,
    /// WCS rows.
    pub wcs: usize,
    /// Thumbnail rows.
    pub thumbnails: usize,
}

/// In-memory [`Persistence`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows per table.
    pub fn counts(&self) -> TableCounts {
        let tables = self.tables.lock();
        TableCounts {
            upload_info: tables.upload_info.len(),
            metadata: tables.metadata.len(),
            wcs: tables.wcs.len(),
            thumbnails: tables.thumbnails.len(),
        }
    }

    /// Committed WCS rows, in insertion order.
    pub fn wcs(&self) -> Vec<Row<StandardizedWcs>> {
        self.tables.lock().wcs.values().cloned().collect()
    }

    /// Committed thumbnail rows, in insertion order.
    pub fn thumbnails(&self) -> Vec<Row<ThumbnailPair>> {
        self.tables.lock().thumbnails.values().cloned().collect()
    }

    /// Committed upload infos, in insertion order.
    pub fn upload_infos(&self) -> Vec<Row<UploadInfo>> {
        self.tables.lock().upload_info.values().cloned().collect()
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Persistence for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, PersistenceError> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            staged: Tables::default(),
            finished: false,
        }))
    }

    fn query_metadata(
        &self,
        predicate: &dyn Fn(&StandardizedMetadata) -> bool,
    ) -> Result<Vec<Row<StandardizedMetadata>>, PersistenceError> {
        Ok(self
            .tables
            .lock()
            .metadata
            .values()
            .filter(|row| predicate(&row.record))
            .cloned()
            .collect())
    }
}

/// Transaction of a [`MemoryStore`], staging rows until commit.
struct MemoryTransaction<'s> {
    store: &'s MemoryStore,
    staged: Tables,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn check(
        &self,
        table: &'static str,
        id: u64,
        exists: impl Fn(&Tables) -> bool,
    ) -> Result<(), PersistenceError> {
        if exists(&self.staged) || exists(&*self.store.tables.lock()) {
            Ok(())
        } else {
            Err(PersistenceError::UnknownReference { table, id })
        }
    }

    fn row<T>(&self, parent: Option<u64>, record: &T) -> Row<T>
    where
        T: Clone,
    {
        Row {
            id: self.store.allocate(),
            parent,
            record: record.clone(),
        }
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn insert_upload_info(&mut self, info: &UploadInfo) -> Result<u64, PersistenceError> {
        let row = self.row(None, info);
        let id = row.id;
        self.staged.upload_info.insert(id, row);
        Ok(id)
    }

    fn insert_metadata(
        &mut self,
        upload_info: u64,
        metadata: &StandardizedMetadata,
    ) -> Result<u64, PersistenceError> {
        self.check(UPLOAD_INFO, upload_info, |t| t.upload_info.contains_key(&upload_info))?;
        let row = self.row(Some(upload_info), metadata);
        let id = row.id;
        self.staged.metadata.insert(id, row);
        Ok(id)
    }

    fn insert_wcs(&mut self, metadata: u64, wcs: &StandardizedWcs) -> Result<u64, PersistenceError> {
        self.check(METADATA, metadata, |t| t.metadata.contains_key(&metadata))?;
        let row = self.row(Some(metadata), wcs);
        let id = row.id;
        self.staged.wcs.insert(id, row);
        Ok(id)
    }

    fn insert_thumbnail(&mut self, wcs: u64, thumbnail: &ThumbnailPair) -> Result<u64, PersistenceError> {
        self.check(WCS, wcs, |t| t.wcs.contains_key(&wcs))?;
        let row = self.row(Some(wcs), thumbnail);
        let id = row.id;
        self.staged.thumbnails.insert(id, row);
        Ok(id)
    }

    fn commit(mut self: Box<Self>) -> Result<(), PersistenceError> {
        let staged = std::mem::take(&mut self.staged);
        self.store.tables.lock().merge(staged);
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        self.staged = Tables::default();
        self.finished = true;
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.staged.is_empty() {
            debug!("Rolling back an uncommitted transaction.");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use nalgebra::Vector3;

    use super::*;

    fn metadata(instrument: &str) -> StandardizedMetadata {
        let begin = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        StandardizedMetadata {
            processor_name: "SingleExtensionFits".to_string(),
            standardizer_name: "common_keywords_standardizer".to_string(),
            instrument: Some(instrument.to_string()),
            telescope: None,
            science_program: None,
            observatory_longitude: 1.,
            observatory_latitude: 2.,
            observatory_height: 3.,
            exposure_begin: begin,
            exposure_end: begin,
            exposure_duration: Some(0.),
            filter_name: None,
        }
    }

    fn wcs() -> StandardizedWcs {
        StandardizedWcs::from_vectors(Vector3::x(), Vector3::y())
    }

    fn pair() -> ThumbnailPair {
        ThumbnailPair {
            small_image_path: "s.jpg".to_string(),
            large_image_path: "l.jpg".to_string(),
        }
    }

    #[test]
    fn commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let info = tx.insert_upload_info(&UploadInfo::default()).unwrap();
        let meta = tx.insert_metadata(info, &metadata("DECam")).unwrap();
        let wcs_id = tx.insert_wcs(meta, &wcs()).unwrap();
        tx.insert_thumbnail(wcs_id, &pair()).unwrap();
        assert_eq!(store.counts(), TableCounts::default());

        tx.commit().unwrap();
        assert_eq!(
            store.counts(),
            TableCounts { upload_info: 1, metadata: 1, wcs: 1, thumbnails: 1 }
        );
        assert_eq!(store.wcs()[0].parent, Some(meta));
        assert_eq!(store.thumbnails()[0].parent, Some(wcs_id));
    }

    #[test]
    fn rollback_and_drop_discard_rows() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.insert_upload_info(&UploadInfo::default()).unwrap();
        tx.rollback();

        {
            let mut tx = store.begin().unwrap();
            tx.insert_upload_info(&UploadInfo::default()).unwrap();
        }
        assert_eq!(store.counts(), TableCounts::default());
    }

    #[test]
    fn references_must_exist() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        assert!(matches!(
            tx.insert_metadata(99, &metadata("x")),
            Err(PersistenceError::UnknownReference { table: "upload_info", id: 99 })
        ));

        let info = tx.insert_upload_info(&UploadInfo::default()).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let meta = tx.insert_metadata(info, &metadata("x")).unwrap();
        assert!(tx.insert_wcs(meta, &wcs()).is_ok());
        assert!(tx.insert_thumbnail(meta, &pair()).is_err());
    }

    #[test]
    fn query() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let info = tx.insert_upload_info(&UploadInfo::default()).unwrap();
        for instrument in ["DECam", "LBC", "DECam"] {
            tx.insert_metadata(info, &metadata(instrument)).unwrap();
        }
        tx.commit().unwrap();

        let decam = store
            .query_metadata(&|m| m.instrument.as_deref() == Some("DECam"))
            .unwrap();
        assert_eq!(decam.len(), 2);
        assert!(decam.iter().all(|row| row.parent == Some(info)));
        assert_eq!(store.query_metadata(&|_| true).unwrap().len(), 3);
    }
}
