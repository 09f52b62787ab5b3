#![warn(missing_docs)]

//! Upload processing pipeline of the Trailblazer FITS catalogue. \
//! An uploaded file is probed, handed to the highest-priority processor claiming it,
//! its header metadata and WCS are standardized into a uniform schema, preview images are
//! rendered, and everything is persisted in a single transaction before any bytes reach the
//! blob store.
//!
//! ## Interface
//! The central struct of this library is [`Pipeline`]. It owns the processor and standardizer
//! registries, the WCS standardizer with its plate-solver fallback, the thumbnail settings
//! and handles to the [`Persistence`](persistence::Persistence) and
//! [`BlobStore`](blob::BlobStore) collaborators.
//! Additional parameters are set via `Pipeline::with_*()` functions.
//!
//! Example:
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use trailblazer::{Pipeline, Upload, blob::MemoryBlobStore, persistence::MemoryStore};
//! let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), Arc::new(MemoryBlobStore::new()))
//!     .unwrap();
//! let report = pipeline.process(Upload::new("frame.fits", std::fs::read("frame.fits").unwrap()));
//! println!("{:?}", report.state);
//! ```
//!
//! ## Registries
//! Processors and metadata standardizers are registered explicitly in
//! [`processors::default_registry()`] and [`standardizers::default_registry()`].
//! Lookup picks the highest priority among the handlers claiming an input, ties going to the
//! handler registered first.
//!
//! ## Features
//! - `parallel` (default): per-detector WCS standardization and thumbnail resampling use `rayon`.
//! - `astrometry-net`: enables the nova.astrometry.net plate-solver client.

pub mod blob;
pub mod config;
pub mod coordinates;
pub mod error;
pub mod fits;
pub mod focal_plane;
pub mod metadata;
pub mod persistence;
pub mod pipeline;
pub mod processors;
pub mod registry;
pub mod solver;
pub mod standardizers;
pub mod thumbnail;
pub mod upload;
pub mod wcs;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::ProcessError;
pub use metadata::StandardizedMetadata;
pub use pipeline::{Pipeline, ProcessReport, UploadState};
pub use upload::Upload;
pub use wcs::{StandardizedWcs, Wcs};

/// A generic float trait such that the coordinate math is generic over `f32`/`f64`.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes `f32` and `f64`.
pub trait Float: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}

impl<F> Float for F where F: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}
