//! # specube
//!
//! Memory-bounded analysis of **spectral data cubes** stored as FITS images:
//! two celestial axes plus one spectral axis (frequency, velocity or
//! wavelength).
//!
//! Cubes are opened lazily from a local path or URL and read channel by
//! channel through a [`ChunkStore`](source::chunks::ChunkStore). Only the
//! planes a reduction needs are ever held in memory.
//!
//! ## Features
//!
//! - **Regions and masks**: ellipses, boxes and polygons in pixel or sky
//!   coordinates, velocity ranges, thresholds and composites ([`region`])
//! - **Sub-cubes**: AND-combined masks trimmed to their bounding box ([`subcube`])
//! - **Position–velocity diagrams** along widened polylines ([`pv`])
//! - **Moment maps** 0/1/2, linewidths and peak maps ([`moment`])
//! - **Model fitting**: 1D/2D Gaussians by Levenberg–Marquardt with
//!   covariance-based uncertainties ([`fit`])
//! - **Reprojection** onto a new celestial grid ([`reproject`])
//! - **Products**: 2D images written as FITS, or PNG with the `image` feature
//!
//! ## Example
//!
//! ```no_run
//! use specube::{moment, open, Region, SourceConfig, SpectralRange, SpectralUnit};
//!
//! let cube = open("data/ngc1333_13co.fits", &SourceConfig::default()).unwrap();
//!
//! // Keep an ellipse around the core and the 5-12 km/s slab
//! let sub = specube::subcube::apply_regions(
//!     &cube,
//!     &[
//!         Region::pixel_ellipse(64.0, 64.0, 20.0, 12.0, 30f64.to_radians()),
//!         Region::velocity_range(5.0, 12.0, SpectralUnit::KilometersPerSecond),
//!     ],
//! )
//! .unwrap();
//!
//! let m0 = moment::moment(&sub, 0, SpectralRange::all(SpectralUnit::KilometersPerSecond)).unwrap();
//! m0.write_fits("mom0.fits").unwrap();
//! ```
//!
//! ## Conventions
//!
//! - Array data is indexed `(channel, y, x)`; WCS axes are in FITS order
//!   (axis 0 is x).
//! - Pixel coordinates in the API are 0-based. Headers keep the 1-based
//!   FITS CRPIX convention.
//! - Blanked or masked voxels read as NaN and are skipped by reductions.
//!

pub mod cube;
pub mod error;
pub mod fit;
pub mod fits;
pub mod mask;
pub mod moment;
pub mod path;
pub mod product;
pub mod pv;
pub mod region;
pub mod reproject;
pub mod source;
pub mod subcube;
pub mod wcs;

pub use cube::{Beam, Cube, CubeMeta, Window};
pub use error::{CubeError, Result, Stage};
pub use fit::{fit, fit_image, fit_spectrum, FitConfig, FitResult, Model, NanPolicy};
pub use mask::CubeMask;
pub use moment::SpectralRange;
pub use path::{Path, PathFrame};
pub use product::Image2d;
pub use pv::PvDiagram;
pub use region::{Length, Position, Region};
pub use reproject::{parse_target, reproject, reproject_with, Interpolation, ReprojectConfig, TargetHeader};
pub use source::{open, open_hdu, FetchConfig, Locator, Scheduler, SourceConfig};
pub use wcs::{CoordinateSystem, RestValue, SpectralUnit, VelocityConvention};
