//! 2D products: PV diagrams and moment maps.
//!
//! An [`Image2d`] owns its pixel data and carries a 2-axis coordinate system,
//! so it can be written to a single-HDU FITS file and read back through the
//! same header parser used for cubes.

use std::path::Path;

use ndarray::Array2;
use tracing::info;

use crate::cube::Beam;
use crate::error::{CubeError, Result, Stage};
use crate::fits::{self, Header, ImageReader};
use crate::wcs::CoordinateSystem;

/// Image indexed `(row, col)`: rows run along WCS axis 2, columns along axis 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Image2d {
    data: Array2<f32>,
    wcs: CoordinateSystem,
    unit: String,
    beam: Option<Beam>,
}

impl Image2d {
    pub fn new(data: Array2<f32>, wcs: CoordinateSystem, unit: impl Into<String>) -> Result<Self> {
        if wcs.naxis() != 2 {
            return Err(CubeError::shape(
                Stage::Header,
                format!("2D product needs a 2-axis coordinate system, got {}", wcs.naxis()),
            ));
        }
        Ok(Self {
            data,
            wcs,
            unit: unit.into(),
            beam: None,
        })
    }

    pub fn with_beam(mut self, beam: Option<Beam>) -> Self {
        self.beam = beam;
        self
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn into_data(self) -> Array2<f32> {
        self.data
    }

    pub fn wcs(&self) -> &CoordinateSystem {
        &self.wcs
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn beam(&self) -> Option<Beam> {
        self.beam
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Header carrying WCS, BUNIT and beam keywords.
    pub fn to_header(&self) -> Header {
        let mut h = self.wcs.to_header();
        if !self.unit.is_empty() {
            h.set("BUNIT", self.unit.as_str());
        }
        if let Some(b) = self.beam {
            h.set("BMAJ", b.major_deg);
            h.set("BMIN", b.minor_deg);
            h.set("BPA", b.pa_deg);
        }
        h
    }

    /// Write as a single-HDU float32 FITS image.
    pub fn write_fits(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let (rows, cols) = self.shape();
        let values: Vec<f32> = self.data.iter().copied().collect();
        fits::write_image(path, &self.to_header(), &[cols, rows], &values)?;
        info!("Wrote {}x{} image to {}", cols, rows, path.display());
        Ok(())
    }

    /// Read the first 2D image HDU of a FITS file.
    pub fn from_fits(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let hdus = fits::read_hdus(path)?;
        let hdu = hdus
            .iter()
            .find(|h| h.is_image() && h.header.get_i64("NAXIS") == Some(2))
            .ok_or_else(|| {
                CubeError::format(
                    Stage::SourceOpen,
                    format!("{} has no 2D image HDU", path.display()),
                )
            })?;
        let header = &hdu.header;
        let cols = header.require_i64("NAXIS1")?.max(0) as usize;
        let rows = header.require_i64("NAXIS2")?.max(0) as usize;

        let reader = ImageReader::open(path, hdu)?;
        let values = reader.read_elements(0, rows * cols)?;
        let data = Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| CubeError::shape(Stage::SourceOpen, e.to_string()))?;

        let wcs = CoordinateSystem::from_header(header)?;
        let beam = match (header.get_f64("BMAJ"), header.get_f64("BMIN")) {
            (Some(major_deg), Some(minor_deg)) => Some(Beam {
                major_deg,
                minor_deg,
                pa_deg: header.get_f64("BPA").unwrap_or(0.0),
            }),
            _ => None,
        };
        let unit = header.get_str("BUNIT").unwrap_or("").trim().to_string();
        Ok(Self::new(data, wcs, unit)?.with_beam(beam))
    }

    /// Write an 8-bit grayscale PNG with a linear min/max stretch.
    ///
    /// Row 0 of the data is drawn at the bottom, NaN pixels are black.
    #[cfg(feature = "image")]
    pub fn write_png(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let (rows, cols) = self.shape();
        let (lo, hi) = self
            .data
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let span = if hi > lo { hi - lo } else { 1.0 };

        let mut pixels = Vec::with_capacity(rows * cols);
        for row in self.data.outer_iter().rev() {
            pixels.extend(row.iter().map(|&v| {
                if v.is_finite() {
                    (((v - lo) / span) * 255.0).round().clamp(0.0, 255.0) as u8
                } else {
                    0
                }
            }));
        }
        let img = image::GrayImage::from_raw(cols as u32, rows as u32, pixels)
            .ok_or_else(|| CubeError::shape(Stage::Write, "PNG buffer size mismatch"))?;
        img.save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| CubeError::io_msg(Stage::Write, format!("{}: {e}", path.display())))?;
        info!("Wrote quicklook {}", path.display());
        Ok(())
    }
}
