//! Minimal pure-Rust FITS codec.
//!
//! Supports what the cube pipeline needs and nothing more:
//!
//! - walking the primary HDU and IMAGE extensions of a file,
//! - decoding big-endian image data for every standard `BITPIX`
//!   (8, 16, 32, 64, -32, -64) with `BSCALE`/`BZERO` scaling and `BLANK` → NaN,
//! - partial reads: any contiguous run of elements can be read without touching
//!   the rest of the data unit (one spectral plane, a block of rows, ...),
//! - writing single-HDU float32 images.
//!
//! Data are stored with NAXIS1 varying fastest, which matches the row-major
//! `(spectral, y, x)` layout used by [`Cube`](crate::Cube), so no axis flipping
//! is ever performed.

pub mod header;

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{CubeError, Result, Stage};
pub use header::{Card, Header, HeaderValue, BLOCK_LEN, CARD_LEN};

/// Location and structure of one header-data unit inside a file.
#[derive(Debug, Clone)]
pub struct HduInfo {
    pub header: Header,
    /// Byte offset of the first data byte.
    pub data_offset: u64,
    /// Unpadded data length in bytes.
    pub data_len: u64,
}

impl HduInfo {
    /// Whether this HDU holds image data (primary array or `IMAGE` extension).
    pub fn is_image(&self) -> bool {
        let naxis = self.header.get_i64("NAXIS").unwrap_or(0);
        if naxis == 0 {
            return false;
        }
        match self.header.get_str("XTENSION") {
            None => true,
            Some(x) => x.trim() == "IMAGE",
        }
    }
}

/// Read every HDU header of a FITS file, skipping over data units.
pub fn read_hdus(path: impl AsRef<Path>) -> Result<Vec<HduInfo>> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| {
        CubeError::io(Stage::SourceOpen, format!("cannot open {}", path.display()), e)
    })?;
    let file_len = file
        .metadata()
        .map_err(|e| CubeError::io(Stage::SourceOpen, format!("cannot stat {}", path.display()), e))?
        .len();

    let mut hdus = Vec::new();
    let mut offset = 0u64;
    while offset < file_len {
        let (header, header_len) = read_header_at(&mut file, offset, path)?;
        if hdus.is_empty() && header.get("SIMPLE").is_none() {
            return Err(CubeError::format(
                Stage::SourceOpen,
                format!("{} is not a FITS file (no SIMPLE keyword)", path.display()),
            ));
        }
        let data_len = data_unit_len(&header)?;
        let data_offset = offset + header_len;
        offset = data_offset + padded(data_len);
        hdus.push(HduInfo {
            header,
            data_offset,
            data_len,
        });
    }

    if hdus.is_empty() {
        return Err(CubeError::format(
            Stage::SourceOpen,
            format!("{} is empty", path.display()),
        ));
    }
    debug!("Read {} HDU(s) from {}", hdus.len(), path.display());
    Ok(hdus)
}

fn read_header_at(file: &mut File, offset: u64, path: &Path) -> Result<(Header, u64)> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| CubeError::io(Stage::SourceOpen, format!("seek in {}", path.display()), e))?;
    let mut raw = Vec::new();
    let mut block = [0u8; BLOCK_LEN];
    loop {
        file.read_exact(&mut block).map_err(|e| {
            CubeError::io(
                Stage::SourceOpen,
                format!("truncated header in {} at byte {}", path.display(), offset),
                e,
            )
        })?;
        raw.extend_from_slice(&block);
        let has_end = block
            .chunks(CARD_LEN)
            .any(|c| c.starts_with(b"END") && c[3..].iter().all(|&b| b == b' '));
        if has_end {
            break;
        }
    }
    let len = raw.len() as u64;
    Ok((Header::from_bytes(&raw), len))
}

fn data_unit_len(header: &Header) -> Result<u64> {
    let bitpix = header.require_i64("BITPIX")?;
    let naxis = header.get_i64("NAXIS").unwrap_or(0);
    if naxis == 0 {
        return Ok(0);
    }
    let mut count = 1u64;
    for i in 1..=naxis {
        count *= header.require_i64(&format!("NAXIS{i}"))?.max(0) as u64;
    }
    let pcount = header.get_i64("PCOUNT").unwrap_or(0).max(0) as u64;
    let gcount = header.get_i64("GCOUNT").unwrap_or(1).max(1) as u64;
    Ok((bitpix.unsigned_abs() / 8) * gcount * (pcount + count))
}

fn padded(len: u64) -> u64 {
    len.div_ceil(BLOCK_LEN as u64) * BLOCK_LEN as u64
}

// ── Image decoding ──────────────────────────────────────────────────────────

/// Pixel encoding of an image data unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLayout {
    pub bitpix: i64,
    /// Axis lengths in FITS order (NAXIS1 first).
    pub naxes: Vec<usize>,
    pub bscale: f64,
    pub bzero: f64,
    pub blank: Option<i64>,
}

impl ImageLayout {
    pub fn from_header(header: &Header) -> Result<Self> {
        let bitpix = header.require_i64("BITPIX")?;
        if !matches!(bitpix, 8 | 16 | 32 | 64 | -32 | -64) {
            return Err(CubeError::format(
                Stage::Header,
                format!("unsupported BITPIX {bitpix}"),
            ));
        }
        let naxis = header.require_i64("NAXIS")?;
        let naxes = (1..=naxis)
            .map(|i| header.require_i64(&format!("NAXIS{i}")).map(|n| n.max(0) as usize))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bitpix,
            naxes,
            bscale: header.get_f64("BSCALE").unwrap_or(1.0),
            bzero: header.get_f64("BZERO").unwrap_or(0.0),
            blank: header.get_i64("BLANK"),
        })
    }

    pub fn bytes_per_element(&self) -> usize {
        self.bitpix.unsigned_abs() as usize / 8
    }

    pub fn num_elements(&self) -> usize {
        self.naxes.iter().product()
    }

    /// Decode big-endian raw bytes into physical `f32` values.
    pub fn decode(&self, raw: &[u8], out: &mut [f32]) {
        let scale = |v: f64| (self.bzero + self.bscale * v) as f32;
        let blank = self.blank;
        let is_blank = |v: i64| blank == Some(v);
        let bpe = self.bytes_per_element();
        for (dst, b) in out.iter_mut().zip(raw.chunks_exact(bpe)) {
            *dst = match self.bitpix {
                8 => {
                    let v = b[0] as i64;
                    if is_blank(v) { f32::NAN } else { scale(v as f64) }
                }
                16 => {
                    let v = i16::from_be_bytes([b[0], b[1]]) as i64;
                    if is_blank(v) { f32::NAN } else { scale(v as f64) }
                }
                32 => {
                    let v = i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64;
                    if is_blank(v) { f32::NAN } else { scale(v as f64) }
                }
                64 => {
                    let mut a = [0u8; 8];
                    a.copy_from_slice(b);
                    let v = i64::from_be_bytes(a);
                    if is_blank(v) { f32::NAN } else { scale(v as f64) }
                }
                -32 => {
                    let v = f32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                    if self.bscale == 1.0 && self.bzero == 0.0 { v } else { scale(v as f64) }
                }
                _ => {
                    let mut a = [0u8; 8];
                    a.copy_from_slice(b);
                    scale(f64::from_be_bytes(a))
                }
            };
        }
    }
}

/// Random-access reader over one image data unit.
///
/// Reads are serialized through an internal file lock, so a single reader can
/// be shared by worker threads.
#[derive(Debug)]
pub struct ImageReader {
    path: PathBuf,
    file: Mutex<File>,
    data_offset: u64,
    layout: ImageLayout,
}

impl ImageReader {
    pub fn open(path: impl AsRef<Path>, hdu: &HduInfo) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let layout = ImageLayout::from_header(&hdu.header)?;
        let expected = (layout.num_elements() * layout.bytes_per_element()) as u64;
        if hdu.data_len < expected {
            return Err(CubeError::format(
                Stage::SourceOpen,
                format!(
                    "data unit of {} is {} bytes, header implies {}",
                    path.display(),
                    hdu.data_len,
                    expected
                ),
            ));
        }
        let file = File::open(&path)
            .map_err(|e| CubeError::io(Stage::SourceOpen, format!("cannot open {}", path.display()), e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            data_offset: hdu.data_offset,
            layout,
        })
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Read `count` consecutive elements starting at element index `start`.
    pub fn read_elements(&self, start: usize, count: usize) -> Result<Vec<f32>> {
        let total = self.layout.num_elements();
        if start + count > total {
            return Err(CubeError::shape(
                Stage::SourceOpen,
                format!(
                    "read of elements {}..{} exceeds data size {} in {}",
                    start,
                    start + count,
                    total,
                    self.path.display()
                ),
            ));
        }
        let bpe = self.layout.bytes_per_element();
        let mut raw = vec![0u8; count * bpe];
        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| CubeError::io_msg(Stage::SourceOpen, "file lock poisoned"))?;
            file.seek(SeekFrom::Start(self.data_offset + (start * bpe) as u64))
                .and_then(|_| file.read_exact(&mut raw))
                .map_err(|e| {
                    CubeError::io(
                        Stage::SourceOpen,
                        format!("reading {} elements from {}", count, self.path.display()),
                        e,
                    )
                })?;
        }
        let mut out = vec![0.0f32; count];
        self.layout.decode(&raw, &mut out);
        Ok(out)
    }
}

// ── Writing ─────────────────────────────────────────────────────────────────

/// Structural keywords regenerated by [`write_image`].
const STRUCTURAL: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "EXTEND", "BSCALE", "BZERO", "BLANK", "END", "XTENSION", "PCOUNT",
    "GCOUNT",
];

fn is_structural(keyword: &str) -> bool {
    STRUCTURAL.contains(&keyword)
        || (keyword.starts_with("NAXIS") && keyword[5..].chars().all(|c| c.is_ascii_digit()))
}

/// Write a single-HDU float32 image.
///
/// `naxes` is in FITS order (NAXIS1 first) and `data` is laid out with NAXIS1
/// varying fastest. Non-structural cards of `extra` are copied after the
/// mandatory keywords.
pub fn write_image(path: impl AsRef<Path>, extra: &Header, naxes: &[usize], data: &[f32]) -> Result<()> {
    let path = path.as_ref();
    let expected: usize = naxes.iter().product();
    if data.len() != expected {
        return Err(CubeError::shape(
            Stage::Write,
            format!("data length {} does not match axes {:?}", data.len(), naxes),
        ));
    }

    let mut header = Header::new();
    header.set("SIMPLE", true);
    header.set("BITPIX", -32_i64);
    header.set("NAXIS", naxes.len());
    for (i, n) in naxes.iter().enumerate() {
        header.set(&format!("NAXIS{}", i + 1), *n);
    }
    for card in extra.cards() {
        if !is_structural(&card.keyword) {
            header.push(card.clone());
        }
    }

    let file = File::create(path)
        .map_err(|e| CubeError::io(Stage::Write, format!("cannot create {}", path.display()), e))?;
    let mut w = BufWriter::new(file);
    let write_err = |e| CubeError::io(Stage::Write, format!("writing {}", path.display()), e);

    w.write_all(&header.to_bytes()).map_err(write_err)?;
    for v in data {
        w.write_all(&v.to_be_bytes()).map_err(write_err)?;
    }
    let data_len = (data.len() * 4) as u64;
    let pad = (padded(data_len) - data_len) as usize;
    w.write_all(&vec![0u8; pad]).map_err(write_err)?;
    w.flush().map_err(write_err)?;

    debug!("Wrote {:?} image to {}", naxes, path.display());
    Ok(())
}
