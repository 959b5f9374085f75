//! End-to-end tests: write a synthetic FITS cube to disk, open it lazily and
//! run every reduction (regions, PV, moments, fitting, reprojection) on it.

use std::path::{Path as FsPath, PathBuf};

use ndarray::{Array2, Array3};
use specube::fits::{self, Header};
use specube::moment::{self, SpectralRange};
use specube::pv;
use specube::subcube;
use specube::{
    fit_spectrum, open, reproject, CubeError, CubeMask, FitConfig, Image2d, Model, Path, Region,
    Scheduler, SourceConfig, SpectralUnit, Stage, TargetHeader,
};

const NX: usize = 24;
const NY: usize = 20;
const NC: usize = 40;
const KMS: SpectralUnit = SpectralUnit::KilometersPerSecond;

/// Line centre in km/s at column `x`: a gentle velocity gradient across the blob.
fn line_centre(x: usize) -> f64 {
    8.0 + 0.25 * (x as f64 - 12.0)
}

/// Gaussian blob at (x=12, y=10) with a Gaussian line of σ = 2.5 km/s.
/// Channel `k` is at `-10 + k` km/s.
fn synthetic_data() -> Array3<f32> {
    Array3::from_shape_fn((NC, NY, NX), |(k, y, x)| {
        let (dx, dy) = (x as f64 - 12.0, y as f64 - 10.0);
        let amp = 5.0 * (-(dx * dx + dy * dy) / 18.0).exp();
        let v = -10.0 + k as f64;
        let z = (v - line_centre(x)) / 2.5;
        (amp * (-0.5 * z * z).exp()) as f32
    })
}

/// Write the synthetic cube with a degenerate Stokes axis, as radio archives do.
fn write_cube(dir: &FsPath) -> anyhow::Result<PathBuf> {
    let mut h = Header::new();
    h.set("CTYPE1", "RA---TAN");
    h.set("CTYPE2", "DEC--TAN");
    h.set("CTYPE3", "VRAD");
    h.set("CTYPE4", "STOKES");
    h.set("CUNIT1", "deg");
    h.set("CUNIT2", "deg");
    h.set("CUNIT3", "m/s");
    h.set("CRPIX1", 13.0);
    h.set("CRPIX2", 11.0);
    h.set("CRPIX3", 1.0);
    h.set("CRPIX4", 1.0);
    h.set("CRVAL1", 52.25);
    h.set("CRVAL2", 31.3);
    h.set("CRVAL3", -10000.0);
    h.set("CRVAL4", 1.0);
    h.set("CDELT1", -0.002);
    h.set("CDELT2", 0.002);
    h.set("CDELT3", 1000.0);
    h.set("CDELT4", 1.0);
    h.set("BUNIT", "K");
    h.set("BMAJ", 0.006);
    h.set("BMIN", 0.004);
    h.set("BPA", 30.0);

    let data = synthetic_data();
    let values: Vec<f32> = data.iter().copied().collect();
    let path = dir.join("cube.fits");
    fits::write_image(&path, &h, &[NX, NY, NC, 1], &values)?;
    Ok(path)
}

#[test]
fn test_open_degenerate_stokes_cube() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let dir = tempfile::tempdir()?;
    let cube = open(write_cube(dir.path())?, &SourceConfig::default())?;

    assert_eq!(cube.shape(), (NC, NY, NX));
    assert_eq!(cube.wcs().naxis(), 3);
    assert_eq!(cube.unit(), "K");
    let beam = cube.beam().expect("beam from BMAJ/BMIN");
    assert!((beam.pa_deg - 30.0).abs() < 1e-12);

    let velocities = cube.spectral_axis(KMS)?;
    assert!((velocities[0] + 10.0).abs() < 1e-9);
    assert!((velocities[NC - 1] - 29.0).abs() < 1e-9);

    let expected = synthetic_data();
    let plane = cube.channel(18)?;
    assert_eq!(plane, expected.index_axis(ndarray::Axis(0), 18));
    Ok(())
}

#[test]
fn test_moment_maps_and_fits_roundtrip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cube = open(write_cube(dir.path())?, &SourceConfig::default())?;
    let all = SpectralRange::all(KMS);

    let m0 = moment::moment(&cube, 0, all)?;
    let m1 = moment::moment(&cube, 1, all)?;
    let sigma = moment::linewidth_sigma(&cube, all)?;
    let area = 5.0 * 2.5 * (2.0 * std::f64::consts::PI).sqrt();
    assert!((m0.data()[[10, 12]] as f64 - area).abs() / area < 1e-3);
    for x in 6..18 {
        assert!((m1.data()[[10, x]] as f64 - line_centre(x)).abs() < 1e-2, "column {x}");
    }
    assert!((sigma.data()[[10, 12]] as f64 - 2.5).abs() < 1e-2);
    assert_eq!(m0.unit(), "K km/s");
    assert_eq!(m0.beam(), cube.beam());

    let out = dir.path().join("mom0.fits");
    m0.write_fits(&out)?;
    let back = Image2d::from_fits(&out)?;
    assert_eq!(back.data(), m0.data());
    assert_eq!(back.wcs(), m0.wcs());
    assert_eq!(back.unit(), "K km/s");

    // No channel in range: the map keeps its shape and is blank
    let empty = moment::moment(&cube, 0, SpectralRange::new(100.0, 200.0, KMS))?;
    assert_eq!(empty.shape(), (NY, NX));
    assert!(empty.data().iter().all(|v| v.is_nan()));
    Ok(())
}

#[test]
fn test_region_subcube_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cube = open(write_cube(dir.path())?, &SourceConfig::default())?;
    let regions = [
        Region::pixel_ellipse(12.0, 10.0, 6.0, 4.0, 0.0),
        Region::velocity_range(0.0, 16.0, KMS),
    ];

    let once = subcube::apply_regions(&cube, &regions)?;
    let twice = subcube::apply_regions(&once, &regions)?;
    assert_eq!(once, twice);

    let (nc, ny, nx) = once.shape();
    assert_eq!(nc, 16);
    assert!(ny <= 9 && nx <= 13);
    assert!((once.spectral_axis(KMS)?[0] - 0.0).abs() < 1e-9);

    // Window corner lies outside the ellipse
    assert!(once.channel(0)?[[0, 0]].is_nan());
    let (_, y0, x0) = once.window().origin();
    let centre = once.channel(8)?[[10 - y0, 12 - x0]];
    assert_eq!(centre, cube.channel(18)?[[10, 12]]);
    Ok(())
}

#[test]
fn test_pv_along_a_row_matches_spectra() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cube = open(write_cube(dir.path())?, &SourceConfig::default())?;
    let path = Path::pixel(vec![[2.0, 10.0], [22.0, 10.0]], 0.0);

    let diagram = pv::extract(&cube, &path, 1.0)?;
    assert_eq!(diagram.image.shape(), (NC, 21));
    assert_eq!(diagram.offset_unit, "deg");
    let last = diagram.offsets[20];
    assert!((last - 0.04).abs() / 0.04 < 1e-4, "offset {last}");

    for j in [0, 7, 10, 20] {
        let spectrum = cube.spectrum(10, 2 + j)?;
        for (k, v) in spectrum.iter().enumerate() {
            assert!((diagram.image.data()[[k, j]] - v).abs() < 1e-6);
        }
    }
    Ok(())
}

#[test]
fn test_fit_line_profile_from_cube() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let dir = tempfile::tempdir()?;
    let cube = open(write_cube(dir.path())?, &SourceConfig::default())?;

    let result = fit_spectrum(
        &cube,
        10,
        14,
        Model::Gaussian1D,
        &[4.0, 7.0, 2.0],
        KMS,
        &FitConfig::default(),
    )?;
    assert!(result.converged);
    assert!(result.warning.is_none());
    let amp = 5.0 * (-4.0f64 / 18.0).exp();
    assert!((result.params[0] - amp).abs() < 1e-4);
    assert!((result.params[1] - line_centre(14)).abs() < 1e-4);
    assert!((result.params[2] - 2.5).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_reproject_onto_coarser_grid() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cube = open(write_cube(dir.path())?, &SourceConfig::default())?;

    let (target, shape) = TargetHeader::like(&cube)
        .shape(13, 11)
        .centered()
        .pixel_grid(0.004, 0.0)
        .build()?;
    let out = reproject(&cube, &target, shape)?;
    assert_eq!(out.shape(), (NC, 11, 13));
    assert_eq!(out.unit(), "K");
    assert_eq!(out.spectral_axis(KMS)?, cube.spectral_axis(KMS)?);

    // Target pixels land on every second source pixel around the centre
    let src = cube.channel(18)?;
    let dst = out.channel(18)?;
    assert!((dst[[5, 6]] - src[[10, 12]]).abs() < 1e-4);
    assert!((dst[[5, 7]] - src[[10, 14]]).abs() < 1e-4);
    assert!((dst[[4, 6]] - src[[8, 12]]).abs() < 1e-4);
    // Column 12 maps to source x = 24, one past the last source column
    assert!(dst[[5, 0]].is_finite());
    assert!(dst[[5, 12]].is_nan());
    assert!(dst[[10, 6]].is_nan());
    Ok(())
}

#[test]
fn test_cached_threaded_open_matches_synchronous() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_cube(dir.path())?;
    let plain = open(path.as_path(), &SourceConfig::default())?;
    let tuned = open(
        path.as_path(),
        &SourceConfig {
            cache_planes: true,
            scheduler: Scheduler::Threaded { threads: Some(3) },
            ..Default::default()
        },
    )?;

    let range = SpectralRange::new(0.0, 20.0, KMS);
    for order in 0..=2 {
        assert_eq!(
            moment::moment(&plain, order, range)?.data(),
            moment::moment(&tuned, order, range)?.data()
        );
    }
    let line = Path::pixel(vec![[3.0, 4.0], [20.0, 15.0]], 2.0);
    assert_eq!(
        pv::extract(&plain, &line, 1.5)?.image.data(),
        pv::extract(&tuned, &line, 1.5)?.image.data()
    );
    Ok(())
}

#[test]
fn test_mask_composition_is_associative() -> anyhow::Result<()> {
    let shape = (NC, NY, NX);
    let a = CubeMask::from_spatial(shape, Array2::from_shape_fn((NY, NX), |(y, x)| (x + y) % 3 != 0))?;
    let b = CubeMask::from_spectral(shape, (0..NC).map(|k| k > 5).collect())?;
    let c = CubeMask::from_threshold(shape, 0.1)?;

    assert_eq!(a.and(&b)?.and(&c)?, a.and(&b.and(&c)?)?);
    assert_eq!(a.and(&b)?, b.and(&a)?);
    Ok(())
}

#[test]
fn test_cube_without_spectral_axis_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Header::new();
    h.set("CTYPE1", "RA---TAN");
    h.set("CTYPE2", "DEC--TAN");
    h.set("CTYPE3", "STOKES");
    let path = dir.path().join("stokes.fits");
    fits::write_image(&path, &h, &[4, 4, 2], &[0.0; 32])?;

    let err = open(path.as_path(), &SourceConfig::default()).unwrap_err();
    assert!(matches!(err, CubeError::Format { stage: Stage::SourceOpen, .. }));
    Ok(())
}
