//! Spectral axis kinds, units and velocity conventions.

use std::fmt;
use std::str::FromStr;

use crate::error::{CubeError, Result, Stage};

/// Speed of light in m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Physical quantity carried by a spectral axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralKind {
    Frequency,
    Velocity(VelocityConvention),
    Wavelength,
}

impl SpectralKind {
    /// Classify a spectral CTYPE (`FREQ`, `VRAD`, `VOPT`, `VELO-LSR`, `WAVE`, ...).
    pub fn from_ctype(ctype: &str) -> Option<Self> {
        let head = ctype.get(..4).unwrap_or(ctype).to_ascii_uppercase();
        match head.as_str() {
            "FREQ" => Some(SpectralKind::Frequency),
            "VRAD" => Some(SpectralKind::Velocity(VelocityConvention::Radio)),
            "VOPT" | "FELO" => Some(SpectralKind::Velocity(VelocityConvention::Optical)),
            "VELO" | "VLSR" => Some(SpectralKind::Velocity(VelocityConvention::Relativistic)),
            "WAVE" | "AWAV" => Some(SpectralKind::Wavelength),
            _ => None,
        }
    }

    /// SI unit assumed when CUNIT is absent.
    pub fn default_unit(&self) -> SpectralUnit {
        match self {
            SpectralKind::Frequency => SpectralUnit::Hz,
            SpectralKind::Velocity(_) => SpectralUnit::MetersPerSecond,
            SpectralKind::Wavelength => SpectralUnit::Meter,
        }
    }
}

/// Velocity definition used to convert between frequency and velocity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VelocityConvention {
    /// v = c·(f0 − f)/f0
    #[default]
    Radio,
    /// v = c·(f0 − f)/f
    Optical,
    /// v = c·(f0² − f²)/(f0² + f²)
    Relativistic,
}

/// Dimension of a spectral unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralDimension {
    Frequency,
    Velocity,
    Length,
}

/// Units accepted for spectral coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralUnit {
    Hz,
    KHz,
    MHz,
    GHz,
    MetersPerSecond,
    KilometersPerSecond,
    Meter,
    Centimeter,
    Millimeter,
    Micrometer,
    Nanometer,
    Angstrom,
}

impl SpectralUnit {
    pub fn dimension(&self) -> SpectralDimension {
        use SpectralUnit::*;
        match self {
            Hz | KHz | MHz | GHz => SpectralDimension::Frequency,
            MetersPerSecond | KilometersPerSecond => SpectralDimension::Velocity,
            _ => SpectralDimension::Length,
        }
    }

    /// Multiply a value in this unit by this factor to get SI (Hz, m/s, m).
    pub fn si_factor(&self) -> f64 {
        use SpectralUnit::*;
        match self {
            Hz | MetersPerSecond | Meter => 1.0,
            KHz | KilometersPerSecond => 1e3,
            MHz => 1e6,
            GHz => 1e9,
            Centimeter => 1e-2,
            Millimeter => 1e-3,
            Micrometer => 1e-6,
            Nanometer => 1e-9,
            Angstrom => 1e-10,
        }
    }

    /// FITS CUNIT string.
    pub fn as_fits(&self) -> &'static str {
        use SpectralUnit::*;
        match self {
            Hz => "Hz",
            KHz => "kHz",
            MHz => "MHz",
            GHz => "GHz",
            MetersPerSecond => "m/s",
            KilometersPerSecond => "km/s",
            Meter => "m",
            Centimeter => "cm",
            Millimeter => "mm",
            Micrometer => "um",
            Nanometer => "nm",
            Angstrom => "Angstrom",
        }
    }
}

impl fmt::Display for SpectralUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_fits())
    }
}

impl FromStr for SpectralUnit {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        use SpectralUnit::*;
        let unit = match s.trim() {
            "Hz" | "HZ" | "hz" => Hz,
            "kHz" | "KHZ" | "khz" => KHz,
            "MHz" | "MHZ" | "mhz" => MHz,
            "GHz" | "GHZ" | "ghz" => GHz,
            "m/s" | "M/S" | "m s-1" | "m.s-1" => MetersPerSecond,
            "km/s" | "KM/S" | "km s-1" | "km.s-1" => KilometersPerSecond,
            "m" | "M" => Meter,
            "cm" | "CM" => Centimeter,
            "mm" | "MM" => Millimeter,
            "um" | "UM" | "micron" => Micrometer,
            "nm" | "NM" => Nanometer,
            "Angstrom" | "ANGSTROM" | "AA" => Angstrom,
            other => {
                return Err(CubeError::format(
                    Stage::Header,
                    format!("unrecognized spectral unit '{other}'"),
                ))
            }
        };
        Ok(unit)
    }
}

/// Rest value used for frequency ↔ velocity conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestValue {
    /// Rest frequency in Hz (RESTFRQ / RESTFREQ).
    Frequency(f64),
    /// Rest wavelength in m (RESTWAV).
    Wavelength(f64),
}

impl RestValue {
    pub fn frequency_hz(&self) -> f64 {
        match self {
            RestValue::Frequency(f) => *f,
            RestValue::Wavelength(w) => SPEED_OF_LIGHT / w,
        }
    }
}

fn velocity_to_frequency(v: f64, f0: f64, conv: VelocityConvention) -> f64 {
    match conv {
        VelocityConvention::Radio => f0 * (1.0 - v / SPEED_OF_LIGHT),
        VelocityConvention::Optical => f0 / (1.0 + v / SPEED_OF_LIGHT),
        VelocityConvention::Relativistic => {
            f0 * ((SPEED_OF_LIGHT - v) / (SPEED_OF_LIGHT + v)).sqrt()
        }
    }
}

fn frequency_to_velocity(f: f64, f0: f64, conv: VelocityConvention) -> f64 {
    match conv {
        VelocityConvention::Radio => SPEED_OF_LIGHT * (f0 - f) / f0,
        VelocityConvention::Optical => SPEED_OF_LIGHT * (f0 - f) / f,
        VelocityConvention::Relativistic => {
            SPEED_OF_LIGHT * (f0 * f0 - f * f) / (f0 * f0 + f * f)
        }
    }
}

/// Convert a native spectral value to the requested unit.
///
/// `native` is in SI units of `kind`. Conversions that cross between velocity
/// and frequency/wavelength need a rest value; `convention` is the velocity
/// convention of the *output* when the output is a velocity.
pub fn convert(
    native: f64,
    kind: SpectralKind,
    rest: Option<RestValue>,
    unit: SpectralUnit,
    convention: VelocityConvention,
) -> Result<f64> {
    let need_rest = || {
        rest.map(|r| r.frequency_hz()).ok_or_else(|| {
            CubeError::format(
                Stage::Header,
                "rest frequency (RESTFRQ/RESTWAV) required for velocity conversion",
            )
        })
    };

    let si = match (kind, unit.dimension()) {
        (SpectralKind::Frequency, SpectralDimension::Frequency) => native,
        (SpectralKind::Frequency, SpectralDimension::Length) => SPEED_OF_LIGHT / native,
        (SpectralKind::Frequency, SpectralDimension::Velocity) => {
            frequency_to_velocity(native, need_rest()?, convention)
        }
        (SpectralKind::Wavelength, SpectralDimension::Length) => native,
        (SpectralKind::Wavelength, SpectralDimension::Frequency) => SPEED_OF_LIGHT / native,
        (SpectralKind::Wavelength, SpectralDimension::Velocity) => {
            frequency_to_velocity(SPEED_OF_LIGHT / native, need_rest()?, convention)
        }
        (SpectralKind::Velocity(src), SpectralDimension::Velocity) if src == convention => native,
        (SpectralKind::Velocity(src), dim) => {
            let f = velocity_to_frequency(native, need_rest()?, src);
            match dim {
                SpectralDimension::Frequency => f,
                SpectralDimension::Length => SPEED_OF_LIGHT / f,
                SpectralDimension::Velocity => frequency_to_velocity(f, need_rest()?, convention),
            }
        }
    };
    Ok(si / unit.si_factor())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CO_10: f64 = 115.271_201_8e9;

    #[test]
    fn test_radio_velocity_from_frequency() {
        let f = CO_10 * (1.0 - 10_000.0 / SPEED_OF_LIGHT);
        let v = convert(
            f,
            SpectralKind::Frequency,
            Some(RestValue::Frequency(CO_10)),
            SpectralUnit::KilometersPerSecond,
            VelocityConvention::Radio,
        )
        .unwrap();
        assert!((v - 10.0).abs() < 1e-9, "v = {v}");
    }

    #[test]
    fn test_velocity_unit_scaling_needs_no_rest() {
        let v = convert(
            2500.0,
            SpectralKind::Velocity(VelocityConvention::Radio),
            None,
            SpectralUnit::KilometersPerSecond,
            VelocityConvention::Radio,
        )
        .unwrap();
        assert!((v - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_missing_rest_is_format_error() {
        let err = convert(
            CO_10,
            SpectralKind::Frequency,
            None,
            SpectralUnit::KilometersPerSecond,
            VelocityConvention::Radio,
        )
        .unwrap_err();
        assert!(matches!(err, CubeError::Format { .. }));
    }

    #[test]
    fn test_convention_roundtrip_through_frequency() {
        let rest = Some(RestValue::Frequency(CO_10));
        for conv in [
            VelocityConvention::Radio,
            VelocityConvention::Optical,
            VelocityConvention::Relativistic,
        ] {
            let f = velocity_to_frequency(-35_000.0, CO_10, conv);
            let v = convert(f, SpectralKind::Frequency, rest, SpectralUnit::MetersPerSecond, conv)
                .unwrap();
            assert!((v + 35_000.0).abs() < 1e-6, "{conv:?}: {v}");
        }
    }

    #[test]
    fn test_wavelength_to_frequency() {
        let f = convert(
            0.0026,
            SpectralKind::Wavelength,
            None,
            SpectralUnit::GHz,
            VelocityConvention::Radio,
        )
        .unwrap();
        assert!((f - SPEED_OF_LIGHT / 0.0026 / 1e9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_units() {
        assert_eq!("km/s".parse::<SpectralUnit>().unwrap(), SpectralUnit::KilometersPerSecond);
        assert_eq!("GHz".parse::<SpectralUnit>().unwrap(), SpectralUnit::GHz);
        assert!("furlong".parse::<SpectralUnit>().is_err());
    }
}
