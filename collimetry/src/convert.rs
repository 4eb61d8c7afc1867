//! Unit aliases and conversions.
//!
//! This module is the only bridge between external units (mm, deg, MeV)
//! and the internal ones (cm, rad, keV). Geometry documents carry
//! millimetres; everything downstream of plan construction works in
//! centimetres and radians. Optical depths are dimensionless mean free
//! paths, `tau = mu [1/cm] * x [cm]`.

use super::error::{Error, Result};

/// Length in centimetres.
pub type Cm = f64;
/// Length in millimetres.
pub type Mm = f64;
/// Photon energy in kilo-electronvolts.
pub type KeV = f64;
/// Photon energy in mega-electronvolts.
pub type MeV = f64;
/// Optical depth in mean free paths.
pub type Mfp = f64;
/// Angle in radians.
pub type Radian = f64;
/// Angle in degrees.
pub type Degree = f64;
/// Attenuation expressed in decibels.
pub type Decibel = f64;
/// Linear attenuation coefficient in 1/cm.
pub type PerCm = f64;

/// Transmissions below this floor are treated as zero when converting to
/// decibels, so `db_from_transmission` never overflows.
pub const TRANSMISSION_FLOOR: f64 = 1e-30;

fn ensure_finite(quantity: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::InvalidUnit { quantity, value })
    }
}

fn ensure_non_negative(quantity: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(Error::InvalidUnit { quantity, value })
    }
}

/// Converts a signed position or offset from millimetres to centimetres.
///
/// # Errors
///
/// Returns [`Error::InvalidUnit`] if `mm` is not finite.
pub fn cm_from_mm(mm: Mm) -> Result<Cm> {
    Ok(ensure_finite("length_mm", mm)? * 0.1)
}

/// Converts a thickness or width from millimetres to centimetres.
/// Unlike [`cm_from_mm`] the value must be non-negative.
///
/// # Errors
///
/// Returns [`Error::InvalidUnit`] if `mm` is not finite or negative.
pub fn thickness_cm_from_mm(mm: Mm) -> Result<Cm> {
    Ok(ensure_non_negative("thickness_mm", mm)? * 0.1)
}

/// Converts centimetres back to millimetres.
#[must_use]
pub fn mm_from_cm(cm: Cm) -> Mm {
    cm * 10.0
}

/// Converts degrees to radians.
///
/// # Errors
///
/// Returns [`Error::InvalidUnit`] if `deg` is not finite.
pub fn rad_from_deg(deg: Degree) -> Result<Radian> {
    Ok(ensure_finite("angle_deg", deg)?.to_radians())
}

/// Converts radians to degrees.
#[must_use]
pub fn deg_from_rad(rad: Radian) -> Degree {
    rad.to_degrees()
}

/// Converts MeV to keV.
///
/// # Errors
///
/// Returns [`Error::InvalidUnit`] if `mev` is not finite or negative.
pub fn kev_from_mev(mev: MeV) -> Result<KeV> {
    Ok(ensure_non_negative("energy_mev", mev)? * 1000.0)
}

/// Converts keV to MeV.
#[must_use]
pub fn mev_from_kev(kev: KeV) -> MeV {
    kev * 1e-3
}

/// Converts a linear thickness into mean free paths, `tau = mu * x`.
///
/// # Errors
///
/// Returns [`Error::InvalidUnit`] if either argument is not finite or
/// negative.
pub fn mfp_from_cm(mu: PerCm, x: Cm) -> Result<Mfp> {
    Ok(ensure_non_negative("mu_per_cm", mu)? * ensure_non_negative("thickness_cm", x)?)
}

/// Expresses a transmission as attenuation in decibels,
/// `db = -10 * log10(max(t, 1e-30))`.
#[must_use]
pub fn db_from_transmission(t: f64) -> Decibel {
    -10.0 * t.max(TRANSMISSION_FLOOR).log10()
}

/// Inverse of [`db_from_transmission`] for attenuations within the floor.
#[must_use]
pub fn transmission_from_db(db: Decibel) -> f64 {
    10.0_f64.powf(-db / 10.0)
}
