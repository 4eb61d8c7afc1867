//! Analytic Compton kernel: scattering kinematics, Klein-Nishina
//! cross-sections and the Kahn rejection sampler.
//!
//! All energies are keV, all angles radians. Throughout, `alpha` is the
//! photon energy in units of the electron rest energy, `alpha = E0/511`.

use super::convert::{KeV, Radian};
use super::error::{Error, Result};
use super::result::KnPoint;
use rand::Rng;

/// Electron rest energy in keV.
pub const ELECTRON_REST_ENERGY_KEV: KeV = 511.0;

/// Classical electron radius in cm.
pub const CLASSICAL_ELECTRON_RADIUS_CM: f64 = 2.8179403262e-13;

/// Thomson cross-section in cm^2, the low-energy limit of Klein-Nishina.
pub const THOMSON_CROSS_SECTION_CM2: f64 = 6.6524587321e-25;

/// Compton wavelength of the electron in Angstrom; the wavelength shift
/// is this times `1 - cos(theta)`.
pub const COMPTON_WAVELENGTH_ANGSTROM: f64 = 0.02426;

/// Below this `alpha` the total cross-section switches to its series
/// expansion; the closed form loses all significance near zero.
const SERIES_ALPHA: f64 = 1e-2;

fn check_energy(energy_kev: KeV) -> Result<f64> {
    if energy_kev.is_finite() && energy_kev > 0.0 {
        Ok(energy_kev / ELECTRON_REST_ENERGY_KEV)
    } else {
        Err(Error::InvalidUnit {
            quantity: "energy_kev",
            value: energy_kev,
        })
    }
}

fn check_angle(theta: Radian) -> Result<Radian> {
    if theta.is_finite() {
        Ok(theta)
    } else {
        Err(Error::InvalidUnit {
            quantity: "theta_rad",
            value: theta,
        })
    }
}

/// Scattered photon energy `E' = E0 / (1 + alpha (1 - cos theta))`.
///
/// Exact at the end points: `E'(0) = E0` and `E'(pi) = E0 / (1 + 2 alpha)`.
///
/// # Errors
///
/// [`Error::InvalidUnit`] for non-positive energy or non-finite angle.
pub fn scattered_energy(e0_kev: KeV, theta: Radian) -> Result<KeV> {
    let alpha = check_energy(e0_kev)?;
    let theta = check_angle(theta)?;
    Ok(e0_kev / alpha.mul_add(1.0 - theta.cos(), 1.0))
}

/// Recoil electron energy `T = E0 - E'`.
///
/// # Errors
///
/// See [`scattered_energy`].
pub fn recoil_energy(e0_kev: KeV, theta: Radian) -> Result<KeV> {
    Ok(e0_kev - scattered_energy(e0_kev, theta)?)
}

/// The kinematic limits at 180 degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComptonEdge {
    /// Minimum scattered photon energy `E0 / (1 + 2 alpha)`, keV.
    pub scattered_min_kev: KeV,
    /// Maximum recoil energy `E0 * 2 alpha / (1 + 2 alpha)`, keV.
    pub recoil_max_kev: KeV,
}

/// Computes the Compton edge of a primary energy.
///
/// # Errors
///
/// [`Error::InvalidUnit`] for non-positive energy.
pub fn compton_edge(e0_kev: KeV) -> Result<ComptonEdge> {
    let alpha = check_energy(e0_kev)?;
    let scattered_min_kev = e0_kev / 2.0_f64.mul_add(alpha, 1.0);
    Ok(ComptonEdge {
        scattered_min_kev,
        recoil_max_kev: e0_kev - scattered_min_kev,
    })
}

/// Wavelength shift `0.02426 * (1 - cos theta)` in Angstrom.
///
/// # Errors
///
/// [`Error::InvalidUnit`] for a non-finite angle.
pub fn wavelength_shift(theta: Radian) -> Result<f64> {
    Ok(COMPTON_WAVELENGTH_ANGSTROM * (1.0 - check_angle(theta)?.cos()))
}

/// Klein-Nishina differential cross-section
/// `dsigma/dOmega = r0^2/2 (E'/E0)^2 (E'/E0 + E0/E' - sin^2 theta)`
/// in cm^2/sr per electron.
///
/// # Errors
///
/// See [`scattered_energy`].
pub fn klein_nishina_differential(e0_kev: KeV, theta: Radian) -> Result<f64> {
    let ratio = scattered_energy(e0_kev, theta)? / e0_kev;
    let sin = theta.sin();
    Ok(CLASSICAL_ELECTRON_RADIUS_CM * CLASSICAL_ELECTRON_RADIUS_CM / 2.0
        * ratio
        * ratio
        * (ratio + 1.0 / ratio - sin * sin))
}

/// Total Klein-Nishina cross-section in cm^2 per electron.
///
/// Uses the closed form in `alpha`; below `alpha = 0.01` the form
/// suffers catastrophic cancellation, so the series
/// `sigma_T (1 - 2 alpha + 26/5 alpha^2 - 133/10 alpha^3)` takes over,
/// reproducing the Thomson limit exactly as `alpha` goes to zero.
///
/// # Errors
///
/// [`Error::InvalidUnit`] for non-positive energy.
pub fn klein_nishina_total(e0_kev: KeV) -> Result<f64> {
    let alpha = check_energy(e0_kev)?;

    if alpha < SERIES_ALPHA {
        let series = 133.0 / 10.0 * alpha;
        let series = (26.0 / 5.0 - series) * alpha;
        let series = (series - 2.0).mul_add(alpha, 1.0);
        return Ok(THOMSON_CROSS_SECTION_CM2 * series);
    }

    let two_alpha = 2.0 * alpha;
    let log_term = two_alpha.ln_1p();
    let front = (1.0 + alpha) / (alpha * alpha)
        * (2.0 * (1.0 + alpha) / (1.0 + two_alpha) - log_term / alpha);
    let middle = log_term / two_alpha;
    let back = 3.0_f64.mul_add(alpha, 1.0) / ((1.0 + two_alpha) * (1.0 + two_alpha));

    Ok(2.0
        * std::f64::consts::PI
        * CLASSICAL_ELECTRON_RADIUS_CM
        * CLASSICAL_ELECTRON_RADIUS_CM
        * (front + middle - back))
}

/// Tabulates the analytic angular distribution over `bins` equal bins of
/// `[0, pi]`, sampled at bin centres.
///
/// # Errors
///
/// [`Error::InvalidConfig`] for zero bins, plus energy validation.
#[allow(clippy::cast_precision_loss)]
pub fn klein_nishina_distribution(e0_kev: KeV, bins: usize) -> Result<Vec<KnPoint>> {
    if bins == 0 {
        return Err(Error::InvalidConfig {
            reason: "angular_bins must be positive".to_string(),
        });
    }
    check_energy(e0_kev)?;

    (0..bins)
        .map(|bin| {
            let theta = (bin as f64 + 0.5) * std::f64::consts::PI / bins as f64;
            Ok(KnPoint {
                theta,
                dsigma_cm2_sr: klein_nishina_differential(e0_kev, theta)?,
            })
        })
        .collect()
}

/// One sampled Compton event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComptonSample {
    /// Polar scatter angle in rad.
    pub theta: Radian,
    /// Cosine of the polar angle, as sampled.
    pub cos_theta: f64,
    /// Azimuth, uniform in `[0, 2 pi)`.
    pub phi: Radian,
    /// Scattered photon energy in keV.
    pub scattered_kev: KeV,
    /// Recoil electron energy in keV; `scattered + recoil = E0` exactly.
    pub recoil_kev: KeV,
}

/// Draws a scatter angle and energy from the Klein-Nishina distribution
/// by Kahn's rejection scheme.
///
/// Three uniform variates per attempt; the branch on
/// `(1 + 2 alpha)/(9 + 2 alpha)` selects the low- or high-energy
/// envelope. The azimuth is an independent uniform draw.
///
/// # Errors
///
/// [`Error::InvalidUnit`] for non-positive energy.
pub fn sample_kahn<R: Rng + ?Sized>(e0_kev: KeV, rng: &mut R) -> Result<ComptonSample> {
    let alpha = check_energy(e0_kev)?;
    let two_alpha = 2.0 * alpha;
    let branch = (1.0 + two_alpha) / (9.0 + two_alpha);

    let (xi, cos_theta) = loop {
        let r1: f64 = rng.gen();
        let r2: f64 = rng.gen();
        let r3: f64 = rng.gen();

        if r1 <= branch {
            let xi = two_alpha.mul_add(r2, 1.0);
            if r3 <= 4.0 * (1.0 / xi - 1.0 / (xi * xi)) {
                break (xi, 1.0 - (xi - 1.0) / alpha);
            }
        } else {
            let xi = (1.0 + two_alpha) / two_alpha.mul_add(r2, 1.0);
            let cos_theta = 1.0 - (xi - 1.0) / alpha;
            if r3 <= 0.5 * cos_theta.mul_add(cos_theta, 1.0 / xi) {
                break (xi, cos_theta);
            }
        }
    };

    let scattered_kev = e0_kev / xi;
    Ok(ComptonSample {
        theta: cos_theta.clamp(-1.0, 1.0).acos(),
        cos_theta,
        phi: 2.0 * std::f64::consts::PI * rng.gen::<f64>(),
        scattered_kev,
        recoil_kev: e0_kev - scattered_kev,
    })
}
