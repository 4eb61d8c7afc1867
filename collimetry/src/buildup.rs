//! Build-up factors correcting Beer-Lambert for scattered photons that
//! still reach the primary direction.
//!
//! Two parametric families share the key (material, energy): the
//! geometric-progression (GP) form and the Taylor two-exponential form.
//! Parameters come from a static table and are interpolated on energy;
//! the optical depth is used directly in mean free paths. The table
//! domain is `tau` in `[0, 40]`; queries above the domain clamp and set
//! [`Warnings::CLAMPED_TAU`], queries below zero are an error.

use super::convert::{KeV, Mfp};
use super::error::{Error, Result};
use super::result::Warnings;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Upper end of the supported optical-depth domain, in mfp.
pub const TAU_DOMAIN_MAX: Mfp = 40.0;

/// Relative GP-Taylor disagreement above which
/// [`Warnings::GP_TAYLOR_DISAGREEMENT`] is set.
pub const CROSS_CHECK_TOLERANCE: f64 = 0.15;

/// Two regions within this relative margin of each other in partial
/// optical depth count as a dominant-material tie.
pub const DOMINANT_TIE_MARGIN: f64 = 0.10;

/// Coefficients of the geometric-progression fitting form.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct GpCoefficients {
    /// Build-up factor at one mfp.
    pub b: f64,
    /// Amplitude of the power term of `K`.
    pub c: f64,
    /// Exponent of the power term of `K`.
    pub a: f64,
    /// Knee position of the tanh term.
    pub xk: f64,
    /// Amplitude of the tanh term.
    pub d: f64,
}

/// Coefficients of the Taylor two-exponential form.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaylorCoefficients {
    /// Amplitude of the first exponential.
    pub a1: f64,
    /// Exponent of the first term; negative values grow with depth.
    pub alpha1: f64,
    /// Exponent of the second term.
    pub alpha2: f64,
}

/// One row of the build-up coefficient table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BuildUpEntry {
    /// Material the row belongs to.
    pub material_id: String,
    /// Energy key in keV.
    pub energy_kev: KeV,
    /// GP coefficients at this key.
    pub gp: GpCoefficients,
    /// Taylor coefficients at this key.
    pub taylor: TaylorCoefficients,
    /// Declared validity range of the fit, in mfp.
    pub tau_max: Mfp,
}

/// How the build-up factor of a multi-region path is composed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildUpMethod {
    /// GP formula for the dominant material with the total optical depth.
    Gp,
    /// Taylor formula for the dominant material with the total depth.
    Taylor,
    /// GP factor of the last region only, with the total optical depth.
    /// The conservative fallback.
    LastMaterial,
    /// Sequential (Kalos-like) product of per-region GP factors.
    #[default]
    Kalos,
}

/// A computed build-up factor together with the conditions observed
/// while computing it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuildUp {
    /// The factor, `>= 1` for physical parameter sets.
    pub factor: f64,
    /// Clamp and cross-check flags.
    pub warnings: Warnings,
}

/// Static build-up coefficient table, immutable after construction.
#[derive(Clone, Debug)]
pub struct BuildUpTable {
    by_material: FxHashMap<String, Vec<BuildUpEntry>>,
}

impl BuildUpTable {
    /// Groups and sorts the entries by material and energy.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate (material, energy) keys or
    /// non-finite energies.
    pub fn new(entries: Vec<BuildUpEntry>) -> Result<Self> {
        let mut by_material: FxHashMap<String, Vec<BuildUpEntry>> = FxHashMap::default();

        for entry in entries {
            if !entry.energy_kev.is_finite() {
                return Err(Error::InvalidUnit {
                    quantity: "buildup_energy_kev",
                    value: entry.energy_kev,
                });
            }
            by_material
                .entry(entry.material_id.clone())
                .or_default()
                .push(entry);
        }

        for rows in by_material.values_mut() {
            rows.sort_by(|l, r| {
                // UNWRAP: energies checked finite above
                l.energy_kev.partial_cmp(&r.energy_kev).unwrap()
            });
            for pair in rows.windows(2) {
                if pair[1].energy_kev <= pair[0].energy_kev {
                    return Err(Error::Other(anyhow::anyhow!(
                        "duplicate build-up key ({}, {} keV)",
                        pair[1].material_id,
                        pair[1].energy_kev
                    )));
                }
            }
        }

        Ok(Self { by_material })
    }

    /// Interpolated coefficients for (material, energy).
    ///
    /// # Errors
    ///
    /// [`Error::NumericalDegeneracy`] when the table has no usable region
    /// for the key; the context carries material and energy.
    fn coefficients(
        &self,
        material_id: &str,
        energy_kev: KeV,
    ) -> Result<(GpCoefficients, TaylorCoefficients, Mfp)> {
        let missing = |context: &str| Error::NumericalDegeneracy {
            context: context.to_string(),
            material: material_id.to_string(),
            energy_kev,
        };

        let rows = self
            .by_material
            .get(material_id)
            .ok_or_else(|| missing("build-up table has no material"))?;

        let first = rows.first().ok_or_else(|| missing("build-up table is empty"))?;
        let last = rows.last().ok_or_else(|| missing("build-up table is empty"))?;
        if energy_kev < first.energy_kev || energy_kev > last.energy_kev {
            return Err(missing("build-up table does not cover the energy"));
        }

        let gap = rows.partition_point(|row| row.energy_kev < energy_kev);
        if gap < rows.len() && rows[gap].energy_kev == energy_kev {
            let row = &rows[gap];
            return Ok((row.gp, row.taylor, row.tau_max));
        }

        // gap is in 1..len because the span check above caught the ends
        let (lo, hi) = (&rows[gap - 1], &rows[gap]);
        let fraction =
            (energy_kev.ln() - lo.energy_kev.ln()) / (hi.energy_kev.ln() - lo.energy_kev.ln());

        let gp = GpCoefficients {
            b: blend(lo.gp.b, hi.gp.b, fraction),
            c: blend(lo.gp.c, hi.gp.c, fraction),
            a: blend(lo.gp.a, hi.gp.a, fraction),
            xk: blend(lo.gp.xk, hi.gp.xk, fraction),
            d: blend(lo.gp.d, hi.gp.d, fraction),
        };
        let taylor = TaylorCoefficients {
            a1: blend(lo.taylor.a1, hi.taylor.a1, fraction),
            alpha1: blend(lo.taylor.alpha1, hi.taylor.alpha1, fraction),
            alpha2: blend(lo.taylor.alpha2, hi.taylor.alpha2, fraction),
        };

        Ok((gp, taylor, lo.tau_max.min(hi.tau_max)))
    }

    /// Build-up factor for a single region of `tau` mfp of `material_id`.
    ///
    /// Both parametric forms are evaluated; `method` selects which one is
    /// returned ([`BuildUpMethod::LastMaterial`] and
    /// [`BuildUpMethod::Kalos`] use the GP form). A disagreement beyond
    /// [`CROSS_CHECK_TOLERANCE`] sets the cross-check warning.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUnit`] for a negative or non-finite `tau`,
    /// [`Error::NumericalDegeneracy`] for a missing table region.
    pub fn factor(
        &self,
        material_id: &str,
        energy_kev: KeV,
        tau: Mfp,
        method: BuildUpMethod,
    ) -> Result<BuildUp> {
        if !tau.is_finite() || tau < 0.0 {
            return Err(Error::InvalidUnit {
                quantity: "tau_mfp",
                value: tau,
            });
        }

        let (gp, taylor, tau_max) = self.coefficients(material_id, energy_kev)?;
        let mut warnings = Warnings::empty();

        let domain = TAU_DOMAIN_MAX.min(tau_max);
        let tau = if tau > domain {
            warnings |= Warnings::CLAMPED_TAU;
            domain
        } else {
            tau
        };

        let gp_value = gp_factor(&gp, tau);
        let taylor_value = taylor_factor(&taylor, tau);
        if gp_value > 0.0 && ((gp_value - taylor_value) / gp_value).abs() > CROSS_CHECK_TOLERANCE {
            warnings |= Warnings::GP_TAYLOR_DISAGREEMENT;
        }

        let factor = match method {
            BuildUpMethod::Taylor => taylor_value,
            BuildUpMethod::Gp | BuildUpMethod::LastMaterial | BuildUpMethod::Kalos => gp_value,
        };

        Ok(BuildUp { factor, warnings })
    }

    /// Composes the build-up factor of an ordered sequence of regions,
    /// each with its own material and partial optical depth. Regions with
    /// zero depth contribute nothing; an all-empty sequence yields 1.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::factor`] errors for any contributing region.
    pub fn compose(
        &self,
        regions: &[(&str, Mfp)],
        energy_kev: KeV,
        method: BuildUpMethod,
    ) -> Result<BuildUp> {
        let active: Vec<(&str, Mfp)> = regions
            .iter()
            .copied()
            .filter(|&(_, tau)| tau > 0.0)
            .collect();

        if active.is_empty() {
            return Ok(BuildUp {
                factor: 1.0,
                warnings: Warnings::empty(),
            });
        }

        let total_tau: Mfp = active.iter().map(|&(_, tau)| tau).sum();

        match method {
            BuildUpMethod::Kalos => {
                let mut factor = 1.0;
                let mut warnings = Warnings::empty();
                for &(material, tau) in &active {
                    let stage = self.factor(material, energy_kev, tau, BuildUpMethod::Gp)?;
                    factor *= stage.factor;
                    warnings |= stage.warnings;
                }
                Ok(BuildUp { factor, warnings })
            }
            BuildUpMethod::LastMaterial => {
                // UNWRAP: active is non-empty here
                let (material, _) = *active.last().unwrap();
                self.factor(material, energy_kev, total_tau, BuildUpMethod::Gp)
            }
            BuildUpMethod::Gp | BuildUpMethod::Taylor => {
                let (dominant, tie) = dominant_region(&active);
                // UNWRAP: active is non-empty here
                let mut built = self.factor(dominant.unwrap(), energy_kev, total_tau, method)?;
                built.warnings |= tie;
                Ok(built)
            }
        }
    }
}

/// Picks the region with the largest partial optical depth and flags a
/// tie when the runner-up of a different material is within
/// [`DOMINANT_TIE_MARGIN`].
pub(crate) fn dominant_region<'a>(regions: &[(&'a str, Mfp)]) -> (Option<&'a str>, Warnings) {
    let Some(&(leader, leader_tau)) = regions
        .iter()
        .max_by(|l, r| l.1.partial_cmp(&r.1).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return (None, Warnings::empty());
    };

    let tie = regions.iter().any(|&(material, tau)| {
        material != leader && tau > 0.0 && tau >= leader_tau * (1.0 - DOMINANT_TIE_MARGIN)
    });

    (
        Some(leader),
        if tie {
            Warnings::DOMINANT_MATERIAL_TIE
        } else {
            Warnings::empty()
        },
    )
}

/// Interpolates one parameter: log-log when both ends are positive,
/// otherwise linear in log energy (exponents may be negative).
fn blend(lo: f64, hi: f64, fraction: f64) -> f64 {
    if lo > 0.0 && hi > 0.0 {
        (hi.ln() - lo.ln()).mul_add(fraction, lo.ln()).exp()
    } else {
        (hi - lo).mul_add(fraction, lo)
    }
}

/// `B(tau) = 1 + (b - 1) (K^tau - 1) / (K - 1)` with the GP dose
/// multiplication factor `K(tau)`; the removable singularity at `K = 1`
/// uses the linear limit.
fn gp_factor(c: &GpCoefficients, tau: Mfp) -> f64 {
    let tanh_m2 = (-2.0_f64).tanh();
    let k = c.d.mul_add(
        (((tau / c.xk) - 2.0).tanh() - tanh_m2) / (1.0 - tanh_m2),
        c.c * tau.powf(c.a),
    );

    if (k - 1.0).abs() < 1e-9 {
        (c.b - 1.0).mul_add(tau, 1.0)
    } else {
        1.0 + (c.b - 1.0) * (k.powf(tau) - 1.0) / (k - 1.0)
    }
}

/// `B(tau) = A1 e^{-alpha1 tau} + (1 - A1) e^{-alpha2 tau}`.
fn taylor_factor(c: &TaylorCoefficients, tau: Mfp) -> f64 {
    c.a1.mul_add(
        (-c.alpha1 * tau).exp(),
        (1.0 - c.a1) * (-c.alpha2 * tau).exp(),
    )
}
