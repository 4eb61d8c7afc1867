//! Closed-form attenuation quantities: linear coefficients, Beer-Lambert
//! transmission through layer stacks, characteristic thicknesses and
//! parameter sweeps.
//!
//! All operations are pure; the material and build-up tables are borrowed
//! immutably so parallel callers share them without synchronization.

use super::buildup::{BuildUpMethod, BuildUpTable};
use super::convert::{Cm, KeV, Mfp, PerCm};
use super::error::{Error, Result};
use super::material::MaterialSet;
use super::result::Warnings;
use serde::{Deserialize, Serialize};

/// Optical depths beyond this evaluate to zero transmission instead of
/// risking `exp` underflow noise.
pub const OPTICAL_DEPTH_OVERFLOW: Mfp = 700.0;

/// One homogeneous slab of a traversal path.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MaterialPath {
    /// Material of the slab.
    pub material_id: String,
    /// Path length through the slab in cm.
    pub thickness_cm: Cm,
}

impl MaterialPath {
    /// Convenience constructor.
    #[must_use]
    pub fn new(material_id: impl Into<String>, thickness_cm: Cm) -> Self {
        Self {
            material_id: material_id.into(),
            thickness_cm,
        }
    }
}

/// Transmission through a layer stack, with its factors split out.
#[derive(Clone, Debug, PartialEq)]
pub struct Transmission {
    /// Composite optical depth in mfp.
    pub optical_depth: Mfp,
    /// Uncorrected Beer-Lambert transmission `exp(-tau)`.
    pub primary: f64,
    /// Applied build-up factor; exactly 1 when build-up is off or the
    /// path is empty.
    pub buildup_factor: f64,
    /// The transmitted fraction, `buildup_factor * primary`.
    pub value: f64,
    /// Clamp, cross-check and tie flags observed on the way.
    pub warnings: Warnings,
}

/// The physics engine: closed-form quantities over the shared tables.
#[derive(Clone, Copy, Debug)]
pub struct Physics<'a> {
    materials: &'a MaterialSet,
    buildup: &'a BuildUpTable,
}

impl<'a> Physics<'a> {
    /// Borrows the shared tables. The tables are read-only; `Physics` is
    /// freely copyable across threads.
    #[must_use]
    pub const fn new(materials: &'a MaterialSet, buildup: &'a BuildUpTable) -> Self {
        Self { materials, buildup }
    }

    /// The material store backing this engine.
    #[must_use]
    pub const fn materials(&self) -> &'a MaterialSet {
        self.materials
    }

    /// The build-up table backing this engine.
    #[must_use]
    pub const fn buildup(&self) -> &'a BuildUpTable {
        self.buildup
    }

    /// Linear attenuation coefficient `mu = (mu/rho) * rho` in 1/cm.
    ///
    /// # Errors
    ///
    /// Propagates material lookup and grid errors.
    pub fn linear_mu(&self, material_id: &str, energy_kev: KeV) -> Result<PerCm> {
        let material = self.materials.material(material_id)?;
        Ok(self.materials.mu_over_rho(material_id, energy_kev)? * material.density)
    }

    /// Composite optical depth `tau = sum_i mu_i x_i` of a layer stack.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUnit`] for a negative thickness, plus lookup
    /// errors.
    pub fn optical_depth(&self, layers: &[MaterialPath], energy_kev: KeV) -> Result<Mfp> {
        layers.iter().try_fold(0.0, |acc, layer| {
            if !layer.thickness_cm.is_finite() || layer.thickness_cm < 0.0 {
                return Err(Error::InvalidUnit {
                    quantity: "thickness_cm",
                    value: layer.thickness_cm,
                });
            }
            Ok(self
                .linear_mu(&layer.material_id, energy_kev)?
                .mul_add(layer.thickness_cm, acc))
        })
    }

    /// Beer-Lambert transmission through a layer stack, optionally
    /// corrected by the build-up of the dominant material (the layer with
    /// the largest partial optical depth) over the total depth.
    ///
    /// Zero-thickness stacks transmit exactly 1; depths beyond
    /// [`OPTICAL_DEPTH_OVERFLOW`] transmit exactly 0.
    ///
    /// # Errors
    ///
    /// Propagates lookup, unit and build-up table errors.
    pub fn transmission(
        &self,
        layers: &[MaterialPath],
        energy_kev: KeV,
        include_buildup: bool,
    ) -> Result<Transmission> {
        let mut regions: Vec<(&str, Mfp)> = Vec::with_capacity(layers.len());
        for layer in layers {
            if !layer.thickness_cm.is_finite() || layer.thickness_cm < 0.0 {
                return Err(Error::InvalidUnit {
                    quantity: "thickness_cm",
                    value: layer.thickness_cm,
                });
            }
            let tau = self.linear_mu(&layer.material_id, energy_kev)? * layer.thickness_cm;
            regions.push((layer.material_id.as_str(), tau));
        }

        let optical_depth: Mfp = regions.iter().map(|&(_, tau)| tau).sum();
        let primary = if optical_depth > OPTICAL_DEPTH_OVERFLOW {
            0.0
        } else {
            (-optical_depth).exp()
        };

        let (buildup_factor, warnings) = if include_buildup && optical_depth > 0.0 {
            let built = self
                .buildup
                .compose(&regions, energy_kev, BuildUpMethod::Gp)?;
            (built.factor, built.warnings)
        } else {
            (1.0, Warnings::empty())
        };

        Ok(Transmission {
            optical_depth,
            primary,
            buildup_factor,
            value: buildup_factor * primary,
            warnings,
        })
    }

    /// Half-value layer `ln 2 / mu` in cm.
    ///
    /// # Errors
    ///
    /// [`Error::NumericalDegeneracy`] when the linear coefficient is not
    /// positive, plus lookup errors.
    pub fn hvl(&self, material_id: &str, energy_kev: KeV) -> Result<Cm> {
        Ok(std::f64::consts::LN_2 / self.positive_mu(material_id, energy_kev)?)
    }

    /// Tenth-value layer `ln 10 / mu` in cm.
    ///
    /// # Errors
    ///
    /// See [`Self::hvl`].
    pub fn tvl(&self, material_id: &str, energy_kev: KeV) -> Result<Cm> {
        Ok(std::f64::consts::LN_10 / self.positive_mu(material_id, energy_kev)?)
    }

    /// Mean free path `1 / mu` in cm.
    ///
    /// # Errors
    ///
    /// See [`Self::hvl`].
    pub fn mean_free_path(&self, material_id: &str, energy_kev: KeV) -> Result<Cm> {
        Ok(1.0 / self.positive_mu(material_id, energy_kev)?)
    }

    fn positive_mu(&self, material_id: &str, energy_kev: KeV) -> Result<PerCm> {
        let mu = self.linear_mu(material_id, energy_kev)?;
        if mu > 0.0 {
            Ok(mu)
        } else {
            Err(Error::NumericalDegeneracy {
                context: "linear attenuation coefficient is not positive".to_string(),
                material: material_id.to_string(),
                energy_kev,
            })
        }
    }

    /// Plain Beer-Lambert transmission of the stack at each energy.
    ///
    /// # Errors
    ///
    /// Propagates lookup and unit errors for any energy.
    pub fn energy_sweep(&self, layers: &[MaterialPath], energies_kev: &[KeV]) -> Result<Vec<f64>> {
        energies_kev
            .iter()
            .map(|&energy| Ok(self.transmission(layers, energy, false)?.value))
            .collect()
    }

    /// Plain Beer-Lambert transmission of one material at each thickness.
    ///
    /// # Errors
    ///
    /// Propagates lookup and unit errors.
    pub fn thickness_sweep(
        &self,
        material_id: &str,
        energy_kev: KeV,
        thicknesses_cm: &[Cm],
    ) -> Result<Vec<f64>> {
        let mu = self.linear_mu(material_id, energy_kev)?;
        thicknesses_cm
            .iter()
            .map(|&x| {
                if !x.is_finite() || x < 0.0 {
                    return Err(Error::InvalidUnit {
                        quantity: "thickness_cm",
                        value: x,
                    });
                }
                let tau = mu * x;
                Ok(if tau > OPTICAL_DEPTH_OVERFLOW {
                    0.0
                } else {
                    (-tau).exp()
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use float_cmp::assert_approx_eq;

    fn engine_tables() -> (MaterialSet, BuildUpTable) {
        (data::reference_materials(), data::reference_buildup())
    }

    #[test]
    fn linear_mu_is_mass_coefficient_times_density() {
        let (materials, buildup) = engine_tables();
        let physics = Physics::new(&materials, &buildup);
        let mu = physics.linear_mu("pb", 1000.0).unwrap();
        let material = materials.material("pb").unwrap();
        let mass = materials.mu_over_rho("pb", 1000.0).unwrap();
        assert_approx_eq!(f64, mu, mass * material.density, ulps = 2);
    }

    #[test]
    fn characteristic_thicknesses_invert_mu() {
        let (materials, buildup) = engine_tables();
        let physics = Physics::new(&materials, &buildup);
        let mu = physics.linear_mu("pb", 1000.0).unwrap();

        assert_approx_eq!(
            f64,
            physics.hvl("pb", 1000.0).unwrap() * mu,
            std::f64::consts::LN_2,
            epsilon = 1e-12
        );
        assert_approx_eq!(
            f64,
            physics.tvl("pb", 1000.0).unwrap() * mu,
            std::f64::consts::LN_10,
            epsilon = 1e-12
        );
        assert_approx_eq!(
            f64,
            physics.mean_free_path("pb", 1000.0).unwrap() * mu,
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn stacked_layers_reproduce_the_product_rule() {
        let (materials, buildup) = engine_tables();
        let physics = Physics::new(&materials, &buildup);

        let stack = [
            MaterialPath::new("pb", 0.5),
            MaterialPath::new("fe", 0.5),
        ];
        let together = physics.transmission(&stack, 1000.0, false).unwrap();

        let lead = physics.transmission(&stack[..1], 1000.0, false).unwrap();
        let iron = physics.transmission(&stack[1..], 1000.0, false).unwrap();

        assert_approx_eq!(
            f64,
            together.value,
            lead.value * iron.value,
            epsilon = 1e-12
        );
        assert_approx_eq!(
            f64,
            together.optical_depth,
            lead.optical_depth + iron.optical_depth,
            epsilon = 1e-12
        );
        assert_approx_eq!(
            f64,
            physics.optical_depth(&stack, 1000.0).unwrap(),
            together.optical_depth,
            epsilon = 1e-12
        );
    }

    #[test]
    fn empty_and_zero_thickness_paths_transmit_everything() {
        let (materials, buildup) = engine_tables();
        let physics = Physics::new(&materials, &buildup);

        let empty = physics.transmission(&[], 1000.0, true).unwrap();
        assert_approx_eq!(f64, empty.value, 1.0, ulps = 2);

        let zero = physics
            .transmission(&[MaterialPath::new("pb", 0.0)], 1000.0, true)
            .unwrap();
        assert_approx_eq!(f64, zero.value, 1.0, ulps = 2);
        assert_approx_eq!(f64, zero.buildup_factor, 1.0, ulps = 2);
    }

    #[test]
    fn huge_depths_underflow_to_zero() {
        let (materials, buildup) = engine_tables();
        let physics = Physics::new(&materials, &buildup);
        let wall = [MaterialPath::new("pb", 1000.0)];
        let through = physics.transmission(&wall, 1000.0, false).unwrap();
        assert_eq!(through.value, 0.0);
    }

    #[test]
    fn negative_thickness_is_rejected() {
        let (materials, buildup) = engine_tables();
        let physics = Physics::new(&materials, &buildup);
        assert!(matches!(
            physics.transmission(&[MaterialPath::new("pb", -1.0)], 1000.0, false),
            Err(Error::InvalidUnit { .. })
        ));
    }

    #[test]
    fn sweeps_match_pointwise_evaluation() {
        let (materials, buildup) = engine_tables();
        let physics = Physics::new(&materials, &buildup);
        let stack = [MaterialPath::new("pb", 1.0)];

        let energies = [500.0, 1000.0, 2000.0];
        let swept = physics.energy_sweep(&stack, &energies).unwrap();
        for (&energy, &value) in energies.iter().zip(&swept) {
            let single = physics.transmission(&stack, energy, false).unwrap();
            assert_approx_eq!(f64, value, single.value, ulps = 2);
        }

        let thicknesses = [0.0, 0.5, 1.0];
        let swept = physics.thickness_sweep("pb", 1000.0, &thicknesses).unwrap();
        assert_approx_eq!(f64, swept[0], 1.0, ulps = 2);
        let mu = physics.linear_mu("pb", 1000.0).unwrap();
        assert_approx_eq!(f64, swept[2], (-mu).exp(), epsilon = 1e-12);
    }
}
