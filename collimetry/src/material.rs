//! Material database: pure elements and alloys with their energy-indexed
//! attenuation coefficients.
//!
//! The store is read-mostly: it is built once at engine initialization and
//! shared immutably across ray workers afterwards. Coefficient lookups
//! interpolate log-log on the material's energy grid; queries outside the
//! grid are an error, never a silent extrapolation. The single permitted
//! extrapolation mode is [`EdgePolicy::NearestSide`], which answers
//! queries whose bracketing pair straddles an absorption edge from the two
//! nearest points on the query's side of the edge.

use super::convert::KeV;
use super::error::{Error, Result};
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Tolerance on alloy weight-fraction sums.
pub const COMPOSITION_TOLERANCE: f64 = 1e-6;

/// Classification of a material record.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialCategory {
    /// A single chemical element.
    PureElement,
    /// A mixture of elements with weight fractions summing to one.
    Alloy,
}

/// One (element, weight fraction) term of an alloy composition.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CompositionEntry {
    /// Material id of the constituent element.
    pub element: String,
    /// Weight fraction of the constituent, in `[0, 1]`.
    pub weight_fraction: f64,
}

/// Mass attenuation coefficients at one grid energy, all in cm^2/g.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct AttenuationDataPoint {
    /// Grid energy in keV.
    pub energy_kev: KeV,
    /// Total mass attenuation coefficient (coherent included).
    pub total: f64,
    /// Mass energy-absorption coefficient.
    pub energy_absorption: f64,
    /// Photoelectric contribution.
    pub photoelectric: f64,
    /// Incoherent (Compton) contribution.
    pub compton: f64,
    /// Pair-production contribution (nuclear and electron fields).
    pub pair: f64,
}

impl AttenuationDataPoint {
    const fn coefficient(&self, kind: CoefficientKind) -> f64 {
        match kind {
            CoefficientKind::Total => self.total,
            CoefficientKind::EnergyAbsorption => self.energy_absorption,
            CoefficientKind::Photoelectric => self.photoelectric,
            CoefficientKind::Compton => self.compton,
            CoefficientKind::Pair => self.pair,
        }
    }
}

/// Which coefficient column of the attenuation grid to query.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientKind {
    /// Total mass attenuation.
    Total,
    /// Mass energy absorption.
    EnergyAbsorption,
    /// Photoelectric absorption.
    Photoelectric,
    /// Incoherent (Compton) scattering.
    Compton,
    /// Pair production.
    Pair,
}

/// Behaviour when the bracketing grid pair straddles an absorption edge.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgePolicy {
    /// Refuse to interpolate across the discontinuity.
    Strict,
    /// Extrapolate from the two nearest points on the query's side of the
    /// edge, so the discontinuity is never crossed.
    #[default]
    NearestSide,
}

/// One material record: identity, bulk properties and attenuation grid.
///
/// Invariants (checked by [`MaterialSet::new`]): the grid is non-empty and
/// strictly increasing in energy, all coefficients are finite and
/// non-negative, the density is positive, and alloy compositions sum to
/// one within [`COMPOSITION_TOLERANCE`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Material {
    /// Stable id referenced by geometry layers, e.g. `pb`.
    pub id: String,
    /// Display name, e.g. `Lead`.
    pub name: String,
    /// Chemical symbol, e.g. `Pb`.
    pub symbol: String,
    /// Effective atomic number.
    pub atomic_number: f64,
    /// Mass density in g/cm^3.
    pub density: f64,
    /// Presentation colour, opaque to the engine.
    pub color: String,
    /// Pure element or alloy.
    pub category: MaterialCategory,
    /// Alloy composition; empty for pure elements.
    #[serde(default)]
    pub composition: Vec<CompositionEntry>,
    /// Attenuation grid, sorted by energy, duplicates forbidden.
    pub points: Vec<AttenuationDataPoint>,
    /// Absorption-edge energies inside the grid, sorted.
    #[serde(default)]
    pub edges_kev: Vec<KeV>,
}

impl Material {
    /// Lower and upper energies of the attenuation grid in keV.
    #[must_use]
    pub fn grid_span(&self) -> (KeV, KeV) {
        // the grid is validated non-empty on construction
        (
            self.points.first().map_or(f64::NAN, |p| p.energy_kev),
            self.points.last().map_or(f64::NAN, |p| p.energy_kev),
        )
    }

    fn out_of_range(&self, energy_kev: KeV) -> Error {
        let (min_kev, max_kev) = self.grid_span();
        Error::OutOfRange {
            material: self.id.clone(),
            energy_kev,
            min_kev,
            max_kev,
        }
    }

    /// Returns the edge strictly between the grid points `lo` and `hi`,
    /// if any.
    fn edge_between(&self, lo: KeV, hi: KeV) -> Option<KeV> {
        self.edges_kev
            .iter()
            .copied()
            .find(|&edge| lo < edge && edge < hi)
    }

    /// Interpolates one coefficient column at `energy_kev`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] outside the grid, and
    /// [`Error::NumericalDegeneracy`] when the bracketing pair straddles an
    /// absorption edge under [`EdgePolicy::Strict`].
    pub fn mu_over_rho(
        &self,
        energy_kev: KeV,
        kind: CoefficientKind,
        policy: EdgePolicy,
    ) -> Result<f64> {
        let points = &self.points;
        let (min_kev, max_kev) = self.grid_span();
        if !energy_kev.is_finite() || energy_kev < min_kev || energy_kev > max_kev {
            return Err(self.out_of_range(energy_kev));
        }

        match points.binary_search_by(|p| {
            // UNWRAP: grid energies are validated finite
            p.energy_kev.partial_cmp(&energy_kev).unwrap()
        }) {
            Ok(i) => Ok(points[i].coefficient(kind)),
            Err(i) => {
                // i is in 1..len because the span check above caught the ends
                let (lo, hi) = (&points[i - 1], &points[i]);

                match self.edge_between(lo.energy_kev, hi.energy_kev) {
                    None => Ok(interpolate_log_log(lo, hi, energy_kev, kind)),
                    Some(_) if policy == EdgePolicy::Strict => {
                        Err(Error::NumericalDegeneracy {
                            context: "attenuation grid straddles an absorption edge".to_string(),
                            material: self.id.clone(),
                            energy_kev,
                        })
                    }
                    Some(edge) => Ok(self.nearest_side(i, edge, energy_kev, kind)),
                }
            }
        }
    }

    /// Extrapolates from the grid pair on the query's side of `edge`. Both
    /// points used fall on the same side by construction; with only one
    /// point available its value is returned unchanged.
    fn nearest_side(&self, gap: usize, edge: KeV, energy_kev: KeV, kind: CoefficientKind) -> f64 {
        let points = &self.points;
        if energy_kev < edge {
            let hi = &points[gap - 1];
            if gap >= 2 && self.edge_between(points[gap - 2].energy_kev, hi.energy_kev).is_none() {
                interpolate_log_log(&points[gap - 2], hi, energy_kev, kind)
            } else {
                hi.coefficient(kind)
            }
        } else {
            let lo = &points[gap];
            if gap + 1 < points.len()
                && self.edge_between(lo.energy_kev, points[gap + 1].energy_kev).is_none()
            {
                interpolate_log_log(lo, &points[gap + 1], energy_kev, kind)
            } else {
                lo.coefficient(kind)
            }
        }
    }
}

/// Log-log interpolation between two grid points; falls back to linear
/// when a value is zero (e.g. pair production below threshold).
fn interpolate_log_log(
    lo: &AttenuationDataPoint,
    hi: &AttenuationDataPoint,
    energy_kev: KeV,
    kind: CoefficientKind,
) -> f64 {
    let (e0, e1) = (lo.energy_kev, hi.energy_kev);
    let (y0, y1) = (lo.coefficient(kind), hi.coefficient(kind));
    let fraction = (energy_kev.ln() - e0.ln()) / (e1.ln() - e0.ln());

    if y0 > 0.0 && y1 > 0.0 {
        (y1.ln() - y0.ln()).mul_add(fraction, y0.ln()).exp()
    } else {
        (y1 - y0).mul_add(fraction, y0)
    }
}

/// Immutable, id-keyed store of all known materials. Built once through
/// [`MaterialSet::new`]; persistence goes through the data files, not
/// through the store itself.
#[derive(Clone, Debug)]
pub struct MaterialSet {
    materials: Vec<Material>,
    index: FxHashMap<String, usize>,
}

impl MaterialSet {
    /// Builds the store, checking every material invariant.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUnit`] for non-finite or negative grid data,
    /// [`Error::InvalidComposition`] for alloy weights not summing to one,
    /// and [`Error::Other`] for structural defects such as duplicate ids
    /// or unsorted grids.
    pub fn new(materials: Vec<Material>) -> Result<Self> {
        let mut index = FxHashMap::default();

        for (slot, material) in materials.iter().enumerate() {
            validate_material(material)?;
            if index.insert(material.id.clone(), slot).is_some() {
                return Err(Error::Other(anyhow!(
                    "duplicate material id `{}`",
                    material.id
                )));
            }
        }

        Ok(Self { materials, index })
    }

    /// All known materials, in load order.
    #[must_use]
    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    /// Looks up one material by id.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id.
    pub fn material(&self, id: &str) -> Result<&Material> {
        self.index
            .get(id)
            .map(|&slot| &self.materials[slot])
            .ok_or_else(|| Error::NotFound {
                material: id.to_string(),
            })
    }

    /// Total mass attenuation coefficient in cm^2/g at `energy_kev`, with
    /// the default [`EdgePolicy::NearestSide`].
    ///
    /// # Errors
    ///
    /// See [`Material::mu_over_rho`] and [`Self::material`].
    pub fn mu_over_rho(&self, id: &str, energy_kev: KeV) -> Result<f64> {
        self.mu_over_rho_with(id, energy_kev, CoefficientKind::Total, EdgePolicy::default())
    }

    /// Coefficient lookup with explicit column and edge policy.
    ///
    /// # Errors
    ///
    /// See [`Material::mu_over_rho`] and [`Self::material`].
    pub fn mu_over_rho_with(
        &self,
        id: &str,
        energy_kev: KeV,
        kind: CoefficientKind,
        policy: EdgePolicy,
    ) -> Result<f64> {
        self.material(id)?.mu_over_rho(energy_kev, kind, policy)
    }

    /// Mixture-rule coefficient for an ad-hoc composition,
    /// `sum_i w_i * (mu/rho)(element_i, E)`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidComposition`] when the weights do not sum to one,
    /// plus any per-element lookup error.
    pub fn mu_over_rho_alloy(
        &self,
        composition: &[CompositionEntry],
        energy_kev: KeV,
    ) -> Result<f64> {
        let sum: f64 = composition.iter().map(|c| c.weight_fraction).sum();
        if (sum - 1.0).abs() > COMPOSITION_TOLERANCE {
            return Err(Error::InvalidComposition { sum });
        }

        composition.iter().try_fold(0.0, |acc, entry| {
            Ok(entry
                .weight_fraction
                .mul_add(self.mu_over_rho(&entry.element, energy_kev)?, acc))
        })
    }

    /// Fraction of the total attenuation due to Compton scattering,
    /// `mu_compton / mu_total`, clamped to `[0, 1]`.
    ///
    /// # Errors
    ///
    /// See [`Material::mu_over_rho`] and [`Self::material`].
    pub fn compton_fraction(&self, id: &str, energy_kev: KeV) -> Result<f64> {
        let material = self.material(id)?;
        let policy = EdgePolicy::default();
        let total = material.mu_over_rho(energy_kev, CoefficientKind::Total, policy)?;
        let compton = material.mu_over_rho(energy_kev, CoefficientKind::Compton, policy)?;

        if total <= 0.0 {
            return Ok(0.0);
        }
        Ok((compton / total).clamp(0.0, 1.0))
    }

}

fn validate_material(material: &Material) -> Result<()> {
    if material.points.is_empty() {
        return Err(Error::Other(anyhow!(
            "material `{}` has an empty attenuation grid",
            material.id
        )));
    }
    if !(material.density.is_finite() && material.density > 0.0) {
        return Err(Error::InvalidUnit {
            quantity: "density_g_cm3",
            value: material.density,
        });
    }

    for pair in material.points.windows(2) {
        if pair[1].energy_kev <= pair[0].energy_kev {
            return Err(Error::Other(anyhow!(
                "attenuation grid of `{}` is not strictly increasing at {} keV",
                material.id,
                pair[1].energy_kev
            )));
        }
    }
    for point in &material.points {
        for value in [
            point.energy_kev,
            point.total,
            point.energy_absorption,
            point.photoelectric,
            point.compton,
            point.pair,
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidUnit {
                    quantity: "attenuation_coefficient",
                    value,
                });
            }
        }
    }

    if material.category == MaterialCategory::Alloy {
        let sum: f64 = material.composition.iter().map(|c| c.weight_fraction).sum();
        if (sum - 1.0).abs() > COMPOSITION_TOLERANCE {
            return Err(Error::InvalidComposition { sum });
        }
    }

    Ok(())
}
