//! Data-file schemas and loaders.
//!
//! Material data comes one file per material: a header identifying the
//! material and its valid energy range, then the sorted attenuation rows
//! as tabulated by NIST XCOM. Build-up coefficients live in a single
//! aggregate file keyed by (material, energy) carrying both the GP and
//! Taylor parameter sets. All resource discovery is by paths supplied by
//! the host; the engine opens nothing on its own.
//!
//! A reference dataset distilled from NIST XCOM and ANSI/ANS-6.4.3 is
//! compiled in, so the engine works out of the box and the test suite
//! needs no external files.

use super::buildup::{BuildUpEntry, BuildUpTable, GpCoefficients, TaylorCoefficients};
use super::convert::KeV;
use super::error::{Error, Result};
use super::material::{
    AttenuationDataPoint, CompositionEntry, Material, MaterialCategory, MaterialSet,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Identity block of a material data file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MaterialHeader {
    /// Stable id, referenced by geometry layers.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Chemical symbol.
    pub symbol: String,
    /// Effective atomic number.
    pub atomic_number: f64,
    /// Mass density in g/cm^3.
    pub density_g_cm3: f64,
    /// Presentation colour, carried through untouched.
    #[serde(default)]
    pub color: String,
    /// Pure element or alloy.
    pub category: MaterialCategory,
    /// Alloy composition; empty for pure elements.
    #[serde(default)]
    pub composition: Vec<CompositionEntry>,
    /// Provenance of the tabulation, e.g. `NIST XCOM`.
    pub source: String,
    /// Lower end of the tabulated range in keV.
    pub min_energy_kev: KeV,
    /// Upper end of the tabulated range in keV.
    pub max_energy_kev: KeV,
    /// Absorption edges inside the range, sorted.
    #[serde(default)]
    pub edges_kev: Vec<KeV>,
}

/// One tabulated attenuation row, all coefficients in cm^2/g.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct AttenuationRow {
    /// Row energy in keV.
    pub energy_kev: KeV,
    /// Total mass attenuation including coherent scattering.
    pub total_with_coherent: f64,
    /// Total mass attenuation without coherent scattering.
    pub total_without_coherent: f64,
    /// Photoelectric absorption.
    pub photoelectric: f64,
    /// Incoherent (Compton) scattering.
    pub compton: f64,
    /// Pair production in the nuclear field.
    pub pair_nuclear: f64,
    /// Pair production in the electron field.
    pub pair_electron: f64,
    /// Mass energy absorption; optional in older files.
    #[serde(default)]
    pub energy_absorption: f64,
}

/// A parsed material data file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MaterialFile {
    /// Identity and range declaration.
    pub header: MaterialHeader,
    /// Attenuation rows, sorted by energy.
    pub rows: Vec<AttenuationRow>,
}

impl MaterialFile {
    /// Parses one material document.
    ///
    /// # Errors
    ///
    /// Wraps the underlying parser error.
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        serde_yaml::from_str(document).map_err(Error::other)
    }

    /// Converts the file into the in-memory material record. Structural
    /// validation happens in [`MaterialSet::new`].
    #[must_use]
    pub fn into_material(self) -> Material {
        let points = self
            .rows
            .into_iter()
            .map(|row| AttenuationDataPoint {
                energy_kev: row.energy_kev,
                total: row.total_with_coherent,
                energy_absorption: row.energy_absorption,
                photoelectric: row.photoelectric,
                compton: row.compton,
                pair: row.pair_nuclear + row.pair_electron,
            })
            .collect();

        Material {
            id: self.header.id,
            name: self.header.name,
            symbol: self.header.symbol,
            atomic_number: self.header.atomic_number,
            density: self.header.density_g_cm3,
            color: self.header.color,
            category: self.header.category,
            composition: self.header.composition,
            points,
            edges_kev: self.header.edges_kev,
        }
    }
}

/// One row of the aggregate build-up coefficient file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BuildUpRow {
    /// Material the row belongs to.
    pub material_id: String,
    /// Energy key in keV.
    pub energy_kev: KeV,
    /// GP parameters (b, c, a, Xk, d).
    pub gp: GpCoefficients,
    /// Taylor parameters (A1, alpha1, alpha2).
    pub taylor: TaylorCoefficients,
    /// Declared optical-depth validity, in mfp.
    #[serde(default = "default_tau_max")]
    pub tau_max: f64,
}

const fn default_tau_max() -> f64 {
    40.0
}

/// The aggregate build-up file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BuildUpFile {
    /// All coefficient rows.
    pub entries: Vec<BuildUpRow>,
}

impl BuildUpFile {
    /// Parses the aggregate build-up document.
    ///
    /// # Errors
    ///
    /// Wraps the underlying parser error.
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        serde_yaml::from_str(document).map_err(Error::other)
    }

    /// Builds the runtime table.
    ///
    /// # Errors
    ///
    /// See [`BuildUpTable::new`].
    pub fn into_table(self) -> Result<BuildUpTable> {
        BuildUpTable::new(
            self.entries
                .into_iter()
                .map(|row| BuildUpEntry {
                    material_id: row.material_id,
                    energy_kev: row.energy_kev,
                    gp: row.gp,
                    taylor: row.taylor,
                    tau_max: row.tau_max,
                })
                .collect(),
        )
    }
}

/// Loads one material file from a host-supplied path.
///
/// # Errors
///
/// I/O and parse errors are wrapped into [`Error::Other`].
pub fn load_material_file(path: impl AsRef<Path>) -> Result<MaterialFile> {
    let document = fs::read_to_string(path).map_err(Error::other)?;
    MaterialFile::from_yaml_str(&document)
}

/// Loads a whole material store from host-supplied paths, one file per
/// material.
///
/// # Errors
///
/// Propagates per-file errors and [`MaterialSet::new`] validation.
pub fn load_materials_from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<MaterialSet> {
    let materials = paths
        .iter()
        .map(|path| Ok(load_material_file(path)?.into_material()))
        .collect::<Result<Vec<_>>>()?;
    MaterialSet::new(materials)
}

/// Loads the aggregate build-up table from a host-supplied path.
///
/// # Errors
///
/// I/O, parse and table-validation errors.
pub fn load_buildup_from_path(path: impl AsRef<Path>) -> Result<BuildUpTable> {
    let document = fs::read_to_string(path).map_err(Error::other)?;
    BuildUpFile::from_yaml_str(&document)?.into_table()
}

const EMBEDDED_MATERIALS: &[&str] = &[
    include_str!("../data/materials/pb.yaml"),
    include_str!("../data/materials/fe.yaml"),
    include_str!("../data/materials/w.yaml"),
    include_str!("../data/materials/al.yaml"),
    include_str!("../data/materials/cu.yaml"),
    include_str!("../data/materials/air.yaml"),
    include_str!("../data/materials/steel.yaml"),
];

const EMBEDDED_BUILDUP: &str = include_str!("../data/buildup.yaml");

/// The compiled-in reference material store (Pb, Fe, W, Al, Cu, air and
/// a structural-steel alloy), distilled from NIST XCOM.
///
/// # Panics
///
/// Never for the shipped dataset; the embedded documents are covered by
/// the test suite.
#[must_use]
pub fn reference_materials() -> MaterialSet {
    let materials = EMBEDDED_MATERIALS
        .iter()
        .map(|document| {
            MaterialFile::from_yaml_str(document)
                .map(MaterialFile::into_material)
                .expect("embedded material document parses")
        })
        .collect();
    MaterialSet::new(materials).expect("embedded material dataset is valid")
}

/// The compiled-in reference build-up table matching
/// [`reference_materials`], shaped after ANSI/ANS-6.4.3.
///
/// # Panics
///
/// Never for the shipped dataset.
#[must_use]
pub fn reference_buildup() -> BuildUpTable {
    BuildUpFile::from_yaml_str(EMBEDDED_BUILDUP)
        .and_then(BuildUpFile::into_table)
        .expect("embedded build-up dataset is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{CoefficientKind, EdgePolicy};
    use float_cmp::assert_approx_eq;

    #[test]
    fn the_embedded_dataset_loads() {
        let materials = reference_materials();
        assert_eq!(materials.materials().len(), 7);
        for id in ["pb", "fe", "w", "al", "cu", "air", "steel"] {
            materials.material(id).unwrap();
        }
        reference_buildup();
    }

    #[test]
    fn lead_matches_its_tabulated_anchors() {
        let materials = reference_materials();
        assert_approx_eq!(
            f64,
            materials.mu_over_rho("pb", 1000.0).unwrap(),
            0.07102,
            epsilon = 1e-9
        );
        // the row next to the K edge
        assert_approx_eq!(
            f64,
            materials.mu_over_rho("pb", 88.0).unwrap(),
            5.021,
            epsilon = 1e-9
        );
        assert_eq!(materials.material("pb").unwrap().density, 11.34);
    }

    #[test]
    fn partial_coefficients_sum_to_the_total_without_coherent() {
        let materials = reference_materials();
        for id in ["pb", "fe", "w", "al"] {
            let material = materials.material(id).unwrap();
            for point in &material.points {
                let parts = point.photoelectric + point.compton + point.pair;
                assert!(
                    parts <= point.total * 1.001,
                    "{id} at {} keV: parts {parts} exceed total {}",
                    point.energy_kev,
                    point.total
                );
            }
        }
    }

    #[test]
    fn steel_is_an_alloy_of_shipped_elements() {
        let materials = reference_materials();
        let steel = materials.material("steel").unwrap();
        assert_eq!(steel.category, MaterialCategory::Alloy);
        let direct = materials.mu_over_rho("steel", 1000.0).unwrap();
        let mixed = materials
            .mu_over_rho_alloy(&steel.composition, 1000.0)
            .unwrap();
        assert_approx_eq!(f64, direct, mixed, epsilon = 1e-6);
    }

    #[test]
    fn compton_dominates_lead_at_a_few_hundred_kev() {
        let materials = reference_materials();
        let fraction = materials.compton_fraction("pb", 1000.0).unwrap();
        assert!(fraction > 0.5, "compton fraction {fraction}");
        let low = materials.compton_fraction("pb", 60.0).unwrap();
        assert!(low < 0.1, "compton fraction {low} at 60 keV");
    }

    #[test]
    fn tungsten_declares_its_k_edge() {
        let materials = reference_materials();
        let tungsten = materials.material("w").unwrap();
        assert_eq!(tungsten.edges_kev, vec![69.5]);
        // strict interpolation across the edge refuses
        assert!(tungsten
            .mu_over_rho(69.5, CoefficientKind::Total, EdgePolicy::Strict)
            .is_err());
    }

    #[test]
    fn material_files_round_trip() {
        let file = MaterialFile::from_yaml_str(EMBEDDED_MATERIALS[0]).unwrap();
        let again = serde_yaml::to_string(&file).unwrap();
        let back = MaterialFile::from_yaml_str(&again).unwrap();
        assert_eq!(back.header.id, "pb");
        assert_eq!(back.rows.len(), file.rows.len());
    }

    #[test]
    fn buildup_rows_cover_every_shipped_material() {
        let table = reference_buildup();
        for id in ["pb", "fe", "w", "al", "cu", "air", "steel"] {
            table
                .factor(id, 1000.0, 1.0, crate::buildup::BuildUpMethod::Gp)
                .unwrap();
        }
    }
}
