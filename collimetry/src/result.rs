//! Immutable simulation result documents.
//!
//! Everything here is a value object: produced once by a simulation run,
//! tagged with a monotone id and a timestamp, and copied out verbatim by
//! the persistence layer. Nothing in this module mutates after
//! construction.

use super::convert::{Decibel, KeV, Mfp, Mm, Radian};
use bitflags::bitflags;
use ndarray::Array2;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// Non-failing conditions observed during a run, surfaced on the
    /// result so the host can warn without the run being rejected.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Warnings: u32 {
        /// A build-up optical depth exceeded the table domain and was
        /// clamped to 40 mfp.
        const CLAMPED_TAU = 1;
        /// GP and Taylor build-up factors disagree by more than 15 %.
        const GP_TAYLOR_DISAGREEMENT = 1 << 1;
        /// An energy above 1 MeV is treated as monoenergetic.
        const MONOENERGETIC_MEV = 1 << 2;
        /// Scatter was simulated to first order only.
        const SCATTER_ORDER_ONE = 1 << 3;
        /// Two layers were within 10 % of each other in partial optical
        /// depth when picking the dominant build-up material.
        const DOMINANT_MATERIAL_TIE = 1 << 4;
    }
}

impl Serialize for Warnings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Warnings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

/// One detector bin of the intensity profile.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectorBin {
    /// Index of the bin, left to right.
    pub bin_index: usize,
    /// Signed position of the bin centre on the detector plane, in mm.
    pub position_mm: Mm,
    /// Accumulated primary intensity (build-up included when enabled).
    pub primary: f64,
    /// Accumulated scattered intensity; zero when scatter is disabled.
    pub scatter: f64,
    /// `primary + scatter`.
    pub total: f64,
    /// Mean primary transmission of the rays landing in this bin.
    pub transmission: f64,
    /// Mean build-up factor of the rays landing in this bin.
    pub buildup_factor: f64,
}

/// Per-energy, per-layer attenuation breakdown for an on-axis path
/// through the solid shielding stack.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EnergyAnalysis {
    /// The energies of the table rows, in keV.
    pub energies_kev: Vec<KeV>,
    /// One label per column, `stage {i}/{material}`.
    pub layer_labels: Vec<String>,
    /// Partial optical depth per (energy, layer), in mfp.
    pub layer_optical_depth: Array2<Mfp>,
    /// Partial transmission per (energy, layer).
    pub layer_transmission: Array2<f64>,
    /// Composite optical depth per energy.
    pub total_optical_depth: Vec<Mfp>,
    /// Composite transmission per energy.
    pub total_transmission: Vec<f64>,
}

/// Penumbra widths measured between two intensity fractions.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Penumbra {
    /// Lower crossing fraction, e.g. 0.2.
    pub lower_fraction: f64,
    /// Upper crossing fraction, e.g. 0.8.
    pub upper_fraction: f64,
    /// Width of the left transition band in mm.
    pub left_mm: Option<Mm>,
    /// Width of the right transition band in mm.
    pub right_mm: Option<Mm>,
    /// The larger of the two sides in mm.
    pub general_mm: Option<Mm>,
}

/// Quality metrics derived from the detector profile.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QualityMetrics {
    /// Penumbra at the configured fraction pair.
    pub penumbra: Penumbra,
    /// `(I_max - I_min) / (I_max + I_min)` over the central 80 % of the
    /// FWHM region; `None` when the profile has no FWHM edges.
    pub flatness: Option<f64>,
    /// Mean leakage in the shielded region as a fraction of the central
    /// primary mean, build-up included.
    pub leakage_mean: Option<f64>,
    /// Maximum leakage fraction, build-up included.
    pub leakage_max: Option<f64>,
    /// Mean leakage fraction with build-up stripped.
    pub leakage_mean_unbuilt: Option<f64>,
    /// Maximum leakage fraction with build-up stripped.
    pub leakage_max_unbuilt: Option<f64>,
    /// `primary_mean / leakage_mean`.
    pub collimation_ratio: Option<f64>,
    /// `10 * log10(collimation_ratio)`.
    pub collimation_ratio_db: Option<Decibel>,
    /// Mean scatter-to-primary ratio; populated only with scatter on.
    pub spr_mean: Option<f64>,
    /// Maximum scatter-to-primary ratio.
    pub spr_max: Option<f64>,
}

/// One sampled Compton interaction of the scatter tracer.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ScatterInteraction {
    /// Index of the primary ray the event belongs to.
    pub ray_index: usize,
    /// Scatter order of the event (1 = first-order).
    pub order: u8,
    /// Beam-axis position of the event in mm.
    pub z_mm: Mm,
    /// Transverse position of the event in mm.
    pub x_mm: Mm,
    /// Polar scatter angle in rad.
    pub theta: Radian,
    /// Azimuthal angle in rad.
    pub phi: Radian,
    /// Photon energy entering the event, keV.
    pub energy_in_kev: KeV,
    /// Scattered photon energy, keV.
    pub energy_out_kev: KeV,
}

/// One point of the analytic Klein-Nishina angular distribution.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct KnPoint {
    /// Scatter angle in rad.
    pub theta: Radian,
    /// Differential cross-section in cm^2/sr per electron.
    pub dsigma_cm2_sr: f64,
}

/// One bin of the scattered-energy spectrum.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct SpectrumBin {
    /// Lower edge of the bin in keV.
    pub energy_kev: KeV,
    /// Accumulated scattered weight in the bin.
    pub weight: f64,
}

/// Counters for the fates of sampled secondary photons.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ScatterAccounting {
    /// Events sampled along primary and secondary paths.
    pub sampled: u64,
    /// Secondaries that reached the detector plane.
    pub reached_detector: u64,
    /// Secondaries that left the geometry sideways or backwards.
    pub escaped: u64,
    /// Samples discarded below the energy cutoff.
    pub below_cutoff: u64,
    /// Secondaries redirected by a higher-order interaction.
    pub rescattered: u64,
}

impl ScatterAccounting {
    /// Fraction of sampled events whose photon escaped the geometry.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn escaped_fraction(&self) -> f64 {
        if self.sampled == 0 {
            return 0.0;
        }
        self.escaped as f64 / self.sampled as f64
    }
}

/// Compton-level analysis attached to a result when enabled.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ComptonAnalysis {
    /// Analytic Klein-Nishina distribution at the primary energy.
    pub distribution: Vec<KnPoint>,
    /// Histogram of sampled scattered-photon energies.
    pub spectrum: Vec<SpectrumBin>,
    /// Sampled interaction records, capped at
    /// [`MAX_RECORDED_INTERACTIONS`].
    pub interactions: Vec<ScatterInteraction>,
    /// Scattered intensity per detector bin.
    pub profile: Vec<f64>,
    /// Fate counters.
    pub accounting: ScatterAccounting,
}

/// Cap on stored interaction records; the accounting counters keep the
/// full totals.
pub const MAX_RECORDED_INTERACTIONS: usize = 10_000;

/// Immutable outcome of one simulation run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SimulationResult {
    /// Monotone id, unique within the process.
    pub id: u64,
    /// Seconds since the UNIX epoch at completion.
    pub timestamp_s: u64,
    /// Detector profile, one entry per bin.
    pub profile: Vec<DetectorBin>,
    /// Per-energy attenuation table.
    pub energy_analysis: EnergyAnalysis,
    /// Derived quality metrics.
    pub metrics: QualityMetrics,
    /// Compton analysis; `None` when disabled.
    pub compton: Option<ComptonAnalysis>,
    /// Non-failing conditions observed during the run.
    pub warnings: Warnings,
    /// Source configuration document carried verbatim for downstream
    /// dose conversion; the engine never interprets it.
    pub source_config: Option<super::geometry::SourceConfig>,
}

static NEXT_RESULT_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out the next process-wide result id.
pub(crate) fn next_result_id() -> u64 {
    NEXT_RESULT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Seconds since the UNIX epoch, saturating at zero for clocks set
/// before 1970.
pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
