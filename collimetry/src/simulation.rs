//! Beam simulation: the orchestration layer turning a geometry and a
//! configuration into an immutable result record.
//!
//! A run is an embarrassingly parallel reduction over rays. Rays are
//! processed in fixed chunks of about one percent of the total; each
//! chunk produces a local detector histogram and the chunks are merged
//! in order, so the serial and data-parallel modes produce bit-identical
//! results. Progress and cancellation are observed once per chunk, never
//! per ray.

use super::buildup::{dominant_region, BuildUpMethod, BuildUpTable};
use super::compton;
use super::convert::{self, Degree, KeV, Mfp, Mm};
use super::error::{Error, Result};
use super::geometry::CollimatorGeometry;
use super::material::MaterialSet;
use super::metrics::{quality_metrics, FractionPair};
use super::physics::{Physics, OPTICAL_DEPTH_OVERFLOW};
use super::raytrace::{DetectorBins, TracePlan};
use super::result::{
    next_result_id, unix_timestamp, ComptonAnalysis, DetectorBin, EnergyAnalysis,
    SimulationResult, Warnings,
};
use super::scatter::{self, ScatterParams};
use itertools::izip;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Smallest accepted ray count.
pub const MIN_RAY_COUNT: usize = 100;
/// Largest accepted ray count.
pub const MAX_RAY_COUNT: usize = 10_000;

/// Compton-channel configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ComptonConfig {
    /// Master switch for the Compton analysis and scatter tracer.
    pub enabled: bool,
    /// Highest simulated scatter order, 1 or 2.
    pub max_scatter_order: u8,
    /// Secondaries below this energy are discarded, keV.
    pub min_energy_cutoff_kev: KeV,
    /// Angular bins of the Klein-Nishina distribution table.
    pub angular_bins: usize,
}

impl Default for ComptonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_scatter_order: 1,
            min_energy_cutoff_kev: 30.0,
            angular_bins: 36,
        }
    }
}

/// One simulation request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SimulationConfig {
    /// Energies of the energy-analysis table; the first entry drives the
    /// detector profile and the scatter tracer, keV.
    pub energies_kev: Vec<KeV>,
    /// Number of deterministic rays, within
    /// [`MIN_RAY_COUNT`]..=[`MAX_RAY_COUNT`].
    pub ray_count: usize,
    /// Apply build-up factors to blocked rays.
    pub include_buildup: bool,
    /// Run the stochastic scatter tracer (requires `compton.enabled`).
    pub include_scatter: bool,
    /// Angular width of one detector bin, degrees.
    pub angular_resolution_deg: Degree,
    /// Multi-stage build-up composition method.
    #[serde(default)]
    pub buildup_method: BuildUpMethod,
    /// Compton channel settings.
    #[serde(default)]
    pub compton: ComptonConfig,
    /// Scatter sampling step, mm.
    #[serde(default = "default_step_mm")]
    pub scatter_step_mm: Mm,
    /// Seed for the scatter PRNG; part of the request so runs reproduce.
    #[serde(default)]
    pub seed: u64,
    /// Process ray chunks on the rayon pool.
    #[serde(default)]
    pub parallel: bool,
    /// Intensity fractions the penumbra is measured between.
    #[serde(default)]
    pub penumbra_fractions: FractionPair,
}

const fn default_step_mm() -> Mm {
    1.0
}

impl SimulationConfig {
    /// A request with the given energies and ray count, everything else
    /// at its defaults.
    #[must_use]
    pub fn new(energies_kev: Vec<KeV>, ray_count: usize) -> Self {
        Self {
            energies_kev,
            ray_count,
            include_buildup: false,
            include_scatter: false,
            angular_resolution_deg: 0.05,
            buildup_method: BuildUpMethod::default(),
            compton: ComptonConfig::default(),
            scatter_step_mm: default_step_mm(),
            seed: 0,
            parallel: false,
            penumbra_fractions: FractionPair::default(),
        }
    }

    /// Checks the request against its domain.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] naming the violated constraint.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig { reason });

        if self.energies_kev.is_empty() {
            return invalid("energies list is empty".to_string());
        }
        if let Some(&bad) = self
            .energies_kev
            .iter()
            .find(|e| !(e.is_finite() && **e > 0.0))
        {
            return invalid(format!("energy {bad} keV is not positive"));
        }
        if !(MIN_RAY_COUNT..=MAX_RAY_COUNT).contains(&self.ray_count) {
            return invalid(format!(
                "ray count {} is outside {MIN_RAY_COUNT}..={MAX_RAY_COUNT}",
                self.ray_count
            ));
        }
        if !(self.angular_resolution_deg.is_finite() && self.angular_resolution_deg > 0.0) {
            return invalid(format!(
                "angular resolution {} deg is not positive",
                self.angular_resolution_deg
            ));
        }
        if !(1..=2).contains(&self.compton.max_scatter_order) {
            return invalid(format!(
                "scatter order {} is not 1 or 2",
                self.compton.max_scatter_order
            ));
        }
        if self.compton.angular_bins == 0 {
            return invalid("angular_bins must be positive".to_string());
        }
        if !(self.scatter_step_mm.is_finite() && self.scatter_step_mm > 0.0) {
            return invalid(format!(
                "scatter step {} mm is not positive",
                self.scatter_step_mm
            ));
        }
        if !(self.compton.min_energy_cutoff_kev.is_finite()
            && self.compton.min_energy_cutoff_kev >= 0.0)
        {
            return invalid(format!(
                "energy cutoff {} keV is negative",
                self.compton.min_energy_cutoff_kev
            ));
        }

        Ok(())
    }

    /// The composition method actually applied: with first-order scatter
    /// the conservative last-material fallback replaces the default
    /// sequential product.
    #[must_use]
    pub fn effective_buildup_method(&self) -> BuildUpMethod {
        match self.buildup_method {
            BuildUpMethod::Kalos
                if self.compton.enabled && self.compton.max_scatter_order == 1 =>
            {
                BuildUpMethod::LastMaterial
            }
            method => method,
        }
    }
}

/// Host-supplied observation points for a running simulation.
#[derive(Clone, Copy, Default)]
pub struct RunHooks<'a> {
    /// Invoked with the completed fraction in `[0, 1]` once per chunk.
    pub progress: Option<&'a (dyn Fn(f64) + Sync)>,
    /// Cooperative cancellation flag, checked once per chunk.
    pub cancel: Option<&'a AtomicBool>,
}

/// The simulation engine over a set of shared, read-only tables.
#[derive(Clone, Copy, Debug)]
pub struct Engine<'a> {
    materials: &'a MaterialSet,
    buildup: &'a BuildUpTable,
}

/// Per-chunk detector histogram; merged in chunk order.
#[derive(Clone, Debug)]
struct ChunkHistogram {
    built: Vec<f64>,
    unbuilt: Vec<f64>,
    buildup_sum: Vec<f64>,
    count: Vec<u32>,
    warnings: Warnings,
}

impl ChunkHistogram {
    fn new(bins: usize) -> Self {
        Self {
            built: vec![0.0; bins],
            unbuilt: vec![0.0; bins],
            buildup_sum: vec![0.0; bins],
            count: vec![0; bins],
            warnings: Warnings::empty(),
        }
    }

    fn merge(&mut self, other: &Self) {
        for (built, unbuilt, buildup_sum, count, from) in izip!(
            &mut self.built,
            &mut self.unbuilt,
            &mut self.buildup_sum,
            &mut self.count,
            izip!(&other.built, &other.unbuilt, &other.buildup_sum, &other.count),
        ) {
            *built += from.0;
            *unbuilt += from.1;
            *buildup_sum += from.2;
            *count += from.3;
        }
        self.warnings |= other.warnings;
    }
}

impl<'a> Engine<'a> {
    /// Borrows the shared tables; see the crate docs for the lifecycle.
    #[must_use]
    pub const fn new(materials: &'a MaterialSet, buildup: &'a BuildUpTable) -> Self {
        Self { materials, buildup }
    }

    /// Runs a simulation without progress reporting or cancellation.
    ///
    /// # Errors
    ///
    /// See [`Self::run_simulation_with`].
    pub fn run_simulation(
        &self,
        geometry: &CollimatorGeometry,
        config: &SimulationConfig,
    ) -> Result<SimulationResult> {
        self.run_simulation_with(geometry, config, RunHooks::default())
    }

    /// Runs a simulation with host hooks.
    ///
    /// Blocking; all parallelism stays inside. Given the same geometry,
    /// configuration and seed the result is bit-reproducible, in both
    /// the serial and the parallel mode.
    ///
    /// # Errors
    ///
    /// Validation errors from the configuration and geometry,
    /// [`Error::OutOfRange`] for energies outside the material grids,
    /// [`Error::Cancelled`] when the host flag was observed (no partial
    /// result is produced), and table lookup errors.
    pub fn run_simulation_with(
        &self,
        geometry: &CollimatorGeometry,
        config: &SimulationConfig,
        hooks: RunHooks<'_>,
    ) -> Result<SimulationResult> {
        config.validate()?;
        let physics = Physics::new(self.materials, self.buildup);
        let plan = TracePlan::new(geometry, self.materials)?;

        let e0 = config.energies_kev[0];
        let mu_e0 = plan
            .material_ids()
            .iter()
            .map(|id| physics.linear_mu(id, e0))
            .collect::<Result<Vec<_>>>()?;

        let bins = DetectorBins::new(
            &plan,
            convert::rad_from_deg(config.angular_resolution_deg)?,
        );
        let angles = plan.generate_angles(config.ray_count);
        let method = config.effective_buildup_method();

        let chunk_size = (angles.len() / 100).max(1);
        let chunks: Vec<&[f64]> = angles.chunks(chunk_size).collect();
        let done = AtomicUsize::new(0);
        let total_chunks = chunks.len();

        let process = |chunk: &&[f64]| -> Result<ChunkHistogram> {
            if let Some(cancel) = hooks.cancel {
                if cancel.load(Ordering::Relaxed) {
                    return Err(Error::Cancelled);
                }
            }

            let mut histogram = ChunkHistogram::new(bins.count());
            for &angle in *chunk {
                self.accumulate_ray(
                    &plan, &bins, &mu_e0, e0, angle, config, method, &mut histogram,
                )?;
            }

            if let Some(progress) = hooks.progress {
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                #[allow(clippy::cast_precision_loss)]
                progress(finished as f64 / total_chunks as f64);
            }
            Ok(histogram)
        };

        let partials: Vec<ChunkHistogram> = if config.parallel {
            chunks.par_iter().map(process).collect::<Result<_>>()?
        } else {
            chunks.iter().map(process).collect::<Result<_>>()?
        };

        let mut histogram = ChunkHistogram::new(bins.count());
        for partial in &partials {
            histogram.merge(partial);
        }
        let mut warnings = histogram.warnings;

        if config.energies_kev.iter().any(|&e| e > 1000.0) {
            warnings |= Warnings::MONOENERGETIC_MEV;
        }

        // stochastic scatter overlay
        let run_scatter = config.include_scatter && config.compton.enabled;
        let scatter_outcome = if run_scatter {
            if config.compton.max_scatter_order == 1 {
                warnings |= Warnings::SCATTER_ORDER_ONE;
            }
            let fraction_e0 = plan
                .material_ids()
                .iter()
                .map(|id| self.materials.compton_fraction(id, e0))
                .collect::<Result<Vec<_>>>()?;
            let params = ScatterParams {
                plan: &plan,
                physics,
                bins,
                e0_kev: e0,
                step_cm: convert::thickness_cm_from_mm(config.scatter_step_mm)?,
                cutoff_kev: config.compton.min_energy_cutoff_kev,
                max_order: config.compton.max_scatter_order,
                seed: config.seed,
                spectrum_bins: config.compton.angular_bins,
                parallel: config.parallel,
                mu_e0: &mu_e0,
                compton_fraction_e0: &fraction_e0,
            };
            Some(scatter::run(&params, &angles)?)
        } else {
            None
        };

        let profile = build_profile(&bins, &histogram, scatter_outcome.as_ref());
        let metrics = derive_metrics(&profile, &histogram, config, run_scatter);
        let energy_analysis = self.energy_analysis(geometry, config, &physics)?;

        let compton_analysis = if config.compton.enabled {
            let distribution = compton::klein_nishina_distribution(e0, config.compton.angular_bins)?;
            let (spectrum, interactions, scatter_profile, accounting) = match scatter_outcome {
                Some(outcome) => (
                    outcome.spectrum,
                    outcome.interactions,
                    outcome.profile,
                    outcome.accounting,
                ),
                None => (Vec::new(), Vec::new(), Vec::new(), Default::default()),
            };
            Some(ComptonAnalysis {
                distribution,
                spectrum,
                interactions,
                profile: scatter_profile,
                accounting,
            })
        } else {
            None
        };

        Ok(SimulationResult {
            id: next_result_id(),
            timestamp_s: unix_timestamp(),
            profile,
            energy_analysis,
            metrics,
            compton: compton_analysis,
            warnings,
            source_config: geometry.source.config.clone(),
        })
    }

    /// Traces one ray and folds it into the chunk histogram.
    #[allow(clippy::too_many_arguments)]
    fn accumulate_ray(
        &self,
        plan: &TracePlan,
        bins: &DetectorBins,
        mu_e0: &[f64],
        e0: KeV,
        angle: f64,
        config: &SimulationConfig,
        method: BuildUpMethod,
        histogram: &mut ChunkHistogram,
    ) -> Result<()> {
        let trace = plan.trace(angle);
        let Some(bin) = bins.index(trace.detector_x_cm) else {
            return Ok(());
        };

        let mut tau_total: Mfp = 0.0;
        // (stage, material, partial tau) in traversal order
        let mut pieces: Vec<(usize, usize, Mfp)> = Vec::with_capacity(trace.segments.len());
        for segment in &trace.segments {
            let tau = mu_e0[segment.material] * segment.length_cm;
            tau_total += tau;
            match pieces.last_mut() {
                Some((stage, material, partial))
                    if *stage == segment.stage && *material == segment.material =>
                {
                    *partial += tau;
                }
                _ => pieces.push((segment.stage, segment.material, tau)),
            }
        }

        let primary = if tau_total > OPTICAL_DEPTH_OVERFLOW {
            0.0
        } else {
            (-tau_total).exp()
        };

        // rays through apertures only carry no build-up
        let buildup_factor = if config.include_buildup && tau_total > 0.0 {
            let mut stage_regions: Vec<(&str, Mfp)> = Vec::new();
            let mut start = 0;
            while start < pieces.len() {
                let stage = pieces[start].0;
                let mut end = start;
                while end < pieces.len() && pieces[end].0 == stage {
                    end += 1;
                }
                let in_stage: Vec<(&str, Mfp)> = pieces[start..end]
                    .iter()
                    .map(|&(_, material, tau)| (plan.material_ids()[material].as_str(), tau))
                    .collect();
                let (dominant, tie) = dominant_region(&in_stage);
                histogram.warnings |= tie;
                if let Some(dominant) = dominant {
                    stage_regions.push((dominant, in_stage.iter().map(|&(_, t)| t).sum()));
                }
                start = end;
            }

            let built = self.buildup.compose(&stage_regions, e0, method)?;
            histogram.warnings |= built.warnings;
            built.factor
        } else {
            1.0
        };

        histogram.built[bin] += buildup_factor * primary;
        histogram.unbuilt[bin] += primary;
        histogram.buildup_sum[bin] += buildup_factor;
        histogram.count[bin] += 1;
        Ok(())
    }

    /// The per-energy, per-layer table for a straight on-axis path
    /// through the solid shielding stack.
    fn energy_analysis(
        &self,
        geometry: &CollimatorGeometry,
        config: &SimulationConfig,
        physics: &Physics<'_>,
    ) -> Result<EnergyAnalysis> {
        let mut layer_labels = Vec::new();
        let mut thicknesses_cm = Vec::new();
        let mut layer_materials = Vec::new();
        for (stage_index, stage) in geometry.stages.iter().enumerate() {
            for layer in &stage.layers {
                layer_labels.push(format!("stage {stage_index}/{}", layer.material_id));
                thicknesses_cm.push(convert::thickness_cm_from_mm(layer.thickness_mm)?);
                layer_materials.push(layer.material_id.clone());
            }
        }

        let energies = &config.energies_kev;
        let mut depth = Array2::zeros((energies.len(), layer_labels.len()));
        let mut transmission = Array2::ones((energies.len(), layer_labels.len()));
        let mut total_depth = Vec::with_capacity(energies.len());
        let mut total_transmission = Vec::with_capacity(energies.len());

        for (row, &energy) in energies.iter().enumerate() {
            let mut tau_sum = 0.0;
            for (column, (material, &thickness_cm)) in
                layer_materials.iter().zip(&thicknesses_cm).enumerate()
            {
                let tau = physics.linear_mu(material, energy)? * thickness_cm;
                depth[[row, column]] = tau;
                transmission[[row, column]] = if tau > OPTICAL_DEPTH_OVERFLOW {
                    0.0
                } else {
                    (-tau).exp()
                };
                tau_sum += tau;
            }
            total_depth.push(tau_sum);
            total_transmission.push(if tau_sum > OPTICAL_DEPTH_OVERFLOW {
                0.0
            } else {
                (-tau_sum).exp()
            });
        }

        Ok(EnergyAnalysis {
            energies_kev: energies.clone(),
            layer_labels,
            layer_optical_depth: depth,
            layer_transmission: transmission,
            total_optical_depth: total_depth,
            total_transmission,
        })
    }
}

/// Assembles the public profile rows from the merged histogram.
fn build_profile(
    bins: &DetectorBins,
    histogram: &ChunkHistogram,
    scatter: Option<&scatter::ScatterOutcome>,
) -> Vec<DetectorBin> {
    (0..bins.count())
        .map(|bin| {
            let count = f64::from(histogram.count[bin]);
            let scattered = scatter.map_or(0.0, |outcome| outcome.profile[bin]);
            let (transmission, buildup_factor) = if histogram.count[bin] > 0 {
                (
                    histogram.built[bin] / count,
                    histogram.buildup_sum[bin] / count,
                )
            } else {
                (0.0, 0.0)
            };
            DetectorBin {
                bin_index: bin,
                position_mm: bins.center_mm(bin),
                primary: histogram.built[bin],
                scatter: scattered,
                total: histogram.built[bin] + scattered,
                transmission,
                buildup_factor,
            }
        })
        .collect()
}

/// Runs the metric derivation over the covered part of the profile.
fn derive_metrics(
    profile: &[DetectorBin],
    histogram: &ChunkHistogram,
    config: &SimulationConfig,
    scatter_ran: bool,
) -> super::result::QualityMetrics {
    let mut positions = Vec::new();
    let mut built = Vec::new();
    let mut unbuilt = Vec::new();
    let mut scatter_means = Vec::new();

    for row in profile {
        let count = histogram.count[row.bin_index];
        if count == 0 {
            continue;
        }
        let count = f64::from(count);
        positions.push(row.position_mm);
        built.push(row.transmission);
        unbuilt.push(histogram.unbuilt[row.bin_index] / count);
        scatter_means.push(row.scatter / count);
    }

    quality_metrics(
        &positions,
        &built,
        &unbuilt,
        scatter_ran.then_some(scatter_means.as_slice()),
        config.penumbra_fractions,
    )
}
