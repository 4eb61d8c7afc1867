//! Deterministic 2-D ray tracer in the beam-axis plane.
//!
//! Geometry is reduced to depth (z) times width (x); a ray starts at the
//! source point with an angle against the beam axis and an energy carried
//! by the caller. For every stage the tracer decides whether the ray
//! passes entirely through the aperture at both faces (the silhouette is
//! interpolated linearly through the depth, so tapered apertures work),
//! whether it misses the body altogether, or whether it traverses the
//! stage's layer stack; traversed layers produce one segment each with
//! its material and path length in cm. Gaps between stages contribute
//! nothing.
//!
//! The plan is built once per simulation: geometry converted to
//! centimetres, material ids interned to indices, so the per-ray loop
//! does no unit conversion and no hashing.

use super::convert::{self, Cm, Mm, Radian};
use super::error::Result;
use super::geometry::{CollimatorGeometry, CollimatorType};
use super::material::MaterialSet;
use rustc_hash::FxHashMap;

/// Margin around the first aperture, as a fraction of the stage's outer
/// half width, that pencil and slit fans cover beyond the opening.
const FAN_MARGIN_FRACTION: f64 = 0.25;

/// Hard cap on detector bins, matching the densest host charts.
const MAX_DETECTOR_BINS: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub(crate) struct PlannedLayer {
    /// Index into [`TracePlan::material_ids`].
    pub material: usize,
    pub z0_cm: Cm,
    pub z1_cm: Cm,
}

#[derive(Clone, Debug)]
pub(crate) struct PlannedStage {
    pub z0_cm: Cm,
    pub z1_cm: Cm,
    pub half_outer_cm: Cm,
    /// Entry and exit half openings; `None` for an open stage.
    pub silhouette_cm: Option<(Cm, Cm)>,
    pub layers: Vec<PlannedLayer>,
}

impl PlannedStage {
    /// Half opening of the aperture silhouette at `z_cm`, interpolated
    /// linearly between the faces.
    fn half_opening_at(&self, z_cm: Cm) -> Option<Cm> {
        self.silhouette_cm.map(|(entry, exit)| {
            let t = (z_cm - self.z0_cm) / (self.z1_cm - self.z0_cm);
            (exit - entry).mul_add(t.clamp(0.0, 1.0), entry)
        })
    }
}

/// One traversed layer of one stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceSegment {
    /// Index into [`TracePlan::material_ids`].
    pub material: usize,
    /// Index of the stage the segment belongs to.
    pub stage: usize,
    /// Segment start along the beam axis, cm.
    pub z0_cm: Cm,
    /// Segment end along the beam axis, cm.
    pub z1_cm: Cm,
    /// Path length through the layer, cm.
    pub length_cm: Cm,
}

/// The outcome of tracing one ray to the detector plane.
#[derive(Clone, Debug, PartialEq)]
pub struct RayTrace {
    /// The ray's angle against the beam axis, rad.
    pub angle: Radian,
    /// Traversed material segments, in beam order; empty for a ray that
    /// saw only apertures, gaps, or free space outside the bodies.
    pub segments: Vec<TraceSegment>,
    /// Signed intersection with the detector plane, cm.
    pub detector_x_cm: Cm,
}

/// Geometry pre-processed for tracing: centimetres, interned materials.
#[derive(Clone, Debug)]
pub struct TracePlan {
    material_ids: Vec<String>,
    stages: Vec<PlannedStage>,
    collimator_type: CollimatorType,
    source_x_cm: Cm,
    source_z_cm: Cm,
    detector_z_cm: Cm,
    detector_half_width_cm: Cm,
}

impl TracePlan {
    /// Validates the geometry and builds the internal plan.
    ///
    /// # Errors
    ///
    /// Propagates [`CollimatorGeometry::validate`] and unit conversion
    /// errors.
    pub fn new(geometry: &CollimatorGeometry, materials: &MaterialSet) -> Result<Self> {
        geometry.validate(materials)?;

        let mut material_ids: Vec<String> = Vec::new();
        let mut interned: FxHashMap<&str, usize> = FxHashMap::default();
        let mut stages = Vec::with_capacity(geometry.stages.len());

        for stage in &geometry.stages {
            let z0_cm = convert::cm_from_mm(stage.z_mm)?;
            let z1_cm = convert::cm_from_mm(stage.exit_z_mm())?;

            let mut layers = Vec::with_capacity(stage.layers.len());
            let mut cursor_cm = z0_cm;
            for layer in &stage.layers {
                let thickness_cm = convert::thickness_cm_from_mm(layer.thickness_mm)?;
                let material = *interned
                    .entry(layer.material_id.as_str())
                    .or_insert_with(|| {
                        material_ids.push(layer.material_id.clone());
                        material_ids.len() - 1
                    });
                layers.push(PlannedLayer {
                    material,
                    z0_cm: cursor_cm,
                    z1_cm: cursor_cm + thickness_cm,
                });
                cursor_cm += thickness_cm;
            }

            let silhouette_cm = match stage.aperture.silhouette_mm() {
                Some((entry_mm, exit_mm)) => Some((
                    convert::thickness_cm_from_mm(entry_mm)? / 2.0,
                    convert::thickness_cm_from_mm(exit_mm)? / 2.0,
                )),
                None => None,
            };

            stages.push(PlannedStage {
                z0_cm,
                z1_cm,
                half_outer_cm: convert::thickness_cm_from_mm(stage.outer_width_mm)? / 2.0,
                silhouette_cm,
                layers,
            });
        }

        Ok(Self {
            material_ids,
            stages,
            collimator_type: geometry.collimator_type,
            source_x_cm: convert::cm_from_mm(geometry.source.x_mm)?,
            source_z_cm: convert::cm_from_mm(geometry.source.z_mm)?,
            detector_z_cm: convert::cm_from_mm(geometry.detector.z_mm)?,
            detector_half_width_cm: convert::thickness_cm_from_mm(geometry.detector.width_mm)?
                / 2.0,
        })
    }

    /// Material ids referenced by segment indices, in first-use order.
    #[must_use]
    pub fn material_ids(&self) -> &[String] {
        &self.material_ids
    }

    /// Distance from the source to the detector plane, cm.
    #[must_use]
    pub fn throw_cm(&self) -> Cm {
        self.detector_z_cm - self.source_z_cm
    }

    /// Half width of the detector, cm.
    #[must_use]
    pub const fn detector_half_width_cm(&self) -> Cm {
        self.detector_half_width_cm
    }

    /// Source point in plan coordinates, `(x, z)` in cm.
    #[must_use]
    pub(crate) const fn source_point_cm(&self) -> (Cm, Cm) {
        (self.source_x_cm, self.source_z_cm)
    }

    /// The deterministic ray fan for this collimator type: `count` angles
    /// evenly spaced over the field derived from the geometry.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn generate_angles(&self, count: usize) -> Vec<Radian> {
        let half = self.fan_half_angle();
        if count <= 1 {
            return vec![0.0];
        }

        (0..count)
            .map(|ray| (ray as f64).mul_add(2.0 * half / (count as f64 - 1.0), -half))
            .collect()
    }

    fn fan_half_angle(&self) -> Radian {
        let full_field = (self.detector_half_width_cm / self.throw_cm()).atan();

        match self.collimator_type {
            CollimatorType::FanBeam => full_field,
            CollimatorType::PencilBeam | CollimatorType::Slit => {
                // UNWRAP: plans always carry at least one stage
                let first = self.stages.first().unwrap();
                let Some((entry_half, _)) = first.silhouette_cm else {
                    return full_field;
                };
                let margin = FAN_MARGIN_FRACTION * first.half_outer_cm;
                let reach = (first.z0_cm - self.source_z_cm).max(f64::MIN_POSITIVE);
                ((entry_half + margin) / reach).atan().min(full_field)
            }
        }
    }

    /// Traces one source-originated ray through all stages.
    #[must_use]
    pub fn trace(&self, angle: Radian) -> RayTrace {
        let mut segments = Vec::new();
        self.collect_segments(self.source_x_cm, self.source_z_cm, angle, &mut segments);

        RayTrace {
            angle,
            segments,
            detector_x_cm: self.x_at(self.source_x_cm, self.source_z_cm, angle, self.detector_z_cm),
        }
    }

    /// Traces from an arbitrary in-geometry point, used for secondary
    /// photons. Only geometry downstream of `z_cm` is considered.
    pub(crate) fn trace_from(
        &self,
        x_cm: Cm,
        z_cm: Cm,
        angle: Radian,
        segments: &mut Vec<TraceSegment>,
    ) -> Cm {
        segments.clear();
        self.collect_segments(x_cm, z_cm, angle, segments);
        self.x_at(x_cm, z_cm, angle, self.detector_z_cm)
    }

    fn x_at(&self, x0_cm: Cm, z0_cm: Cm, angle: Radian, z_cm: Cm) -> Cm {
        angle.tan().mul_add(z_cm - z0_cm, x0_cm)
    }

    fn collect_segments(
        &self,
        x0_cm: Cm,
        z0_cm: Cm,
        angle: Radian,
        segments: &mut Vec<TraceSegment>,
    ) {
        let inverse_cos = 1.0 / angle.cos();

        for (stage_index, stage) in self.stages.iter().enumerate() {
            if stage.z1_cm <= z0_cm {
                continue;
            }
            let entry_z = stage.z0_cm.max(z0_cm);
            let entry_x = self.x_at(x0_cm, z0_cm, angle, entry_z);
            let exit_x = self.x_at(x0_cm, z0_cm, angle, stage.z1_cm);

            // through the opening at both faces: the silhouette is linear
            // through the depth, so two inside faces imply inside
            // everywhere between them
            let through_aperture = match (
                stage.half_opening_at(entry_z),
                stage.half_opening_at(stage.z1_cm),
            ) {
                // a zero-width silhouette is a closed aperture, even for
                // the on-axis ray
                (Some(entry_half), Some(exit_half)) => {
                    entry_half > 0.0
                        && exit_half > 0.0
                        && entry_x.abs() <= entry_half
                        && exit_x.abs() <= exit_half
                }
                _ => true,
            };
            if through_aperture {
                continue;
            }

            // fully outside the body on one side: free space, counted as
            // leakage only by where the ray lands
            if entry_x.abs() > stage.half_outer_cm
                && exit_x.abs() > stage.half_outer_cm
                && entry_x * exit_x > 0.0
            {
                continue;
            }

            for layer in &stage.layers {
                let layer_z0 = layer.z0_cm.max(z0_cm);
                if layer_z0 >= layer.z1_cm {
                    continue;
                }
                segments.push(TraceSegment {
                    material: layer.material,
                    stage: stage_index,
                    z0_cm: layer_z0,
                    z1_cm: layer.z1_cm,
                    length_cm: (layer.z1_cm - layer_z0) * inverse_cos,
                });
            }
        }
    }
}

/// Equal-width accumulation bins over the detector plane. The bin count
/// derives from the angular resolution as seen from the source.
#[derive(Clone, Copy, Debug)]
pub struct DetectorBins {
    half_width_cm: Cm,
    count: usize,
}

impl DetectorBins {
    /// Derives the bin layout from the plan and an angular bin width.
    #[must_use]
    pub fn new(plan: &TracePlan, angular_resolution_rad: Radian) -> Self {
        let span = 2.0 * (plan.detector_half_width_cm() / plan.throw_cm()).atan();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = ((span / angular_resolution_rad).ceil() as usize).clamp(1, MAX_DETECTOR_BINS);

        Self {
            half_width_cm: plan.detector_half_width_cm(),
            count,
        }
    }

    /// Number of bins.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Bin index for a detector-plane position; `None` off the plane.
    #[must_use]
    pub fn index(&self, x_cm: Cm) -> Option<usize> {
        if x_cm < -self.half_width_cm || x_cm >= self.half_width_cm {
            None
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let bin = ((x_cm + self.half_width_cm) / (2.0 * self.half_width_cm)
                * self.count as f64) as usize;
            Some(bin.min(self.count - 1))
        }
    }

    /// Centre position of a bin in mm.
    #[must_use]
    pub fn center_mm(&self, index: usize) -> Mm {
        #[allow(clippy::cast_precision_loss)]
        let fraction = (index as f64 + 0.5) / self.count as f64;
        convert::mm_from_cm((2.0 * self.half_width_cm).mul_add(fraction, -self.half_width_cm))
    }
}
