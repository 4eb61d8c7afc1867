//! Declarative collimator geometry: source, ordered stages and detector.
//!
//! Geometry objects are constructed by the host editor and passed by
//! value into simulations; the engine validates them on load and never
//! mutates them. All dimensions in this module are millimetres; the
//! conversion to internal centimetres happens once, when the ray tracer
//! builds its plan.

use super::convert::Mm;
use super::error::{Error, Result};
use super::material::MaterialSet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tolerance on the layer-thickness sum against the stage depth, in mm.
pub const LAYER_SUM_TOLERANCE_MM: Mm = 1e-6;

/// Beam shape of the collimator, which fixes the ray fan.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollimatorType {
    /// Wide fan covering the full detector.
    FanBeam,
    /// Narrow bundle subtending the first aperture plus a margin.
    PencilBeam,
    /// Slit beam; traced like a pencil fan in the beam-axis plane.
    Slit,
}

/// The opening of one stage. Stage bodies are solid material everywhere
/// except the aperture.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aperture {
    /// Rectangular slit, possibly tapered between entry and exit faces.
    Slit {
        /// Opening width on the entry face, mm.
        entry_width_mm: Mm,
        /// Opening width on the exit face, mm.
        exit_width_mm: Mm,
        /// Opening height on the entry face, mm.
        entry_height_mm: Mm,
        /// Opening height on the exit face, mm.
        exit_height_mm: Mm,
    },
    /// Circular opening, possibly conical.
    Pinhole {
        /// Opening diameter on the entry face, mm.
        entry_diameter_mm: Mm,
        /// Opening diameter on the exit face, mm.
        exit_diameter_mm: Mm,
    },
    /// No material anywhere; the stage does not attenuate.
    Open,
}

impl Aperture {
    /// Entry and exit opening widths in the trace plane; `None` for an
    /// open stage.
    #[must_use]
    pub const fn silhouette_mm(&self) -> Option<(Mm, Mm)> {
        match *self {
            Self::Slit {
                entry_width_mm,
                exit_width_mm,
                ..
            } => Some((entry_width_mm, exit_width_mm)),
            Self::Pinhole {
                entry_diameter_mm,
                exit_diameter_mm,
            } => Some((entry_diameter_mm, exit_diameter_mm)),
            Self::Open => None,
        }
    }
}

/// One material zone along a stage's depth.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Layer {
    /// Material of the zone, resolved against the material store.
    pub material_id: String,
    /// Zone thickness along the beam axis, mm.
    pub thickness_mm: Mm,
    /// Free-form purpose label, opaque to the engine.
    #[serde(default)]
    pub purpose: String,
}

/// One rigid collimator block along the beam axis.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Stage {
    /// Front-face position along the beam axis, mm.
    pub z_mm: Mm,
    /// Depth along the beam axis, mm.
    pub depth_mm: Mm,
    /// Outer body width, mm.
    pub outer_width_mm: Mm,
    /// The single opening of this stage.
    pub aperture: Aperture,
    /// Material zones dividing the depth; thicknesses sum to `depth_mm`.
    pub layers: Vec<Layer>,
}

impl Stage {
    /// Exit-face position along the beam axis, mm.
    #[must_use]
    pub fn exit_z_mm(&self) -> Mm {
        self.z_mm + self.depth_mm
    }
}

/// Opaque source configuration document (tube or LINAC settings),
/// carried verbatim for downstream dose conversion; the engine never
/// interprets it.
///
/// Human-readable formats carry the document inline; binary formats
/// carry it as YAML text, because a free-form value cannot be
/// reconstructed from a non-self-describing stream.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceConfig(pub serde_yaml::Value);

impl Default for SourceConfig {
    fn default() -> Self {
        Self(serde_yaml::Value::Null)
    }
}

impl Serialize for SourceConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let text = serde_yaml::to_string(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&text)
        }
    }
}

impl<'de> Deserialize<'de> for SourceConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            serde_yaml::Value::deserialize(deserializer).map(Self)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_yaml::from_str(&text).map(Self).map_err(serde::de::Error::custom)
        }
    }
}

/// The photon source. `z_mm = 0` by convention.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Source {
    /// Position along the beam axis, mm.
    #[serde(default)]
    pub z_mm: Mm,
    /// Transverse offset, mm.
    #[serde(default)]
    pub x_mm: Mm,
    /// Source configuration carried through untouched.
    #[serde(default)]
    pub config: Option<SourceConfig>,
}

/// The detector plane behind the last stage.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detector {
    /// Plane position along the beam axis, mm.
    pub z_mm: Mm,
    /// Sensitive width, mm.
    pub width_mm: Mm,
}

/// A complete collimator geometry document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CollimatorGeometry {
    /// Beam shape.
    #[serde(rename = "type")]
    pub collimator_type: CollimatorType,
    /// The photon source.
    #[serde(default)]
    pub source: Source,
    /// Ordered, non-empty stage sequence; gaps between stages are air.
    pub stages: Vec<Stage>,
    /// The detector plane.
    pub detector: Detector,
}

impl CollimatorGeometry {
    /// Checks every structural invariant against the material store.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidGeometry`] with the offending stage index, or
    /// [`Error::NotFound`] for an unresolvable material id.
    pub fn validate(&self, materials: &MaterialSet) -> Result<()> {
        let invalid = |stage: Option<usize>, reason: String| Error::InvalidGeometry {
            stage,
            reason,
        };

        if self.stages.is_empty() {
            return Err(invalid(None, "stage list is empty".to_string()));
        }
        if !self.source.z_mm.is_finite() || !self.source.x_mm.is_finite() {
            return Err(invalid(None, "source position is not finite".to_string()));
        }

        let mut previous_exit = self.source.z_mm;
        for (index, stage) in self.stages.iter().enumerate() {
            if !stage.z_mm.is_finite() || stage.z_mm <= previous_exit - LAYER_SUM_TOLERANCE_MM {
                return Err(invalid(
                    Some(index),
                    format!(
                        "front face at {} mm does not lie strictly behind {} mm",
                        stage.z_mm, previous_exit
                    ),
                ));
            }
            if !(stage.depth_mm.is_finite() && stage.depth_mm > 0.0) {
                return Err(invalid(
                    Some(index),
                    format!("depth {} mm is not positive", stage.depth_mm),
                ));
            }
            if !(stage.outer_width_mm.is_finite() && stage.outer_width_mm > 0.0) {
                return Err(invalid(
                    Some(index),
                    format!("outer width {} mm is not positive", stage.outer_width_mm),
                ));
            }

            if let Some((entry_mm, exit_mm)) = stage.aperture.silhouette_mm() {
                for opening in [entry_mm, exit_mm] {
                    if !(opening.is_finite() && opening >= 0.0) {
                        return Err(invalid(
                            Some(index),
                            format!("aperture opening {opening} mm is not a width"),
                        ));
                    }
                    if opening > stage.outer_width_mm {
                        return Err(invalid(
                            Some(index),
                            format!(
                                "aperture opening {opening} mm exceeds the outer width {} mm",
                                stage.outer_width_mm
                            ),
                        ));
                    }
                }
            }

            let mut layer_sum = 0.0;
            for layer in &stage.layers {
                if !(layer.thickness_mm.is_finite() && layer.thickness_mm >= 0.0) {
                    return Err(invalid(
                        Some(index),
                        format!(
                            "layer `{}` thickness {} mm is negative",
                            layer.material_id, layer.thickness_mm
                        ),
                    ));
                }
                materials.material(&layer.material_id)?;
                layer_sum += layer.thickness_mm;
            }
            if (layer_sum - stage.depth_mm).abs() > LAYER_SUM_TOLERANCE_MM {
                return Err(invalid(
                    Some(index),
                    format!(
                        "layer thicknesses sum to {layer_sum} mm, stage depth is {} mm",
                        stage.depth_mm
                    ),
                ));
            }

            previous_exit = stage.exit_z_mm();
        }

        if !(self.detector.width_mm.is_finite() && self.detector.width_mm > 0.0) {
            return Err(invalid(
                None,
                format!("detector width {} mm is not positive", self.detector.width_mm),
            ));
        }
        if !self.detector.z_mm.is_finite() || self.detector.z_mm <= previous_exit {
            return Err(invalid(
                None,
                format!(
                    "detector plane at {} mm does not lie behind the last stage exit at \
                     {previous_exit} mm",
                    self.detector.z_mm
                ),
            ));
        }

        Ok(())
    }

    /// Parses a geometry document, accepting both the staged form and the
    /// legacy single-body form, which is migrated to one stage.
    ///
    /// # Errors
    ///
    /// Returns the staged-form parse error when the document matches
    /// neither schema.
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        match serde_yaml::from_str::<Self>(document) {
            Ok(geometry) => Ok(geometry),
            Err(staged_error) => serde_yaml::from_str::<LegacyDocument>(document)
                .map(LegacyDocument::migrate)
                .map_err(|_| Error::Other(staged_error.into())),
        }
    }

    /// Serializes the geometry document.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Other(e.into()))
    }
}

/// Pre-stage geometry document: one collimator body, no stage sequence.
#[derive(Debug, Deserialize)]
struct LegacyDocument {
    #[serde(rename = "type")]
    collimator_type: CollimatorType,
    #[serde(default)]
    source: Source,
    body: LegacyBody,
    detector: Detector,
}

#[derive(Debug, Deserialize)]
struct LegacyBody {
    #[serde(default)]
    z_mm: Mm,
    depth_mm: Mm,
    outer_width_mm: Mm,
    aperture: Aperture,
    /// Single-material bodies predate layers.
    #[serde(default)]
    material_id: Option<String>,
    #[serde(default)]
    layers: Vec<Layer>,
}

impl LegacyDocument {
    fn migrate(self) -> CollimatorGeometry {
        let layers = if self.body.layers.is_empty() {
            self.body
                .material_id
                .into_iter()
                .map(|material_id| Layer {
                    material_id,
                    thickness_mm: self.body.depth_mm,
                    purpose: String::new(),
                })
                .collect()
        } else {
            self.body.layers
        };

        CollimatorGeometry {
            collimator_type: self.collimator_type,
            source: self.source,
            stages: vec![Stage {
                z_mm: self.body.z_mm,
                depth_mm: self.body.depth_mm,
                outer_width_mm: self.body.outer_width_mm,
                aperture: self.body.aperture,
                layers,
            }],
            detector: self.detector,
        }
    }
}
