//! Error and result types for the engine.
//!
//! The engine never panics through its public surface; every operation
//! returns either a value document or one of the named kinds below. Each
//! variant carries enough context (material, energy, stage or ray index)
//! for the host to render an actionable message.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A conversion or physical quantity received a non-finite value, or a
    /// negative value where it must be non-negative.
    #[error("invalid {quantity}: {value}")]
    InvalidUnit {
        /// Name of the offending quantity, e.g. `thickness_mm`.
        quantity: &'static str,
        /// The rejected value.
        value: f64,
    },
    /// An energy fell outside a material's attenuation grid.
    #[error(
        "energy {energy_kev} keV is outside the attenuation grid of `{material}` \
         ({min_kev}..={max_kev} keV)"
    )]
    OutOfRange {
        /// Material whose grid was queried.
        material: String,
        /// The requested energy in keV.
        energy_kev: f64,
        /// Lower end of the grid in keV.
        min_kev: f64,
        /// Upper end of the grid in keV.
        max_kev: f64,
    },
    /// An unknown material id was referenced.
    #[error("unknown material id `{material}`")]
    NotFound {
        /// The unresolved id.
        material: String,
    },
    /// Alloy weight fractions do not sum to one.
    #[error("alloy weight fractions sum to {sum}, expected 1 within 1e-6")]
    InvalidComposition {
        /// The actual sum of the weight fractions.
        sum: f64,
    },
    /// A geometry document violates a structural invariant.
    #[error("invalid geometry (stage {stage:?}): {reason}")]
    InvalidGeometry {
        /// Index of the offending stage, if the violation is local to one.
        stage: Option<usize>,
        /// What was violated.
        reason: String,
    },
    /// A simulation configuration violates its domain.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was violated.
        reason: String,
    },
    /// Cooperative cancellation was observed; no partial result exists.
    #[error("simulation cancelled")]
    Cancelled,
    /// A parametric table is missing or unusable for the requested key.
    #[error("numerical degeneracy in {context} for `{material}` at {energy_kev} keV")]
    NumericalDegeneracy {
        /// Which computation hit the degeneracy, e.g. `build-up table`.
        context: String,
        /// Material key of the missing or unusable entry.
        material: String,
        /// Energy key of the missing or unusable entry.
        energy_kev: f64,
    },
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a foreign error into [`Error::Other`].
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(anyhow::Error::new(err))
    }
}
