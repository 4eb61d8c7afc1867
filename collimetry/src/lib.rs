//! `Collimetry` is a photon-transport engine for designing and
//! evaluating multi-stage X-ray collimators for cargo and vehicle
//! inspection, from 80 kVp tube spectra up to 6 MeV LINAC lines.
//!
//! The crate is a pure compute library layered strictly leaves-first:
//! unit conversions, the material database, the closed-form physics
//! engine, parametric build-up factors, the analytic Compton kernel, a
//! deterministic 2-D ray tracer, the beam simulation, and an optional
//! stochastic scatter tracer on top. It performs no I/O of its own
//! beyond the loader interfaces in [`data`] and the project container in
//! [`project`]; screens, charts and exporters are host collaborators.
//!
//! The material and build-up tables load once and are shared immutably;
//! simulations are reproducible bit for bit, including the scatter
//! channel, whose seeded PRNG is part of the request.

pub mod buildup;
pub mod compton;
pub mod convert;
pub mod data;
pub mod error;
pub mod geometry;
pub mod material;
pub mod metrics;
pub mod physics;
pub mod project;
pub mod raytrace;
pub mod result;
mod scatter;
pub mod simulation;

pub use error::{Error, Result};
pub use geometry::CollimatorGeometry;
pub use material::MaterialSet;
pub use result::SimulationResult;
pub use simulation::{Engine, RunHooks, SimulationConfig};
