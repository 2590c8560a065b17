//! Pixel-grid reaction-diffusion simulation engine.
//!
//! Advances species concentrations on an irregular, compartment-partitioned
//! grid of cells using explicit Runge-Kutta schemes with embedded-error
//! adaptive step-size control. Reaction kinetics are arbitrary user-supplied
//! expressions, compiled once at construction and evaluated per cell.
//!
//! The entry point is [`PixelSim`], constructed from a read-only
//! [`ModelSpec`] plus [`SolverOptions`], and driven through the common
//! [`Simulator`] contract. [`PixelSimSteadyState`] decorates it with a
//! run-until-equilibrium convergence test.

pub mod model;
pub mod simulate;
pub mod utils;

pub use model::{
    CompartmentLayout, CompartmentSpec, ErrorTolerances, InitialConcentration, IntegratorType,
    MembraneSpec, ModelSpec, ReactionSpec, SolverOptions, SpeciesSpec,
};
pub use simulate::{
    PixelSim, PixelSimSteadyState, ReacEval, RkError, SetupError, SimCompartment, SimMembrane,
    Simulator,
};
