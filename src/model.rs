//! Read-only model description consumed by the simulation engine at
//! construction: compartment geometry, species, reactions, membranes and
//! solver configuration. Nothing in this module steps a simulation.

pub mod layout;
pub mod options;
pub mod spec;

pub use layout::{CompartmentLayout, LayoutError};
pub use options::{ErrorTolerances, IntegratorType, SolverOptions};
pub use spec::{
    CompartmentSpec, InitialConcentration, MembraneSpec, ModelError, ModelSpec, ReactionSpec,
    SpeciesSpec,
};
