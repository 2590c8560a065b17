//! The simulation engine: compartment and membrane units, the reaction
//! evaluator, the pixel simulator with its adaptive integrators, and the
//! steady-state decorator.

pub mod compartment;
pub mod membrane;
pub mod pixel_sim;
pub mod reac_eval;
pub mod steady_state;

pub use compartment::{RkError, SimCompartment};
pub use membrane::SimMembrane;
pub use pixel_sim::PixelSim;
pub use reac_eval::ReacEval;
pub use steady_state::PixelSimSteadyState;

use crate::model::ModelError;
use image::RgbImage;
use rayon::ThreadPoolBuildError;
use thiserror::Error;

/// Fatal construction-time errors. A simulator that failed to construct is
/// unusable; run-time conditions are reported through
/// [`Simulator::error_message`] instead.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("reaction '{reaction}': failed to compile expression: {source}")]
    ExpressionCompile {
        reaction: String,
        #[source]
        source: meval::Error,
    },

    #[error("reaction '{reaction}': unknown identifier '{name}'")]
    UnknownIdentifier { reaction: String, name: String },

    #[error("error tolerances must be positive (abs = {abs}, rel = {rel})")]
    InvalidTolerances { abs: f64, rel: f64 },

    #[error("concentration array has length {got}, expected {expected}")]
    ConcentrationLength { got: usize, expected: usize },

    #[error("failed to build thread pool")]
    ThreadPool(
        #[from]
        #[source]
        ThreadPoolBuildError,
    ),
}

/// The common simulator contract, the seam behind which an orchestrator can
/// place this engine or an alternative backend. The backend is selected once
/// at construction and never switched at run time.
pub trait Simulator {
    /// Advances the simulation by `time`, honouring an optional wall-clock
    /// timeout in milliseconds (`<= 0` disables it) and an optional
    /// cancellation predicate polled once per accepted step. Returns the
    /// number of completed sub-steps.
    fn run(&mut self, time: f64, timeout_ms: f64, stop_callback: Option<&dyn Fn() -> bool>)
        -> u64;

    /// Flat concentration array for one compartment, ordered
    /// `[cell][slot]` with slot count `n_species + concentration_padding()`.
    ///
    /// Panics if `compartment` is out of range.
    fn concentrations(&self, compartment: usize) -> Vec<f64>;

    /// Number of extra non-species slots per cell holding the time/space
    /// pseudo-variables.
    fn concentration_padding(&self) -> usize;

    /// Sticky description of the last fatal or interrupting condition;
    /// empty on success.
    fn error_message(&self) -> &str;

    /// Diagnostic visualisation of the failure, empty unless a convergence
    /// failure occurred.
    fn error_images(&self) -> &[RgbImage];

    /// Requests cooperative cancellation from any thread; honoured within
    /// one accepted step.
    fn request_stop(&self);
}
